// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::constants::SENSE_BUFFER_SIZE;

/// Sense code representation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Sense {
    /// Provides generic information describing an error or exception
    /// condition.
    pub key: u8,
    /// Additional Sense Code.
    pub asc: u8,
    /// Additional Sense Code Qualifier.
    pub ascq: u8,
}

impl Sense {
    /// Encodes the sense as fixed-format sense data.
    ///
    /// Fixed format sense data has response code 0x70 for current errors and
    /// 0x71 for deferred errors; the mid-layer only ever produces current
    /// errors.
    pub fn to_fixed(&self) -> [u8; SENSE_BUFFER_SIZE] {
        let mut data = [0u8; SENSE_BUFFER_SIZE];
        data[0] = 0x70;
        data[2] = self.key;
        // Additional length. The data is 18 bytes, and this byte is 8th.
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }

    /// Decodes a fixed-format sense buffer back into key/asc/ascq.
    ///
    /// Buffers that do not carry the fixed-format response code decode to an
    /// empty sense rather than an error; drivers hand the mid-layer whatever
    /// the device returned.
    pub fn from_fixed(data: &[u8]) -> Sense {
        if data.len() < 14 || data[0] & 0x7e != 0x70 {
            return Sense::default();
        }
        Sense {
            key: data[2] & 0x0f,
            asc: data[12],
            ascq: data[13],
        }
    }

    /// True if any of the fields carries information.
    pub fn is_set(&self) -> bool {
        self.key != 0 || self.asc != 0 || self.ascq != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ILLEGAL_REQUEST;

    #[test]
    fn fixed_format_round_trip() {
        let sense = Sense {
            key: ILLEGAL_REQUEST,
            asc: 0x24,
            ascq: 0x00,
        };
        let buf = sense.to_fixed();
        assert_eq!(buf[0], 0x70);
        assert_eq!(buf[7], 10);
        assert_eq!(Sense::from_fixed(&buf), sense);
    }

    #[test]
    fn short_buffer_decodes_empty() {
        assert_eq!(Sense::from_fixed(&[0x70, 0x00]), Sense::default());
        assert!(!Sense::from_fixed(&[]).is_set());
    }
}
