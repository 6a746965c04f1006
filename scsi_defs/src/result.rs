// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::constants::CHECK_CONDITION;
use crate::constants::GOOD;
use crate::constants::HOST_OK;
use crate::constants::SENSE_BUFFER_SIZE;
use crate::sense::Sense;

/// The completion envelope delivered once per logical command.
///
/// `status` packs the mid-layer host status in the upper half word and the
/// SAM device status in the lower byte, so a zero status means the command
/// completed cleanly end to end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScsiResult {
    /// `host_status << 16 | device_status`.
    pub status: u32,
    /// Bytes actually transferred, summed over any physical sub-commands.
    pub bytes_xferred: u64,
    /// Fixed-format sense data, valid when the device status is
    /// CHECK CONDITION.
    pub sense: [u8; SENSE_BUFFER_SIZE],
    /// The serial number the issuer stamped on the command.
    pub serial: u32,
    /// The packed ID of the handle the command was issued through.
    pub origin_handle: u32,
}

impl ScsiResult {
    /// Packs a host and device status pair.
    pub fn make_status(host: u32, device: u8) -> u32 {
        (host << 16) | device as u32
    }

    /// The mid-layer host status half of `status`.
    pub fn host_status(&self) -> u32 {
        self.status >> 16
    }

    /// The SAM device status half of `status`.
    pub fn device_status(&self) -> u8 {
        self.status as u8
    }

    /// True when both halves report success.
    pub fn is_ok(&self) -> bool {
        self.host_status() == HOST_OK && self.device_status() == GOOD
    }

    /// The decoded sense, meaningful only on CHECK CONDITION.
    pub fn sense(&self) -> Sense {
        if self.device_status() == CHECK_CONDITION {
            Sense::from_fixed(&self.sense)
        } else {
            Sense::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HOST_TIMEOUT;
    use crate::constants::ILLEGAL_REQUEST;

    #[test]
    fn status_packing() {
        let mut result = ScsiResult {
            status: ScsiResult::make_status(HOST_TIMEOUT, CHECK_CONDITION),
            ..Default::default()
        };
        assert_eq!(result.host_status(), HOST_TIMEOUT);
        assert_eq!(result.device_status(), CHECK_CONDITION);
        assert!(!result.is_ok());
        result.status = 0;
        assert!(result.is_ok());
    }

    #[test]
    fn sense_only_on_check_condition() {
        let sense = Sense {
            key: ILLEGAL_REQUEST,
            asc: 0x20,
            ascq: 0,
        };
        let mut result = ScsiResult {
            status: ScsiResult::make_status(HOST_OK, CHECK_CONDITION),
            sense: sense.to_fixed(),
            ..Default::default()
        };
        assert_eq!(result.sense(), sense);
        result.status = ScsiResult::make_status(HOST_OK, GOOD);
        assert!(!result.sense().is_set());
    }
}
