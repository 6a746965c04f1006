// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SCSI command-set definitions shared by the mid-layer and its drivers.
//!
//! Values follow the t10 specs:
//! SPC-3: <https://www.t10.org/cgi-bin/ac.pl?t=f&f=spc3r23.pdf>
//! SAM-5: <https://www.t10.org/cgi-bin/ac.pl?t=f&f=sam5r21.pdf>

mod cdb;
mod constants;
mod result;
mod sense;

pub use cdb::cdb_lba_and_len;
pub use cdb::cdb_set_lba_and_len;
pub use cdb::is_read_opcode;
pub use cdb::is_rw_opcode;
pub use cdb::is_write_opcode;
pub use constants::*;
pub use result::ScsiResult;
pub use sense::Sense;
