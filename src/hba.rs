// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The downward contract between the mid-layer and host-bus-adapter drivers.

use std::fmt;
use std::sync::Arc;

use scsi_defs::Sense;
use scsi_defs::CHECK_CONDITION;
use scsi_defs::GOOD;
use scsi_defs::HOST_OK;
use scsi_defs::SENSE_BUFFER_SIZE;

use crate::adapter::Adapter;
use crate::command::Command;
use crate::target::DiskId;
use crate::target::Target;
use crate::token::Token;
use crate::WorldId;

/// PCI coordinates of the adapter hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.dev, self.func)
    }
}

/// Constant properties a driver declares when registering an adapter.
#[derive(Clone, Debug)]
pub struct AdapterCaps {
    /// Stable adapter name, e.g. "vmhba0".
    pub name: String,
    /// The driver implementation behind the adapter.
    pub driver_name: String,
    /// Owning driver module, for use-count bookkeeping.
    pub module_id: u32,
    pub pci: PciAddress,
    /// Maximum scatter-gather entries per dispatched command. Zero marks a
    /// block-only adapter whose commands are never split.
    pub sg_size: u32,
    /// Maximum bytes in one dispatched command.
    pub max_xfer: u64,
    /// Whether the adapter can DMA above the low-memory watermark.
    pub pae_capable: bool,
    /// Highest target id the driver will answer `get_info` for.
    pub max_targets: u32,
    /// Highest lun the driver will answer `get_info` for.
    pub max_luns: u32,
}

/// What the driver did with a dispatched command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// The command was accepted and will complete asynchronously.
    Dispatched,
    /// The driver queue is full; the command was not accepted.
    WouldBlock,
    /// The driver rejected the command outright.
    Failure,
}

/// Per-unit discovery data returned by a driver's `get_info`.
#[derive(Clone, Debug)]
pub struct TargetInfo {
    pub disk_id: DiskId,
    /// Peripheral device type from the INQUIRY data.
    pub class: u8,
    pub block_size: u32,
    pub num_blocks: u64,
    pub queue_depth: u32,
    /// The unit requires a vendor activate command to switch paths.
    pub supports_manual_switchover: bool,
    /// Vendor quirk: the unit misbehaves under any policy but MRU.
    pub must_use_mru: bool,
    /// The unit is a pseudo disk exposed by the array controller.
    pub pseudo: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

/// Identifies one dispatched physical command across the driver boundary.
///
/// The driver holds this token-bearing id for the life of the command and
/// hands it back to [`crate::core::ScsiCore::command_complete`]; everything
/// the completion pipeline needs to route the result is inside.
pub struct ResultId {
    pub(crate) adapter: Arc<Adapter>,
    pub(crate) target: Arc<Target>,
    pub(crate) path_idx: usize,
    pub(crate) token: Arc<Token>,
    pub(crate) handle_id: u32,
    pub(crate) partition: u16,
    pub(crate) serial: u32,
    pub(crate) world: WorldId,
    /// Whether the dispatch was charged to the scheduler; bypass-queue and
    /// internal probe commands are not.
    pub(crate) accounted: bool,
}

impl ResultId {
    /// The serial stamped on the command this id tracks.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// The packed id of the issuing handle.
    pub fn handle_id(&self) -> u32 {
        self.handle_id
    }
}

/// A completion report from the driver.
#[derive(Copy, Clone, Debug)]
pub struct CompletionInfo {
    pub host_status: u32,
    pub device_status: u8,
    pub sense: [u8; SENSE_BUFFER_SIZE],
    pub bytes_xferred: u64,
}

impl CompletionInfo {
    pub fn ok(bytes_xferred: u64) -> CompletionInfo {
        CompletionInfo {
            host_status: HOST_OK,
            device_status: GOOD,
            sense: [0; SENSE_BUFFER_SIZE],
            bytes_xferred,
        }
    }

    pub fn host_error(host_status: u32) -> CompletionInfo {
        CompletionInfo {
            host_status,
            device_status: GOOD,
            sense: [0; SENSE_BUFFER_SIZE],
            bytes_xferred: 0,
        }
    }

    pub fn device_error(device_status: u8) -> CompletionInfo {
        CompletionInfo {
            host_status: HOST_OK,
            device_status,
            sense: [0; SENSE_BUFFER_SIZE],
            bytes_xferred: 0,
        }
    }

    pub fn check_condition(sense: Sense) -> CompletionInfo {
        CompletionInfo {
            host_status: HOST_OK,
            device_status: CHECK_CONDITION,
            sense: sense.to_fixed(),
            bytes_xferred: 0,
        }
    }
}

/// The callback table a driver registers per adapter.
///
/// `command` is called with no mid-layer locks held and may be called from
/// many threads at once. Completion may be reported from any context,
/// including one that must not block.
pub trait HbaDriver: Send + Sync {
    /// Dispatches one physical command.
    fn command(&self, world: WorldId, cmd: &Command, rid: ResultId) -> DispatchResult;

    /// Reports whether a unit answers at (id, lun), and its identity.
    fn get_info(&self, id: u32, lun: u32) -> Option<TargetInfo>;

    /// The adapter is being torn down.
    fn close(&self) {}

    /// One-line diagnostic state for the proc surface.
    fn proc_info(&self) -> String {
        String::new()
    }

    /// Asks the driver to log its internal queue for (id, lun).
    fn dump_queue(&self, _id: u32, _lun: u32) {}

    fn get_geometry(&self, _id: u32, _lun: u32) -> Option<Geometry> {
        None
    }

    /// Driver-specific control; the mid-layer passes these through.
    fn ioctl(&self, _id: u32, _lun: u32, _cmd: u32, _arg: u64) -> crate::Result<u64> {
        Err(crate::Error::InvalidTarget)
    }

    /// Storage-specific control; the mid-layer passes these through.
    fn sioctl(&self, _id: u32, _lun: u32, _cmd: u32, _arg: u64) -> crate::Result<u64> {
        Err(crate::Error::InvalidTarget)
    }

    /// Asks the driver to re-probe its bus before the mid-layer re-walks
    /// (id, lun) space.
    fn rescan(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pci_address_formatting() {
        let pci = PciAddress {
            bus: 0,
            dev: 0x1f,
            func: 2,
        };
        assert_eq!(pci.to_string(), "00:1f.2");
    }

    #[test]
    fn completion_builders() {
        assert!(CompletionInfo::ok(512).host_status == HOST_OK);
        let check = CompletionInfo::check_condition(Sense {
            key: scsi_defs::UNIT_ATTENTION,
            asc: scsi_defs::ASC_POWER_ON_RESET,
            ascq: 0,
        });
        assert_eq!(check.device_status, CHECK_CONDITION);
        assert_eq!(Sense::from_fixed(&check.sense).key, scsi_defs::UNIT_ATTENTION);
    }
}
