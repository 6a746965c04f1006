// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::Weak;

use sync::Mutex;

use crate::adapter::Adapter;
use crate::hba::TargetInfo;
use crate::multipath::PathPolicy;
use crate::partition::Partition;
use crate::path::Path;
use crate::path::PathState;
use crate::sched::SchedQ;
use crate::stats::IoStats;
use crate::WorldId;

/// How a device identifies itself, independent of the path it was seen on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiskIdKind {
    /// Sentinel: treat the device as distinct regardless of byte equality.
    Unique,
    /// Vendor serial-number page.
    SerialNumber,
    /// Device-identification VPD page.
    Page83,
}

/// The vendor-assigned identity of a logical unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskId {
    pub kind: DiskIdKind,
    pub lun: u32,
    pub data: Vec<u8>,
}

impl DiskId {
    /// An identity that never merges with another discovery.
    pub fn unique(seed: &str) -> DiskId {
        DiskId {
            kind: DiskIdKind::Unique,
            lun: 0,
            data: seed.as_bytes().to_vec(),
        }
    }

    pub fn serial(lun: u32, serial: &[u8]) -> DiskId {
        DiskId {
            kind: DiskIdKind::SerialNumber,
            lun,
            data: serial.to_vec(),
        }
    }

    /// Whether two discoveries name the same logical unit.
    ///
    /// Byte-equal ids of kind [`DiskIdKind::Unique`] are still distinct; that
    /// kind exists precisely to defeat merging for devices with unreliable
    /// identity pages.
    pub fn same_logical_unit(&self, other: &DiskId) -> bool {
        self.kind != DiskIdKind::Unique
            && self.kind == other.kind
            && self.lun == other.lun
            && self.data == other.data
    }
}

// Target flag bits.
/// The array needs a vendor activate command to switch the active side.
pub const TARGET_SUPPORTS_MANUAL_SWITCHOVER: u32 = 1 << 0;
/// Vendor quirk forcing the MRU path policy.
pub const TARGET_MUST_USE_MRU: u32 = 1 << 1;
/// This host holds the device reservation.
pub const TARGET_RESERVED_LOCAL: u32 = 1 << 2;
/// Reservation conflicts fail fast until a read or write succeeds.
pub const TARGET_NO_RETRY_ON_RESERV_CONFLICT: u32 = 1 << 3;
/// The unit is a pseudo disk exposed by an array controller.
pub const TARGET_PSEUDO_DISK: u32 = 1 << 4;

pub(crate) struct TargetInner {
    pub disk_id: DiskId,
    pub flags: u32,
    pub block_size: u32,
    pub num_blocks: u64,
    pub partitions: Vec<Partition>,
    pub max_qdepth: u32,
    pub cur_qdepth: u32,
    pub paths: Vec<Path>,
    pub active_path: usize,
    pub preferred_path: Option<usize>,
    pub last_rr_path: usize,
    pub policy: PathPolicy,
    pub refcount: u32,
    pub use_count: u32,
    pub sched: BTreeMap<WorldId, SchedQ>,
    /// Physical commands in flight against the device, all worlds.
    pub cif: u32,
    /// Logical commands sitting in the scheduler queues.
    pub queued: u32,
    /// While positive, only a failover override may dispatch.
    pub delay_cmds: u32,
    pub failover_in_progress: bool,
    pub stats: IoStats,
}

/// One logical unit, reachable over one or more paths.
pub struct Target {
    /// Non-owning back-reference to the adapter the primary path uses.
    pub adapter: Weak<Adapter>,
    pub adapter_name: String,
    pub id: u32,
    pub lun: u32,
    pub class: u8,
    pub(crate) inner: Mutex<TargetInner>,
}

impl Target {
    pub(crate) fn new(adapter: &Arc<Adapter>, id: u32, lun: u32, info: &TargetInfo) -> Arc<Target> {
        let mut flags = 0;
        if info.supports_manual_switchover {
            flags |= TARGET_SUPPORTS_MANUAL_SWITCHOVER;
        }
        if info.must_use_mru {
            flags |= TARGET_MUST_USE_MRU;
        }
        if info.pseudo {
            flags |= TARGET_PSEUDO_DISK;
        }
        let policy = if info.must_use_mru {
            PathPolicy::MostRecentlyUsed
        } else {
            PathPolicy::Fixed
        };
        Arc::new(Target {
            adapter: Arc::downgrade(adapter),
            adapter_name: adapter.caps.name.clone(),
            id,
            lun,
            class: info.class,
            inner: Mutex::new(TargetInner {
                disk_id: info.disk_id.clone(),
                flags,
                block_size: info.block_size,
                num_blocks: info.num_blocks,
                partitions: crate::partition::build_partitions(&[], info.num_blocks),
                max_qdepth: info.queue_depth,
                cur_qdepth: info.queue_depth.max(1),
                paths: vec![Path::new(adapter, id, lun)],
                active_path: 0,
                preferred_path: None,
                last_rr_path: 0,
                policy,
                refcount: 1,
                use_count: 0,
                sched: BTreeMap::new(),
                cif: 0,
                queued: 0,
                delay_cmds: 0,
                failover_in_progress: false,
                stats: IoStats::default(),
            }),
        })
    }

    pub fn is_disk_class(&self) -> bool {
        self.class == scsi_defs::TYPE_DISK
    }

    /// Whether a discovery at (adapter, id, lun) names a path of this target.
    pub fn has_path(&self, adapter_name: &str, id: u32, lun: u32) -> bool {
        self.inner
            .lock()
            .paths
            .iter()
            .any(|p| p.matches(adapter_name, id, lun))
    }

    pub fn same_logical_unit(&self, disk_id: &DiskId) -> bool {
        self.inner.lock().disk_id.same_logical_unit(disk_id)
    }

    /// Adds a secondary path. The caller has already checked for duplicate
    /// coordinates.
    pub(crate) fn add_path(&self, adapter: &Arc<Adapter>, id: u32, lun: u32) {
        let mut inner = self.inner.lock();
        let mut path = Path::new(adapter, id, lun);
        // Secondary paths of a switchover array come up passive.
        if inner.flags & TARGET_SUPPORTS_MANUAL_SWITCHOVER != 0 {
            path.state = PathState::Standby;
        }
        inner.paths.push(path);
    }

    /// Removes the path at (adapter, id, lun), fixing up the active and
    /// preferred indices. Returns false if the path is unknown or is the last
    /// one.
    pub(crate) fn remove_path(&self, adapter_name: &str, id: u32, lun: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.paths.len() <= 1 {
            return false;
        }
        let Some(idx) = inner
            .paths
            .iter()
            .position(|p| p.matches(adapter_name, id, lun))
        else {
            return false;
        };
        inner.paths.remove(idx);
        let fix = |slot: usize| if slot > idx { slot - 1 } else { slot };
        if inner.active_path == idx {
            inner.active_path = 0;
        } else {
            inner.active_path = fix(inner.active_path);
        }
        inner.last_rr_path = 0;
        inner.preferred_path = match inner.preferred_path {
            Some(p) if p == idx => None,
            Some(p) if p > idx => Some(p - 1),
            other => other,
        };
        true
    }

    /// The diagnostic path-state string: one entry per path, `*` marking the
    /// active path and `#` the preferred one.
    pub fn path_state_string(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::from("{");
        for (i, path) in inner.paths.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}", path.state);
            if i == inner.active_path {
                out.push('*');
            }
            if inner.preferred_path == Some(i) {
                out.push('#');
            }
        }
        out.push('}');
        out
    }

    /// Administrative policy change.
    ///
    /// Targets carrying the MRU vendor quirk refuse other policies.
    pub fn set_policy(&self, policy: PathPolicy) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if inner.flags & TARGET_MUST_USE_MRU != 0 && policy != PathPolicy::MostRecentlyUsed {
            return Err(crate::Error::Busy);
        }
        inner.policy = policy;
        Ok(())
    }

    /// Administrative preferred-path change for the FIXED policy.
    pub fn set_preferred_path(&self, index: Option<usize>) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(idx) = index {
            if idx >= inner.paths.len() {
                return Err(crate::Error::InvalidTarget);
            }
        }
        inner.preferred_path = index;
        Ok(())
    }

    /// Administrative path enable/disable: ON ↔ OFF.
    pub fn set_path_enabled(&self, index: usize, enabled: bool) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let Some(path) = inner.paths.get_mut(index) else {
            return Err(crate::Error::InvalidTarget);
        };
        match (path.state, enabled) {
            (PathState::Off, true) => path.state = PathState::On,
            (PathState::On, false) | (PathState::Standby, false) => path.state = PathState::Off,
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn retain(&self) {
        self.inner.lock().refcount += 1;
    }

    pub(crate) fn release(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.refcount > 0, "target refcount underflow");
        inner.refcount -= 1;
    }

    pub fn refcount(&self) -> u32 {
        self.inner.lock().refcount
    }

    pub fn use_count(&self) -> u32 {
        self.inner.lock().use_count
    }

    /// Reports `(block_size, num_blocks)` for the whole target.
    pub fn capacity(&self) -> (u32, u64) {
        let inner = self.inner.lock();
        (inner.block_size, inner.num_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_id_identity() {
        let a = DiskId::serial(0, b"WD-1234");
        let b = DiskId::serial(0, b"WD-1234");
        let c = DiskId::serial(1, b"WD-1234");
        assert!(a.same_logical_unit(&b));
        assert!(!a.same_logical_unit(&c));
    }

    #[test]
    fn unique_kind_never_merges() {
        let a = DiskId::unique("vmhba0:0:0");
        let b = a.clone();
        assert_eq!(a, b);
        assert!(!a.same_logical_unit(&b));
    }
}
