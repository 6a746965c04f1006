// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Open handles and the bounded, generation-stamped handle table.

use std::collections::VecDeque;
use std::sync::Arc;

use sync::Condvar;
use sync::Mutex;

use crate::adapter::Adapter;
use crate::partition::is_extended_type;
use crate::partition::Partition;
use crate::partition::DUMP_PARTITION_TYPE;
use crate::partition::KERNEL_PARTITION_TYPE;
use crate::partition::WHOLE_DISK_PARTITION;
use crate::target::Target;
use crate::token::Token;
use crate::Error;
use crate::Result;
use crate::WorldId;

/// Capacity of the handle table.
pub const MAX_HANDLES: usize = 256;

// Handle flag bits.
/// Writes through the handle are refused.
pub const HANDLE_READONLY: u32 = 1 << 0;
/// The opener declared shared-writer intent.
pub const HANDLE_MULTIPLE_WRITERS: u32 = 1 << 1;
/// The open came from the host administrative layer.
pub const HANDLE_HOST_OPEN: u32 = 1 << 2;
/// The open observed a reservation conflict and completed lazily.
pub const HANDLE_PHYSICAL_RESERVE: u32 = 1 << 3;
/// The handle is on its way out; new commands are refused.
pub const HANDLE_CLOSING: u32 = 1 << 4;
/// The open targets the crash-dump partition.
pub const HANDLE_DUMP_OPEN: u32 = 1 << 5;

pub(crate) struct HandleState {
    pub flags: u32,
    /// Serial counter for commands issued through the handle.
    pub serial: u32,
    /// Commands issued and not yet completed.
    pub pending: u32,
    /// Completed tokens awaiting consumption by the host drain.
    pub results: VecDeque<Arc<Token>>,
}

/// An open reference to (adapter, target, partition) owned by a world.
pub struct Handle {
    /// Packed id: `generation * MAX_HANDLES + slot`.
    pub id: u32,
    pub world: WorldId,
    pub adapter: Arc<Adapter>,
    pub target: Arc<Target>,
    pub partition: u16,
    pub(crate) state: Mutex<HandleState>,
    pub(crate) result_cv: Condvar,
}

impl Handle {
    pub(crate) fn new(
        id: u32,
        world: WorldId,
        adapter: Arc<Adapter>,
        target: Arc<Target>,
        partition: u16,
        flags: u32,
    ) -> Arc<Handle> {
        Arc::new(Handle {
            id,
            world,
            adapter,
            target,
            partition,
            state: Mutex::new(HandleState {
                flags,
                serial: 0,
                pending: 0,
                results: VecDeque::new(),
            }),
            result_cv: Condvar::new(),
        })
    }

    pub fn flags(&self) -> u32 {
        self.state.lock().flags
    }

    pub(crate) fn set_flags(&self, bits: u32) {
        self.state.lock().flags |= bits;
    }

    pub fn is_closing(&self) -> bool {
        self.flags() & HANDLE_CLOSING != 0
    }

    pub(crate) fn next_serial(&self) -> u32 {
        let mut state = self.state.lock();
        state.serial = state.serial.wrapping_add(1);
        state.serial
    }

    pub fn pending(&self) -> u32 {
        self.state.lock().pending
    }

    pub(crate) fn inc_pending(&self) {
        self.state.lock().pending += 1;
    }

    pub(crate) fn dec_pending(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    /// Links a completed token onto the result list for the host drain.
    pub(crate) fn push_result(&self, token: Arc<Token>) {
        self.state.lock().results.push_back(token);
        self.result_cv.notify_all();
    }

    /// Pops one completed token; the bool reports whether more remain.
    pub fn pop_result(&self) -> Option<(Arc<Token>, bool)> {
        let mut state = self.state.lock();
        let token = state.results.pop_front()?;
        Some((token, !state.results.is_empty()))
    }
}

/// Decides whether a new open of `part` may proceed, given the flags of the
/// request, and returns the possibly adjusted handle flags.
///
/// Host opens degrade to read-only on conflicts and on extended partitions;
/// everything else is refused with BUSY on conflict. VM and kernel opens are
/// additionally pinned to the kernel (or dump) partition type.
pub(crate) fn check_open_conflict(
    part: &Partition,
    requested_flags: u32,
    class_is_disk: bool,
    passthrough_locking: bool,
) -> Result<u32> {
    let mut flags = requested_flags;
    if !class_is_disk {
        // Non-disk devices have no partition structure to arbitrate; the
        // passthrough lock serializes openers wholesale.
        if passthrough_locking && part.is_open() {
            return Err(Error::Busy);
        }
        return Ok(flags);
    }

    let wants_multi_writer = flags & HANDLE_MULTIPLE_WRITERS != 0;
    let conflict = part.writers > 0 && !(wants_multi_writer && part.flags & crate::partition::PART_MULTI_WRITER != 0);

    if flags & HANDLE_HOST_OPEN != 0 {
        if conflict || is_extended_type(part.ptype) {
            flags |= HANDLE_READONLY;
        }
        return Ok(flags);
    }

    if conflict {
        return Err(Error::Busy);
    }
    if part.number != WHOLE_DISK_PARTITION {
        let wanted = if flags & HANDLE_DUMP_OPEN != 0 {
            DUMP_PARTITION_TYPE
        } else {
            KERNEL_PARTITION_TYPE
        };
        if part.ptype != wanted {
            return Err(Error::InvalidPartition);
        }
    }
    Ok(flags)
}

/// Fixed-capacity handle table with generation-stamped ids.
///
/// The allocation cursor only moves forward, so a freed slot is not handed
/// out again until the cursor wraps, and every wrap bumps the generation; a
/// stale id therefore can never resolve to its slot's next occupant.
pub(crate) struct HandleTable {
    slots: Vec<Option<Arc<Handle>>>,
    generation: u32,
    next_slot: usize,
    count: usize,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            slots: (0..MAX_HANDLES).map(|_| None).collect(),
            generation: 0,
            next_slot: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Reserves a slot and returns the packed id for it.
    pub fn alloc_id(&mut self) -> Option<(u32, usize)> {
        if self.count >= MAX_HANDLES {
            return None;
        }
        loop {
            if self.next_slot == MAX_HANDLES {
                self.next_slot = 0;
                self.generation = self.generation.wrapping_add(1);
            }
            let slot = self.next_slot;
            self.next_slot += 1;
            if self.slots[slot].is_none() {
                let id = self.generation.wrapping_mul(MAX_HANDLES as u32) + slot as u32;
                return Some((id, slot));
            }
        }
    }

    pub fn install(&mut self, slot: usize, handle: Arc<Handle>) {
        assert!(self.slots[slot].is_none(), "handle slot double use");
        self.slots[slot] = Some(handle);
        self.count += 1;
    }

    /// Resolves a packed id, requiring full equality with the stored id.
    pub fn lookup(&self, id: u32) -> Option<Arc<Handle>> {
        if id == crate::INVALID_HANDLE_ID {
            return None;
        }
        let slot = id as usize % MAX_HANDLES;
        match &self.slots[slot] {
            Some(handle) if handle.id == id => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: u32) -> Option<Arc<Handle>> {
        let slot = id as usize % MAX_HANDLES;
        match &self.slots[slot] {
            Some(handle) if handle.id == id => {
                self.count -= 1;
                self.slots[slot].take()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_never_repeat_across_reuse() {
        let mut table = HandleTable::new();
        let mut seen = std::collections::HashSet::new();
        // Fill the table, recording every id.
        let mut ids = Vec::new();
        for _ in 0..MAX_HANDLES {
            let (id, slot) = table.alloc_id().unwrap();
            table.install(
                slot,
                Handle::new(
                    id,
                    1,
                    test_adapter(),
                    test_target(),
                    0,
                    0,
                ),
            );
            assert!(seen.insert(id));
            ids.push(id);
        }
        assert!(table.alloc_id().is_none());
        // Free a few slots and re-allocate; the wrap bumps the generation so
        // the new ids are fresh.
        for id in &ids[..8] {
            table.remove(*id).unwrap();
        }
        for _ in 0..8 {
            let (id, slot) = table.alloc_id().unwrap();
            table.install(slot, Handle::new(id, 1, test_adapter(), test_target(), 0, 0));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn id_uniqueness_under_random_churn() {
        use rand::rngs::StdRng;
        use rand::Rng;
        use rand::SeedableRng;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut table = HandleTable::new();
        let mut live: Vec<u32> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let adapter = test_adapter();
        let target = test_target();
        for _ in 0..4000 {
            if live.len() < MAX_HANDLES && (live.is_empty() || rng.gen_bool(0.6)) {
                let (id, slot) = table.alloc_id().unwrap();
                table.install(
                    slot,
                    Handle::new(id, 1, adapter.clone(), target.clone(), 0, 0),
                );
                assert!(seen.insert(id), "id {:#x} repeated", id);
                live.push(id);
            } else {
                let idx = rng.gen_range(0..live.len());
                let id = live.swap_remove(idx);
                table.remove(id).unwrap();
                assert!(table.lookup(id).is_none());
            }
        }
    }

    #[test]
    fn stale_id_does_not_resolve() {
        let mut table = HandleTable::new();
        let (id, slot) = table.alloc_id().unwrap();
        table.install(slot, Handle::new(id, 1, test_adapter(), test_target(), 0, 0));
        table.remove(id).unwrap();
        assert!(table.lookup(id).is_none());
    }

    #[test]
    fn host_open_degrades_to_read_only_on_conflict() {
        let mut part = whole_disk();
        part.writers = 1;
        let flags = check_open_conflict(&part, HANDLE_HOST_OPEN, true, true).unwrap();
        assert!(flags & HANDLE_READONLY != 0);
    }

    #[test]
    fn vm_open_busy_on_conflict() {
        let mut part = whole_disk();
        part.writers = 1;
        assert_eq!(
            check_open_conflict(&part, 0, true, true),
            Err(Error::Busy)
        );
    }

    #[test]
    fn multi_writer_intent_clears_conflict() {
        let mut part = whole_disk();
        part.writers = 1;
        part.flags |= crate::partition::PART_MULTI_WRITER;
        assert!(check_open_conflict(&part, HANDLE_MULTIPLE_WRITERS, true, true).is_ok());
    }

    #[test]
    fn vm_open_requires_kernel_partition_type() {
        let mut part = whole_disk();
        part.number = 1;
        part.ptype = 0x83;
        assert_eq!(
            check_open_conflict(&part, 0, true, true),
            Err(Error::InvalidPartition)
        );
        part.ptype = KERNEL_PARTITION_TYPE;
        assert!(check_open_conflict(&part, 0, true, true).is_ok());
    }

    #[test]
    fn passthrough_locking_limits_nondisk_opens() {
        let mut part = whole_disk();
        part.readers = 1;
        assert_eq!(
            check_open_conflict(&part, 0, false, true),
            Err(Error::Busy)
        );
        assert!(check_open_conflict(&part, 0, false, false).is_ok());
    }

    fn whole_disk() -> Partition {
        crate::partition::build_partitions(&[], 1024).remove(0)
    }

    fn test_adapter() -> Arc<Adapter> {
        use crate::hba::*;
        struct NullDriver;
        impl crate::hba::HbaDriver for NullDriver {
            fn command(
                &self,
                _world: WorldId,
                _cmd: &crate::Command,
                _rid: ResultId,
            ) -> DispatchResult {
                DispatchResult::Failure
            }
            fn get_info(&self, _id: u32, _lun: u32) -> Option<TargetInfo> {
                None
            }
        }
        Adapter::new(
            AdapterCaps {
                name: "vmhba0".to_string(),
                driver_name: "nulldrv".to_string(),
                module_id: 1,
                pci: PciAddress::default(),
                sg_size: 8,
                max_xfer: 1 << 20,
                pae_capable: true,
                max_targets: 4,
                max_luns: 1,
            },
            Arc::new(NullDriver),
        )
    }

    fn test_target() -> Arc<Target> {
        let adapter = test_adapter();
        Target::new(
            &adapter,
            0,
            0,
            &crate::hba::TargetInfo {
                disk_id: crate::target::DiskId::serial(0, b"T0"),
                class: scsi_defs::TYPE_DISK,
                block_size: 512,
                num_blocks: 1 << 20,
                queue_depth: 4,
                supports_manual_switchover: false,
                must_use_mru: false,
                pseudo: false,
            },
        )
    }
}
