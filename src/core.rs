// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The mid-layer facade: process-wide state, registration, the handle
//! lifecycle and the upward command contract.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use scsi_defs::ScsiResult;
use scsi_defs::RESERVATION_CONFLICT;
use scsi_defs::RELEASE_6;
use scsi_defs::RESERVE_6;
use scsi_defs::TEST_UNIT_READY;

use sync::Mutex;

use crate::adapter::Adapter;
use crate::adapter::AdapterTable;
use crate::blocking;
use crate::bounce::BouncePool;
use crate::command::Command;
use crate::command::SgList;
use crate::complete;
use crate::config::MidLayerOptions;
use crate::handle;
use crate::handle::Handle;
use crate::handle::HandleTable;
use crate::handle::HANDLE_CLOSING;
use crate::handle::HANDLE_MULTIPLE_WRITERS;
use crate::handle::HANDLE_PHYSICAL_RESERVE;
use crate::handle::HANDLE_READONLY;
use crate::hba::AdapterCaps;
use crate::hba::CompletionInfo;
use crate::hba::Geometry;
use crate::hba::HbaDriver;
use crate::hba::ResultId;
use crate::hba::TargetInfo;
use crate::helper::HelperPool;
use crate::issue;
use crate::issue::Delivery;
use crate::mem::MachineMemory;
use crate::partition::refresh_partitions;
use crate::partition::PartitionTableSource;
use crate::partition::PART_MULTI_WRITER;
use crate::partition::PART_READ_ONLY;
use crate::rescan;
use crate::target::Target;
use crate::token::Token;
use crate::Error;
use crate::Result;
use crate::WorldId;
use crate::HOST_CONSOLE_WORLD;

/// How long the open-time reservation probe may take.
const OPEN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A snapshot of one handle's identity and state.
#[derive(Clone, Debug)]
pub struct HandleInfo {
    pub adapter_name: String,
    pub target_id: u32,
    pub lun: u32,
    pub partition: u16,
    pub world: WorldId,
    pub flags: u32,
    pub pending: u32,
}

/// The SCSI mid-layer instance.
///
/// Everything process-wide lives here: the adapter registry, the handle
/// table, the bounce pool and the helper worlds. See the crate docs for the
/// lock ordering.
pub struct ScsiCore {
    pub options: MidLayerOptions,
    pub(crate) mem: Arc<dyn MachineMemory>,
    pub(crate) adapters: Mutex<AdapterTable>,
    pub(crate) handles: Mutex<HandleTable>,
    pub(crate) bounce: BouncePool,
    pub(crate) helpers: HelperPool,
    part_source: Box<dyn PartitionTableSource>,
}

impl ScsiCore {
    pub fn new(
        options: MidLayerOptions,
        mem: Arc<dyn MachineMemory>,
        part_source: Box<dyn PartitionTableSource>,
    ) -> Arc<ScsiCore> {
        let bounce_pages = options.bounce_pages;
        let helper_worlds = options.helper_worlds;
        let core = Arc::new(ScsiCore {
            options,
            mem,
            adapters: Mutex::new(AdapterTable::new()),
            handles: Mutex::new(HandleTable::new()),
            bounce: BouncePool::new(bounce_pages),
            helpers: HelperPool::new(),
            part_source,
        });
        core.helpers.start(Arc::downgrade(&core), helper_worlds);
        core
    }

    /// Stops the helper worlds and closes every registered driver.
    pub fn shutdown(&self) {
        self.helpers.shutdown();
        for adapter in self.adapters.lock().iter() {
            adapter.driver.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<ScsiCore> {
        use crate::mem::LOW_MEM_LIMIT;
        use crate::mem::VecMemory;
        use crate::partition::WholeDiskSource;
        ScsiCore::new(
            MidLayerOptions::default(),
            VecMemory::with_regions(&[(0, 2 << 20), (LOW_MEM_LIMIT, 1 << 20)]),
            Box::new(WholeDiskSource),
        )
    }

    pub(crate) fn lookup_handle(&self, id: u32) -> Option<Arc<Handle>> {
        self.handles.lock().lookup(id)
    }

    pub fn lookup_adapter(&self, name: &str) -> Option<Arc<Adapter>> {
        self.adapters.lock().find(name)
    }

    /// The adapter a target's primary path belongs to. Falls back to a name
    /// lookup so a re-registered adapter reattaches.
    pub(crate) fn primary_adapter(&self, target: &Arc<Target>) -> Option<Arc<Adapter>> {
        target
            .adapter
            .upgrade()
            .or_else(|| self.lookup_adapter(&target.adapter_name))
    }

    // --- Registration -----------------------------------------------------

    /// Registers one adapter and its driver callback table.
    pub fn register_adapter(
        &self,
        caps: AdapterCaps,
        driver: Arc<dyn HbaDriver>,
    ) -> Result<Arc<Adapter>> {
        let adapter = Adapter::new(caps, driver);
        let mut table = self.adapters.lock();
        if table.rescan_in_progress {
            return Err(Error::Busy);
        }
        table.insert(adapter.clone(), self.options.max_adapters)?;
        Ok(adapter)
    }

    /// Tears an adapter down once nothing references it.
    pub fn unregister_adapter(&self, name: &str, _module_unload: bool) -> Result<()> {
        let mut table = self.adapters.lock();
        let Some(adapter) = table.find(name) else {
            return Err(Error::InvalidAdapter);
        };
        {
            let inner = adapter.inner.lock();
            if inner.open_count != 0 || inner.path_evals != 0 {
                warn!(
                    "scsi: adapter {} still has {} opens, not destroyed",
                    name, inner.open_count
                );
                return Err(Error::Busy);
            }
            if inner
                .targets
                .iter()
                .any(|t| t.refcount() > 1 || t.use_count() > 0)
            {
                return Err(Error::Busy);
            }
        }
        table.remove(name);
        drop(table);
        adapter.driver.close();
        Ok(())
    }

    // --- Topology ---------------------------------------------------------

    /// Records a discovered unit. A unit whose identity matches an existing
    /// target on any adapter contributes a path to that target instead of a
    /// new one; a second path at identical coordinates is rejected.
    pub fn create_target(
        &self,
        adapter: &Arc<Adapter>,
        id: u32,
        lun: u32,
        info: &TargetInfo,
    ) -> Result<Arc<Target>> {
        if self
            .find_target_by_path(&adapter.caps.name, id, lun)
            .is_some()
        {
            return Err(Error::InvalidTarget);
        }
        {
            let table = self.adapters.lock();
            for other in table.iter() {
                for target in other.targets() {
                    if target.same_logical_unit(&info.disk_id) {
                        target.add_path(adapter, id, lun);
                        return Ok(target);
                    }
                }
            }
        }
        let target = Target::new(adapter, id, lun, info);
        adapter.inner.lock().targets.push(target.clone());
        Ok(target)
    }

    /// Removes the path at (adapter, id, lun); when it is the primary path,
    /// removes the whole target provided nothing holds it.
    pub fn remove_target(&self, adapter_name: &str, id: u32, lun: u32) -> Result<()> {
        let adapter = self
            .lookup_adapter(adapter_name)
            .ok_or(Error::InvalidAdapter)?;
        let target = self
            .find_target_by_path(adapter_name, id, lun)
            .ok_or(Error::InvalidTarget)?;
        let is_primary =
            target.adapter_name == adapter_name && target.id == id && target.lun == lun;
        if !is_primary {
            if target.remove_path(adapter_name, id, lun) {
                return Ok(());
            }
            return Err(Error::InvalidTarget);
        }
        {
            let inner = target.inner.lock();
            if inner.refcount != 1 || inner.use_count != 0 {
                return Err(Error::Busy);
            }
            let held = inner
                .sched
                .iter()
                .any(|(w, e)| *w != HOST_CONSOLE_WORLD && (e.has_queued() || e.cif > 0));
            if held {
                return Err(Error::Busy);
            }
        }
        adapter
            .inner
            .lock()
            .targets
            .retain(|t| !Arc::ptr_eq(t, &target));
        Ok(())
    }

    /// Looks a target up by path coordinates, taking a reference on it.
    pub fn find_target(&self, adapter_name: &str, id: u32, lun: u32) -> Option<Arc<Target>> {
        let target = self.find_target_by_path(adapter_name, id, lun)?;
        target.retain();
        Some(target)
    }

    pub fn release_target(&self, target: &Arc<Target>) {
        target.release();
    }

    pub(crate) fn find_target_by_path(
        &self,
        adapter_name: &str,
        id: u32,
        lun: u32,
    ) -> Option<Arc<Target>> {
        let table = self.adapters.lock();
        for adapter in table.iter() {
            for target in adapter.targets() {
                if target.has_path(adapter_name, id, lun) {
                    return Some(target);
                }
            }
        }
        None
    }

    /// Re-reads the partition table through the pluggable source, keeping
    /// open-state of surviving partitions. Caller holds the adapter's
    /// open-in-progress guard.
    pub(crate) fn refresh_partition_table(
        &self,
        adapter: &Arc<Adapter>,
        target: &Arc<Target>,
    ) -> Result<()> {
        let defs = self
            .part_source
            .read_partition_table(&adapter.caps.name, target.id, target.lun)
            .map_err(|err| {
                warn!(
                    "scsi: partition table read for {}:{}:{} failed: {:#}",
                    adapter.caps.name, target.id, target.lun, err
                );
                Error::Io(0)
            })?;
        let mut inner = target.inner.lock();
        let num_blocks = inner.num_blocks;
        inner.partitions = refresh_partitions(&inner.partitions, &defs, num_blocks);
        Ok(())
    }

    // --- Handle lifecycle -------------------------------------------------

    /// Opens `(adapter, id, lun, partition)` for `world`.
    ///
    /// Serialized per adapter by the open-in-progress guard, which also
    /// covers the partition-table (re)read. A reservation conflict observed
    /// while probing a disk yields a lazy open carrying
    /// [`HANDLE_PHYSICAL_RESERVE`].
    pub fn open(
        &self,
        adapter_name: &str,
        id: u32,
        lun: u32,
        partition: u16,
        world: WorldId,
        flags: u32,
    ) -> Result<u32> {
        let adapter = self
            .lookup_adapter(adapter_name)
            .ok_or(Error::InvalidAdapter)?;
        if self.adapters.lock().rescan_in_progress {
            return Err(Error::Busy);
        }
        adapter.begin_open();
        let result = self.open_guarded(&adapter, id, lun, partition, world, flags);
        adapter.end_open();
        result
    }

    fn open_guarded(
        &self,
        adapter: &Arc<Adapter>,
        id: u32,
        lun: u32,
        partition: u16,
        world: WorldId,
        flags: u32,
    ) -> Result<u32> {
        let target = self
            .find_target_by_path(&adapter.caps.name, id, lun)
            .ok_or(Error::InvalidTarget)?;

        if target.use_count() == 0 {
            // First opener refreshes the partition table.
            let _ = self.refresh_partition_table(adapter, &target);
        }

        let mut flags = flags;
        if target.is_disk_class() {
            let probe = Command::from_cdb(&[TEST_UNIT_READY, 0, 0, 0, 0, 0]);
            let active = target.inner.lock().active_path;
            if let Ok(result) =
                issue::dispatch_pinned_sync(self, &target, active, probe, OPEN_PROBE_TIMEOUT)
            {
                if result.device_status() == RESERVATION_CONFLICT {
                    flags |= HANDLE_PHYSICAL_RESERVE;
                }
            }
        }

        let adjusted = {
            let inner = target.inner.lock();
            let part = inner
                .partitions
                .iter()
                .find(|p| p.number == partition)
                .ok_or(Error::InvalidPartition)?;
            handle::check_open_conflict(
                part,
                flags,
                target.is_disk_class(),
                self.options.passthrough_locking,
            )?
        };

        let handle = {
            let mut table = self.handles.lock();
            let Some((packed, slot)) = table.alloc_id() else {
                return Err(Error::NoResources);
            };
            let handle = Handle::new(
                packed,
                world,
                adapter.clone(),
                target.clone(),
                partition,
                adjusted,
            );
            table.install(slot, handle.clone());
            handle
        };

        {
            let mut inner = target.inner.lock();
            inner.refcount += 1;
            inner.use_count += 1;
            if let Some(part) = inner
                .partitions
                .iter_mut()
                .find(|p| p.number == partition)
            {
                if adjusted & HANDLE_READONLY != 0 {
                    part.readers += 1;
                    if part.writers == 0 {
                        part.flags |= PART_READ_ONLY;
                    }
                } else {
                    part.writers += 1;
                    part.flags &= !PART_READ_ONLY;
                    if adjusted & HANDLE_MULTIPLE_WRITERS != 0 {
                        part.flags |= PART_MULTI_WRITER;
                    }
                }
            }
        }
        {
            let mut inner = adapter.inner.lock();
            inner.open_count += 1;
            inner.module_use_count += 1;
        }
        Ok(handle.id)
    }

    /// Closes a handle: releases partition counts, per-partition flags at
    /// zero, and the references pinning target, adapter and driver module.
    pub fn close(&self, handle_id: u32) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .remove(handle_id)
            .ok_or(Error::InvalidHandle)?;
        handle.set_flags(HANDLE_CLOSING);
        let flags = handle.flags();
        {
            let mut inner = handle.target.inner.lock();
            if let Some(part) = inner
                .partitions
                .iter_mut()
                .find(|p| p.number == handle.partition)
            {
                if flags & HANDLE_READONLY != 0 {
                    part.readers = part.readers.saturating_sub(1);
                } else {
                    part.writers = part.writers.saturating_sub(1);
                }
                if part.readers == 0 && part.writers == 0 {
                    part.flags &= !(PART_MULTI_WRITER | PART_READ_ONLY);
                }
            }
            inner.use_count = inner.use_count.saturating_sub(1);
            inner.refcount = inner.refcount.saturating_sub(1);
        }
        {
            let mut inner = handle.adapter.inner.lock();
            inner.open_count = inner.open_count.saturating_sub(1);
            inner.module_use_count = inner.module_use_count.saturating_sub(1);
        }
        Ok(())
    }

    // --- Command surface --------------------------------------------------

    /// Submits one command asynchronously; the returned token is the
    /// rendezvous for its completion.
    pub fn execute(&self, handle_id: u32, cmd: Command, delivery: Delivery) -> Result<Arc<Token>> {
        issue::execute(self, handle_id, cmd, delivery)
    }

    /// Submits one command and blocks through the retry policy.
    pub fn execute_sync(&self, handle_id: u32, cmd: &Command) -> Result<ScsiResult> {
        blocking::sync_execute(self, handle_id, cmd)
    }

    /// Aborts the command issued through `handle_id` with serial `serial`.
    pub fn abort(&self, handle_id: u32, serial: u32) -> Result<()> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        issue::do_abort(self, &handle, serial, false)
    }

    /// Purges and resets everything outstanding on the handle's target.
    pub fn reset(&self, handle_id: u32) -> Result<()> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        issue::do_abort(self, &handle, 0, true)
    }

    /// Sends a device reset down the active path without touching queues.
    pub fn reset_physical(&self, handle_id: u32) -> Result<()> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        let target = handle.target.clone();
        let mut cmd = Command::from_cdb(&[0]);
        cmd.kind = crate::command::CommandKind::Reset;
        if self.options.use_lun_reset {
            cmd.flags |= crate::command::CMD_USE_LUNRESET;
        }
        let active = target.inner.lock().active_path;
        issue::dispatch_pinned_sync(self, &target, active, cmd, OPEN_PROBE_TIMEOUT).map(|_| ())
    }

    /// Blocking single-range read of whole blocks.
    pub fn read_blocking(&self, handle_id: u32, sector: u64, blocks: u32, sg: SgList) -> Result<ScsiResult> {
        self.execute_sync(handle_id, &Command::read(sector, blocks, sg))
    }

    /// Blocking scatter-gather read or write; the block count comes from
    /// the list's total byte length.
    pub fn read_write_sg_blocking(
        &self,
        handle_id: u32,
        write: bool,
        sector: u64,
        sg: SgList,
    ) -> Result<ScsiResult> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        let (block_size, _) = handle.target.capacity();
        let total = sg.total_len();
        if block_size == 0 || total % block_size as u64 != 0 {
            return Err(Error::Io(0));
        }
        let blocks = (total / block_size as u64) as u32;
        let cmd = if write {
            Command::write(sector, blocks, sg)
        } else {
            Command::read(sector, blocks, sg)
        };
        self.execute_sync(handle_id, &cmd)
    }

    pub fn query_handle(&self, handle_id: u32) -> Result<HandleInfo> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        Ok(HandleInfo {
            adapter_name: handle.adapter.caps.name.clone(),
            target_id: handle.target.id,
            lun: handle.target.lun,
            partition: handle.partition,
            world: handle.world,
            flags: handle.flags(),
            pending: handle.pending(),
        })
    }

    /// Takes the device reservation through the handle's target.
    pub fn reserve(&self, handle_id: u32) -> Result<()> {
        let cmd = Command::from_cdb(&[RESERVE_6, 0, 0, 0, 0, 0]);
        self.execute_sync(handle_id, &cmd).map(|_| ())
    }

    /// Releases the device reservation.
    pub fn release(&self, handle_id: u32) -> Result<()> {
        let cmd = Command::from_cdb(&[RELEASE_6, 0, 0, 0, 0, 0]);
        self.execute_sync(handle_id, &cmd).map(|_| ())
    }

    /// Re-walks an adapter's (id, lun) space against the driver.
    pub fn rescan(&self, adapter_name: &str) -> Result<()> {
        rescan::rescan_adapter(self, adapter_name)
    }

    /// `(block_size, num_sectors)` of the partition behind the handle.
    pub fn get_capacity(&self, handle_id: u32) -> Result<(u32, u64)> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        let inner = handle.target.inner.lock();
        let part = inner
            .partitions
            .iter()
            .find(|p| p.number == handle.partition)
            .ok_or(Error::InvalidPartition)?;
        Ok((inner.block_size, part.num_sectors))
    }

    pub fn get_geometry(&self, handle_id: u32) -> Result<Geometry> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        handle
            .adapter
            .driver
            .get_geometry(handle.target.id, handle.target.lun)
            .ok_or(Error::InvalidTarget)
    }

    /// Host-side drain of the handle's completed-command list.
    pub fn cmd_complete_dequeue(&self, handle_id: u32) -> Result<Option<(ScsiResult, bool)>> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        Ok(handle
            .pop_result()
            .map(|(token, more)| (token.result(), more)))
    }

    /// Configures the scheduler shares of `world` against the handle's
    /// target. Presets for low/normal/high live in [`crate::config`].
    pub fn set_world_shares(&self, handle_id: u32, world: WorldId, shares: u32) -> Result<()> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        let mut inner = handle.target.inner.lock();
        let entry = crate::sched::entry_mut(&mut inner, world, self.options.default_shares);
        let shares = shares.max(1);
        entry.shares = shares;
        entry.stride = crate::sched::STRIDE1 / shares as u64;
        Ok(())
    }

    /// The diagnostic path-state string of the handle's target.
    pub fn path_state_string(&self, handle_id: u32) -> Result<String> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        Ok(handle.target.path_state_string())
    }

    /// Driver completion upcall; safe from contexts that must not block.
    pub fn command_complete(&self, rid: ResultId, comp: CompletionInfo) {
        complete::command_complete(self, rid, comp);
    }

    // --- Administrative tail pipes ---------------------------------------

    /// One-line adapter state for the proc surface.
    pub fn adapter_proc_info(&self, adapter_name: &str) -> Result<String> {
        let adapter = self
            .lookup_adapter(adapter_name)
            .ok_or(Error::InvalidAdapter)?;
        let inner = adapter.inner.lock();
        Ok(format!(
            "{} {} pci {} opens {} queued {} {}",
            adapter.caps.name,
            adapter.caps.driver_name,
            adapter.caps.pci,
            inner.open_count,
            inner.qcount,
            adapter.driver.proc_info()
        ))
    }

    /// Asks the driver to log its queue state for the handle's unit.
    pub fn dump_queue(&self, handle_id: u32) -> Result<()> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        handle
            .adapter
            .driver
            .dump_queue(handle.target.id, handle.target.lun);
        Ok(())
    }

    /// Driver-specific control passthrough.
    pub fn ioctl(&self, handle_id: u32, cmd: u32, arg: u64) -> Result<u64> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        handle
            .adapter
            .driver
            .ioctl(handle.target.id, handle.target.lun, cmd, arg)
    }

    /// Storage-specific control passthrough.
    pub fn sioctl(&self, handle_id: u32, cmd: u32, arg: u64) -> Result<u64> {
        let handle = self.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
        handle
            .adapter
            .driver
            .sioctl(handle.target.id, handle.target.lun, cmd, arg)
    }
}

impl Drop for ScsiCore {
    fn drop(&mut self) {
        self.helpers.shutdown();
    }
}
