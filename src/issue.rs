// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The command-issue pipeline: validity checks, the live partition-table
//! write guard, origin stamping, splitting, scheduler admission, path
//! binding and driver dispatch.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use scsi_defs::cdb_lba_and_len;
use scsi_defs::ScsiResult;
use scsi_defs::DEVICE_BUSY;
use scsi_defs::HOST_ABORT;
use scsi_defs::HOST_ERROR;
use scsi_defs::HOST_NO_CONNECT;
use scsi_defs::HOST_OK;
use scsi_defs::HOST_RESET;

use crate::adapter::Adapter;
use crate::command::Command;
use crate::command::CommandKind;
use crate::command::CMD_BYPASSES_QUEUE;
use crate::command::CMD_RETURN_WOULD_BLOCK;
use crate::command::CMD_USE_LUNRESET;
use crate::complete;
use crate::core::ScsiCore;
use crate::handle::Handle;
use crate::handle::HANDLE_READONLY;
use crate::hba::CompletionInfo;
use crate::hba::DispatchResult;
use crate::hba::ResultId;
use crate::multipath;
use crate::partition::MbrEntry;
use crate::partition::SECTOR_SIZE;
use crate::path::PathState;
use crate::sched;
use crate::split;
use crate::split::ChildCmd;
use crate::target::Target;
use crate::target::TargetInner;
use crate::token::Token;
use crate::token::TokenCallback;
use crate::token::TOKEN_CANT_BLOCK;
use crate::token::TOKEN_ENQUEUE;
use crate::token::TOKEN_HOST_INTERRUPT;
use crate::Error;
use crate::Result;
use crate::WorldId;
use crate::HOST_CONSOLE_WORLD;
use crate::INVALID_HANDLE_ID;

/// Sleep injected when a bypass-queue dispatch bounces off a full driver.
const BYPASS_BUSY_SLEEP: Duration = Duration::from_millis(5);
/// How long a wire abort or reset may take per path.
const ABORT_PATH_TIMEOUT: Duration = Duration::from_secs(2);

/// How a completed command reaches its issuer.
pub enum Delivery {
    /// The issuer waits on the token itself.
    Wait,
    /// Completion links the token onto the handle result list for the host
    /// drain, optionally raising the host interrupt.
    Enqueue { host_interrupt: bool },
    /// Completion invokes the callback with an extra token reference.
    Callback(TokenCallback),
}

/// One logical command moving through admission, queueing and dispatch.
pub(crate) struct IssueUnit {
    pub world: WorldId,
    pub handle_id: u32,
    pub partition: u16,
    pub serial: u32,
    pub token: Arc<Token>,
    pub cmd: Box<Command>,
    /// Present when the command was decomposed for the adapter's limits.
    pub children: Option<Vec<ChildCmd>>,
    pub pinned_path: Option<usize>,
}

impl IssueUnit {
    pub fn phys_count(&self) -> u32 {
        match &self.children {
            Some(children) => children.len() as u32,
            None => 1,
        }
    }

    #[cfg(test)]
    pub fn for_test(world: WorldId) -> IssueUnit {
        IssueUnit {
            world,
            handle_id: 0,
            partition: 0,
            serial: 0,
            token: Token::new(0, world, 0, 0),
            cmd: Box::new(Command::from_cdb(&[0])),
            children: None,
            pinned_path: None,
        }
    }
}

/// A unit bound to a path, charged and ready for the driver.
pub(crate) struct DispatchJob {
    pub path_adapter: Arc<Adapter>,
    pub target: Arc<Target>,
    pub path_idx: usize,
    pub unit: IssueUnit,
    pub accounted: bool,
}

/// The upward `execute` entry point.
///
/// Performs, in order: handle liveness, read-only enforcement, the live
/// partition-table guard, origin stamping, dispatch by command type, command
/// copy and token allocation, the splitting decision, scheduler admission
/// and driver dispatch.
pub(crate) fn execute(
    core: &ScsiCore,
    handle_id: u32,
    mut cmd: Command,
    delivery: Delivery,
) -> Result<Arc<Token>> {
    let handle = core.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
    if handle.is_closing() {
        return Err(Error::InvalidHandle);
    }
    if cmd.is_write() && handle.flags() & HANDLE_READONLY != 0 {
        return Err(Error::ReadOnly);
    }
    partition_table_write_guard(core, &handle, &cmd)?;

    cmd.origin_handle = handle.id;
    match cmd.kind {
        CommandKind::Queued => {
            cmd.origin_sn = handle.next_serial();
        }
        CommandKind::Abort => {
            do_abort(core, &handle, cmd.origin_sn, false)?;
            return Ok(completed_token(&handle, cmd.origin_sn));
        }
        CommandKind::Reset => {
            do_abort(core, &handle, cmd.origin_sn, true)?;
            return Ok(completed_token(&handle, cmd.origin_sn));
        }
        CommandKind::Dump | CommandKind::LowLevel => {
            return Err(Error::Io(ScsiResult::make_status(HOST_ERROR, 0)));
        }
    }

    let mut token_flags = 0;
    if let Delivery::Enqueue { host_interrupt } = &delivery {
        token_flags |= TOKEN_ENQUEUE;
        if *host_interrupt {
            token_flags |= TOKEN_HOST_INTERRUPT;
        }
    }
    let token = Token::new(token_flags, handle.world, handle.id, cmd.origin_sn);
    if let Delivery::Callback(cb) = delivery {
        token.set_callback(cb);
    }
    token.set_cmd(Box::new(cmd.clone()));
    handle.inc_pending();

    let target = handle.target.clone();
    let Some(adapter) = core.primary_adapter(&target) else {
        handle.dec_pending();
        return Err(Error::InvalidAdapter);
    };

    let (block_size, _) = target.capacity();
    let children = if split::fits_adapter(&adapter.caps, &cmd, core.options.io_force_copy) {
        None
    } else {
        match split::split_command(core, &adapter.caps, block_size, &token, &cmd) {
            Ok(children) => Some(children),
            Err(err) => {
                handle.dec_pending();
                return Err(err);
            }
        }
    };

    let bypass = cmd.flags & CMD_BYPASSES_QUEUE != 0;
    let unit = IssueUnit {
        world: handle.world,
        handle_id: handle.id,
        partition: handle.partition,
        serial: cmd.origin_sn,
        token: token.clone(),
        cmd: Box::new(cmd),
        children,
        pinned_path: None,
    };
    if let Err(err) = submit_unit(core, &adapter, &target, unit, bypass) {
        handle.dec_pending();
        return Err(err);
    }
    Ok(token)
}

fn completed_token(handle: &Arc<Handle>, serial: u32) -> Arc<Token> {
    let token = Token::new(0, handle.world, handle.id, serial);
    token.store_result(ScsiResult {
        status: ScsiResult::make_status(HOST_OK, 0),
        bytes_xferred: 0,
        sense: [0; scsi_defs::SENSE_BUFFER_SIZE],
        serial,
        origin_handle: handle.id,
    });
    token.io_done();
    token
}

/// Refuses writes that would alter a live, open partition-table entry.
///
/// Primary MBR sectors are compared entry by entry against the bytes the
/// write carries; a write that leaves every open entry's start, size and
/// type unchanged passes. Extended and nested tables are protected at
/// sector granularity.
fn partition_table_write_guard(core: &ScsiCore, handle: &Arc<Handle>, cmd: &Command) -> Result<()> {
    if !cmd.is_write() {
        return Ok(());
    }
    let Some((lba, blocks)) = cdb_lba_and_len(&cmd.cdb) else {
        return Ok(());
    };
    let end = lba + blocks as u64;

    let (block_size, live): (u32, Vec<_>) = {
        let inner = handle.target.inner.lock();
        (
            inner.block_size,
            inner
                .partitions
                .iter()
                .filter(|p| p.number != 0 && p.is_open())
                .map(|p| {
                    (
                        p.table_sector,
                        p.entry_index,
                        p.start_sector,
                        p.num_sectors,
                        p.ptype,
                    )
                })
                .collect(),
        )
    };

    for (table_sector, entry_index, start, num, ptype) in live {
        if table_sector < lba || table_sector >= end {
            continue;
        }
        let Some(index) = entry_index else {
            // Extended-table entry: any overlapping write is refused.
            return Err(Error::ReadOnly);
        };
        let offset = (table_sector - lba) * block_size as u64;
        let mut sector = [0u8; SECTOR_SIZE];
        if cmd
            .sg
            .read_into(core.mem.as_ref(), offset, &mut sector)
            .is_err()
        {
            // The candidate bytes cannot be verified, so the write cannot be
            // proven harmless.
            return Err(Error::ReadOnly);
        }
        let Some(entry) = MbrEntry::from_sector(&sector, index as usize) else {
            return Err(Error::ReadOnly);
        };
        let unchanged = entry.start_lba.get() as u64 == start
            && entry.num_sectors.get() as u64 == num
            && entry.ptype == ptype;
        if !unchanged {
            return Err(Error::ReadOnly);
        }
    }
    Ok(())
}

enum SubmitOutcome {
    Queued,
    Job(DispatchJob),
    NoPath(IssueUnit),
    Refused(IssueUnit),
}

/// Admits, queues or refuses a freshly issued unit.
pub(crate) fn submit_unit(
    core: &ScsiCore,
    adapter: &Arc<Adapter>,
    target: &Arc<Target>,
    unit: IssueUnit,
    bypass: bool,
) -> Result<()> {
    let outcome = {
        let mut ainner = adapter.inner.lock();
        let mut tinner = target.inner.lock();
        sched::entry_mut(&mut tinner, unit.world, core.options.default_shares);
        if !bypass && !sched::can_admit(&tinner, unit.world, core.options.max_world_cif) {
            if unit.cmd.flags & CMD_RETURN_WOULD_BLOCK != 0 {
                SubmitOutcome::Refused(unit)
            } else {
                tinner.queued += 1;
                ainner.qcount += 1;
                let world = unit.world;
                tinner
                    .sched
                    .get_mut(&world)
                    .expect("scheduler entry vanished")
                    .queue
                    .push_back(unit);
                SubmitOutcome::Queued
            }
        } else {
            match prepare_dispatch(core, &mut tinner, target, unit, bypass) {
                Ok(job) => SubmitOutcome::Job(job),
                Err(unit) => SubmitOutcome::NoPath(unit),
            }
        }
    };
    match outcome {
        SubmitOutcome::Queued => Ok(()),
        SubmitOutcome::Job(job) => {
            run_job(core, job);
            Ok(())
        }
        SubmitOutcome::NoPath(unit) => {
            complete::complete_unit_synthetic(core, unit, HOST_NO_CONNECT);
            Ok(())
        }
        SubmitOutcome::Refused(unit) => {
            if let Some(children) = &unit.children {
                split::unwind_children(core, children);
            }
            Err(Error::WouldBlock)
        }
    }
}

/// Charges the scheduler, binds a path and increments its in-flight count.
/// Fails with the unit back when no alive path remains.
fn prepare_dispatch(
    core: &ScsiCore,
    tinner: &mut TargetInner,
    target: &Arc<Target>,
    unit: IssueUnit,
    bypass: bool,
) -> std::result::Result<DispatchJob, IssueUnit> {
    let path_adapter;
    let path_idx;
    loop {
        let idx = match unit.pinned_path {
            Some(idx) => Some(idx),
            None => multipath::select_path(tinner),
        };
        let Some(idx) = idx else {
            return Err(unit);
        };
        match tinner.paths[idx].adapter.upgrade() {
            Some(adapter) => {
                path_adapter = adapter;
                path_idx = idx;
                break;
            }
            None => {
                // The adapter went away under the path; treat it as dead and
                // look again.
                tinner.paths[idx].state = PathState::Dead;
                if unit.pinned_path.is_some() {
                    return Err(unit);
                }
            }
        }
    }

    let n = unit.phys_count();
    if !bypass {
        let entry = tinner
            .sched
            .get_mut(&unit.world)
            .expect("scheduler entry vanished");
        entry.lvt += entry.stride;
        entry.cif += n;
        tinner.cif += n;
    }
    tinner.paths[path_idx].in_flight += n;
    Ok(DispatchJob {
        path_adapter,
        target: target.clone(),
        path_idx,
        unit,
        accounted: !bypass,
    })
}

/// Hands a job's physical commands to the driver, with no locks held.
///
/// Returns true when the unit went back onto its queue (driver would
/// block); the caller must not keep draining that target this pass.
pub(crate) fn run_job(core: &ScsiCore, job: DispatchJob) -> bool {
    let DispatchJob {
        path_adapter,
        target,
        path_idx,
        unit,
        accounted,
    } = job;
    let is_split = unit.children.is_some();
    let IssueUnit {
        world,
        handle_id,
        partition,
        serial,
        token,
        cmd,
        children,
        ..
    } = unit;

    let phys: Vec<(Box<Command>, Arc<Token>)> = match children {
        Some(children) => children.into_iter().map(|c| (c.cmd, c.token)).collect(),
        None => vec![(cmd.clone(), token.clone())],
    };

    let make_rid = |ptoken: &Arc<Token>| ResultId {
        adapter: path_adapter.clone(),
        target: target.clone(),
        path_idx,
        token: ptoken.clone(),
        handle_id,
        partition,
        serial,
        world,
        accounted,
    };

    for i in 0..phys.len() {
        let (pcmd, ptoken) = &phys[i];
        ptoken.mark_issued();
        match path_adapter.driver.command(world, pcmd, make_rid(ptoken)) {
            DispatchResult::Dispatched => continue,
            DispatchResult::WouldBlock if !is_split && accounted => {
                requeue_front(
                    core,
                    &target,
                    IssueUnit {
                        world,
                        handle_id,
                        partition,
                        serial,
                        token,
                        cmd,
                        children: None,
                        pinned_path: None,
                    },
                    path_idx,
                );
                return true;
            }
            DispatchResult::WouldBlock if !is_split => {
                // Bypass-queue dispatch: complete synthetically as BUSY and
                // pace the issuer a little.
                complete::command_complete(
                    core,
                    make_rid(ptoken),
                    CompletionInfo::device_error(DEVICE_BUSY),
                );
                if token.flags() & TOKEN_CANT_BLOCK == 0 {
                    std::thread::sleep(BYPASS_BUSY_SLEEP);
                }
                return false;
            }
            _ => {
                // Outright failure, or a split that can no longer complete
                // whole: fail everything not yet dispatched.
                if is_split {
                    split::flag_split_error(&token);
                }
                for (_, jtoken) in phys[i..].iter() {
                    complete::command_complete(
                        core,
                        make_rid(jtoken),
                        CompletionInfo::host_error(HOST_ERROR),
                    );
                }
                return false;
            }
        }
    }
    false
}

/// Puts a bounced unit back at the head of its world queue and reverts the
/// dispatch charges.
fn requeue_front(core: &ScsiCore, target: &Arc<Target>, unit: IssueUnit, path_idx: usize) {
    let Some(adapter) = core.primary_adapter(target) else {
        complete::complete_unit_synthetic(core, unit, HOST_NO_CONNECT);
        return;
    };
    let mut ainner = adapter.inner.lock();
    let mut tinner = target.inner.lock();
    let n = unit.phys_count();
    if let Some(path) = tinner.paths.get_mut(path_idx) {
        path.in_flight = path.in_flight.saturating_sub(n);
    }
    let world = unit.world;
    let entry = sched::entry_mut(&mut tinner, world, core.options.default_shares);
    entry.cif = entry.cif.saturating_sub(n);
    entry.lvt = entry.lvt.saturating_sub(entry.stride);
    entry.priority.push_front(unit);
    tinner.cif = tinner.cif.saturating_sub(n);
    tinner.queued += 1;
    ainner.qcount += 1;
}

/// Drains admissible queued work, optionally restricted to one target.
///
/// Called on completions (restricted to the target that freed a slot) and by
/// the failover helper with `override_delay` once the new path is up.
pub(crate) fn execute_queued(
    core: &ScsiCore,
    adapter: &Arc<Adapter>,
    only: Option<&Arc<Target>>,
    override_delay: bool,
) {
    let mut jobs = Vec::new();
    let mut dead = Vec::new();
    {
        let mut ainner = adapter.inner.lock();
        if ainner.qcount == 0 {
            return;
        }
        let targets: Vec<Arc<Target>> = match only {
            Some(target) => vec![target.clone()],
            None => ainner.targets.clone(),
        };
        for target in targets {
            let mut tinner = target.inner.lock();
            if tinner.delay_cmds > 0 && !override_delay {
                continue;
            }
            while tinner.cif < tinner.cur_qdepth {
                let Some(world) = sched::pick_next(&tinner, core.options.max_world_cif) else {
                    break;
                };
                let unit = tinner
                    .sched
                    .get_mut(&world)
                    .and_then(|e| e.pop())
                    .expect("picked world has no queued unit");
                tinner.queued = tinner.queued.saturating_sub(1);
                ainner.qcount = ainner.qcount.saturating_sub(1);
                match prepare_dispatch(core, &mut tinner, &target, unit, false) {
                    Ok(job) => jobs.push(job),
                    Err(unit) => dead.push(unit),
                }
            }
        }
    }
    for unit in dead {
        complete::complete_unit_synthetic(core, unit, HOST_NO_CONNECT);
    }
    for job in jobs {
        run_job(core, job);
    }
}

/// Dispatches one command down a pinned path, bypassing the scheduler, and
/// waits for its completion. Used by the failover probe, the open-time
/// reservation probe, and wire aborts.
pub(crate) fn dispatch_pinned_sync(
    core: &ScsiCore,
    target: &Arc<Target>,
    path_idx: usize,
    mut cmd: Command,
    timeout: Duration,
) -> Result<ScsiResult> {
    cmd.origin_handle = INVALID_HANDLE_ID;
    let token = Token::new(0, HOST_CONSOLE_WORLD, INVALID_HANDLE_ID, cmd.origin_sn);
    token.set_cmd(Box::new(cmd.clone()));

    let path_adapter = {
        let mut tinner = target.inner.lock();
        let Some(path) = tinner.paths.get_mut(path_idx) else {
            return Err(Error::InvalidTarget);
        };
        path.in_flight += 1;
        path.adapter.upgrade()
    };
    let Some(path_adapter) = path_adapter else {
        let mut tinner = target.inner.lock();
        if let Some(path) = tinner.paths.get_mut(path_idx) {
            path.in_flight = path.in_flight.saturating_sub(1);
            path.state = PathState::Dead;
        }
        return Err(Error::NoConnect);
    };

    let rid = ResultId {
        adapter: path_adapter.clone(),
        target: target.clone(),
        path_idx,
        token: token.clone(),
        handle_id: INVALID_HANDLE_ID,
        partition: 0,
        serial: cmd.origin_sn,
        world: HOST_CONSOLE_WORLD,
        accounted: false,
    };
    token.mark_issued();
    match path_adapter.driver.command(HOST_CONSOLE_WORLD, &cmd, rid) {
        DispatchResult::Dispatched => {
            if token.wait_for_io_timeout(timeout) {
                Err(Error::Timeout)
            } else {
                Ok(token.result())
            }
        }
        DispatchResult::WouldBlock => {
            let mut tinner = target.inner.lock();
            if let Some(path) = tinner.paths.get_mut(path_idx) {
                path.in_flight = path.in_flight.saturating_sub(1);
            }
            drop(tinner);
            if token.flags() & TOKEN_CANT_BLOCK == 0 {
                std::thread::sleep(BYPASS_BUSY_SLEEP);
            }
            Ok(ScsiResult {
                status: ScsiResult::make_status(HOST_OK, DEVICE_BUSY),
                bytes_xferred: 0,
                sense: [0; scsi_defs::SENSE_BUFFER_SIZE],
                serial: cmd.origin_sn,
                origin_handle: INVALID_HANDLE_ID,
            })
        }
        DispatchResult::Failure => {
            let mut tinner = target.inner.lock();
            if let Some(path) = tinner.paths.get_mut(path_idx) {
                path.in_flight = path.in_flight.saturating_sub(1);
            }
            Err(Error::Io(ScsiResult::make_status(HOST_ERROR, 0)))
        }
    }
}

/// Abort and reset entry point.
///
/// Purges matching queued entries, completing each synthetically, then sends
/// the abort or reset CDB down every path with work in flight (or the active
/// path) and aggregates their verdicts.
pub(crate) fn do_abort(
    core: &ScsiCore,
    handle: &Arc<Handle>,
    victim_sn: u32,
    target_wide: bool,
) -> Result<()> {
    let target = handle.target.clone();
    let Some(adapter) = core.primary_adapter(&target) else {
        return Err(Error::InvalidAdapter);
    };

    let mut purged = Vec::new();
    let mut found_exact = false;
    let candidates: Vec<usize>;
    {
        let mut ainner = adapter.inner.lock();
        let mut tinner = target.inner.lock();
        for entry in tinner.sched.values_mut() {
            for queue in [&mut entry.priority, &mut entry.queue] {
                let mut i = 0;
                while i < queue.len() {
                    let unit = &queue[i];
                    let hit = unit.handle_id == handle.id
                        && (target_wide || unit.serial == victim_sn);
                    if hit {
                        found_exact |= !target_wide && unit.serial == victim_sn;
                        purged.push(queue.remove(i).expect("indexed unit vanished"));
                    } else {
                        i += 1;
                    }
                }
            }
        }
        tinner.queued = tinner.queued.saturating_sub(purged.len() as u32);
        ainner.qcount = ainner.qcount.saturating_sub(purged.len() as u32);
        candidates = tinner
            .paths
            .iter()
            .enumerate()
            .filter(|(i, p)| p.in_flight > 0 || *i == tinner.active_path)
            .map(|(i, _)| i)
            .collect();
    }

    let purge_status = if target_wide { HOST_RESET } else { HOST_ABORT };
    let purged_any = !purged.is_empty();
    {
        let mut tstats = target.inner.lock();
        if target_wide {
            tstats.stats.resets += 1;
        } else {
            tstats.stats.aborts += 1;
        }
    }
    for unit in purged {
        complete::complete_unit_synthetic(core, unit, purge_status);
    }
    if found_exact && !target_wide {
        // The original never reached a driver; nothing to chase on the wire.
        return Ok(());
    }

    let mut any_failed = false;
    let mut any_ran = false;
    let mut all_not_running = true;
    for idx in candidates {
        let mut cmd = Command::from_cdb(&[0]);
        cmd.kind = if target_wide {
            CommandKind::Reset
        } else {
            CommandKind::Abort
        };
        cmd.origin_handle = handle.id;
        cmd.origin_sn = victim_sn;
        if target_wide && core.options.use_lun_reset {
            cmd.flags |= CMD_USE_LUNRESET;
        }
        match dispatch_pinned_sync(core, &target, idx, cmd, ABORT_PATH_TIMEOUT) {
            Ok(result) if result.host_status() == HOST_OK => {
                any_ran = true;
                all_not_running = false;
            }
            Ok(result) if result.host_status() == HOST_ABORT => {
                // The driver reports the victim was not running on this path.
            }
            Ok(_) | Err(_) => {
                any_failed = true;
                all_not_running = false;
            }
        }
    }

    if any_failed {
        warn!(
            "scsi: abort/reset did not reach every path of {}:{}:{}",
            target.adapter_name, target.id, target.lun
        );
        return Err(Error::Io(ScsiResult::make_status(HOST_ERROR, 0)));
    }
    if !purged_any && !any_ran && all_not_running {
        return Err(Error::AbortNotRunning);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SgEntry;
    use crate::command::SgList;
    use crate::handle::HANDLE_READONLY;
    use crate::mem::MachineMemory;
    use crate::mem::VecMemory;
    use crate::partition::MbrEntry;
    use crate::partition::PartitionDef;
    use crate::partition::PartitionTableSource;
    use crate::partition::KERNEL_PARTITION_TYPE;
    use crate::testutil;
    use crate::testutil::MockMode;
    use scsi_defs::GOOD;
    use zerocopy::AsBytes;

    fn sg(entries: &[(u64, u32)]) -> SgList {
        SgList::machine(
            entries
                .iter()
                .map(|&(addr, len)| SgEntry { addr, len })
                .collect(),
        )
    }

    #[test]
    fn execute_read_completes() {
        let (core, driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        let result = core
            .read_blocking(handle, 16, 8, sg(&[(0x1000, 4096)]))
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(result.bytes_xferred, 4096);
        // One probe at open time plus the read itself.
        assert_eq!(driver.dispatch_count(), 2);
        core.close(handle).unwrap();
    }

    #[test]
    fn write_through_readonly_handle_refused() {
        let (core, _driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, HANDLE_READONLY).unwrap();
        let cmd = Command::write(0, 8, sg(&[(0x1000, 4096)]));
        assert_eq!(
            core.execute(handle, cmd, Delivery::Wait).err(),
            Some(Error::ReadOnly)
        );
        core.close(handle).unwrap();
    }

    #[test]
    fn stale_handle_refused() {
        let (core, _driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        core.close(handle).unwrap();
        let cmd = Command::read(0, 1, sg(&[(0x1000, 512)]));
        assert_eq!(
            core.execute(handle, cmd, Delivery::Wait).err(),
            Some(Error::InvalidHandle)
        );
    }

    #[test]
    fn bypass_queue_would_block_becomes_busy() {
        let (core, driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        *driver.would_block_next.lock() = 1;
        let mut cmd = Command::read(0, 1, sg(&[(0x1000, 512)]));
        cmd.flags |= CMD_BYPASSES_QUEUE;
        let token = core.execute(handle, cmd, Delivery::Wait).unwrap();
        token.wait_for_io();
        assert_eq!(token.result().device_status(), DEVICE_BUSY);
        core.close(handle).unwrap();
    }

    #[test]
    fn return_would_block_skips_queueing() {
        let (core, driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        for i in 0..4u64 {
            let cmd = Command::read(i * 8, 8, sg(&[(0x1000, 4096)]));
            core.execute(handle, cmd, Delivery::Wait).unwrap();
        }
        let mut cmd = Command::read(64, 8, sg(&[(0x1000, 4096)]));
        cmd.flags |= crate::command::CMD_RETURN_WOULD_BLOCK;
        assert_eq!(
            core.execute(handle, cmd, Delivery::Wait).err(),
            Some(Error::WouldBlock)
        );
        for _ in 0..4 {
            driver.complete_next(None);
        }
        core.close(handle).unwrap();
    }

    #[test]
    fn abort_purges_queued_command() {
        let (core, driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        // Queue depth is 4: four dispatches saturate the target, the fifth
        // queues.
        let mut tokens = Vec::new();
        for i in 0..5u64 {
            let cmd = Command::read(i * 8, 8, sg(&[(0x1000, 4096)]));
            tokens.push(core.execute(handle, cmd, Delivery::Wait).unwrap());
        }
        assert_eq!(driver.held_len(), 4);
        let queued_sn = tokens[4].origin_sn;
        core.abort(handle, queued_sn).unwrap();
        tokens[4].wait_for_io();
        assert_eq!(tokens[4].result().host_status(), HOST_ABORT);
        // The in-flight commands were untouched.
        assert_eq!(driver.held_len(), 4);
        for _ in 0..4 {
            driver.complete_next(None);
        }
        core.close(handle).unwrap();
    }

    struct OnePartition;

    impl PartitionTableSource for OnePartition {
        fn read_partition_table(
            &self,
            _adapter_name: &str,
            _id: u32,
            _lun: u32,
        ) -> anyhow::Result<Vec<PartitionDef>> {
            Ok(vec![PartitionDef {
                number: 1,
                start_sector: 2048,
                num_sectors: 2048,
                ptype: KERNEL_PARTITION_TYPE,
                table_sector: 0,
                entry_index: Some(0),
            }])
        }
    }

    fn guarded_setup() -> (std::sync::Arc<ScsiCore>, std::sync::Arc<VecMemory>) {
        let mem = VecMemory::new(0, 2 << 20);
        let core = ScsiCore::new(
            crate::MidLayerOptions::default(),
            mem.clone(),
            Box::new(OnePartition),
        );
        let driver = testutil::MockDriver::new();
        driver.attach(&core);
        driver.add_target(0, 0, testutil::disk_info(b"DISK-0"));
        let adapter = core
            .register_adapter(testutil::caps("vmhba0", 8, 32 << 10, true), driver)
            .unwrap();
        core.create_target(&adapter, 0, 0, &testutil::disk_info(b"DISK-0"))
            .unwrap();
        (core, mem)
    }

    fn mbr_image(ptype: u8, start: u32, num: u32) -> [u8; 512] {
        let mut sector = [0u8; 512];
        let entry = MbrEntry {
            boot_indicator: 0,
            chs_first: [0; 3],
            ptype,
            chs_last: [0; 3],
            start_lba: start.into(),
            num_sectors: num.into(),
        };
        sector[446..462].copy_from_slice(entry.as_bytes());
        sector[510] = 0x55;
        sector[511] = 0xaa;
        sector
    }

    #[test]
    fn live_partition_entry_write_refused() {
        let (core, mem) = guarded_setup();
        // Partition 1 is open, so its MBR entry is live.
        let part_handle = core.open("vmhba0", 0, 0, 1, 1, 0).unwrap();
        let disk_handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();

        // An MBR image changing entry 0's type must be refused, and the
        // driver must never see the write.
        let image = mbr_image(0x83, 2048, 2048);
        mem.write_at(0x8000, &image).unwrap();
        let cmd = Command::write(0, 16, sg(&[(0x8000, 8192)]));
        assert_eq!(
            core.execute(disk_handle, cmd, Delivery::Wait).err(),
            Some(Error::ReadOnly)
        );

        // The same write with the entry byte-identical is materially a
        // no-op for the table and passes the guard.
        let same = mbr_image(KERNEL_PARTITION_TYPE, 2048, 2048);
        mem.write_at(0x8000, &same).unwrap();
        let cmd = Command::write(0, 16, sg(&[(0x8000, 8192)]));
        let result = core.execute_sync(disk_handle, &cmd).unwrap();
        assert_eq!(result.device_status(), GOOD);

        core.close(part_handle).unwrap();
        core.close(disk_handle).unwrap();

        // With partition 1 closed the entry is no longer live and any image
        // may be written.
        let disk_handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        let image = mbr_image(0x83, 4096, 1024);
        mem.write_at(0x8000, &image).unwrap();
        let cmd = Command::write(0, 16, sg(&[(0x8000, 8192)]));
        assert!(core.execute_sync(disk_handle, &cmd).unwrap().is_ok());
        core.close(disk_handle).unwrap();
    }
}
