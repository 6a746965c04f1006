// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The completion pipeline: path and reservation bookkeeping, statistics,
//! the failover trigger, split joins and final delivery to issuers.
//!
//! Drivers may call in from bottom-half contexts; nothing here sleeps.

use std::sync::Arc;

use log::info;
use log::warn;
use scsi_defs::is_rw_opcode;
use scsi_defs::Sense;
use scsi_defs::ScsiResult;
use scsi_defs::ASC_POWER_ON_RESET;
use scsi_defs::CHECK_CONDITION;
use scsi_defs::GOOD;
use scsi_defs::HOST_OK;
use scsi_defs::RELEASE_6;
use scsi_defs::RESERVATION_CONFLICT;
use scsi_defs::RESERVE_6;
use scsi_defs::SENSE_BUFFER_SIZE;
use scsi_defs::UNIT_ATTENTION;

use crate::core::ScsiCore;
use crate::helper::HelperRequest;
use crate::hba::CompletionInfo;
use crate::hba::ResultId;
use crate::issue::IssueUnit;
use crate::multipath;
use crate::path::PathState;
use crate::path::PATH_RESERVED_HERE;
use crate::sched;
use crate::split;
use crate::target::Target;
use crate::target::TARGET_NO_RETRY_ON_RESERV_CONFLICT;
use crate::target::TARGET_RESERVED_LOCAL;
use crate::target::TARGET_SUPPORTS_MANUAL_SWITCHOVER;
use crate::token::Token;
use crate::token::TOKEN_CALLBACK;
use crate::token::TOKEN_ENQUEUE;
use crate::token::TOKEN_HOST_INTERRUPT;
use crate::INVALID_HANDLE_ID;

/// Driver upcall for one dispatched physical command.
pub(crate) fn command_complete(core: &ScsiCore, rid: ResultId, comp: CompletionInfo) {
    let packed = ScsiResult::make_status(comp.host_status, comp.device_status);
    let sense = if comp.device_status == CHECK_CONDITION {
        Sense::from_fixed(&comp.sense)
    } else {
        Sense::default()
    };
    let ok = comp.host_status == HOST_OK && comp.device_status == GOOD;
    let latency = rid.token.issue_latency();
    let opcode = rid.token.cmd_clone().map(|c| c.opcode()).unwrap_or(0);

    // Everything the adapter and target own is updated in one locked pass:
    // in-flight counts, path state, reservation flags, statistics, and the
    // failover requeue decision.
    let adapter = core
        .primary_adapter(&rid.target)
        .unwrap_or_else(|| rid.adapter.clone());
    let mut want_failover = false;
    {
        let mut ainner = adapter.inner.lock();
        let mut tinner = rid.target.inner.lock();
        let manual = tinner.flags & TARGET_SUPPORTS_MANUAL_SWITCHOVER != 0;

        if let Some(path) = tinner.paths.get_mut(rid.path_idx) {
            path.in_flight = path.in_flight.saturating_sub(1);

            if path.state == PathState::Dead && multipath::resurrects_path(comp.host_status) {
                info!(
                    "scsi: path {}:{}:{} resurrected by completion",
                    path.adapter_name, path.id, path.lun
                );
                path.state = PathState::On;
            }

            if opcode == RESERVE_6 && ok {
                path.flags |= PATH_RESERVED_HERE;
            }
            let power_on_sense = sense.key == UNIT_ATTENTION && sense.asc == ASC_POWER_ON_RESET;
            if (opcode == RELEASE_6 && ok)
                || power_on_sense
                || comp.device_status == RESERVATION_CONFLICT
            {
                path.flags &= !PATH_RESERVED_HERE;
            }

            if rid.accounted {
                let dead = multipath::path_dead_status(comp.host_status);
                let standby_switch = path.state == PathState::Standby
                    && manual
                    && multipath::standby_wants_failover(&sense);
                if dead {
                    warn!(
                        "scsi: path {}:{}:{} is dead (host status {:#x})",
                        path.adapter_name, path.id, path.lun, comp.host_status
                    );
                    path.state = PathState::Dead;
                }
                if (dead || standby_switch) && rid.handle_id != INVALID_HANDLE_ID {
                    want_failover = true;
                }
            }

            if path.state == PathState::Standby && ok {
                path.state = PathState::On;
            }
        }

        // The target flag mirrors the OR of its paths' reservation flags.
        if tinner
            .paths
            .iter()
            .any(|p| p.flags & PATH_RESERVED_HERE != 0)
        {
            tinner.flags |= TARGET_RESERVED_LOCAL;
        } else {
            tinner.flags &= !TARGET_RESERVED_LOCAL;
        }

        // A successful read or write unlatches fast-fail reservation
        // handling.
        if ok && is_rw_opcode(opcode) {
            tinner.flags &= !TARGET_NO_RETRY_ON_RESERV_CONFLICT;
        }

        if want_failover {
            // Hold the command: back on the priority queue, scheduler slot
            // surrendered, helper world asked to re-plumb the path.
            if let Some(cmd) = rid.token.cmd_clone() {
                let unit = IssueUnit {
                    world: rid.world,
                    handle_id: rid.handle_id,
                    partition: rid.partition,
                    serial: rid.serial,
                    token: rid.token.clone(),
                    cmd,
                    children: None,
                    pinned_path: None,
                };
                let shares = core.options.default_shares;
                let entry = sched::entry_mut(&mut tinner, rid.world, shares);
                entry.cif = entry.cif.saturating_sub(1);
                entry.priority.push_back(unit);
                tinner.cif = tinner.cif.saturating_sub(1);
                tinner.queued += 1;
                ainner.qcount += 1;
            } else {
                // No command copy to retry with; fall through to delivery.
                want_failover = false;
            }
        }

        if !want_failover {
            let block_size = tinner.block_size;
            tinner
                .stats
                .record(opcode, comp.bytes_xferred, block_size, latency);
            if let Some(part) = tinner
                .partitions
                .iter_mut()
                .find(|p| p.number == rid.partition)
            {
                part.stats
                    .record(opcode, comp.bytes_xferred, block_size, latency);
            }
            if let Some(entry) = tinner.sched.get_mut(&rid.world) {
                entry
                    .stats
                    .record(opcode, comp.bytes_xferred, block_size, latency);
            }
        }
    }

    if want_failover {
        core.helpers
            .request(HelperRequest::Failover(rid.target.clone()));
        return;
    }

    // Join or deliver.
    if rid.token.parent.is_some() {
        split::child_done(core, &rid.token, packed, comp.bytes_xferred, comp.sense);
    } else {
        let result = ScsiResult {
            status: packed,
            bytes_xferred: comp.bytes_xferred,
            sense: comp.sense,
            serial: rid.serial,
            origin_handle: rid.handle_id,
        };
        deliver(core, &rid.token, result);
    }

    // Tell the scheduler the slot is free and drain anything admissible.
    if rid.accounted {
        let kick = {
            let ainner = adapter.inner.lock();
            let mut tinner = rid.target.inner.lock();
            if let Some(entry) = tinner.sched.get_mut(&rid.world) {
                entry.cif = entry.cif.saturating_sub(1);
            }
            tinner.cif = tinner.cif.saturating_sub(1);
            ainner.qcount > 0
        };
        if kick {
            crate::issue::execute_queued(core, &adapter, Some(&rid.target), false);
        }
    }
}

/// Final delivery of a logical command's result to its issuer: wake any
/// waiter, enqueue on the handle's result list, raise the host interrupt,
/// invoke the registered callback.
///
/// Completions whose handle is gone or stale still ran all their accounting;
/// the result is simply not handed anywhere (a waiter parked on the token
/// itself still observes it).
pub(crate) fn deliver(core: &ScsiCore, token: &Arc<Token>, result: ScsiResult) {
    token.store_result(result);
    let flags = token.flags();
    match core.lookup_handle(token.origin_handle) {
        Some(handle) => {
            if flags & TOKEN_ENQUEUE != 0 {
                handle.push_result(token.clone());
            }
            if flags & TOKEN_HOST_INTERRUPT != 0 {
                handle.adapter.inner.lock().host_interrupt_pending = true;
            }
            handle.dec_pending();
        }
        None => {
            if token.origin_handle != INVALID_HANDLE_ID {
                warn!(
                    "scsi: stray completion for handle {:#x} serial {}",
                    token.origin_handle, token.origin_sn
                );
            }
        }
    }
    token.io_done();
    if flags & TOKEN_CALLBACK != 0 {
        if let Some(callback) = token.take_callback() {
            callback(core, token);
        }
    }
    token.drop_cmd();
}

/// Completes a unit that never reached a driver: purged by abort or reset,
/// or stranded with no connected path.
pub(crate) fn complete_unit_synthetic(core: &ScsiCore, unit: IssueUnit, host_status: u32) {
    let packed = ScsiResult::make_status(host_status, 0);
    let zero_sense = [0u8; SENSE_BUFFER_SIZE];
    match unit.children {
        Some(children) => {
            for child in children {
                split::child_done(core, &child.token, packed, 0, zero_sense);
            }
        }
        None => {
            if unit.token.parent.is_some() {
                split::child_done(core, &unit.token, packed, 0, zero_sense);
            } else {
                deliver(
                    core,
                    &unit.token,
                    ScsiResult {
                        status: packed,
                        bytes_xferred: 0,
                        sense: zero_sense,
                        serial: unit.serial,
                        origin_handle: unit.handle_id,
                    },
                );
            }
        }
    }
}

/// Fails every queued unit of a target, used when its last path dies.
pub(crate) fn fail_all_queued(core: &ScsiCore, target: &Arc<Target>, host_status: u32) {
    let adapter = core.primary_adapter(target);
    let purged: Vec<IssueUnit> = {
        let mut ainner_guard = adapter.as_ref().map(|a| a.inner.lock());
        let mut tinner = target.inner.lock();
        let mut purged = Vec::new();
        for entry in tinner.sched.values_mut() {
            purged.extend(entry.priority.drain(..));
            purged.extend(entry.queue.drain(..));
        }
        tinner.queued = tinner.queued.saturating_sub(purged.len() as u32);
        if let Some(ainner) = ainner_guard.as_deref_mut() {
            ainner.qcount = ainner.qcount.saturating_sub(purged.len() as u32);
        }
        purged
    };
    for unit in purged {
        complete_unit_synthetic(core, unit, host_status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::command::SgEntry;
    use crate::command::SgList;
    use crate::issue::Delivery;
    use crate::testutil;
    use crate::testutil::MockMode;
    use scsi_defs::HOST_NO_CONNECT;
    use scsi_defs::HOST_TIMEOUT;
    use scsi_defs::RESERVE_6;

    fn sg(entries: &[(u64, u32)]) -> SgList {
        SgList::machine(
            entries
                .iter()
                .map(|&(addr, len)| SgEntry { addr, len })
                .collect(),
        )
    }

    #[test]
    fn dead_path_resurrected_by_successful_completion() {
        let (core, driver, _adapter, target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        let cmd = Command::read(0, 8, sg(&[(0x1000, 4096)]));
        let token = core.execute(handle, cmd, Delivery::Wait).unwrap();
        // The path dies while the command is in flight; its completion is
        // good evidence the route works after all.
        target.inner.lock().paths[0].state = PathState::Dead;
        driver.complete_next(None);
        token.wait_for_io();
        assert_eq!(target.inner.lock().paths[0].state, PathState::On);
        core.close(handle).unwrap();
    }

    #[test]
    fn bus_level_failure_does_not_resurrect() {
        let (core, driver, _adapter, target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        let cmd = Command::read(0, 8, sg(&[(0x1000, 4096)]));
        let token = core.execute(handle, cmd, Delivery::Wait).unwrap();
        target.inner.lock().paths[0].state = PathState::Dead;
        // Bus-busy is no evidence the route works; the path stays dead.
        driver.complete_next(Some(CompletionInfo::host_error(scsi_defs::HOST_BUS_BUSY)));
        token.wait_for_io();
        assert_eq!(target.inner.lock().paths[0].state, PathState::Dead);
        assert_eq!(token.result().host_status(), scsi_defs::HOST_BUS_BUSY);
        core.close(handle).unwrap();
    }

    #[test]
    fn reservation_flag_follows_paths() {
        let (core, _driver, _adapter, target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        let reserve = Command::from_cdb(&[RESERVE_6, 0, 0, 0, 0, 0]);
        core.execute_sync(handle, &reserve).unwrap();
        {
            let inner = target.inner.lock();
            assert!(inner.flags & TARGET_RESERVED_LOCAL != 0);
            assert!(inner.paths[0].flags & PATH_RESERVED_HERE != 0);
        }
        let release = Command::from_cdb(&[scsi_defs::RELEASE_6, 0, 0, 0, 0, 0]);
        core.execute_sync(handle, &release).unwrap();
        {
            let inner = target.inner.lock();
            assert!(inner.flags & TARGET_RESERVED_LOCAL == 0);
            assert!(inner.paths[0].flags & PATH_RESERVED_HERE == 0);
        }
        core.close(handle).unwrap();
    }

    #[test]
    fn split_children_aggregate_bytes() {
        let (core, driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        // 16 entries, 40 KiB: splits into a 32 KiB child and an 8 KiB child
        // against the 8-entry / 32 KiB adapter.
        let entries: Vec<(u64, u32)> = (0..16).map(|i| (0x10000 + i * 0x1000, 2560)).collect();
        let cmd = Command::write(64, 80, sg(&entries));
        let token = core.execute(handle, cmd, Delivery::Wait).unwrap();
        assert_eq!(driver.held_len(), 2);
        driver.complete_next(None);
        assert!(token.flags() & crate::token::TOKEN_IO_DONE == 0);
        driver.complete_next(None);
        token.wait_for_io();
        let result = token.result();
        assert!(result.is_ok());
        assert_eq!(result.bytes_xferred, 40960);
        core.close(handle).unwrap();
    }

    #[test]
    fn split_child_failure_zeroes_bytes() {
        let (core, driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        let entries: Vec<(u64, u32)> = (0..16).map(|i| (0x10000 + i * 0x1000, 2560)).collect();
        let cmd = Command::write(64, 80, sg(&entries));
        let token = core.execute(handle, cmd, Delivery::Wait).unwrap();
        driver.complete_next(None);
        driver.complete_next(Some(CompletionInfo::host_error(HOST_TIMEOUT)));
        token.wait_for_io();
        let result = token.result();
        assert_eq!(result.bytes_xferred, 0);
        assert_eq!(result.host_status(), HOST_TIMEOUT);
        core.close(handle).unwrap();
    }

    #[test]
    fn stray_completion_is_harmless() {
        let (core, driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        let cmd = Command::read(0, 8, sg(&[(0x1000, 4096)]));
        let token = core.execute(handle, cmd, Delivery::Wait).unwrap();
        core.close(handle).unwrap();
        // The handle is gone; the completion still settles the token and
        // the accounting without delivering anywhere.
        driver.complete_next(None);
        token.wait_for_io();
        assert!(token.result().is_ok());
    }

    #[test]
    fn enqueue_delivery_feeds_result_list() {
        let (core, _driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        let cmd = Command::read(0, 8, sg(&[(0x1000, 4096)]));
        let token = core
            .execute(
                handle,
                cmd,
                Delivery::Enqueue {
                    host_interrupt: false,
                },
            )
            .unwrap();
        token.wait_for_io();
        let (result, more) = core.cmd_complete_dequeue(handle).unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!more);
        assert_eq!(result.serial, token.origin_sn);
        assert!(core.cmd_complete_dequeue(handle).unwrap().is_none());
        core.close(handle).unwrap();
    }

    #[test]
    fn callback_delivery_runs_callback() {
        use std::sync::atomic::AtomicU32;
        use std::sync::atomic::Ordering;
        let (core, _driver, _adapter, _target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        let hits = std::sync::Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let cmd = Command::read(0, 8, sg(&[(0x1000, 4096)]));
        let token = core
            .execute(
                handle,
                cmd,
                Delivery::Callback(std::sync::Arc::new(move |_core, token| {
                    assert!(token.result().is_ok());
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        token.wait_for_io();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        core.close(handle).unwrap();
    }

    #[test]
    fn last_path_death_fails_queued_with_no_connect() {
        let (core, driver, _adapter, target) = testutil::single_disk_setup();
        let handle = core.open("vmhba0", 0, 0, 0, 1, 0).unwrap();
        driver.set_mode(MockMode::Hold);
        let mut tokens = Vec::new();
        for i in 0..5u64 {
            let cmd = Command::read(i * 8, 8, sg(&[(0x1000, 4096)]));
            tokens.push(core.execute(handle, cmd, Delivery::Wait).unwrap());
        }
        // Four in flight, one queued. The only path dies on the first
        // completion; the helper world finds nothing alive and fails the
        // queued command.
        driver.complete_next(Some(CompletionInfo::host_error(HOST_NO_CONNECT)));
        tokens[4].wait_for_io();
        assert_eq!(tokens[4].result().host_status(), HOST_NO_CONNECT);
        assert_eq!(target.inner.lock().paths[0].state, PathState::Dead);
        for _ in 0..3 {
            driver.complete_next(None);
        }
        core.close(handle).unwrap();
    }
}
