// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Path selection policies, the path state machine predicates, and the
//! failover procedure driven from helper-world context.

use std::sync::Arc;

use log::info;
use log::warn;
use scsi_defs::Sense;
use scsi_defs::ASC_NOT_READY;
use scsi_defs::HOST_BUS_BUSY;
use scsi_defs::HOST_NO_CONNECT;
use scsi_defs::MODE_SELECT_6;
use scsi_defs::NOT_READY;

use crate::command::Command;
use crate::command::CMD_BYPASSES_QUEUE;
use crate::core::ScsiCore;
use crate::path::PathState;
use crate::path::PATH_FAILOVER_TRIED;
use crate::target::Target;
use crate::target::TargetInner;
use crate::target::TARGET_SUPPORTS_MANUAL_SWITCHOVER;

/// How the active path is chosen among the alive ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PathPolicy {
    /// Stick to the preferred path whenever it is alive.
    Fixed,
    /// Keep using whatever worked last until it stops working.
    MostRecentlyUsed,
    /// Rotate across alive paths per dispatch.
    RoundRobin,
}

/// Whether a completion's host status marks the path dead.
pub(crate) fn path_dead_status(host_status: u32) -> bool {
    host_status == HOST_NO_CONNECT
}

/// Whether a completion on a DEAD path is good enough evidence to resurrect
/// it. Connection-level failures are not.
pub(crate) fn resurrects_path(host_status: u32) -> bool {
    host_status != HOST_NO_CONNECT && host_status != HOST_BUS_BUSY
}

/// Whether sense data from a STANDBY path asks for a switchover.
pub(crate) fn standby_wants_failover(sense: &Sense) -> bool {
    sense.key == NOT_READY && sense.asc == ASC_NOT_READY
}

fn best_alive(inner: &TargetInner) -> Option<usize> {
    let on = inner
        .paths
        .iter()
        .position(|p| p.state == PathState::On);
    on.or_else(|| {
        inner
            .paths
            .iter()
            .position(|p| p.state == PathState::Standby)
    })
}

/// Picks the path for the next dispatch and records it as active.
///
/// Returns `None` only when no path of the target is alive.
pub(crate) fn select_path(inner: &mut TargetInner) -> Option<usize> {
    let pick = match inner.policy {
        PathPolicy::Fixed => inner
            .preferred_path
            .filter(|&i| inner.paths[i].is_alive())
            .or_else(|| best_alive(inner)),
        PathPolicy::MostRecentlyUsed => {
            let active = inner.active_path;
            if active < inner.paths.len() && inner.paths[active].is_alive() {
                Some(active)
            } else {
                best_alive(inner)
            }
        }
        PathPolicy::RoundRobin => {
            let n = inner.paths.len();
            (1..=n)
                .map(|step| (inner.last_rr_path + step) % n)
                .find(|&i| inner.paths[i].is_alive())
        }
    }?;
    if inner.policy == PathPolicy::RoundRobin {
        inner.last_rr_path = pick;
    }
    inner.active_path = pick;
    Some(pick)
}

/// The vendor activate command sent down a standby path of a
/// manual-switchover array.
fn build_activate_command() -> Command {
    // Page-code 0x20 vendor mode select; the arrays we drive treat it as
    // "make this port the active one".
    let mut cmd = Command::from_cdb(&[MODE_SELECT_6, 0x10, 0x20, 0, 0, 0]);
    cmd.flags |= CMD_BYPASSES_QUEUE;
    cmd
}

/// Drives a path failover for `target` from helper-world context.
///
/// All pending requests on the target are held via `delay_cmds` while the
/// probe runs; the queue is re-driven with the delay override when done.
/// Must not be called from a completion context.
pub(crate) fn run_failover(core: &ScsiCore, target: &Arc<Target>) {
    {
        let mut inner = target.inner.lock();
        if inner.failover_in_progress {
            return;
        }
        inner.failover_in_progress = true;
        inner.delay_cmds += 1;
    }
    // Adapter teardown must wait for path evaluation to finish.
    let primary = core.primary_adapter(target);
    if let Some(adapter) = &primary {
        adapter.inner.lock().path_evals += 1;
    }

    failover_body(core, target);

    if let Some(adapter) = &primary {
        let mut inner = adapter.inner.lock();
        inner.path_evals -= 1;
    }
    let alive = {
        let mut inner = target.inner.lock();
        inner.failover_in_progress = false;
        inner.delay_cmds -= 1;
        inner.paths.iter().any(|p| p.is_alive())
    };

    if !alive {
        warn!(
            "scsi: no path to {}:{}:{} survived failover",
            target.adapter_name, target.id, target.lun
        );
        crate::complete::fail_all_queued(core, target, HOST_NO_CONNECT);
        return;
    }
    if let Some(adapter) = core.primary_adapter(target) {
        crate::issue::execute_queued(core, &adapter, Some(target), true);
    }
}

fn failover_body(core: &ScsiCore, target: &Arc<Target>) {
    loop {
        // Decide what to try next under the lock, then probe without it.
        let (candidate, needs_activate, old_active) = {
            let mut inner = target.inner.lock();
            let manual = inner.flags & TARGET_SUPPORTS_MANUAL_SWITCHOVER != 0;
            if let Some(idx) = inner
                .paths
                .iter()
                .position(|p| p.state == PathState::On)
            {
                // A healthy path exists; no probe required.
                let old = inner.active_path;
                inner.active_path = idx;
                if old != idx {
                    info!(
                        "scsi: {}:{}:{} fails over to path {}",
                        target.adapter_name, target.id, target.lun, idx
                    );
                }
                return;
            }
            let Some(idx) = inner.paths.iter().position(|p| {
                p.state == PathState::Standby && p.flags & PATH_FAILOVER_TRIED == 0
            }) else {
                return;
            };
            inner.paths[idx].flags |= PATH_FAILOVER_TRIED;
            (idx, manual, inner.active_path)
        };

        if needs_activate {
            let cmd = build_activate_command();
            let timeout = std::time::Duration::from_secs(core.options.timeout_secs);
            match crate::issue::dispatch_pinned_sync(core, target, candidate, cmd, timeout) {
                Ok(result) if result.is_ok() => {
                    let mut inner = target.inner.lock();
                    // The completion path promoted the standby path already;
                    // make it active and park the previous side.
                    inner.paths[candidate].state = PathState::On;
                    if old_active != candidate && old_active < inner.paths.len() {
                        let old = &mut inner.paths[old_active];
                        if old.state == PathState::On {
                            old.state = PathState::Standby;
                        }
                    }
                    inner.active_path = candidate;
                    for p in inner.paths.iter_mut() {
                        p.flags &= !PATH_FAILOVER_TRIED;
                    }
                    info!(
                        "scsi: {}:{}:{} activated standby path {}",
                        target.adapter_name, target.id, target.lun, candidate
                    );
                    return;
                }
                Ok(_) | Err(_) => {
                    // Try the next standby candidate, if any.
                    continue;
                }
            }
        } else {
            // No vendor handshake needed; a standby path can serve directly.
            let mut inner = target.inner.lock();
            inner.paths[candidate].state = PathState::On;
            inner.active_path = candidate;
            for p in inner.paths.iter_mut() {
                p.flags &= !PATH_FAILOVER_TRIED;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scsi_defs::HOST_OK;
    use scsi_defs::HOST_TIMEOUT;

    #[test]
    fn dead_predicate_and_resurrection() {
        assert!(path_dead_status(HOST_NO_CONNECT));
        assert!(!path_dead_status(HOST_TIMEOUT));
        assert!(resurrects_path(HOST_OK));
        assert!(resurrects_path(HOST_TIMEOUT));
        assert!(!resurrects_path(HOST_NO_CONNECT));
        assert!(!resurrects_path(HOST_BUS_BUSY));
    }

    #[test]
    fn standby_failover_sense() {
        assert!(standby_wants_failover(&Sense {
            key: NOT_READY,
            asc: ASC_NOT_READY,
            ascq: 0x03,
        }));
        assert!(!standby_wants_failover(&Sense {
            key: scsi_defs::UNIT_ATTENTION,
            asc: 0x29,
            ascq: 0,
        }));
    }

    fn two_path_target() -> std::sync::Arc<Target> {
        let (core, _driver, _adapter, target) = crate::testutil::single_disk_setup();
        let driver2 = crate::testutil::MockDriver::new();
        driver2.attach(&core);
        driver2.add_target(0, 0, crate::testutil::disk_info(b"DISK-0"));
        let adapter2 = core
            .register_adapter(crate::testutil::caps("vmhba1", 8, 32 << 10, true), driver2)
            .unwrap();
        core.create_target(&adapter2, 0, 0, &crate::testutil::disk_info(b"DISK-0"))
            .unwrap();
        assert_eq!(target.inner.lock().paths.len(), 2);
        target
    }

    #[test]
    fn fixed_policy_prefers_preferred_path() {
        let target = two_path_target();
        target.set_preferred_path(Some(1)).unwrap();
        let mut inner = target.inner.lock();
        assert_eq!(select_path(&mut inner), Some(1));
        // A dead preferred path falls back to any alive path.
        inner.paths[1].state = PathState::Dead;
        assert_eq!(select_path(&mut inner), Some(0));
        // The preferred path wins again even from standby.
        inner.paths[1].state = PathState::Standby;
        assert_eq!(select_path(&mut inner), Some(1));
    }

    #[test]
    fn mru_policy_sticks_to_working_path() {
        let target = two_path_target();
        target.set_policy(PathPolicy::MostRecentlyUsed).unwrap();
        let mut inner = target.inner.lock();
        inner.active_path = 1;
        assert_eq!(select_path(&mut inner), Some(1));
        assert_eq!(select_path(&mut inner), Some(1));
        inner.paths[1].state = PathState::Dead;
        assert_eq!(select_path(&mut inner), Some(0));
        // The old path coming back does not move MRU off the new one.
        inner.paths[1].state = PathState::On;
        assert_eq!(select_path(&mut inner), Some(0));
    }

    #[test]
    fn round_robin_rotates_over_alive_paths() {
        let target = two_path_target();
        target.set_policy(PathPolicy::RoundRobin).unwrap();
        let mut inner = target.inner.lock();
        let first = select_path(&mut inner).unwrap();
        let second = select_path(&mut inner).unwrap();
        assert_ne!(first, second);
        assert_eq!(select_path(&mut inner), Some(first));
        inner.paths[0].state = PathState::Off;
        assert_eq!(select_path(&mut inner), Some(1));
        assert_eq!(select_path(&mut inner), Some(1));
    }

    #[test]
    fn no_alive_path_selects_nothing() {
        let target = two_path_target();
        let mut inner = target.inner.lock();
        inner.paths[0].state = PathState::Dead;
        inner.paths[1].state = PathState::Off;
        assert_eq!(select_path(&mut inner), None);
    }
}
