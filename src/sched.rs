// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stride scheduling over per-(target, world) queues.
//!
//! Each world with work against a target holds a scheduler entry whose
//! virtual time advances by `stride = STRIDE1 / shares` per issued logical
//! command; dispatch always picks the entry furthest behind in virtual time,
//! so over a long run issue counts converge to the share ratio.

use std::collections::VecDeque;

use crate::issue::IssueUnit;
use crate::stats::IoStats;
use crate::target::TargetInner;
use crate::WorldId;

/// Numerator of the stride computation.
pub const STRIDE1: u64 = 1 << 20;

/// Per-(target, world) scheduler accounting.
pub(crate) struct SchedQ {
    pub world: WorldId,
    pub shares: u32,
    pub stride: u64,
    /// Local virtual time; advanced by `stride` per issued command.
    pub lvt: u64,
    /// Physical commands this world has in flight against the target.
    pub cif: u32,
    pub queue: VecDeque<IssueUnit>,
    /// Drained before `queue`; failover requeues land here.
    pub priority: VecDeque<IssueUnit>,
    pub stats: IoStats,
}

impl SchedQ {
    pub fn new(world: WorldId, shares: u32, start_lvt: u64) -> SchedQ {
        let shares = shares.max(1);
        SchedQ {
            world,
            shares,
            stride: STRIDE1 / shares as u64,
            lvt: start_lvt,
            cif: 0,
            queue: VecDeque::new(),
            priority: VecDeque::new(),
            stats: IoStats::default(),
        }
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty() || !self.priority.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len() + self.priority.len()
    }

    /// Pops the next unit, priority queue first.
    pub fn pop(&mut self) -> Option<IssueUnit> {
        self.priority.pop_front().or_else(|| self.queue.pop_front())
    }
}

/// Finds or creates the scheduler entry for `world`.
///
/// A fresh entry starts at the minimum virtual time of its peers so a newly
/// arriving world competes from now rather than replaying history.
pub(crate) fn entry_mut<'a>(
    inner: &'a mut TargetInner,
    world: WorldId,
    default_shares: u32,
) -> &'a mut SchedQ {
    let start_lvt = inner.sched.values().map(|e| e.lvt).min().unwrap_or(0);
    inner
        .sched
        .entry(world)
        .or_insert_with(|| SchedQ::new(world, default_shares, start_lvt))
}

/// Whether a new logical command from `world` may dispatch right now rather
/// than queue.
pub(crate) fn can_admit(inner: &TargetInner, world: WorldId, max_world_cif: u32) -> bool {
    if inner.delay_cmds > 0 {
        return false;
    }
    if inner.cif >= inner.cur_qdepth {
        return false;
    }
    match inner.sched.get(&world) {
        Some(entry) => entry.cif < max_world_cif && !entry.has_queued(),
        None => true,
    }
}

/// Picks the world to dispatch next: smallest virtual time among entries
/// with queued work, ties broken by world id.
pub(crate) fn pick_next(inner: &TargetInner, max_world_cif: u32) -> Option<WorldId> {
    inner
        .sched
        .values()
        .filter(|e| e.has_queued() && e.cif < max_world_cif)
        .min_by_key(|e| (e.lvt, e.world))
        .map(|e| e.world)
}
