// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::sync::Weak;

use crate::adapter::Adapter;

/// Administrative and observed state of one route to a target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PathState {
    /// Usable and believed healthy.
    On,
    /// Administratively disabled.
    Off,
    /// I/O on the path failed with a connection-level error.
    Dead,
    /// The passive side of an active/passive array; usable only after a
    /// switchover.
    Standby,
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PathState::On => "on",
            PathState::Off => "off",
            PathState::Dead => "dead",
            PathState::Standby => "standby",
        };
        f.write_str(s)
    }
}

// Path flag bits.
/// A failover attempt has already been made down this path.
pub const PATH_FAILOVER_TRIED: u32 = 1 << 0;
/// The device reservation was taken through this path.
pub const PATH_RESERVED_HERE: u32 = 1 << 1;
/// The path has completed vendor registration.
pub const PATH_REGISTERED: u32 = 1 << 2;

/// One concrete route `(adapter, id, lun)` to a target.
///
/// Paths live in their target's path list and are mutated only under the
/// target lock; the adapter back-reference is non-owning so that a rescan
/// tearing down an adapter cannot leave a cycle.
pub struct Path {
    pub adapter: Weak<Adapter>,
    pub adapter_name: String,
    pub id: u32,
    pub lun: u32,
    pub state: PathState,
    pub in_flight: u32,
    pub flags: u32,
}

impl Path {
    pub fn new(adapter: &std::sync::Arc<Adapter>, id: u32, lun: u32) -> Path {
        Path {
            adapter: std::sync::Arc::downgrade(adapter),
            adapter_name: adapter.caps.name.clone(),
            id,
            lun,
            state: PathState::On,
            in_flight: 0,
            flags: 0,
        }
    }

    /// A path I/O can be routed down, possibly after a switchover.
    pub fn is_alive(&self) -> bool {
        matches!(self.state, PathState::On | PathState::Standby)
    }

    pub fn matches(&self, adapter_name: &str, id: u32, lun: u32) -> bool {
        self.adapter_name == adapter_name && self.id == id && self.lun == lun
    }
}
