// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SCSI mid-layer: routes logical requests on opened
//! (adapter, target, lun, partition) handles to host-bus-adapter drivers.
//!
//! The mid-layer owns device topology and handle lifecycle, splits commands
//! to fit adapter transfer limits, schedules per-world fair shares against
//! target queue depths, selects among multiple paths to a logical unit with
//! automatic failover, and plumbs driver completions back to issuers.
//!
//! Lock ordering, outermost first:
//!
//! 1. the adapter table lock ([`core::ScsiCore::adapters`])
//! 2. a per-adapter lock ([`adapter::Adapter`])
//! 3. a per-target lock ([`target::Target`])
//! 4. the handle table lock ([`core::ScsiCore::handles`])
//! 5. leaf locks: per-handle state, per-token state
//!
//! The PAE bounce pool sits outside the rank entirely: it is a lock-free
//! page allocator ([`bounce::BouncePool`]) with a reserved quota.
//!
//! Driver completions arrive on contexts that must not block; everything on
//! the completion path takes only leaf locks or briefly-held table locks and
//! never sleeps. Work that must sleep (failover probes) is handed to helper
//! worker threads.

pub mod adapter;
pub mod blocking;
pub mod bounce;
pub mod command;
pub mod complete;
pub mod config;
pub mod core;
pub mod handle;
pub mod hba;
pub mod helper;
pub mod issue;
pub mod mem;
pub mod multipath;
pub mod partition;
pub mod path;
pub mod rescan;
pub mod sched;
pub mod split;
pub mod stats;
pub mod target;
#[cfg(test)]
mod testutil;
pub mod token;

use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::command::Command;
pub use crate::command::SgEntry;
pub use crate::command::SgList;
pub use crate::config::MidLayerOptions;
pub use crate::core::HandleInfo;
pub use crate::core::ScsiCore;
pub use crate::hba::AdapterCaps;
pub use crate::hba::CompletionInfo;
pub use crate::hba::DispatchResult;
pub use crate::hba::HbaDriver;
pub use crate::hba::ResultId;
pub use crate::hba::TargetInfo;
pub use crate::issue::Delivery;
pub use crate::multipath::PathPolicy;
pub use crate::target::DiskId;
pub use crate::token::Token;

/// An opaque identifier for a resource-accounting principal.
pub type WorldId = u32;

/// The world id of the host console; opens and commands from the host
/// administrative surface are accounted here.
pub const HOST_CONSOLE_WORLD: WorldId = 0;

/// A packed handle id that can never resolve to a live handle.
pub const INVALID_HANDLE_ID: u32 = u32::MAX;

/// Errors surfaced by the mid-layer.
#[sorted]
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("abort found no queued or running command")]
    AbortNotRunning,
    #[error("adapter is busy with a rescan or another open")]
    Busy,
    #[error("no adapter with that name is registered")]
    InvalidAdapter,
    #[error("handle is closed or was never opened")]
    InvalidHandle,
    #[error("no such partition on the target")]
    InvalidPartition,
    #[error("no target at that address")]
    InvalidTarget,
    #[error("unclassified I/O failure, packed status {0:#x}")]
    Io(u32),
    #[error("no connected path to the target remains")]
    NoConnect,
    #[error("bounce page pool is exhausted")]
    NoMemory,
    #[error("no resources to admit the command")]
    NoResources,
    #[error("target is not ready")]
    NotReady,
    #[error("write attempted through a read-only handle")]
    ReadOnly,
    #[error("target is reserved by another initiator")]
    ReservationConflict,
    #[error("command timed out")]
    Timeout,
    #[error("dispatch would block")]
    WouldBlock,
}

pub type Result<T> = std::result::Result<T, Error>;
