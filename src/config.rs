// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::Deserialize;

fn timeout_secs_default() -> u64 {
    40
}
fn timeout_retries_default() -> u32 {
    3
}
fn busy_sleep_ms_default() -> u64 {
    50
}
fn host_error_retries_default() -> u32 {
    3
}
fn reserv_conflict_retries_default() -> u32 {
    5
}
fn bool_true_default() -> bool {
    true
}
fn bounce_pages_default() -> usize {
    64
}
fn default_shares_default() -> u32 {
    1000
}
fn max_world_cif_default() -> u32 {
    16
}
fn helper_worlds_default() -> usize {
    2
}
fn max_adapters_default() -> usize {
    64
}

/// Tunables for the mid-layer, deserializable from the host configuration
/// surface.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct MidLayerOptions {
    /// Seconds a synchronous waiter allows one command attempt before
    /// aborting it.
    #[serde(default = "timeout_secs_default")]
    pub timeout_secs: u64,
    /// How many timed-out attempts the synchronous wait loop makes in all.
    #[serde(default = "timeout_retries_default")]
    pub timeout_retries: u32,
    /// Sleep between retries of BUSY-class statuses.
    #[serde(default = "busy_sleep_ms_default")]
    pub busy_sleep_ms: u64,
    /// Retry cap for HOST_ERROR completions.
    #[serde(default = "host_error_retries_default")]
    pub host_error_retries: u32,
    /// Retry cap for reservation conflicts before the target is latched to
    /// fail them fast.
    #[serde(default = "reserv_conflict_retries_default")]
    pub reserv_conflict_retries: u32,
    /// Whether UNIT ATTENTION completions are retried.
    #[serde(default = "bool_true_default")]
    pub retry_unit_attention: bool,
    /// Whether non-disk device classes are limited to a single open.
    #[serde(default = "bool_true_default")]
    pub passthrough_locking: bool,
    /// Send LUN resets rather than device resets where the transport allows.
    #[serde(default)]
    pub use_lun_reset: bool,
    /// Force every machine-addressed transfer through bounce pages even on
    /// adapters that can address high memory.
    #[serde(default)]
    pub io_force_copy: bool,
    /// Number of reserved low-memory bounce pages.
    #[serde(default = "bounce_pages_default")]
    pub bounce_pages: usize,
    /// Scheduler shares given to a world with no explicit configuration.
    #[serde(default = "default_shares_default")]
    pub default_shares: u32,
    /// Per-world cap on commands in flight against one target.
    #[serde(default = "max_world_cif_default")]
    pub max_world_cif: u32,
    /// Helper worker threads driving path failover.
    #[serde(default = "helper_worlds_default")]
    pub helper_worlds: usize,
    /// Registered adapter cap.
    #[serde(default = "max_adapters_default")]
    pub max_adapters: usize,
}

impl Default for MidLayerOptions {
    fn default() -> Self {
        MidLayerOptions {
            timeout_secs: timeout_secs_default(),
            timeout_retries: timeout_retries_default(),
            busy_sleep_ms: busy_sleep_ms_default(),
            host_error_retries: host_error_retries_default(),
            reserv_conflict_retries: reserv_conflict_retries_default(),
            retry_unit_attention: bool_true_default(),
            passthrough_locking: bool_true_default(),
            use_lun_reset: false,
            io_force_copy: false,
            bounce_pages: bounce_pages_default(),
            default_shares: default_shares_default(),
            max_world_cif: max_world_cif_default(),
            helper_worlds: helper_worlds_default(),
            max_adapters: max_adapters_default(),
        }
    }
}

/// Scheduler share presets for the common priority levels.
pub const SHARES_LOW: u32 = 500;
pub const SHARES_NORMAL: u32 = 1000;
pub const SHARES_HIGH: u32 = 2000;
