// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use sync::Condvar;
use sync::Mutex;

use crate::hba::AdapterCaps;
use crate::hba::HbaDriver;
use crate::target::Target;
use crate::Error;
use crate::Result;

/// Buckets in the adapter name hash. Names are short and sparse, so a small
/// prime keeps chains near one.
pub const ADAPTER_HASH_BUCKETS: usize = 19;

fn hash_adapter_name(name: &str) -> usize {
    name.bytes().fold(0usize, |acc, b| acc + b as usize) % ADAPTER_HASH_BUCKETS
}

pub(crate) struct AdapterInner {
    pub targets: Vec<Arc<Target>>,
    /// Handles currently open through this adapter.
    pub open_count: u32,
    /// Queued logical commands across all targets of the adapter.
    pub qcount: u32,
    /// Guards partition-table reads: one open at a time per adapter.
    pub open_in_progress: bool,
    /// Path evaluations in flight; destroy refuses while nonzero.
    pub path_evals: u32,
    /// Use count pinning the owning driver module.
    pub module_use_count: u32,
    /// Set when a completion requested the host interrupt and not yet
    /// drained by the host.
    pub host_interrupt_pending: bool,
}

/// One registered host-bus adapter.
pub struct Adapter {
    pub caps: AdapterCaps,
    pub(crate) driver: Arc<dyn HbaDriver>,
    pub(crate) inner: Mutex<AdapterInner>,
    pub(crate) open_cv: Condvar,
}

impl Adapter {
    pub(crate) fn new(caps: AdapterCaps, driver: Arc<dyn HbaDriver>) -> Arc<Adapter> {
        Arc::new(Adapter {
            caps,
            driver,
            inner: Mutex::new(AdapterInner {
                targets: Vec::new(),
                open_count: 0,
                qcount: 0,
                open_in_progress: false,
                path_evals: 0,
                module_use_count: 0,
                host_interrupt_pending: false,
            }),
            open_cv: Condvar::new(),
        })
    }

    pub fn open_count(&self) -> u32 {
        self.inner.lock().open_count
    }

    pub(crate) fn targets(&self) -> Vec<Arc<Target>> {
        self.inner.lock().targets.clone()
    }

    /// Enters the one-open-at-a-time section used for partition-table reads.
    pub(crate) fn begin_open(&self) {
        let mut inner = self.inner.lock();
        while inner.open_in_progress {
            inner = self.open_cv.wait(inner);
        }
        inner.open_in_progress = true;
    }

    pub(crate) fn end_open(&self) {
        let mut inner = self.inner.lock();
        inner.open_in_progress = false;
        drop(inner);
        self.open_cv.notify_all();
    }

    /// Takes and clears the pending host-interrupt mark.
    pub fn drain_host_interrupt(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.host_interrupt_pending)
    }
}

/// The process-wide adapter registry: a fixed-bucket name hash plus the
/// rescan exclusion flag.
pub(crate) struct AdapterTable {
    buckets: Vec<Vec<Arc<Adapter>>>,
    count: usize,
    pub rescan_in_progress: bool,
}

impl AdapterTable {
    pub fn new() -> AdapterTable {
        AdapterTable {
            buckets: vec![Vec::new(); ADAPTER_HASH_BUCKETS],
            count: 0,
            rescan_in_progress: false,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn find(&self, name: &str) -> Option<Arc<Adapter>> {
        self.buckets[hash_adapter_name(name)]
            .iter()
            .find(|a| a.caps.name == name)
            .cloned()
    }

    /// Registers an adapter; fails on a duplicate name or when the
    /// configured adapter cap is reached.
    pub fn insert(&mut self, adapter: Arc<Adapter>, max_adapters: usize) -> Result<()> {
        if self.count >= max_adapters {
            return Err(Error::NoResources);
        }
        let bucket = hash_adapter_name(&adapter.caps.name);
        if self.buckets[bucket]
            .iter()
            .any(|a| a.caps.name == adapter.caps.name)
        {
            return Err(Error::InvalidAdapter);
        }
        self.buckets[bucket].push(adapter);
        self.count += 1;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Adapter>> {
        let bucket = hash_adapter_name(name);
        let idx = self.buckets[bucket]
            .iter()
            .position(|a| a.caps.name == name)?;
        self.count -= 1;
        Some(self.buckets[bucket].remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Adapter>> {
        self.buckets.iter().flatten()
    }
}
