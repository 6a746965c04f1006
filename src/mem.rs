// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Machine-memory access for the few places the mid-layer touches payload
//! bytes: bounce-page copies and the partition-table write guard.

use std::sync::Arc;

use sync::Mutex;
use thiserror::Error as ThisError;

/// Machine page size assumed by the bounce-copy machinery.
pub const PAGE_SIZE: u64 = 4096;

/// Machine addresses at or above this limit cannot be reached by adapters
/// without high-memory DMA support.
pub const LOW_MEM_LIMIT: u64 = 1 << 32;

#[derive(ThisError, Debug)]
pub enum MemError {
    #[error("machine address range {addr:#x}+{len:#x} is not mapped")]
    Unmapped { addr: u64, len: usize },
}

/// Byte access to machine memory by address.
///
/// The embedder supplies the implementation; tests use [`VecMemory`].
pub trait MachineMemory: Send + Sync {
    fn read_at(&self, addr: u64, out: &mut [u8]) -> std::result::Result<(), MemError>;
    fn write_at(&self, addr: u64, data: &[u8]) -> std::result::Result<(), MemError>;

    /// Copies `len` bytes between two machine addresses.
    fn copy(&self, dst: u64, src: u64, len: usize) -> std::result::Result<(), MemError> {
        let mut buf = vec![0u8; len];
        self.read_at(src, &mut buf)?;
        self.write_at(dst, &buf)
    }
}

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

/// A sparse, vector-backed machine memory built from flat regions.
pub struct VecMemory {
    regions: Mutex<Vec<Region>>,
}

impl VecMemory {
    pub fn new(base: u64, len: usize) -> Arc<VecMemory> {
        VecMemory::with_regions(&[(base, len)])
    }

    /// A memory with several disjoint `(base, len)` regions.
    pub fn with_regions(layout: &[(u64, usize)]) -> Arc<VecMemory> {
        Arc::new(VecMemory {
            regions: Mutex::new(
                layout
                    .iter()
                    .map(|&(base, len)| Region {
                        base,
                        bytes: vec![0u8; len],
                    })
                    .collect(),
            ),
        })
    }

    fn access<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> std::result::Result<R, MemError> {
        let mut regions = self.regions.lock();
        for region in regions.iter_mut() {
            let Some(start) = addr.checked_sub(region.base) else {
                continue;
            };
            let start = start as usize;
            let Some(end) = start.checked_add(len) else {
                continue;
            };
            if end <= region.bytes.len() {
                return Ok(f(&mut region.bytes[start..end]));
            }
        }
        Err(MemError::Unmapped { addr, len })
    }
}

impl MachineMemory for VecMemory {
    fn read_at(&self, addr: u64, out: &mut [u8]) -> std::result::Result<(), MemError> {
        self.access(addr, out.len(), |bytes| out.copy_from_slice(bytes))
    }

    fn write_at(&self, addr: u64, data: &[u8]) -> std::result::Result<(), MemError> {
        self.access(addr, data.len(), |bytes| bytes.copy_from_slice(data))
    }
}
