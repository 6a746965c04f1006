// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Partition records and the wire view of MBR partition-table entries.
//!
//! Parsing a disk's partition table is the embedder's business; the
//! mid-layer receives the parsed entries through [`PartitionTableSource`]
//! and keeps per-partition open counts, flags and statistics. It does retain
//! enough of the MBR layout to implement the live-table write guard.

use zerocopy::byteorder::LittleEndian;
use zerocopy::byteorder::U32;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;
use zerocopy::Unaligned;

use crate::stats::IoStats;

/// Sector size the partition machinery assumes for table layout.
pub const SECTOR_SIZE: usize = 512;
/// Byte offset of the first partition entry in an MBR sector.
pub const MBR_ENTRY_OFFSET: usize = 446;
/// Entries in one MBR sector.
pub const MBR_ENTRY_COUNT: usize = 4;
/// Partition number of the whole-target pseudo partition.
pub const WHOLE_DISK_PARTITION: u16 = 0;
/// Most partitions one target may carry; the on-disk scheme allows more but
/// the mid-layer's tables stop here.
pub const MAX_PARTITIONS: usize = 16;

// Partition types of interest to the open-policy checks.
/// The kernel's own partition type; VM and kernel opens must address this.
pub const KERNEL_PARTITION_TYPE: u8 = 0xfb;
/// The crash-dump partition type; dump opens must address this.
pub const DUMP_PARTITION_TYPE: u8 = 0xfc;
/// CHS extended container partition.
pub const EXTENDED_PARTITION_TYPE: u8 = 0x05;
/// LBA extended container partition.
pub const EXTENDED_LBA_PARTITION_TYPE: u8 = 0x0f;

/// True for the container types that hold a nested partition table.
pub fn is_extended_type(ptype: u8) -> bool {
    ptype == EXTENDED_PARTITION_TYPE || ptype == EXTENDED_LBA_PARTITION_TYPE
}

// Partition flag bits.
/// Every writer of the partition declared multi-writer intent.
pub const PART_MULTI_WRITER: u32 = 1 << 0;
/// All opens of the partition are read-only.
pub const PART_READ_ONLY: u32 = 1 << 1;

/// One entry of an MBR partition table as it appears on disk.
#[repr(C)]
#[derive(Copy, Clone, Debug, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct MbrEntry {
    pub boot_indicator: u8,
    pub chs_first: [u8; 3],
    pub ptype: u8,
    pub chs_last: [u8; 3],
    pub start_lba: U32<LittleEndian>,
    pub num_sectors: U32<LittleEndian>,
}

impl MbrEntry {
    /// Reads entry `index` out of a raw MBR sector image.
    pub fn from_sector(sector: &[u8], index: usize) -> Option<MbrEntry> {
        if index >= MBR_ENTRY_COUNT {
            return None;
        }
        let off = MBR_ENTRY_OFFSET + index * std::mem::size_of::<MbrEntry>();
        MbrEntry::read_from(sector.get(off..off + std::mem::size_of::<MbrEntry>())?)
    }
}

/// A parsed partition handed to the mid-layer by the table source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDef {
    /// Partition number; 0 is reserved for the whole target.
    pub number: u16,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub ptype: u8,
    /// Absolute sector of the table this entry was read from.
    pub table_sector: u64,
    /// Entry slot within a primary MBR sector, when the entry lives there.
    /// Logical partitions from extended tables carry `None` and are guarded
    /// at sector granularity.
    pub entry_index: Option<u8>,
}

/// A slice of a target with its open-state bookkeeping.
#[derive(Clone, Debug)]
pub struct Partition {
    pub number: u16,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub ptype: u8,
    pub table_sector: u64,
    pub entry_index: Option<u8>,
    pub readers: u32,
    pub writers: u32,
    pub flags: u32,
    pub stats: IoStats,
}

impl Partition {
    fn from_def(def: &PartitionDef) -> Partition {
        Partition {
            number: def.number,
            start_sector: def.start_sector,
            num_sectors: def.num_sectors,
            ptype: def.ptype,
            table_sector: def.table_sector,
            entry_index: def.entry_index,
            readers: 0,
            writers: 0,
            flags: 0,
            stats: IoStats::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.readers != 0 || self.writers != 0
    }
}

/// Builds a target's partition vector from parsed definitions, synthesizing
/// the whole-disk entry 0 which always exists.
pub fn build_partitions(defs: &[PartitionDef], num_blocks: u64) -> Vec<Partition> {
    let mut parts = Vec::with_capacity(defs.len() + 1);
    parts.push(Partition {
        number: WHOLE_DISK_PARTITION,
        start_sector: 0,
        num_sectors: num_blocks,
        ptype: 0,
        table_sector: 0,
        entry_index: None,
        readers: 0,
        writers: 0,
        flags: 0,
        stats: IoStats::default(),
    });
    for def in defs {
        if def.number == WHOLE_DISK_PARTITION || def.number as usize >= MAX_PARTITIONS {
            continue;
        }
        parts.push(Partition::from_def(def));
    }
    parts
}

/// Merges fresh definitions into an existing table, preserving the open
/// counts and flags of partitions that survived the re-read.
pub fn refresh_partitions(old: &[Partition], defs: &[PartitionDef], num_blocks: u64) -> Vec<Partition> {
    let mut parts = build_partitions(defs, num_blocks);
    for part in parts.iter_mut() {
        if let Some(prev) = old.iter().find(|p| p.number == part.number) {
            part.readers = prev.readers;
            part.writers = prev.writers;
            part.flags = prev.flags;
            part.stats = prev.stats;
        }
    }
    parts
}

/// The pluggable partition-table parser.
///
/// Implementations read whatever on-disk scheme they understand and return
/// flat definitions. Called with the open-in-progress guard held for the
/// adapter, so at most one read per adapter runs at a time.
pub trait PartitionTableSource: Send + Sync {
    fn read_partition_table(
        &self,
        adapter_name: &str,
        id: u32,
        lun: u32,
    ) -> anyhow::Result<Vec<PartitionDef>>;
}

/// Table source for targets with no recognized partition table: only the
/// whole-disk partition exists.
pub struct WholeDiskSource;

impl PartitionTableSource for WholeDiskSource {
    fn read_partition_table(
        &self,
        _adapter_name: &str,
        _id: u32,
        _lun: u32,
    ) -> anyhow::Result<Vec<PartitionDef>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr_with_entry(index: usize, ptype: u8, start: u32, num: u32) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        let entry = MbrEntry {
            boot_indicator: 0,
            chs_first: [0; 3],
            ptype,
            chs_last: [0; 3],
            start_lba: U32::new(start),
            num_sectors: U32::new(num),
        };
        let off = MBR_ENTRY_OFFSET + index * std::mem::size_of::<MbrEntry>();
        sector[off..off + 16].copy_from_slice(entry.as_bytes());
        sector[510] = 0x55;
        sector[511] = 0xaa;
        sector
    }

    #[test]
    fn mbr_entry_extraction() {
        let sector = mbr_with_entry(1, KERNEL_PARTITION_TYPE, 2048, 8192);
        let entry = MbrEntry::from_sector(&sector, 1).unwrap();
        assert_eq!(entry.ptype, KERNEL_PARTITION_TYPE);
        assert_eq!(entry.start_lba.get(), 2048);
        assert_eq!(entry.num_sectors.get(), 8192);
        assert!(MbrEntry::from_sector(&sector, 4).is_none());
    }

    #[test]
    fn whole_disk_entry_always_present() {
        let parts = build_partitions(&[], 4096);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].number, WHOLE_DISK_PARTITION);
        assert_eq!(parts[0].num_sectors, 4096);
    }

    #[test]
    fn refresh_preserves_open_counts() {
        let def = PartitionDef {
            number: 1,
            start_sector: 2048,
            num_sectors: 2048,
            ptype: KERNEL_PARTITION_TYPE,
            table_sector: 0,
            entry_index: Some(0),
        };
        let mut parts = build_partitions(&[def.clone()], 8192);
        parts[1].readers = 2;
        parts[1].writers = 1;
        let refreshed = refresh_partitions(&parts, &[def], 8192);
        assert_eq!(refreshed[1].readers, 2);
        assert_eq!(refreshed[1].writers, 1);
    }

    #[test]
    fn out_of_range_defs_dropped() {
        let def = PartitionDef {
            number: MAX_PARTITIONS as u16,
            start_sector: 0,
            num_sectors: 1,
            ptype: 0x83,
            table_sector: 0,
            entry_index: Some(0),
        };
        assert_eq!(build_partitions(&[def], 128).len(), 1);
    }
}
