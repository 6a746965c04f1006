// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use scsi_defs::cdb_set_lba_and_len;
use scsi_defs::READ_10;
use scsi_defs::READ_16;
use scsi_defs::WRITE_10;
use scsi_defs::WRITE_16;

use crate::mem::MachineMemory;
use crate::mem::MemError;
use crate::INVALID_HANDLE_ID;

/// Widest CDB the mid-layer carries.
pub const MAX_CDB_SIZE: usize = 16;

// Command flag bits.
/// Dispatch without consulting the scheduler.
pub const CMD_BYPASSES_QUEUE: u32 = 1 << 0;
/// Surface WOULD_BLOCK to the caller instead of queueing.
pub const CMD_RETURN_WOULD_BLOCK: u32 = 1 << 1;
/// The issuer does not care whether the command fails.
pub const CMD_IGNORE_FAILURE: u32 = 1 << 2;
/// Suppress error logging for expected failures.
pub const CMD_PRINT_NO_ERRORS: u32 = 1 << 3;
/// The command addresses the adapter below the logical-unit abstraction.
pub const CMD_LOW_LEVEL: u32 = 1 << 4;
/// A reset should address the LUN rather than the whole device.
pub const CMD_USE_LUNRESET: u32 = 1 << 5;
/// The synchronous waiter gave up on this command.
pub const CMD_TIMEDOUT: u32 = 1 << 6;

/// How an entry in a scatter-gather list addresses its buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddrKind {
    Virtual,
    Physical,
    Machine,
}

/// One contiguous run of payload bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
}

/// A scatter-gather list with a single addressing discipline.
///
/// The discipline is per list; a command never mixes virtual, physical and
/// machine entries, and the splitter keeps that true for every child it
/// produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SgList {
    pub addr_kind: AddrKind,
    pub entries: Vec<SgEntry>,
}

impl SgList {
    pub fn machine(entries: Vec<SgEntry>) -> SgList {
        SgList {
            addr_kind: AddrKind::Machine,
            entries,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| e.len as u64).sum()
    }

    /// Reads `out.len()` payload bytes starting `offset` bytes into the list.
    ///
    /// Fails if the span runs off the end of the list or any backing range is
    /// unmapped.
    pub fn read_into(
        &self,
        mem: &dyn MachineMemory,
        offset: u64,
        out: &mut [u8],
    ) -> std::result::Result<(), MemError> {
        let mut skip = offset;
        let mut filled = 0usize;
        for entry in &self.entries {
            if skip >= entry.len as u64 {
                skip -= entry.len as u64;
                continue;
            }
            let avail = (entry.len as u64 - skip) as usize;
            let want = (out.len() - filled).min(avail);
            mem.read_at(entry.addr + skip, &mut out[filled..filled + want])?;
            filled += want;
            skip = 0;
            if filled == out.len() {
                return Ok(());
            }
        }
        Err(MemError::Unmapped {
            addr: offset,
            len: out.len(),
        })
    }
}

/// The dispatch class of a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// A normal command subject to scheduling and splitting.
    Queued,
    /// Target-wide purge and reset.
    Reset,
    /// Abort of one previously issued command.
    Abort,
    /// A crash-dump write that bypasses normal plumbing.
    Dump,
    /// Adapter-level passthrough.
    LowLevel,
}

/// One logical SCSI request as submitted by the upper layer.
///
/// Commands are copied on entry to the issue pipeline so the submitter may
/// reuse or free its own copy immediately.
#[derive(Clone, Debug)]
pub struct Command {
    pub kind: CommandKind,
    pub flags: u32,
    pub cdb: [u8; MAX_CDB_SIZE],
    pub cdb_len: usize,
    pub sg: SgList,
    pub data_len: u64,
    /// Absolute sector the transfer starts at, for block commands.
    pub sector: u64,
    /// Identity of the submitting handle, stamped by the issue pipeline.
    pub origin_handle: u32,
    /// Serial number under the submitting handle, stamped by the issue
    /// pipeline.
    pub origin_sn: u32,
}

impl Command {
    /// A command with no payload.
    pub fn from_cdb(cdb_bytes: &[u8]) -> Command {
        let mut cdb = [0u8; MAX_CDB_SIZE];
        cdb[..cdb_bytes.len()].copy_from_slice(cdb_bytes);
        Command {
            kind: CommandKind::Queued,
            flags: 0,
            cdb,
            cdb_len: cdb_bytes.len(),
            sg: SgList {
                addr_kind: AddrKind::Machine,
                entries: Vec::new(),
            },
            data_len: 0,
            sector: 0,
            origin_handle: INVALID_HANDLE_ID,
            origin_sn: 0,
        }
    }

    fn rw(opcode: u8, cdb_len: usize, sector: u64, blocks: u32, sg: SgList) -> Command {
        let mut cmd = Command::from_cdb(&[opcode]);
        cmd.cdb_len = cdb_len;
        // Values are validated by the builders below before reaching here.
        assert!(cdb_set_lba_and_len(&mut cmd.cdb, sector, blocks));
        cmd.data_len = sg.total_len();
        cmd.sector = sector;
        cmd.sg = sg;
        cmd
    }

    /// Builds a READ(10), or READ(16) when the range needs the wider CDB.
    pub fn read(sector: u64, blocks: u32, sg: SgList) -> Command {
        if sector > u32::MAX as u64 || blocks > u16::MAX as u32 {
            Command::rw(READ_16, 16, sector, blocks, sg)
        } else {
            Command::rw(READ_10, 10, sector, blocks, sg)
        }
    }

    /// Builds a WRITE(10), or WRITE(16) when the range needs the wider CDB.
    pub fn write(sector: u64, blocks: u32, sg: SgList) -> Command {
        if sector > u32::MAX as u64 || blocks > u16::MAX as u32 {
            Command::rw(WRITE_16, 16, sector, blocks, sg)
        } else {
            Command::rw(WRITE_10, 10, sector, blocks, sg)
        }
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn is_write(&self) -> bool {
        scsi_defs::is_write_opcode(self.opcode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::VecMemory;
    use scsi_defs::cdb_lba_and_len;

    fn sg(entries: &[(u64, u32)]) -> SgList {
        SgList::machine(
            entries
                .iter()
                .map(|&(addr, len)| SgEntry { addr, len })
                .collect(),
        )
    }

    #[test]
    fn read_builder_picks_cdb_width() {
        let cmd = Command::read(100, 8, sg(&[(0x1000, 4096)]));
        assert_eq!(cmd.opcode(), READ_10);
        assert_eq!(cdb_lba_and_len(&cmd.cdb), Some((100, 8)));
        assert_eq!(cmd.data_len, 4096);

        let wide = Command::read(1 << 33, 8, sg(&[(0x1000, 4096)]));
        assert_eq!(wide.opcode(), READ_16);
        assert_eq!(cdb_lba_and_len(&wide.cdb), Some((1 << 33, 8)));
    }

    #[test]
    fn sg_read_spans_entries() {
        let mem = VecMemory::new(0, 0x4000);
        mem.write_at(0x1000, b"hello").unwrap();
        mem.write_at(0x2000, b"world").unwrap();
        let list = sg(&[(0x1000, 5), (0x2000, 5)]);
        let mut out = [0u8; 8];
        list.read_into(mem.as_ref(), 2, &mut out).unwrap();
        assert_eq!(&out, b"lloworld");
    }

    #[test]
    fn sg_read_past_end() {
        let mem = VecMemory::new(0, 0x1000);
        let list = sg(&[(0, 16)]);
        let mut out = [0u8; 32];
        assert!(list.read_into(mem.as_ref(), 0, &mut out).is_err());
    }
}
