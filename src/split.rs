// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decomposition of one logical command into physical sub-commands that fit
//! an adapter's scatter-gather, transfer-size and DMA-addressability limits,
//! and the join bookkeeping that reassembles their completions.

use std::sync::Arc;

use scsi_defs::cdb_lba_and_len;
use scsi_defs::cdb_set_lba_and_len;
use scsi_defs::ScsiResult;
use scsi_defs::GOOD;
use scsi_defs::HOST_ERROR;
use scsi_defs::HOST_OK;
use scsi_defs::SENSE_BUFFER_SIZE;

use crate::command::AddrKind;
use crate::command::Command;
use crate::command::SgEntry;
use crate::core::ScsiCore;
use crate::hba::AdapterCaps;
use crate::token::FramePayload;
use crate::token::Token;
use crate::mem::LOW_MEM_LIMIT;
use crate::mem::PAGE_SIZE;
use crate::Error;
use crate::Result;

/// One bounce substitution made in a child's scatter-gather list.
#[derive(Copy, Clone, Debug)]
pub struct BounceMap {
    pub bounce_addr: u64,
    pub orig_addr: u64,
    pub len: u32,
}

/// A physical sub-command ready for dispatch. The child token owns the
/// command copy and any bounce pages.
pub(crate) struct ChildCmd {
    pub cmd: Box<Command>,
    pub token: Arc<Token>,
}

/// Join bookkeeping carried in the parent token's callback frame.
pub struct SplitJoin {
    pub needed: u32,
    pub handled: u32,
    /// Sum of the children's transferred bytes.
    pub bytes: u64,
    /// Packed status of the first child to return, overridden by the first
    /// nonzero status.
    pub status: u32,
    pub sense: [u8; SENSE_BUFFER_SIZE],
    pub any_failed: bool,
    /// Splitting or dispatch failed partway; the parent completes as
    /// HOST_ERROR no matter what the dispatched children returned.
    pub error: bool,
}

impl SplitJoin {
    pub fn new(needed: u32) -> SplitJoin {
        SplitJoin {
            needed,
            handled: 0,
            bytes: 0,
            status: 0,
            sense: [0; SENSE_BUFFER_SIZE],
            any_failed: false,
            error: false,
        }
    }
}

fn dma_addressable(caps: &AdapterCaps, cmd: &Command, force_copy: bool) -> bool {
    if cmd.sg.addr_kind != AddrKind::Machine || cmd.sg.entries.is_empty() {
        return true;
    }
    if force_copy {
        return false;
    }
    caps.pae_capable
        || cmd
            .sg
            .entries
            .iter()
            .all(|e| e.addr + e.len as u64 <= LOW_MEM_LIMIT)
}

/// Whether the command can go to the driver as-is.
///
/// Block-only adapters (`sg_size == 0`) take every command whole; otherwise
/// the command must fit the entry count, the transfer cap and the adapter's
/// addressable range.
pub(crate) fn fits_adapter(caps: &AdapterCaps, cmd: &Command, force_copy: bool) -> bool {
    if caps.sg_size == 0 {
        return true;
    }
    cmd.sg.entries.len() as u32 <= caps.sg_size
        && cmd.data_len <= caps.max_xfer
        && dma_addressable(caps, cmd, force_copy)
}

/// Byte cursor over a parent scatter-gather list.
#[derive(Clone)]
struct SgCursor<'a> {
    entries: &'a [SgEntry],
    idx: usize,
    off: u32,
}

impl<'a> SgCursor<'a> {
    fn new(entries: &'a [SgEntry]) -> SgCursor<'a> {
        SgCursor {
            entries,
            idx: 0,
            off: 0,
        }
    }

    fn done(&self) -> bool {
        self.idx >= self.entries.len()
    }

    /// Takes up to `max` bytes from the current entry, advancing past it
    /// when fully consumed.
    fn take(&mut self, max: u32) -> Option<SgEntry> {
        let entry = self.entries.get(self.idx)?;
        let remain = entry.len - self.off;
        let chunk = remain.min(max);
        let out = SgEntry {
            addr: entry.addr + self.off as u64,
            len: chunk,
        };
        self.off += chunk;
        if self.off == entry.len {
            self.idx += 1;
            self.off = 0;
        }
        Some(out)
    }
}

/// Takes entries for one child until an adapter limit is hit.
fn take_child(
    cursor: &mut SgCursor,
    sg_size: u32,
    max_bytes: u64,
    per_entry_cap: u32,
) -> (Vec<SgEntry>, u64) {
    let mut entries = Vec::new();
    let mut bytes = 0u64;
    while !cursor.done() && (entries.len() as u32) < sg_size && bytes < max_bytes {
        let room = (max_bytes - bytes).min(per_entry_cap as u64) as u32;
        let Some(entry) = cursor.take(room) else {
            break;
        };
        bytes += entry.len as u64;
        entries.push(entry);
    }
    (entries, bytes)
}

/// Replaces entries the adapter cannot address with bounce pages, filling
/// them from the originals for write-direction transfers.
///
/// On pool exhaustion every page taken for this child is returned and the
/// caller unwinds the whole split.
fn apply_bounce(core: &ScsiCore, cmd: &mut Command, is_write: bool, force_copy: bool) -> Result<Vec<BounceMap>> {
    let mut maps: Vec<BounceMap> = Vec::new();
    for entry in cmd.sg.entries.iter_mut() {
        let high = entry.addr + entry.len as u64 > LOW_MEM_LIMIT;
        if !high && !force_copy {
            continue;
        }
        debug_assert!(entry.len as u64 <= PAGE_SIZE);
        let Some(page) = core.bounce.alloc() else {
            for map in &maps {
                core.bounce.free_page(map.bounce_addr);
            }
            return Err(Error::NoMemory);
        };
        if is_write {
            if let Err(err) = core.mem.copy(page, entry.addr, entry.len as usize) {
                log::error!("scsi: bounce fill failed: {}", err);
                core.bounce.free_page(page);
                for map in &maps {
                    core.bounce.free_page(map.bounce_addr);
                }
                return Err(Error::Io(ScsiResult::make_status(HOST_ERROR, 0)));
            }
        }
        maps.push(BounceMap {
            bounce_addr: page,
            orig_addr: entry.addr,
            len: entry.len,
        });
        entry.addr = page;
    }
    Ok(maps)
}

pub(crate) fn unwind_children(core: &ScsiCore, children: &[ChildCmd]) {
    for child in children {
        for map in child.token.take_bounces() {
            core.bounce.free_page(map.bounce_addr);
        }
    }
}

/// Splits `cmd` into children satisfying the adapter limits and pushes the
/// join frame onto `parent`.
///
/// Children of block commands are trimmed to block multiples, rewinding the
/// cursor so the next child resumes mid-entry; their CDBs are rewritten with
/// the per-child LBA and length. Non-block opcodes may only be "split" into
/// a single bounce-copied child.
pub(crate) fn split_command(
    core: &ScsiCore,
    caps: &AdapterCaps,
    block_size: u32,
    parent: &Arc<Token>,
    cmd: &Command,
) -> Result<Vec<ChildCmd>> {
    let rw = cdb_lba_and_len(&cmd.cdb);
    let force_copy = core.options.io_force_copy;
    let needs_bounce = !dma_addressable(caps, cmd, force_copy);
    let per_entry_cap = if needs_bounce {
        PAGE_SIZE as u32
    } else {
        u32::MAX
    };
    let block_size = block_size.max(1) as u64;

    let mut children: Vec<ChildCmd> = Vec::new();
    let mut cursor = SgCursor::new(&cmd.sg.entries);
    let mut consumed_blocks = 0u64;

    while !cursor.done() {
        let snapshot = cursor.clone();
        let (mut entries, mut bytes) =
            take_child(&mut cursor, caps.sg_size, caps.max_xfer, per_entry_cap);

        if rw.is_some() {
            let aligned = bytes - bytes % block_size;
            if aligned == 0 {
                unwind_children(core, &children);
                return Err(Error::Io(ScsiResult::make_status(HOST_ERROR, 0)));
            }
            if aligned != bytes {
                // Rewind and re-take exactly the aligned byte count; the last
                // entry shrinks and the cursor backs up into it.
                cursor = snapshot;
                let (e, b) = take_child(&mut cursor, caps.sg_size, aligned, per_entry_cap);
                debug_assert_eq!(b, aligned);
                entries = e;
                bytes = b;
            }
        } else if !children.is_empty() || !cursor.done() {
            // An opcode the splitter cannot rewrite only tolerates a pure
            // bounce copy, never a real decomposition.
            unwind_children(core, &children);
            return Err(Error::Io(ScsiResult::make_status(HOST_ERROR, 0)));
        }

        let mut child_cmd = cmd.clone();
        child_cmd.sg.entries = entries;
        child_cmd.data_len = bytes;
        if let Some((parent_lba, _)) = rw {
            let child_lba = parent_lba + consumed_blocks;
            let child_blocks = (bytes / block_size) as u32;
            if !cdb_set_lba_and_len(&mut child_cmd.cdb, child_lba, child_blocks) {
                unwind_children(core, &children);
                return Err(Error::Io(ScsiResult::make_status(HOST_ERROR, 0)));
            }
            child_cmd.sector = child_lba;
            consumed_blocks += child_blocks as u64;
        }

        let maps = if needs_bounce {
            match apply_bounce(core, &mut child_cmd, cmd.is_write(), force_copy) {
                Ok(maps) => maps,
                Err(err) => {
                    unwind_children(core, &children);
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };

        let token = Token::new_child(parent);
        token.set_cmd(Box::new(child_cmd.clone()));
        token.set_bounces(maps);
        children.push(ChildCmd {
            cmd: Box::new(child_cmd),
            token,
        });
    }

    parent.push_callback_frame(
        split_parent_done,
        FramePayload::Split(SplitJoin::new(children.len() as u32)),
    );
    Ok(children)
}

/// Join step run per child completion.
///
/// Copies bounce pages back for read-direction transfers, folds the child's
/// status and byte count into the parent's join frame, and pops the parent
/// frame once every child has reported.
pub(crate) fn child_done(
    core: &ScsiCore,
    child: &Arc<Token>,
    status: u32,
    bytes: u64,
    sense: [u8; SENSE_BUFFER_SIZE],
) {
    let parent = child
        .parent
        .clone()
        .expect("split join on a token with no parent");
    let ok = status >> 16 == HOST_OK && status as u8 == GOOD;

    let is_write = child
        .cmd_clone()
        .map(|c| c.is_write())
        .unwrap_or(false);
    for map in child.take_bounces() {
        if ok && !is_write {
            if let Err(err) = core.mem.copy(map.orig_addr, map.bounce_addr, map.len as usize) {
                log::error!("scsi: bounce copy-back failed: {}", err);
            }
        }
        core.bounce.free_page(map.bounce_addr);
    }
    child.drop_cmd();

    let done = parent.with_top_frame(|payload| {
        let FramePayload::Split(join) = payload;
        if join.handled == 0 || (join.status == 0 && status != 0) {
            join.status = status;
            join.sense = sense;
        }
        join.bytes += bytes;
        if !ok {
            join.any_failed = true;
        }
        join.handled += 1;
        debug_assert!(join.handled <= join.needed);
        join.handled == join.needed
    });
    if done {
        parent.pop_callback_frame(core);
    }
}

/// Marks the parent's join frame so the final completion is forced to
/// HOST_ERROR; used when dispatch fails partway through the children.
pub(crate) fn flag_split_error(parent: &Arc<Token>) {
    parent.with_top_frame(|payload| {
        let FramePayload::Split(join) = payload;
        join.error = true;
    });
}

/// Frame function: assembles the parent result and hands it to delivery.
fn split_parent_done(core: &ScsiCore, parent: &Arc<Token>, payload: FramePayload) {
    let FramePayload::Split(join) = payload;
    let status = if join.error {
        ScsiResult::make_status(HOST_ERROR, 0)
    } else {
        join.status
    };
    let bytes = if join.any_failed || join.error {
        0
    } else {
        join.bytes
    };
    let result = ScsiResult {
        status,
        bytes_xferred: bytes,
        sense: join.sense,
        serial: parent.origin_sn,
        origin_handle: parent.origin_handle,
    };
    crate::complete::deliver(core, parent, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SgList;

    fn caps(sg_size: u32, max_xfer: u64, pae: bool) -> AdapterCaps {
        AdapterCaps {
            name: "vmhba0".to_string(),
            driver_name: "mock".to_string(),
            module_id: 1,
            pci: crate::hba::PciAddress::default(),
            sg_size,
            max_xfer,
            pae_capable: pae,
            max_targets: 8,
            max_luns: 1,
        }
    }

    fn sg(entries: &[(u64, u32)]) -> SgList {
        SgList::machine(
            entries
                .iter()
                .map(|&(addr, len)| SgEntry { addr, len })
                .collect(),
        )
    }

    #[test]
    fn fits_checks_all_three_limits() {
        let cmd = Command::write(0, 8, sg(&[(0x1000, 4096)]));
        assert!(fits_adapter(&caps(8, 32768, true), &cmd, false));
        assert!(!fits_adapter(&caps(8, 2048, true), &cmd, false));
        // One entry over the entry budget.
        let many = Command::write(0, 8, sg(&[(0x1000, 1024); 4]));
        assert!(!fits_adapter(&caps(3, 32768, true), &many, false));
        // High-memory entry on a non-PAE adapter.
        let high = Command::write(0, 8, sg(&[(LOW_MEM_LIMIT, 4096)]));
        assert!(!fits_adapter(&caps(8, 32768, false), &high, false));
        assert!(fits_adapter(&caps(8, 32768, true), &high, false));
        // Block-only adapters take everything whole.
        assert!(fits_adapter(&caps(0, 0, false), &high, false));
        // Force-copy defeats the PAE shortcut.
        assert!(!fits_adapter(&caps(8, 32768, true), &high, true));
    }

    #[test]
    fn split_by_sg_and_xfer_limits() {
        let core = ScsiCore::new_for_test();
        // 16 entries of 2560 bytes = 40 KiB; adapter takes 8 entries and
        // 32 KiB per command, block size 512.
        let entries: Vec<(u64, u32)> = (0..16).map(|i| (0x10000 + i * 0x1000, 2560)).collect();
        let cmd = Command::write(100, 80, sg(&entries));
        let parent = Token::new(0, 1, 7, 1);
        let children =
            split_command(&core, &caps(8, 32768, true), 512, &parent, &cmd).unwrap();
        assert_eq!(children.len(), 2);
        // 8 entries * 2560 = 20480 bytes = 40 blocks per child.
        let c0 = &children[0].cmd;
        assert_eq!(c0.sg.entries.len(), 8);
        assert_eq!(c0.data_len, 20480);
        assert_eq!(cdb_lba_and_len(&c0.cdb), Some((100, 40)));
        let c1 = &children[1].cmd;
        assert_eq!(cdb_lba_and_len(&c1.cdb), Some((140, 40)));
        // All bytes covered exactly once.
        let total: u64 = children.iter().map(|c| c.cmd.data_len).sum();
        assert_eq!(total, cmd.data_len);
    }

    #[test]
    fn tail_trim_rewinds_into_entry() {
        let core = ScsiCore::new_for_test();
        // One 1536-byte entry, transfer cap 1024, block size 512: the first
        // child must stop at 1024 and the second resume mid-entry.
        let cmd = Command::write(0, 3, sg(&[(0x4000, 1536)]));
        let parent = Token::new(0, 1, 7, 1);
        let children = split_command(&core, &caps(8, 1024, true), 512, &parent, &cmd).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].cmd.sg.entries[0], SgEntry { addr: 0x4000, len: 1024 });
        assert_eq!(children[1].cmd.sg.entries[0], SgEntry { addr: 0x5000, len: 512 });
        assert_eq!(cdb_lba_and_len(&children[0].cmd.cdb), Some((0, 2)));
        assert_eq!(cdb_lba_and_len(&children[1].cmd.cdb), Some((2, 1)));
    }

    #[test]
    fn unknown_opcode_refuses_decomposition() {
        let core = ScsiCore::new_for_test();
        let mut cmd = Command::from_cdb(&[scsi_defs::INQUIRY, 0, 0, 0, 36, 0]);
        cmd.sg = sg(&[(0x1000, 4096), (0x2000, 4096)]);
        cmd.data_len = 8192;
        let parent = Token::new(0, 1, 7, 1);
        assert!(split_command(&core, &caps(1, 4096, true), 512, &parent, &cmd).is_err());
        assert!(!parent.has_frames());
    }

    #[test]
    fn pae_split_bounces_high_entries() {
        let core = ScsiCore::new_for_test();
        let before = core.bounce.available();
        // A write crossing the low-memory limit on a non-PAE adapter; pages
        // must come from the pool and entries shrink to page size.
        let cmd = Command::write(
            0,
            16,
            sg(&[(LOW_MEM_LIMIT, 4096), (0x2000, 4096)]),
        );
        let parent = Token::new(0, 1, 7, 1);
        let children =
            split_command(&core, &caps(8, 32768, false), 512, &parent, &cmd).unwrap();
        assert_eq!(children.len(), 1);
        let child = &children[0];
        for entry in &child.cmd.sg.entries {
            assert!(entry.addr + entry.len as u64 <= LOW_MEM_LIMIT);
            assert!(entry.len as u64 <= PAGE_SIZE);
        }
        assert_eq!(core.bounce.available(), before - 1);
        // Completing the child returns the page.
        child_done(
            &core,
            &child.token,
            0,
            child.cmd.data_len,
            [0; SENSE_BUFFER_SIZE],
        );
        assert_eq!(core.bounce.available(), before);
    }
}
