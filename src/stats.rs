// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

/// I/O counters kept per adapter, target, partition and (target, world)
/// scheduler entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoStats {
    pub commands: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub blocks_read: u64,
    pub blocks_written: u64,
    pub aborts: u64,
    pub resets: u64,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
}

impl IoStats {
    /// Accounts one completed command.
    pub fn record(&mut self, opcode: u8, bytes: u64, block_size: u32, latency: Duration) {
        self.commands += 1;
        let blocks = if block_size != 0 {
            bytes / block_size as u64
        } else {
            0
        };
        if scsi_defs::is_read_opcode(opcode) {
            self.read_ops += 1;
            self.blocks_read += blocks;
        } else if scsi_defs::is_write_opcode(opcode) {
            self.write_ops += 1;
            self.blocks_written += blocks;
        }
        let us = latency.as_micros() as u64;
        self.total_latency_us += us;
        if us > self.max_latency_us {
            self.max_latency_us = us;
        }
    }

    /// Mean completion latency in microseconds over all recorded commands.
    pub fn mean_latency_us(&self) -> u64 {
        if self.commands == 0 {
            0
        } else {
            self.total_latency_us / self.commands
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scsi_defs::READ_10;
    use scsi_defs::WRITE_10;

    #[test]
    fn record_reads_and_writes() {
        let mut stats = IoStats::default();
        stats.record(READ_10, 4096, 512, Duration::from_micros(100));
        stats.record(WRITE_10, 1024, 512, Duration::from_micros(300));
        assert_eq!(stats.commands, 2);
        assert_eq!(stats.read_ops, 1);
        assert_eq!(stats.write_ops, 1);
        assert_eq!(stats.blocks_read, 8);
        assert_eq!(stats.blocks_written, 2);
        assert_eq!(stats.mean_latency_us(), 200);
        assert_eq!(stats.max_latency_us, 300);
    }
}
