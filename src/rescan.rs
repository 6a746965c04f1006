// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Topology mutation driven by a bus rescan: new units become targets or
//! paths, vanished units are torn down when reference-clean, and surviving
//! units get their capacity and partition table refreshed.

use std::sync::Arc;

use log::info;
use log::warn;

use crate::adapter::Adapter;
use crate::core::ScsiCore;
use crate::Error;
use crate::Result;

/// Walks one adapter's (id, lun) space against the driver's `get_info`.
///
/// Guarded by a process-wide rescan flag; opens and adapter registration
/// observe BUSY while a rescan runs.
pub(crate) fn rescan_adapter(core: &ScsiCore, name: &str) -> Result<()> {
    let adapter = {
        let mut table = core.adapters.lock();
        if table.rescan_in_progress {
            return Err(Error::Busy);
        }
        let Some(adapter) = table.find(name) else {
            return Err(Error::InvalidAdapter);
        };
        table.rescan_in_progress = true;
        adapter
    };
    let result = walk_adapter(core, &adapter);
    core.adapters.lock().rescan_in_progress = false;
    result
}

fn walk_adapter(core: &ScsiCore, adapter: &Arc<Adapter>) -> Result<()> {
    adapter.driver.rescan();
    for id in 0..adapter.caps.max_targets {
        for lun in 0..adapter.caps.max_luns {
            let info = adapter.driver.get_info(id, lun);
            let existing = core.find_target_by_path(&adapter.caps.name, id, lun);
            match (info, existing) {
                (Some(info), None) => match core.create_target(adapter, id, lun, &info) {
                    Ok(target) => info!(
                        "scsi: rescan found {}:{}:{} ({} paths)",
                        adapter.caps.name,
                        id,
                        lun,
                        target.inner.lock().paths.len()
                    ),
                    Err(err) => warn!(
                        "scsi: rescan could not record {}:{}:{}: {}",
                        adapter.caps.name, id, lun, err
                    ),
                },
                (None, Some(_)) => match core.remove_target(&adapter.caps.name, id, lun) {
                    Ok(()) => info!("scsi: rescan removed {}:{}:{}", adapter.caps.name, id, lun),
                    // Still opened or queued somewhere; the unit stays until
                    // it is reference-clean.
                    Err(err) => info!(
                        "scsi: rescan keeps busy unit {}:{}:{}: {}",
                        adapter.caps.name, id, lun, err
                    ),
                },
                (Some(info), Some(target)) => {
                    let no_writers = {
                        let mut inner = target.inner.lock();
                        inner.block_size = info.block_size;
                        inner.num_blocks = info.num_blocks;
                        inner.max_qdepth = info.queue_depth;
                        inner.cur_qdepth = info.queue_depth.max(1);
                        inner.partitions.iter().all(|p| p.writers == 0)
                    };
                    if no_writers {
                        adapter.begin_open();
                        let _ = core.refresh_partition_table(adapter, &target);
                        adapter.end_open();
                    }
                }
                (None, None) => {}
            }
        }
    }
    Ok(())
}
