// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared fixtures for the in-crate pipeline tests: a scriptable mock HBA
//! driver and topology builders.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;

use sync::Mutex;

use crate::adapter::Adapter;
use crate::command::Command;
use crate::core::ScsiCore;
use crate::hba::AdapterCaps;
use crate::hba::CompletionInfo;
use crate::hba::DispatchResult;
use crate::hba::HbaDriver;
use crate::hba::PciAddress;
use crate::hba::ResultId;
use crate::hba::TargetInfo;
use crate::target::DiskId;
use crate::target::Target;
use crate::WorldId;

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum MockMode {
    /// Complete every dispatch inline from `command`.
    Inline,
    /// Park dispatches; the test completes them via `complete_next`.
    Hold,
}

pub(crate) struct MockDriver {
    pub targets: Mutex<BTreeMap<(u32, u32), TargetInfo>>,
    pub mode: Mutex<MockMode>,
    /// Completions consumed in dispatch order before the default OK.
    pub scripted: Mutex<VecDeque<CompletionInfo>>,
    pub dispatched: Mutex<Vec<Command>>,
    pub held: Mutex<VecDeque<(Command, ResultId)>>,
    pub would_block_next: Mutex<u32>,
    core: Mutex<Weak<ScsiCore>>,
}

impl MockDriver {
    pub fn new() -> Arc<MockDriver> {
        Arc::new(MockDriver {
            targets: Mutex::new(BTreeMap::new()),
            mode: Mutex::new(MockMode::Inline),
            scripted: Mutex::new(VecDeque::new()),
            dispatched: Mutex::new(Vec::new()),
            held: Mutex::new(VecDeque::new()),
            would_block_next: Mutex::new(0),
            core: Mutex::new(Weak::new()),
        })
    }

    pub fn attach(&self, core: &Arc<ScsiCore>) {
        *self.core.lock() = Arc::downgrade(core);
    }

    pub fn add_target(&self, id: u32, lun: u32, info: TargetInfo) {
        self.targets.lock().insert((id, lun), info);
    }

    pub fn script(&self, comp: CompletionInfo) {
        self.scripted.lock().push_back(comp);
    }

    pub fn set_mode(&self, mode: MockMode) {
        *self.mode.lock() = mode;
    }

    /// Completes the oldest held dispatch, with `comp` or the default OK.
    pub fn complete_next(&self, comp: Option<CompletionInfo>) -> bool {
        let Some((cmd, rid)) = self.held.lock().pop_front() else {
            return false;
        };
        let comp = comp.unwrap_or_else(|| CompletionInfo::ok(cmd.data_len));
        let core = self.core.lock().upgrade().expect("mock driver not attached");
        core.command_complete(rid, comp);
        true
    }

    pub fn held_len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }
}

impl HbaDriver for MockDriver {
    fn command(&self, _world: WorldId, cmd: &Command, rid: ResultId) -> DispatchResult {
        {
            let mut wb = self.would_block_next.lock();
            if *wb > 0 {
                *wb -= 1;
                return DispatchResult::WouldBlock;
            }
        }
        self.dispatched.lock().push(cmd.clone());
        let mode = *self.mode.lock();
        match mode {
            MockMode::Hold => {
                self.held.lock().push_back((cmd.clone(), rid));
            }
            MockMode::Inline => {
                let comp = self
                    .scripted
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| CompletionInfo::ok(cmd.data_len));
                let core = self.core.lock().upgrade().expect("mock driver not attached");
                core.command_complete(rid, comp);
            }
        }
        DispatchResult::Dispatched
    }

    fn get_info(&self, id: u32, lun: u32) -> Option<TargetInfo> {
        self.targets.lock().get(&(id, lun)).cloned()
    }
}

pub(crate) fn disk_info(serial: &[u8]) -> TargetInfo {
    TargetInfo {
        disk_id: DiskId::serial(0, serial),
        class: scsi_defs::TYPE_DISK,
        block_size: 512,
        num_blocks: 1 << 20,
        queue_depth: 4,
        supports_manual_switchover: false,
        must_use_mru: false,
        pseudo: false,
    }
}

pub(crate) fn caps(name: &str, sg_size: u32, max_xfer: u64, pae: bool) -> AdapterCaps {
    AdapterCaps {
        name: name.to_string(),
        driver_name: "mockhba".to_string(),
        module_id: 7,
        pci: PciAddress {
            bus: 0,
            dev: 4,
            func: 0,
        },
        sg_size,
        max_xfer,
        pae_capable: pae,
        max_targets: 8,
        max_luns: 2,
    }
}

/// A core with one adapter and one disk target at (0, 0).
pub(crate) fn single_disk_setup() -> (Arc<ScsiCore>, Arc<MockDriver>, Arc<Adapter>, Arc<Target>) {
    let core = ScsiCore::new_for_test();
    let driver = MockDriver::new();
    driver.attach(&core);
    driver.add_target(0, 0, disk_info(b"DISK-0"));
    let adapter = core
        .register_adapter(caps("vmhba0", 8, 32 << 10, true), driver.clone())
        .expect("adapter registration failed");
    let target = core
        .create_target(&adapter, 0, 0, &disk_info(b"DISK-0"))
        .expect("target creation failed");
    (core, driver, adapter, target)
}
