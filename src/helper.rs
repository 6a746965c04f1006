// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helper worlds: worker threads that take the blocking half of path
//! failover off the completion contexts that must not sleep.

use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;

use log::error;
use sync::Mutex;

use crate::core::ScsiCore;
use crate::multipath;
use crate::target::Target;

pub(crate) enum HelperRequest {
    /// Drive a failover for the target, probing standby paths as needed.
    Failover(Arc<Target>),
    Shutdown,
}

/// A single-consumer work queue served by a small pool of worker threads.
pub(crate) struct HelperPool {
    tx: Mutex<Option<Sender<HelperRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl HelperPool {
    pub fn new() -> HelperPool {
        HelperPool {
            tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self, core: Weak<ScsiCore>, count: usize) {
        let (tx, rx) = channel();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = self.workers.lock();
        for i in 0..count.max(1) {
            let rx = rx.clone();
            let core = core.clone();
            let worker = thread::Builder::new()
                .name(format!("scsiHelper{}", i))
                .spawn(move || helper_loop(core, rx))
                .expect("failed to spawn scsi helper world");
            workers.push(worker);
        }
        *self.tx.lock() = Some(tx);
    }

    /// Enqueues a request; dropped silently after shutdown.
    pub fn request(&self, req: HelperRequest) {
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(req).is_err() {
                error!("scsi: helper request after workers exited");
            }
        }
    }

    pub fn shutdown(&self) {
        let workers = {
            let mut workers = self.workers.lock();
            if let Some(tx) = self.tx.lock().as_ref() {
                for _ in 0..workers.len() {
                    let _ = tx.send(HelperRequest::Shutdown);
                }
            }
            *self.tx.lock() = None;
            std::mem::take(&mut *workers)
        };
        let me = thread::current().id();
        for worker in workers {
            // Shutdown can run on a helper thread when it held the last
            // reference to the core; it must not join itself.
            if worker.thread().id() != me {
                let _ = worker.join();
            }
        }
    }
}

fn helper_loop(core: Weak<ScsiCore>, rx: Arc<Mutex<Receiver<HelperRequest>>>) {
    loop {
        // Hold the receiver lock only while waiting for one request so the
        // pool drains in parallel.
        let req = {
            let rx = rx.lock();
            rx.recv()
        };
        match req {
            Ok(HelperRequest::Failover(target)) => {
                let Some(core) = core.upgrade() else {
                    break;
                };
                multipath::run_failover(&core, &target);
            }
            Ok(HelperRequest::Shutdown) | Err(_) => break,
        }
    }
}
