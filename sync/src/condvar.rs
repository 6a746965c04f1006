// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Condvar as StdCondvar;
use std::sync::MutexGuard;
use std::sync::WaitTimeoutResult;
use std::time::Duration;

/// A Condvar wrapper whose wait methods do not return a `Result`.
///
/// Panics if the paired mutex is poisoned, which only happens when a thread
/// holding the lock has already panicked.
#[derive(Default)]
pub struct Condvar {
    cond: StdCondvar,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            cond: StdCondvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        match self.cond.wait(guard) {
            Ok(guard) => guard,
            Err(_) => panic!("condvar mutex is poisoned"),
        }
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        match self.cond.wait_timeout(guard, timeout) {
            Ok(result) => result,
            Err(_) => panic!("condvar mutex is poisoned"),
        }
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}
