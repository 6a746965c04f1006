// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::TryLockError;

/// A Mutex wrapper whose `lock()` does not return a `Result`.
///
/// Panics if the lock is poisoned, which only happens when a thread holding
/// the lock has already panicked.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    lock: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            lock: StdMutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.lock.into_inner().unwrap()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("mutex is poisoned"),
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        match self.lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => panic!("mutex is poisoned"),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self.lock.get_mut() {
            Ok(value) => value,
            Err(_) => panic!("mutex is poisoned"),
        }
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.lock.fmt(f)
    }
}
