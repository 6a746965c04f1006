// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The rendezvous object for one outstanding command.
//!
//! A token is shared by the issuer, the dispatch path, the driver completion
//! and any waiter; `Arc` clones stand in for the retain/release pairs each of
//! those holds. A token owns the mid-layer's private copy of its command and
//! a bounded stack of callback frames pushed by layers that post-process the
//! completion.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use scsi_defs::ScsiResult;
use smallvec::SmallVec;
use sync::Condvar;
use sync::Mutex;

use crate::command::Command;
use crate::core::ScsiCore;
use crate::split::SplitJoin;
use crate::WorldId;

// Token flag bits.
/// The command has completed.
pub const TOKEN_IO_DONE: u32 = 1 << 0;
/// The synchronous waiter's timer fired before completion.
pub const TOKEN_IO_TIMEDOUT: u32 = 1 << 1;
/// A waiter is parked on the token.
pub const TOKEN_WAITER: u32 = 1 << 2;
/// Completion invokes the registered callback.
pub const TOKEN_CALLBACK: u32 = 1 << 3;
/// Completion links the token onto the handle's result list.
pub const TOKEN_ENQUEUE: u32 = 1 << 4;
/// A post-completion action is pending on the token.
pub const TOKEN_POST_ACTION: u32 = 1 << 5;
/// Completion raises the host interrupt for the issuing adapter.
pub const TOKEN_HOST_INTERRUPT: u32 = 1 << 6;
/// The holder runs in a context that must never sleep.
pub const TOKEN_CANT_BLOCK: u32 = 1 << 7;

/// Callback-frame stack depth. Exceeding it is a programming error in the
/// layer doing the push.
pub const MAX_CALLBACK_FRAMES: usize = 4;

/// The completion callback registered with [`TOKEN_CALLBACK`].
pub type TokenCallback = Arc<dyn Fn(&ScsiCore, &Arc<Token>) + Send + Sync>;

/// A frame's completion function, invoked exactly once per push.
pub type FrameFn = fn(&ScsiCore, &Arc<Token>, FramePayload);

/// Discriminated payload carried by a callback frame.
pub enum FramePayload {
    /// Split-join bookkeeping for a decomposed command.
    Split(SplitJoin),
}

pub(crate) struct CallbackFrame {
    saved_callback: Option<TokenCallback>,
    func: FrameFn,
    payload: FramePayload,
}

pub(crate) struct TokenInner {
    pub flags: u32,
    pub result: ScsiResult,
    pub callback: Option<TokenCallback>,
    pub frames: SmallVec<[CallbackFrame; MAX_CALLBACK_FRAMES]>,
    pub cmd: Option<Box<Command>>,
    pub issue_time: Option<Instant>,
    /// Bounce pages owned by this (child) token, returned to the pool at
    /// join time.
    pub bounces: Vec<crate::split::BounceMap>,
}

pub struct Token {
    pub world: WorldId,
    pub origin_handle: u32,
    pub origin_sn: u32,
    pub alloc_time: Instant,
    /// Set on the tokens of physical sub-commands; points at the logical
    /// command's token.
    pub(crate) parent: Option<Arc<Token>>,
    pub(crate) inner: Mutex<TokenInner>,
    cv: Condvar,
}

impl Token {
    pub fn new(flags: u32, world: WorldId, origin_handle: u32, origin_sn: u32) -> Arc<Token> {
        Arc::new(Token {
            world,
            origin_handle,
            origin_sn,
            alloc_time: Instant::now(),
            parent: None,
            inner: Mutex::new(TokenInner {
                flags,
                result: ScsiResult::default(),
                callback: None,
                frames: SmallVec::new(),
                cmd: None,
                issue_time: None,
                bounces: Vec::new(),
            }),
            cv: Condvar::new(),
        })
    }

    /// A token for one physical sub-command of a split parent.
    pub(crate) fn new_child(parent: &Arc<Token>) -> Arc<Token> {
        Arc::new(Token {
            world: parent.world,
            origin_handle: parent.origin_handle,
            origin_sn: parent.origin_sn,
            alloc_time: Instant::now(),
            parent: Some(parent.clone()),
            inner: Mutex::new(TokenInner {
                flags: 0,
                result: ScsiResult::default(),
                callback: None,
                frames: SmallVec::new(),
                cmd: None,
                issue_time: None,
                bounces: Vec::new(),
            }),
            cv: Condvar::new(),
        })
    }

    pub fn flags(&self) -> u32 {
        self.inner.lock().flags
    }

    pub fn set_flags(&self, bits: u32) {
        self.inner.lock().flags |= bits;
    }

    /// Registers the completion callback and marks the token for callback
    /// delivery.
    pub fn set_callback(&self, callback: TokenCallback) {
        let mut inner = self.inner.lock();
        inner.callback = Some(callback);
        inner.flags |= TOKEN_CALLBACK;
    }

    /// Announces that the caller is about to park on [`Token::wait`].
    pub fn prepare_to_wait(&self) {
        self.inner.lock().flags |= TOKEN_WAITER;
    }

    /// Parks until another party calls [`Token::wake`].
    pub fn wait(&self) {
        let mut inner = self.inner.lock();
        while inner.flags & TOKEN_WAITER != 0 {
            inner = self.cv.wait(inner);
        }
    }

    /// Releases a parked waiter.
    pub fn wake(&self) {
        let mut inner = self.inner.lock();
        inner.flags &= !TOKEN_WAITER;
        drop(inner);
        self.cv.notify_all();
    }

    /// Parks until the command completes or is marked timed out.
    pub fn wait_for_io(&self) {
        let mut inner = self.inner.lock();
        while inner.flags & (TOKEN_IO_DONE | TOKEN_IO_TIMEDOUT) == 0 {
            inner = self.cv.wait(inner);
        }
    }

    /// Parks like [`Token::wait_for_io`] but arms a timer; if it fires first
    /// the token is marked timed out and true is returned.
    pub fn wait_for_io_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.flags & TOKEN_IO_DONE != 0 {
                return false;
            }
            if inner.flags & TOKEN_IO_TIMEDOUT != 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                inner.flags |= TOKEN_IO_TIMEDOUT;
                return true;
            }
            let (guard, _) = self.cv.wait_timeout(inner, deadline - now);
            inner = guard;
        }
    }

    /// Marks the command done and wakes any waiter. Monotonic; a duplicate
    /// call is not an error.
    pub fn io_done(&self) {
        let mut inner = self.inner.lock();
        inner.flags |= TOKEN_IO_DONE;
        inner.flags &= !TOKEN_WAITER;
        drop(inner);
        self.cv.notify_all();
    }

    /// Marks the command timed out and wakes any waiter.
    pub fn io_timed_out(&self) {
        let mut inner = self.inner.lock();
        inner.flags |= TOKEN_IO_TIMEDOUT;
        drop(inner);
        self.cv.notify_all();
    }

    pub fn result(&self) -> ScsiResult {
        self.inner.lock().result
    }

    pub(crate) fn store_result(&self, result: ScsiResult) {
        self.inner.lock().result = result;
    }

    pub(crate) fn set_cmd(&self, cmd: Box<Command>) {
        self.inner.lock().cmd = Some(cmd);
    }

    pub(crate) fn cmd_clone(&self) -> Option<Box<Command>> {
        self.inner.lock().cmd.clone()
    }

    pub(crate) fn mark_issued(&self) {
        self.inner.lock().issue_time = Some(Instant::now());
    }

    pub(crate) fn issue_latency(&self) -> Duration {
        let inner = self.inner.lock();
        inner
            .issue_time
            .map(|t| t.elapsed())
            .unwrap_or_else(|| self.alloc_time.elapsed())
    }

    /// Pushes a callback frame, saving the currently registered callback so
    /// the pop can restore it.
    ///
    /// # Panics
    ///
    /// Panics if the bounded frame stack is full.
    pub fn push_callback_frame(&self, func: FrameFn, payload: FramePayload) {
        let mut inner = self.inner.lock();
        assert!(
            inner.frames.len() < MAX_CALLBACK_FRAMES,
            "callback frame stack overflow"
        );
        let saved_callback = inner.callback.take();
        inner.frames.push(CallbackFrame {
            saved_callback,
            func,
            payload,
        });
    }

    /// Pops the top callback frame, restores the saved callback, and invokes
    /// the frame's function with its payload.
    ///
    /// # Panics
    ///
    /// Panics if no frame is on the stack; a pop without a matching push is a
    /// programming error in the popping layer.
    pub fn pop_callback_frame(self: &Arc<Self>, core: &ScsiCore) {
        let (func, payload) = {
            let mut inner = self.inner.lock();
            let frame = inner
                .frames
                .pop()
                .expect("callback frame pop on empty stack");
            inner.callback = frame.saved_callback;
            (frame.func, frame.payload)
        };
        func(core, self, payload);
    }

    /// Runs `f` on the payload of the topmost frame.
    ///
    /// # Panics
    ///
    /// Panics if no frame is on the stack.
    pub(crate) fn with_top_frame<R>(&self, f: impl FnOnce(&mut FramePayload) -> R) -> R {
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .last_mut()
            .expect("no callback frame on the stack");
        f(&mut frame.payload)
    }

    pub(crate) fn has_frames(&self) -> bool {
        !self.inner.lock().frames.is_empty()
    }

    pub(crate) fn take_callback(&self) -> Option<TokenCallback> {
        self.inner.lock().callback.clone()
    }

    /// Drops the owned command copy; called when the token's last pipeline
    /// reference goes away.
    pub(crate) fn drop_cmd(&self) {
        self.inner.lock().cmd = None;
    }

    pub(crate) fn set_bounces(&self, bounces: Vec<crate::split::BounceMap>) {
        self.inner.lock().bounces = bounces;
    }

    pub(crate) fn take_bounces(&self) -> Vec<crate::split::BounceMap> {
        std::mem::take(&mut self.inner.lock().bounces)
    }
}
