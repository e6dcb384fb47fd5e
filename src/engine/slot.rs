// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::UnsafeCell,
    future::Future,
    pin::Pin,
    ptr,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    task::{Context, Poll},
};

use futures::task::AtomicWaker;
use once_cell::sync::OnceCell;

use crate::error::RpcError;

/// Per-index correlation record on the client.
///
/// Ownership protocol: the submitter owns the slot from ring acquisition
/// until the demux completes it; completion hands ownership back to the
/// submitter for release. Two atomic edges order everything else:
///
/// - `expected_req_id` is release-stored by [`arm`](Slot::arm) after the
///   destination fields are written; the demux's acquire-load therefore sees
///   a consistent destination whenever the id matches.
/// - `completed` is release-stored by [`fulfill`](Slot::fulfill) after the
///   payload and `actual_len` are written; the caller's acquire-load in
///   [`ReplyWait`] sees both before returning.
pub(crate) struct Slot {
    /// Request id this slot is armed for; 0 means free.
    expected_req_id: AtomicU64,
    completed: AtomicBool,
    waiter: AtomicWaker,
    dest: UnsafeCell<RespDest>,
}

struct RespDest {
    ptr: *mut u8,
    cap: usize,
    actual_len: usize,
}

// SAFETY: `dest` is written by the submitter before the release-store of
// `expected_req_id`, by the demux before the release-store of `completed`,
// and read by the caller after the matching acquire-loads; no unordered
// access exists.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Default for Slot {
    fn default() -> Self {
        Self {
            expected_req_id: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            waiter: AtomicWaker::new(),
            dest: UnsafeCell::new(RespDest {
                ptr: ptr::null_mut(),
                cap: 0,
                actual_len: 0,
            }),
        }
    }
}

impl Slot {
    /// Bind the slot to an outstanding request. Caller must hold the slot
    /// index exclusively (freshly popped from the free ring).
    pub fn arm(&self, req_id: u64, resp: &mut [u8]) {
        self.waiter.take();
        self.completed.store(false, Ordering::Relaxed);
        // SAFETY: exclusive slot ownership; no demux access before the
        // release-store below publishes the id.
        unsafe {
            *self.dest.get() = RespDest {
                ptr: resp.as_mut_ptr(),
                cap: resp.len(),
                actual_len: 0,
            };
        }
        self.expected_req_id.store(req_id, Ordering::Release);
    }

    /// Request id the slot currently expects (0 when free).
    pub fn expected(&self) -> u64 {
        self.expected_req_id.load(Ordering::Acquire)
    }

    /// Deliver a reply: copy as much payload as the destination holds,
    /// record the copied length, and resume the waiter exactly once.
    pub fn fulfill(&self, payload: &[u8]) {
        // SAFETY: the acquire-load of `expected_req_id` that led here pairs
        // with `arm`'s release-store, so `dest` is visible and the caller is
        // suspended, leaving us sole access to its buffer.
        unsafe {
            let dest = &mut *self.dest.get();
            let n = payload.len().min(dest.cap);
            ptr::copy_nonoverlapping(payload.as_ptr(), dest.ptr, n);
            dest.actual_len = n;
        }
        self.completed.store(true, Ordering::Release);
        self.waiter.wake();
    }

    /// Mark the slot free again. Only the submitter calls this, after the
    /// reply (or failure) has been observed.
    pub fn disarm(&self) {
        self.expected_req_id.store(0, Ordering::Release);
    }

    /// Wake the waiter without completing the slot; used when the
    /// connection poisons so suspended callers re-poll and observe it.
    pub fn interrupt(&self) {
        self.waiter.wake();
    }

    fn actual_len(&self) -> usize {
        // SAFETY: called only after an acquire-load of `completed` observed
        // `fulfill`'s release-store.
        unsafe { (*self.dest.get()).actual_len }
    }
}

/// Caller-side suspension point: resolves when the demux fulfills the slot
/// or the connection records a fatal failure.
pub(crate) struct ReplyWait<'a> {
    slot: &'a Slot,
    failure: &'a OnceCell<RpcError>,
}

impl<'a> ReplyWait<'a> {
    pub fn new(slot: &'a Slot, failure: &'a OnceCell<RpcError>) -> Self {
        Self { slot, failure }
    }
}

impl Future for ReplyWait<'_> {
    type Output = Result<usize, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let slot = self.slot;
        if slot.completed.load(Ordering::Acquire) {
            return Poll::Ready(Ok(slot.actual_len()));
        }

        slot.waiter.register(cx.waker());

        // Re-check after registration: the demux may have completed between
        // the first load and the register.
        if slot.completed.load(Ordering::Acquire) {
            return Poll::Ready(Ok(slot.actual_len()));
        }
        if let Some(err) = self.failure.get() {
            return Poll::Ready(Err(err.clone()));
        }
        Poll::Pending
    }
}
