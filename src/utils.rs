// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    future::Future,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use crossbeam_utils::Backoff;
use futures::task::{ArcWake, waker};

/// Wake flag shared between the polling loop and whatever thread completes
/// the awaited work.
struct SpinSignal {
    fired: AtomicBool,
}

impl ArcWake for SpinSignal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.fired.store(true, Ordering::Release);
    }
}

/// Drive a future to completion on the calling thread.
///
/// The future is polled only after its waker fires; between wakes the thread
/// relaxes the CPU instead of parking. This is the synchronous façade over
/// the cooperative engine and the only supported way to issue a call from a
/// thread that is not itself a task. The first poll happens immediately.
pub fn spin_wait<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);

    let signal = Arc::new(SpinSignal {
        fired: AtomicBool::new(true),
    });
    let waker = waker(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    let backoff = Backoff::new();
    loop {
        if signal.fired.swap(false, Ordering::Acquire) {
            if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return out;
            }
            backoff.reset();
        } else {
            backoff.snooze();
        }
    }
}
