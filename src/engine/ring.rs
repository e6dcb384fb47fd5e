// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

/// Bounded lock-free MPMC queue of free slot indices.
///
/// Each cell carries a sequence stamp; producers claim a cell when its stamp
/// equals the tail position, consumers when it equals position + 1. Capacity
/// is a power of two of at least twice `max_inflight`, so a connection that
/// only ever circulates `max_inflight` indices can never fill the ring.
pub struct SlotRing {
    cells: Box<[RingCell]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

struct RingCell {
    seq: AtomicUsize,
    value: UnsafeCell<u32>,
}

// SAFETY: a cell's value is written only by the producer that claimed its
// sequence stamp and read only by the consumer that observed the bumped
// stamp; the stamp's release/acquire pair orders the accesses.
unsafe impl Send for SlotRing {}
unsafe impl Sync for SlotRing {}

impl SlotRing {
    /// Ring seeded with every index in `[0, max_inflight)` exactly once.
    pub fn with_indices(max_inflight: u32) -> Self {
        let capacity = (max_inflight as usize * 2).next_power_of_two().max(2);
        let cells = (0..capacity)
            .map(|i| RingCell {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let ring = Self {
            cells,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        };
        for idx in 0..max_inflight {
            let ok = ring.push(idx);
            debug_assert!(ok, "seed cannot overflow a 2x ring");
        }
        ring
    }

    /// Enqueue a free index. Returns `false` when the ring is full, which a
    /// correctly balanced acquire/release stream can never produce.
    pub fn push(&self, value: u32) -> bool {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;

            if dif == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS claimed this cell for us alone.
                        unsafe { *cell.value.get() = value };
                        cell.seq.store(pos + 1, Ordering::Release);
                        return true;
                    },
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return false;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue a free index, or `None` when every slot is in flight.
    pub fn try_pop(&self) -> Option<u32> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let dif = seq as isize - (pos + 1) as isize;

            if dif == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS claimed this cell for us alone.
                        let value = unsafe { *cell.value.get() };
                        cell.seq.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    },
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Number of queued indices. Exact only while the ring is quiescent.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
