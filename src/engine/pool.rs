// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::ptr::NonNull;

use crate::{
    error::TransportError,
    verbs::{MemoryRegion, MrView, ProtectionDomain},
};

/// One direction's pinned buffer arena: a contiguous allocation registered
/// with the device and sliced into `cells` fixed-size cells, addressed by
/// slot index. The arena is never resized or moved after construction.
pub(crate) struct PinnedPool<R: MemoryRegion> {
    /// Backing store. Kept only for ownership; all access goes through
    /// views into `region`.
    _arena: Box<[u8]>,
    region: R,
    cell_size: usize,
    cells: u32,
}

impl<R: MemoryRegion> PinnedPool<R> {
    pub fn new<P>(pd: &P, cells: u32, cell_size: usize) -> Result<Self, TransportError>
    where P: ProtectionDomain<Region = R> {
        let mut arena = vec![0u8; cells as usize * cell_size].into_boxed_slice();
        let addr = NonNull::new(arena.as_mut_ptr())
            .ok_or_else(|| TransportError::work_request("null arena"))?;

        // SAFETY: `arena` is boxed, lives as long as `region` (both owned by
        // self), and its address never changes.
        let region = unsafe { pd.register_memory(addr, arena.len()) }?;

        Ok(Self {
            _arena: arena,
            region,
            cell_size,
            cells,
        })
    }

    /// Full cell `idx`, for posting receives.
    pub fn cell(&self, idx: u32) -> MrView {
        assert!(idx < self.cells, "cell index {idx} out of {}", self.cells);
        self.region
            .view(idx as usize * self.cell_size, self.cell_size)
    }

    /// Prefix of cell `idx`, for posting sends of exactly `len` bytes.
    pub fn view(&self, idx: u32, len: usize) -> MrView {
        assert!(idx < self.cells, "cell index {idx} out of {}", self.cells);
        assert!(
            len <= self.cell_size,
            "view {len} exceeds cell {}",
            self.cell_size
        );
        self.region.view(idx as usize * self.cell_size, len)
    }
}
