// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64,
};

/// Size of the fixed wire header that prefixes every message.
pub const HEADER_LEN: usize = size_of::<RpcHeader>();

/// Fixed 16-byte header, little-endian on the wire.
///
/// `req_id` packs a per-connection monotonic sequence in its high 32 bits and
/// the sender's slot index in its low 32 bits. Responses echo `req_id`
/// verbatim; `fn_id` is meaningful only in requests.
#[repr(C)]
#[derive(
    Debug, Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct RpcHeader {
    pub req_id: U64<LittleEndian>,      // 0..8
    pub payload_len: U32<LittleEndian>, // 8..12
    pub fn_id: U32<LittleEndian>,       // 12..16
}

impl RpcHeader {
    pub fn new(req_id: u64, payload_len: u32, fn_id: u32) -> Self {
        Self {
            req_id: U64::new(req_id),
            payload_len: U32::new(payload_len),
            fn_id: U32::new(fn_id),
        }
    }

    /// Serialize the header into the first [`HEADER_LEN`] bytes of `cell`.
    ///
    /// Every pool cell is at least [`HEADER_LEN`] bytes by construction.
    #[inline]
    pub fn write_to_cell(&self, cell: &mut [u8]) {
        cell[..HEADER_LEN].copy_from_slice(self.as_bytes());
    }

    /// Parse a header from the first [`HEADER_LEN`] bytes of `frame`.
    #[inline]
    pub fn read_from_cell(frame: &[u8]) -> Option<Self> {
        Self::read_from_prefix(frame).ok().map(|(hdr, _)| hdr)
    }
}

/// Compose a request id from a sequence number and the slot it occupies.
#[inline]
pub fn make_req_id(seq: u64, slot_idx: u32) -> u64 {
    (seq << 32) | u64::from(slot_idx)
}

/// Slot index embedded in a request id (low 32 bits).
#[inline]
pub fn slot_of_req_id(req_id: u64) -> u32 {
    (req_id & 0xFFFF_FFFF) as u32
}

/// Sequence number embedded in a request id (high 32 bits).
#[inline]
pub fn seq_of_req_id(req_id: u64) -> u32 {
    (req_id >> 32) as u32
}
