// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use thiserror::Error;

/// Failure of the transport underneath the engine (SEND/RECV completion
/// errors, torn-down queue pairs).
///
/// Cloneable so that one connection-level failure can be reported to every
/// outstanding caller.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// A work request completed with an error status.
    #[error("work request failed: {0}")]
    WorkRequest(Arc<str>),

    /// The queue pair (or its in-process stand-in) is no longer usable.
    #[error("connection closed")]
    ConnectionClosed,
}

impl TransportError {
    pub fn work_request(msg: impl Into<String>) -> Self {
        Self::WorkRequest(Arc::from(msg.into()))
    }
}

/// Peer behavior that violates the wire protocol.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// `req_id`'s low 32 bits name a slot outside `[0, max_inflight)`.
    #[error("slot index {slot_idx} out of range (max_inflight={max_inflight})")]
    SlotOutOfRange { slot_idx: u32, max_inflight: u32 },

    /// A reply carried a `req_id` the slot no longer expects.
    #[error("stale req_id: expected {expected:#x}, got {got:#x}")]
    StaleReqId { expected: u64, got: u64 },

    /// The header claims more payload than the completion delivered.
    #[error("payload_len {payload_len} exceeds received {nbytes} bytes")]
    TruncatedPayload { payload_len: u32, nbytes: usize },
}

/// Per-call and per-connection failures surfaced by the engine.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Request precondition violated; no slot was reserved and nothing was
    /// posted.
    #[error("request payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
