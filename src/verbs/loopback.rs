// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process queue-pair provider.
//!
//! Models the two-sided contract of a reliable-connected QP closely enough
//! for the engine not to know the difference: a SEND consumes the oldest
//! posted RECV of the peer, completions report delivered byte counts, an
//! oversized SEND breaks the queue pair, and `close()` fails everything
//! still outstanding. Tests and examples run the whole RPC stack over this
//! provider.

use std::{
    ptr::NonNull,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use rand::RngExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    conn::endpoint::QpEndpoint,
    error::TransportError,
    verbs::{
        BootstrapQp, MemoryRegion, MrView, ProtectionDomain, QueuePair, RecvCompletion,
    },
};

static NEXT_QP_NUM: AtomicU32 = AtomicU32::new(1);

/// Protection domain stand-in; registration just records the range.
#[derive(Debug, Default, Clone)]
pub struct LoopbackPd;

#[derive(Debug)]
pub struct LoopbackMr {
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is a passive (addr, len) record; the registrant owns
// the memory and guarantees its stability per `register_memory`'s contract.
unsafe impl Send for LoopbackMr {}
unsafe impl Sync for LoopbackMr {}

impl MemoryRegion for LoopbackMr {
    fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl ProtectionDomain for LoopbackPd {
    type Region = LoopbackMr;

    unsafe fn register_memory(
        &self,
        addr: NonNull<u8>,
        len: usize,
    ) -> Result<LoopbackMr, TransportError> {
        Ok(LoopbackMr { addr, len })
    }
}

struct PostedRecv {
    view: MrView,
    done: oneshot::Sender<Result<usize, TransportError>>,
}

/// One direction of the pair: receives posted on this side, consumed by the
/// peer's sends in FIFO order.
struct Direction {
    posted_tx: mpsc::UnboundedSender<PostedRecv>,
    posted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PostedRecv>>,
}

impl Direction {
    fn new() -> Self {
        let (posted_tx, posted_rx) = mpsc::unbounded_channel();
        Self {
            posted_tx,
            posted_rx: tokio::sync::Mutex::new(posted_rx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QpState {
    Reset,
    ReadyToReceive,
    ReadyToSend,
}

pub struct LoopbackQp {
    pd: LoopbackPd,
    /// RECVs this side posts; the peer's SENDs consume them.
    inbound: Arc<Direction>,
    /// RECVs the peer posted; this side's SENDs consume them.
    outbound: Arc<Direction>,
    /// Shared by both ends; cancelling it breaks the whole queue pair.
    closed: CancellationToken,
    endpoint: QpEndpoint,
    state: Mutex<QpState>,
}

/// Build a connected pair of loopback queue pairs.
pub fn pair() -> (LoopbackQp, LoopbackQp) {
    let a_in = Arc::new(Direction::new());
    let b_in = Arc::new(Direction::new());
    let closed = CancellationToken::new();

    let a = LoopbackQp::new(Arc::clone(&a_in), Arc::clone(&b_in), closed.clone());
    let b = LoopbackQp::new(b_in, a_in, closed);
    (a, b)
}

impl LoopbackQp {
    fn new(
        inbound: Arc<Direction>,
        outbound: Arc<Direction>,
        closed: CancellationToken,
    ) -> Self {
        let mut gid = [0u8; 16];
        rand::rng().fill(&mut gid[2..]);
        gid[0] = 0xFE;
        gid[1] = 0x80;

        let endpoint = QpEndpoint::new(
            0,
            NEXT_QP_NUM.fetch_add(1, Ordering::Relaxed),
            rand::rng().random::<u32>() & 0x00FF_FFFF,
            gid,
        );

        Self {
            pd: LoopbackPd,
            inbound,
            outbound,
            closed,
            endpoint,
            state: Mutex::new(QpState::Reset),
        }
    }

    /// Tear down both directions; outstanding verbs fail with
    /// [`TransportError::ConnectionClosed`].
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn qp_num(&self) -> u32 {
        self.endpoint.qp_num.get()
    }

    fn break_pair(&self) {
        self.closed.cancel();
    }
}

impl QueuePair for LoopbackQp {
    type Pd = LoopbackPd;

    fn pd(&self) -> &LoopbackPd {
        &self.pd
    }

    async fn post_send(&self, view: MrView) -> Result<(), TransportError> {
        let slot = {
            let mut posted = tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::ConnectionClosed),
                guard = self.outbound.posted_rx.lock() => guard,
            };
            tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::ConnectionClosed),
                head = posted.recv() => head.ok_or(TransportError::ConnectionClosed)?,
            }
        };

        if view.len() > slot.view.len() {
            // A SEND larger than the posted RECV is a fatal QP error on real
            // hardware; mirror that by breaking the pair.
            let err = TransportError::work_request(format!(
                "send of {} bytes exceeds posted recv of {}",
                view.len(),
                slot.view.len()
            ));
            let _ = slot.done.send(Err(err.clone()));
            self.break_pair();
            return Err(err);
        }

        // SAFETY: the sender owns its cell until completion; the posted recv
        // buffer belongs to the peer's still-suspended recv task.
        unsafe {
            slot.view.as_mut_slice()[..view.len()].copy_from_slice(view.as_slice());
        }

        let _ = slot.done.send(Ok(view.len()));
        Ok(())
    }

    async fn post_recv(&self, view: MrView) -> Result<RecvCompletion, TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inbound
            .posted_tx
            .send(PostedRecv {
                view,
                done: done_tx,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;

        let nbytes = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::ConnectionClosed),
            res = done_rx => res.map_err(|_| TransportError::ConnectionClosed)??,
        };

        Ok(RecvCompletion { nbytes, opaque: 0 })
    }
}

impl BootstrapQp for LoopbackQp {
    fn local_endpoint(&self) -> QpEndpoint {
        self.endpoint.clone()
    }

    fn ready_to_receive(&self, remote: &QpEndpoint) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != QpState::Reset {
            return Err(TransportError::work_request(format!(
                "rtr from invalid state {state:?}"
            )));
        }
        debug!(
            "loopback qp {}: rtr against peer qp_num={} gid={}",
            self.endpoint.qp_num.get(),
            remote.qp_num.get(),
            remote.gid_hex()
        );
        *state = QpState::ReadyToReceive;
        Ok(())
    }

    fn ready_to_send(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != QpState::ReadyToReceive {
            return Err(TransportError::work_request(format!(
                "rts from invalid state {state:?}"
            )));
        }
        *state = QpState::ReadyToSend;
        Ok(())
    }
}
