// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Context as _, Result};
use crossbeam_utils::Backoff;
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::RpcConfig,
    engine::{
        pool::PinnedPool,
        ring::SlotRing,
        slot::{ReplyWait, Slot},
    },
    error::{ProtocolError, RpcError, TransportError},
    verbs::{ProtectionDomain, QueuePair},
    wire::{self, HEADER_LEN, RpcHeader},
};

type RegionOf<Q> = <<Q as QueuePair>::Pd as ProtectionDomain>::Region;

/// Client half of one RPC connection.
///
/// Owns the two pinned pools, the slot table and the free ring; spawns one
/// receive worker per slot at construction (must therefore be created inside
/// a Tokio runtime). `call` is the submit path; any number of tasks and
/// threads may share one client.
pub struct RpcClient<Q: QueuePair> {
    shared: Arc<ClientShared<Q>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct ClientShared<Q: QueuePair> {
    cfg: RpcConfig,
    qp: Arc<Q>,
    send_pool: PinnedPool<RegionOf<Q>>,
    recv_pool: PinnedPool<RegionOf<Q>>,
    slots: Box<[Slot]>,
    free: SlotRing,
    /// High half of every `req_id`; starts at 1 so id 0 never leaves the
    /// host and stays usable as the slot-free sentinel.
    seq: AtomicU64,
    /// First fatal connection error; everything after it fails fast.
    failure: OnceCell<RpcError>,
    cancel: CancellationToken,
}

impl<Q: QueuePair> RpcClient<Q> {
    pub fn new(qp: Arc<Q>, cfg: RpcConfig) -> Result<Self> {
        cfg.validate().context("client: invalid rpc config")?;

        let send_cell = cfg.req_cell_size();
        let recv_cell = cfg.resp_cell_size();
        let send_pool = PinnedPool::new(qp.pd(), cfg.max_inflight, send_cell)
            .context("client: registering send pool")?;
        let recv_pool = PinnedPool::new(qp.pd(), cfg.max_inflight, recv_cell)
            .context("client: registering recv pool")?;

        let slots = (0..cfg.max_inflight)
            .map(|_| Slot::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(ClientShared {
            free: SlotRing::with_indices(cfg.max_inflight),
            slots,
            send_pool,
            recv_pool,
            qp,
            seq: AtomicU64::new(1),
            failure: OnceCell::new(),
            cancel: CancellationToken::new(),
            cfg,
        });

        let mut workers = Vec::with_capacity(shared.cfg.max_inflight as usize);
        for idx in 0..shared.cfg.max_inflight {
            workers.push(tokio::spawn(recv_worker(Arc::clone(&shared), idx)));
        }

        info!(
            "client: initialized with {} slots, send_cell={send_cell}, recv_cell={recv_cell}",
            shared.cfg.max_inflight
        );

        Ok(Self {
            shared,
            workers: tokio::sync::Mutex::new(workers),
        })
    }

    /// Issue one call: reserve a slot, frame the request into the slot's
    /// send cell, post the SEND and suspend until the demux delivers the
    /// correlated reply into `resp`.
    ///
    /// Returns the number of response bytes copied; replies longer than
    /// `resp` are truncated to its length.
    pub async fn call(
        &self,
        fn_id: u32,
        req: &[u8],
        resp: &mut [u8],
    ) -> Result<usize, RpcError> {
        let shared = &*self.shared;
        if req.len() > shared.cfg.max_req_payload {
            return Err(RpcError::PayloadTooLarge {
                len: req.len(),
                max: shared.cfg.max_req_payload,
            });
        }
        if let Some(err) = shared.failure.get() {
            return Err(err.clone());
        }

        let slot_idx = shared.acquire_slot().await?;
        let result = shared.submit(slot_idx, fn_id, req, resp).await;

        shared.slots[slot_idx as usize].disarm();
        shared.release_slot(slot_idx);
        result
    }

    /// Free-ring population; equals `max_inflight` when no call is
    /// outstanding. Diagnostic only.
    pub fn idle_slots(&self) -> usize {
        self.shared.free.len()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.shared.cfg
    }

    /// Tear the connection down: fail outstanding and future calls, stop
    /// every receive worker and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shared
            .poison(RpcError::from(TransportError::ConnectionClosed));
        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
        debug!("client: all recv workers joined");
    }
}

impl<Q: QueuePair> Drop for RpcClient<Q> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<Q: QueuePair> ClientShared<Q> {
    /// Busy-wait for a free slot with a CPU relax hint, yielding to the
    /// scheduler when the backoff saturates so completions keep draining.
    /// Bounded inflight guarantees progress while the peer replies.
    async fn acquire_slot(&self) -> Result<u32, RpcError> {
        let backoff = Backoff::new();
        loop {
            if let Some(idx) = self.free.try_pop() {
                return Ok(idx);
            }
            if let Some(err) = self.failure.get() {
                return Err(err.clone());
            }
            if backoff.is_completed() {
                tokio::task::yield_now().await;
            } else {
                backoff.spin();
            }
        }
    }

    fn release_slot(&self, idx: u32) {
        if !self.free.push(idx) {
            // Unreachable for a balanced acquire/release stream; the ring
            // holds twice max_inflight.
            error!("client: free ring rejected slot {idx}");
        }
    }

    async fn submit(
        &self,
        slot_idx: u32,
        fn_id: u32,
        req: &[u8],
        resp: &mut [u8],
    ) -> Result<usize, RpcError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let req_id = wire::make_req_id(seq, slot_idx);

        let slot = &self.slots[slot_idx as usize];
        slot.arm(req_id, resp);

        let view = self.send_pool.view(slot_idx, HEADER_LEN + req.len());
        // SAFETY: holding the slot index makes this cell exclusively ours
        // until release.
        let cell = unsafe { view.as_mut_slice() };
        RpcHeader::new(req_id, req.len() as u32, fn_id).write_to_cell(cell);
        cell[HEADER_LEN..HEADER_LEN + req.len()].copy_from_slice(req);

        if let Err(err) = self.qp.post_send(view).await {
            error!("client: post_send failed: {err}");
            let err = RpcError::from(err);
            self.poison(err.clone());
            return Err(err);
        }

        ReplyWait::new(slot, &self.failure).await
    }

    /// Record the first fatal error, stop the workers and resume every
    /// suspended caller so it observes the failure.
    fn poison(&self, err: RpcError) {
        let _ = self.failure.set(err);
        self.cancel.cancel();
        for slot in &self.slots {
            slot.interrupt();
        }
    }
}

/// One standing RECV per receive cell. The cell address never changes, so
/// the NIC can scatter into all cells concurrently and no queue sits between
/// completion and caller resumption.
async fn recv_worker<Q: QueuePair>(shared: Arc<ClientShared<Q>>, idx: u32) {
    debug!("client: recv worker[{idx}] started");
    loop {
        let view = shared.recv_pool.cell(idx);
        let completion = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            completion = shared.qp.post_recv(view) => completion,
        };

        let nbytes = match completion {
            Ok(c) => c.nbytes,
            Err(err) => {
                if !shared.cancel.is_cancelled() {
                    warn!("client: recv worker[{idx}] transport error: {err}");
                    shared.poison(RpcError::from(err));
                }
                break;
            },
        };

        if nbytes < HEADER_LEN {
            warn!("client: received too small packet: {nbytes}");
            continue;
        }

        // SAFETY: the RECV completion transferred this cell back to us; no
        // other task touches cell `idx` until the next post_recv.
        let frame = unsafe { &view.as_slice()[..nbytes] };
        let Some(header) = RpcHeader::read_from_cell(frame) else {
            continue;
        };

        let recv_id = header.req_id.get();
        let payload_len = header.payload_len.get() as usize;
        if HEADER_LEN + payload_len > nbytes {
            let err = ProtocolError::TruncatedPayload {
                payload_len: header.payload_len.get(),
                nbytes,
            };
            error!(req_id = recv_id, "client: {err}");
            shared.poison(RpcError::from(err));
            break;
        }

        let slot_idx = wire::slot_of_req_id(recv_id);
        if slot_idx >= shared.cfg.max_inflight {
            // Peer bug; drop the frame and keep the connection up.
            let err = ProtocolError::SlotOutOfRange {
                slot_idx,
                max_inflight: shared.cfg.max_inflight,
            };
            error!(req_id = recv_id, slot_idx, "client: {err}");
            continue;
        }

        let slot = &shared.slots[slot_idx as usize];
        let expected = slot.expected();
        if expected != recv_id {
            // The slot-reuse rule makes this a peer protocol violation, not
            // a benign race.
            let err = ProtocolError::StaleReqId {
                expected,
                got: recv_id,
            };
            error!(req_id = recv_id, slot_idx, "client: {err}");
            shared.poison(RpcError::from(err));
            break;
        }

        slot.fulfill(&frame[HEADER_LEN..HEADER_LEN + payload_len]);
    }
    debug!("client: recv worker[{idx}] exited");
}
