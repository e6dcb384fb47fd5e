// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, thread};

use anyhow::{Context as _, Result};
use tokio::{sync::oneshot, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::RpcConfig,
    engine::{mux::HandlerMux, pool::PinnedPool},
    error::ProtocolError,
    verbs::{ProtectionDomain, QueuePair},
    wire::{HEADER_LEN, RpcHeader},
};

type RegionOf<Q> = <<Q as QueuePair>::Pd as ProtectionDomain>::Region;

/// Server half of one RPC connection.
///
/// `max_inflight` workers each own a `(recv, send)` cell pair: post a RECV,
/// hand the frame to the compute pool for dispatch, post the reply SEND,
/// loop. Handlers therefore never run on the I/O tasks.
pub struct RpcServer<Q: QueuePair> {
    shared: Arc<ServerShared<Q>>,
}

struct ServerShared<Q: QueuePair> {
    cfg: RpcConfig,
    qp: Arc<Q>,
    mux: HandlerMux,
    /// Request cells; sized for `max_req_payload`.
    recv_pool: PinnedPool<RegionOf<Q>>,
    /// Response cells; sized for `max_resp_payload`.
    send_pool: PinnedPool<RegionOf<Q>>,
    compute: ComputePool<Q>,
    cancel: CancellationToken,
}

impl<Q: QueuePair> RpcServer<Q> {
    /// Build the server over an established queue pair. The mux is frozen
    /// from here on; register every handler first.
    pub fn new(
        qp: Arc<Q>,
        mux: HandlerMux,
        cfg: RpcConfig,
        thread_count: u32,
    ) -> Result<Self> {
        cfg.validate().context("server: invalid rpc config")?;
        anyhow::ensure!(thread_count >= 1, "server: thread_count must be >= 1");

        let recv_cell = cfg.req_cell_size();
        let send_cell = cfg.resp_cell_size();
        let recv_pool = PinnedPool::new(qp.pd(), cfg.max_inflight, recv_cell)
            .context("server: registering recv pool")?;
        let send_pool = PinnedPool::new(qp.pd(), cfg.max_inflight, send_cell)
            .context("server: registering send pool")?;

        let shared = Arc::new(ServerShared {
            compute: ComputePool::start(thread_count)
                .context("server: starting compute pool")?,
            recv_pool,
            send_pool,
            qp,
            mux,
            cancel: CancellationToken::new(),
            cfg,
        });

        info!(
            "server: initialized with {} slots, thread_count={thread_count}",
            shared.cfg.max_inflight
        );
        Ok(Self { shared })
    }

    /// Run the worker fleet until the connection dies or `shutdown` is
    /// called. Completes once every worker has exited.
    pub async fn run(&self) {
        let mut workers = JoinSet::new();
        for idx in 0..self.shared.cfg.max_inflight {
            workers.spawn(server_worker(Arc::clone(&self.shared), idx));
        }
        while workers.join_next().await.is_some() {}
        debug!("server: all workers exited");
    }

    /// Stop the worker fleet; `run` returns once the workers drain.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

/// One I/O worker bound to cell pair `idx`.
async fn server_worker<Q: QueuePair>(shared: Arc<ServerShared<Q>>, idx: u32) {
    loop {
        let recv_view = shared.recv_pool.cell(idx);
        let completion = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            completion = shared.qp.post_recv(recv_view) => completion,
        };

        let nbytes = match completion {
            Ok(c) => c.nbytes,
            Err(err) => {
                if !shared.cancel.is_cancelled() {
                    warn!("server: worker[{idx}] transport error: {err}");
                    shared.cancel.cancel();
                }
                break;
            },
        };

        if nbytes < HEADER_LEN {
            warn!("server: received too small packet: {nbytes}");
            continue;
        }

        // Move parsing and handler work off this I/O task.
        let (done_tx, done_rx) = oneshot::channel();
        let job = DispatchJob {
            shared: Arc::clone(&shared),
            idx,
            nbytes,
            done: done_tx,
        };
        if !shared.compute.submit(job) {
            warn!("server: compute pool gone, worker[{idx}] exiting");
            break;
        }
        let resp_len = match done_rx.await {
            Ok(Some(total)) => total,
            // Fatal frame (or a dying pool thread); the token is already
            // cancelled.
            Ok(None) | Err(_) => break,
        };

        let send_view = shared.send_pool.view(idx, resp_len);
        if let Err(err) = shared.qp.post_send(send_view).await {
            error!("server: send reply failed: {err}");
            shared.cancel.cancel();
            break;
        }
    }
}

/// Parse + dispatch unit handed to the compute pool. Plain struct, so the
/// per-request hot path queues no allocations of its own.
struct DispatchJob<Q: QueuePair> {
    shared: Arc<ServerShared<Q>>,
    idx: u32,
    nbytes: usize,
    /// Total reply length (header + payload), or `None` on a fatal frame.
    done: oneshot::Sender<Option<usize>>,
}

impl<Q: QueuePair> DispatchJob<Q> {
    fn run(self) {
        let Self {
            shared,
            idx,
            nbytes,
            done,
        } = self;

        let recv_view = shared.recv_pool.cell(idx);
        let send_view = shared.send_pool.cell(idx);
        // SAFETY: the owning worker is suspended on `done`; both cells of
        // pair `idx` are exclusively ours until then.
        let frame = unsafe { &recv_view.as_slice()[..nbytes] };
        let send_cell = unsafe { send_view.as_mut_slice() };

        let Some(header) = RpcHeader::read_from_cell(frame) else {
            shared.cancel.cancel();
            let _ = done.send(None);
            return;
        };

        let payload_len = header.payload_len.get() as usize;
        if HEADER_LEN + payload_len > nbytes {
            let err = ProtocolError::TruncatedPayload {
                payload_len: header.payload_len.get(),
                nbytes,
            };
            error!(req_id = header.req_id.get(), fn_id = header.fn_id.get(), "server: {err}");
            shared.cancel.cancel();
            let _ = done.send(None);
            return;
        }

        let req_payload = &frame[HEADER_LEN..HEADER_LEN + payload_len];
        let (resp_header, resp_payload) = send_cell.split_at_mut(HEADER_LEN);
        let resp_len = shared
            .mux
            .dispatch(header.fn_id.get(), req_payload, resp_payload);

        RpcHeader::new(header.req_id.get(), resp_len as u32, header.fn_id.get())
            .write_to_cell(resp_header);

        let _ = done.send(Some(HEADER_LEN + resp_len));
    }
}

/// Fixed fleet of OS threads draining dispatch jobs from one MPMC channel.
struct ComputePool<Q: QueuePair> {
    tx: Option<flume::Sender<DispatchJob<Q>>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl<Q: QueuePair> ComputePool<Q> {
    fn start(thread_count: u32) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<DispatchJob<Q>>();

        let mut threads = Vec::with_capacity(thread_count as usize);
        for i in 0..thread_count {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("rpc-compute-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job.run();
                    }
                })
                .with_context(|| format!("spawning compute thread {i}"))?;
            threads.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            threads,
        })
    }

    /// Queue a job; `false` when the pool has already shut down.
    fn submit(&self, job: DispatchJob<Q>) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(job).is_ok())
    }
}

impl<Q: QueuePair> Drop for ComputePool<Q> {
    fn drop(&mut self) {
        // Closing the channel lets every pool thread fall out of recv().
        self.tx.take();
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            // A pool thread can run this drop when a queued job held the
            // last reference; it must not join itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}
