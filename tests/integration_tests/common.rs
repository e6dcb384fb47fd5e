// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use verbs_rpc_rs::{
    cfg::config::RpcConfig,
    engine::{client::RpcClient, mux::HandlerMux, server::RpcServer},
    verbs::loopback::{self, LoopbackQp},
};

pub fn test_path() -> String {
    std::env::var("TEST_CONFIG").unwrap_or_else(|_| "tests/config.yaml".into())
}

pub fn rpc_config(max_inflight: u32) -> RpcConfig {
    let mut cfg = RpcConfig {
        max_inflight,
        ..RpcConfig::default()
    };
    cfg.normalize();
    cfg
}

pub struct ServerHandle {
    pub server: Arc<RpcServer<LoopbackQp>>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn stop(self) {
        self.server.shutdown();
        let _ = self.task.await;
    }
}

/// Loopback pair with the server fleet already running.
pub async fn start_pair(
    client_cfg: RpcConfig,
    server_cfg: RpcConfig,
    thread_count: u32,
    mux: HandlerMux,
) -> Result<(Arc<RpcClient<LoopbackQp>>, ServerHandle)> {
    let (client_qp, server_qp) = loopback::pair();

    let client = Arc::new(RpcClient::new(Arc::new(client_qp), client_cfg)?);
    let server = Arc::new(RpcServer::new(
        Arc::new(server_qp),
        mux,
        server_cfg,
        thread_count,
    )?);

    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    Ok((client, ServerHandle { server, task }))
}

/// fn_id=1 handler that copies the request into the response verbatim.
pub fn echo_mux() -> HandlerMux {
    let mut mux = HandlerMux::new();
    mux.register_handler(1, |req, resp| {
        resp[..req.len()].copy_from_slice(req);
        req.len()
    });
    mux
}
