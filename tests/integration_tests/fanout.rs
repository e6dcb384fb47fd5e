// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use serial_test::serial;
use tokio::task::JoinSet;
use verbs_rpc_rs::{cfg::logger::init_logger, engine::mux::HandlerMux};

use crate::integration_tests::common::{rpc_config, start_pair, test_path};

const NUM_HANDLERS: u32 = 20;
const CALLS_PER_HANDLER: usize = 1000;
const REQUEST_SIZE: usize = 128;

fn response_byte(fn_id: u32) -> u8 {
    0x20 + fn_id as u8
}

fn fanout_mux() -> HandlerMux {
    let mut mux = HandlerMux::new();
    for fn_id in 0..NUM_HANDLERS {
        mux.register_handler(fn_id, move |req, resp| {
            resp[..req.len()].fill(response_byte(fn_id));
            req.len()
        });
    }
    mux
}

/// 20 handlers invoked round-robin, 1000 times each.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn round_robin_over_twenty_handlers() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(512), rpc_config(1024), 4, fanout_mux()).await?;

    let req = vec![0x10u8; REQUEST_SIZE];
    let mut resp = vec![0u8; REQUEST_SIZE];
    for round in 0..CALLS_PER_HANDLER {
        for fn_id in 0..NUM_HANDLERS {
            resp.fill(0);
            let n = client.call(fn_id, &req, &mut resp).await?;
            assert_eq!(n, REQUEST_SIZE, "round {round} fn {fn_id}");
            assert!(
                resp.iter().all(|&b| b == response_byte(fn_id)),
                "round {round} fn {fn_id} data mismatch"
            );
        }
    }

    server.stop().await;
    Ok(())
}

/// Replies arriving in an arbitrary permutation of request order must still
/// correlate: handlers stall for different durations while many calls are
/// in flight.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_order_replies_correlate_correctly() -> Result<()> {
    let _ = init_logger(&test_path());

    let mut mux = HandlerMux::new();
    for fn_id in 0..8u32 {
        mux.register_handler(fn_id, move |req, resp| {
            // Later fn_ids answer sooner; with several compute threads this
            // permutes completion order relative to arrival order.
            std::thread::sleep(Duration::from_millis(u64::from(8 - fn_id)));
            resp[..req.len()].fill(response_byte(fn_id));
            req.len()
        });
    }

    let (client, server) = start_pair(rpc_config(64), rpc_config(64), 4, mux).await?;

    let mut calls = JoinSet::new();
    for i in 0..96u32 {
        let client = Arc::clone(&client);
        calls.spawn(async move {
            let fn_id = i % 8;
            let req = vec![0x10u8; REQUEST_SIZE];
            let mut resp = vec![0u8; REQUEST_SIZE];
            let n = client.call(fn_id, &req, &mut resp).await?;
            anyhow::ensure!(n == REQUEST_SIZE, "length mismatch for call {i}");
            anyhow::ensure!(
                resp.iter().all(|&b| b == response_byte(fn_id)),
                "reply for call {i} correlated to the wrong request"
            );
            Ok(())
        });
    }

    while let Some(joined) = calls.join_next().await {
        joined??;
    }

    assert_eq!(client.idle_slots(), 64);
    server.stop().await;
    Ok(())
}
