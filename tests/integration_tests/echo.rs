// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use verbs_rpc_rs::{cfg::logger::init_logger, engine::mux::HandlerMux, error::RpcError};

use crate::integration_tests::common::{echo_mux, rpc_config, start_pair, test_path};

const RESPONSE_SIZE: usize = 4096;

fn fixed_response_mux() -> HandlerMux {
    let mut mux = HandlerMux::new();
    mux.register_handler(1, |_req, resp| {
        resp[..RESPONSE_SIZE].fill(0x22);
        RESPONSE_SIZE
    });
    mux
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_round_trip() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(128), rpc_config(128), 4, echo_mux()).await?;

    let req = vec![0x11u8; 128];
    let mut resp = vec![0u8; RESPONSE_SIZE];
    let n = client.call(1, &req, &mut resp).await?;

    assert_eq!(n, 128);
    assert!(resp[..n].iter().all(|&b| b == 0x11));

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_response_larger_than_request() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(128), rpc_config(128), 4, fixed_response_mux()).await?;

    let req = vec![0x11u8; 128];
    let mut resp = vec![0u8; RESPONSE_SIZE];
    let n = client.call(1, &req, &mut resp).await?;

    assert_eq!(n, RESPONSE_SIZE);
    assert!(resp.iter().all(|&b| b == 0x22));

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn long_reply_truncates_to_destination() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(64), rpc_config(64), 4, fixed_response_mux()).await?;

    // The handler writes 4096 bytes; the caller only offers 1000.
    let req = vec![0x11u8; 128];
    let mut resp = vec![0u8; 1000];
    let n = client.call(1, &req, &mut resp).await?;

    assert_eq!(n, 1000);
    assert!(resp.iter().all(|&b| b == 0x22));

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversize_request_fails_without_side_effects() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(64), rpc_config(64), 4, echo_mux()).await?;
    let max_req = client.config().max_req_payload;

    let req = vec![0x33u8; max_req + 1];
    let mut resp = vec![0u8; 64];
    let err = client
        .call(1, &req, &mut resp)
        .await
        .expect_err("oversize request must fail");
    assert!(matches!(err, RpcError::PayloadTooLarge { .. }));
    // No slot was reserved for the failed call.
    assert_eq!(client.idle_slots(), 64);

    // The connection is still healthy.
    let req = vec![0x44u8; 16];
    let n = client.call(1, &req, &mut resp).await?;
    assert_eq!(n, 16);
    assert!(resp[..n].iter().all(|&b| b == 0x44));

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_fn_id_yields_zero_length_reply() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(64), rpc_config(64), 4, echo_mux()).await?;

    let mut resp = vec![0xAAu8; 64];
    let n = client.call(999, b"anything", &mut resp).await?;
    // Handler-not-found is a zero-length response, not a call failure.
    assert_eq!(n, 0);

    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_request_and_reply_round_trip() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(64), rpc_config(64), 4, echo_mux()).await?;

    let mut resp = vec![0u8; 16];
    let n = client.call(1, b"", &mut resp).await?;
    assert_eq!(n, 0);

    server.stop().await;
    Ok(())
}
