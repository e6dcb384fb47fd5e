// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use anyhow::Result;
use serial_test::serial;
use verbs_rpc_rs::{cfg::logger::init_logger, utils::spin_wait};

use crate::integration_tests::common::{echo_mux, rpc_config, start_pair, test_path};

const THREADS: usize = 4;
const CALLS_PER_THREAD: usize = 50_000;

/// Four OS threads share one client and drive it through the spin-wait
/// bridge. All 200k calls must complete, and the free ring must end exactly
/// as populated as it started (no slot lost or double-freed).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn four_threads_share_one_client() -> Result<()> {
    let _ = init_logger(&test_path());

    let (client, server) =
        start_pair(rpc_config(128), rpc_config(128), 4, echo_mux()).await?;

    let completed = Arc::new(AtomicU64::new(0));

    let workers = {
        let client = Arc::clone(&client);
        let completed = Arc::clone(&completed);
        tokio::task::spawn_blocking(move || {
            let threads: Vec<_> = (0..THREADS)
                .map(|_| {
                    let client = Arc::clone(&client);
                    let completed = Arc::clone(&completed);
                    thread::spawn(move || {
                        let req = vec![0x11u8; 128];
                        let mut resp = vec![0u8; 128];
                        for _ in 0..CALLS_PER_THREAD {
                            let n = spin_wait(client.call(1, &req, &mut resp))
                                .expect("call failed");
                            assert_eq!(n, 128);
                            assert!(resp.iter().all(|&b| b == 0x11));
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().expect("caller thread");
            }
        })
    };
    workers.await?;

    assert_eq!(
        completed.load(Ordering::Relaxed),
        (THREADS * CALLS_PER_THREAD) as u64
    );
    // Every acquire was matched by a release.
    assert_eq!(client.idle_slots(), 128);

    server.stop().await;
    Ok(())
}
