// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use verbs_rpc_rs::cfg::config::{Config, RpcConfig};

#[test]
fn load_test_config() -> Result<()> {
    let cfg = Config::load_from_file("tests/config.yaml")?;

    assert_eq!(cfg.rpc.max_inflight, 64);
    assert_eq!(cfg.rpc.max_req_payload, 256);
    assert_eq!(cfg.rpc.max_resp_payload, 4096);
    // CqSize: 0 in the file is normalized up to MaxInflight.
    assert_eq!(cfg.rpc.cq_size, 64);

    assert_eq!(cfg.server.thread_count, 4);
    assert_eq!(cfg.transport.target_address, "127.0.0.1");
    assert_eq!(cfg.transport.port, 9988);
    assert_eq!(cfg.transport.max_user_data, 4096);
    Ok(())
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::load_from_file("tests/does_not_exist.yaml").is_err());
}

#[test]
fn empty_sections_fall_back_to_defaults() -> Result<()> {
    let mut cfg: Config = serde_yaml::from_str("{}")?;
    cfg.validate_and_normalize()?;
    assert_eq!(cfg.rpc.max_inflight, RpcConfig::default().max_inflight);
    assert_eq!(cfg.server.thread_count, 4);
    assert_eq!(
        cfg.transport.max_user_data,
        verbs_rpc_rs::conn::endpoint::MAX_USER_DATA
    );
    Ok(())
}
