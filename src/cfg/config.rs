// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{conn::endpoint::MAX_USER_DATA, wire::HEADER_LEN};

/// Engine knobs for one connection. Both sides of a connection must agree
/// on the payload bounds; `max_inflight` may differ per side.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_max_inflight", rename = "MaxInflight")]
    /// Slots per pool, receive workers, and the bound on outstanding calls.
    pub max_inflight: u32,

    #[serde(default = "default_max_req_payload", rename = "MaxReqPayload")]
    /// Upper bound on request payload bytes; sizes the request-direction
    /// cells.
    pub max_req_payload: usize,

    #[serde(default = "default_max_resp_payload", rename = "MaxRespPayload")]
    /// Upper bound on response payload bytes; sizes the response-direction
    /// cells.
    pub max_resp_payload: usize,

    #[serde(default, rename = "CqSize")]
    /// Completion-queue depth handed to the verb layer; normalized up to at
    /// least `MaxInflight`.
    pub cq_size: u32,
}

fn default_max_inflight() -> u32 {
    128
}

fn default_max_req_payload() -> usize {
    256
}

fn default_max_resp_payload() -> usize {
    4096
}

impl Default for RpcConfig {
    fn default() -> Self {
        let mut cfg = Self {
            max_inflight: default_max_inflight(),
            max_req_payload: default_max_req_payload(),
            max_resp_payload: default_max_resp_payload(),
            cq_size: 0,
        };
        cfg.normalize();
        cfg
    }
}

impl RpcConfig {
    /// Derive dependent fields; currently only the CQ depth floor.
    pub fn normalize(&mut self) {
        if self.cq_size < self.max_inflight {
            self.cq_size = self.max_inflight;
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_inflight >= 1, "MaxInflight must be >= 1");
        ensure!(self.max_req_payload >= 1, "MaxReqPayload must be >= 1");
        ensure!(self.max_resp_payload >= 1, "MaxRespPayload must be >= 1");
        ensure!(
            self.max_req_payload <= u32::MAX as usize - HEADER_LEN
                && self.max_resp_payload <= u32::MAX as usize - HEADER_LEN,
            "payload bounds must fit the 32-bit length field"
        );
        Ok(())
    }

    /// Cell size for the request direction (payload bound plus header).
    pub fn req_cell_size(&self) -> usize {
        self.max_req_payload + HEADER_LEN
    }

    /// Cell size for the response direction (payload bound plus header).
    pub fn resp_cell_size(&self) -> usize {
        self.max_resp_payload + HEADER_LEN
    }
}

/// Server-only runtime settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_thread_count", rename = "ThreadCount")]
    /// Compute-pool size for handler execution.
    pub thread_count: u32,
}

fn default_thread_count() -> u32 {
    4
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
        }
    }
}

/// Bootstrap hints kept locally and never sent on the wire.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportHints {
    #[serde(default, rename = "TargetAddress")]
    /// Peer address for the out-of-band TCP exchange.
    pub target_address: String,
    #[serde(default, rename = "Port")]
    /// Bootstrap TCP port.
    pub port: u16,
    #[serde(default = "default_max_user_data", rename = "MaxUserData")]
    /// Bound on the opaque metadata exchanged during bootstrap, in both
    /// directions.
    pub max_user_data: usize,
}

fn default_max_user_data() -> usize {
    MAX_USER_DATA
}

impl Default for TransportHints {
    fn default() -> Self {
        Self {
            target_address: String::new(),
            port: 0,
            max_user_data: MAX_USER_DATA,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportHints,
}

impl Config {
    /// Load from YAML, validate, and normalize derived fields.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {:?}", path.as_ref()))?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        self.rpc.normalize();
        self.rpc.validate()?;
        ensure!(self.server.thread_count >= 1, "ThreadCount must be >= 1");
        Ok(())
    }
}
