// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Out-of-band connection bootstrap.
//!
//! A TCP channel is used exactly once per connection: both sides write their
//! queue-pair attributes plus opaque user metadata, read the peer's, then
//! transition the local QP RTR and RTS. The socket carries no data after
//! that.

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::{
    conn::endpoint::{QpEndpoint, recv_endpoint, send_endpoint},
    verbs::BootstrapQp,
};

/// What bootstrap learned about the peer.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub endpoint: QpEndpoint,
    pub user_data: Bytes,
}

/// Dial `target`, exchange endpoints over the fresh socket, and bring the
/// local queue pair up against the peer's attributes. `max_user_data` bounds
/// the metadata in both directions (`TransportHints::max_user_data`).
pub async fn connect<Q: BootstrapQp>(
    qp: &Q,
    target: impl ToSocketAddrs,
    user_data: &[u8],
    max_user_data: usize,
) -> Result<RemotePeer> {
    let mut stream = TcpStream::connect(target)
        .await
        .context("bootstrap: tcp connect failed")?;
    stream.set_nodelay(true)?;
    info!(
        "bootstrap: tcp connected to {}",
        stream
            .peer_addr()
            .map_or_else(|_| "?".into(), |a| a.to_string())
    );

    let peer = exchange(qp, &mut stream, user_data, max_user_data).await?;
    info!("bootstrap: queue pair ready (connector side)");
    Ok(peer)
}

/// Listening side of the bootstrap exchange.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("bootstrap: tcp bind failed")?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one TCP connection and run the exchange for `qp` over it.
    pub async fn accept<Q: BootstrapQp>(
        &self,
        qp: &Q,
        user_data: &[u8],
        max_user_data: usize,
    ) -> Result<RemotePeer> {
        let (mut stream, peer_addr) = self
            .listener
            .accept()
            .await
            .context("bootstrap: tcp accept failed")?;
        stream.set_nodelay(true)?;
        info!("bootstrap: accepted tcp connection from {peer_addr}");

        let peer = exchange(qp, &mut stream, user_data, max_user_data).await?;
        info!("bootstrap: queue pair ready (acceptor side)");
        Ok(peer)
    }
}

/// Symmetric exchange: write local attributes first, then read the peer's,
/// then RTR/RTS. Both sides run the same sequence; TCP buffers the
/// concurrent writes.
async fn exchange<Q: BootstrapQp>(
    qp: &Q,
    stream: &mut TcpStream,
    user_data: &[u8],
    max_user_data: usize,
) -> Result<RemotePeer> {
    let local = qp.local_endpoint();
    send_endpoint(stream, &local, user_data, max_user_data)
        .await
        .context("bootstrap: sending local endpoint")?;

    let (endpoint, peer_user_data) = recv_endpoint(stream, max_user_data)
        .await
        .context("bootstrap: receiving remote endpoint")?;
    debug!(
        "bootstrap: remote lid={} qp_num={} psn={} gid={}",
        endpoint.lid.get(),
        endpoint.qp_num.get(),
        endpoint.sq_psn.get(),
        endpoint.gid_hex()
    );

    qp.ready_to_receive(&endpoint)
        .context("bootstrap: rtr transition")?;
    debug!("bootstrap: qp rtr");
    qp.ready_to_send().context("bootstrap: rts transition")?;
    debug!("bootstrap: qp rts");

    Ok(RemotePeer {
        endpoint,
        user_data: peer_user_data,
    })
}
