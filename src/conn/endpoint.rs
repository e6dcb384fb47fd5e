// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

/// Size of the fixed endpoint block on the bootstrap channel.
pub const ENDPOINT_LEN: usize = size_of::<QpEndpoint>();

/// Default bound on the opaque user metadata exchanged during bootstrap;
/// configurable through `TransportHints::max_user_data`.
pub const MAX_USER_DATA: usize = 4096;

/// Queue-pair attributes exchanged out-of-band before the QP can be
/// transitioned RTR/RTS. Little-endian on the bootstrap channel.
#[repr(C)]
#[derive(
    Debug, Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct QpEndpoint {
    pub lid: U16<LittleEndian>,    // 0..2
    reserved: [u8; 2],             // 2..4
    pub qp_num: U32<LittleEndian>, // 4..8
    pub sq_psn: U32<LittleEndian>, // 8..12
    pub gid: [u8; 16],             // 12..28
}

impl QpEndpoint {
    pub fn new(lid: u16, qp_num: u32, sq_psn: u32, gid: [u8; 16]) -> Self {
        Self {
            lid: U16::new(lid),
            reserved: [0; 2],
            qp_num: U32::new(qp_num),
            sq_psn: U32::new(sq_psn),
            gid,
        }
    }

    pub fn gid_hex(&self) -> String {
        hex::encode(self.gid)
    }
}

/// Write the local endpoint block plus length-prefixed user metadata.
pub async fn send_endpoint<W>(
    writer: &mut W,
    endpoint: &QpEndpoint,
    user_data: &[u8],
    max_user_data: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if user_data.len() > max_user_data {
        bail!(
            "user metadata too large: {} > {max_user_data}",
            user_data.len()
        );
    }

    writer.write_all(endpoint.as_bytes()).await?;
    writer
        .write_all(U32::<LittleEndian>::new(user_data.len() as u32).as_bytes())
        .await?;
    if !user_data.is_empty() {
        writer.write_all(user_data).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read the peer's endpoint block plus its user metadata.
pub async fn recv_endpoint<R>(
    reader: &mut R,
    max_user_data: usize,
) -> Result<(QpEndpoint, Bytes)>
where R: AsyncRead + Unpin {
    let mut block = [0u8; ENDPOINT_LEN];
    reader.read_exact(&mut block).await?;
    let endpoint = QpEndpoint::read_from_bytes(&block)
        .map_err(|_| anyhow::anyhow!("malformed endpoint block"))?;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let user_len = u32::from_le_bytes(len_buf) as usize;
    if user_len > max_user_data {
        bail!("peer user metadata too large: {user_len} > {max_user_data}");
    }

    let mut user_data = vec![0u8; user_len];
    if user_len > 0 {
        reader.read_exact(&mut user_data).await?;
    }

    Ok((endpoint, Bytes::from(user_data)))
}
