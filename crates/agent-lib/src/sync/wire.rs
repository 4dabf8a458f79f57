//! Wire protocol to the config updater
//!
//! Plain TCP carrying length-prefixed JSON frames: a u32 big-endian length
//! followed by the serialized message. Requests name the remote method and
//! carry the batch; responses carry an acknowledgement string.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::models::ContainerInfo;

/// The single remote procedure the updater exposes.
pub const PUSH_METHOD: &str = "PushDetectionResults";

/// Upper bound on a single frame; anything larger is a protocol violation.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub params: Vec<ContainerInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).context("frame too large")?;
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds protocol maximum");
    }
    stream.write_u32(len).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let len = stream.read_u32().await.context("connection closed")?;
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds protocol maximum");
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .context("truncated frame")?;
    Ok(payload)
}

/// One established connection to the updater.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to updater at {addr}"))?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream })
    }

    /// Perform one remote call; returns the updater's acknowledgement.
    pub async fn call(&mut self, method: &str, batch: &[ContainerInfo]) -> Result<String> {
        let request = Request {
            method: method.to_string(),
            params: batch.to_vec(),
        };
        let payload = serde_json::to_vec(&request).context("failed to encode request")?;
        write_frame(&mut self.stream, &payload).await?;

        let response_bytes = read_frame(&mut self.stream).await?;
        let response: Response =
            serde_json::from_slice(&response_bytes).context("failed to decode response")?;
        if let Some(error) = response.error {
            bail!("updater rejected batch: {error}");
        }
        Ok(response.reply)
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
