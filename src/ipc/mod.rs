//! Wire protocol between the child and the supervisor.
//!
//! Messages travel over a local stream socket as length-prefixed frames:
//! `[length: u32 big-endian][payload: length bytes]`, where the payload is an
//! internally tagged JSON object. JSON keeps the frames self-describing, so
//! new request or reply fields are non-breaking.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use semver::Version;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::supervisor::HistoricVersion;

pub mod client;
pub mod server;

/// Frames larger than this are rejected on both ends.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// A request from the child to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CheckForUpdate,
    Update { version: String },
    Rollback,
    History,
    CurrentVersion,
}

/// The supervisor's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Ok,
    UpdateCheck {
        latest: Option<Version>,
        all: Vec<Version>,
    },
    History {
        entries: Vec<HistoricVersion>,
    },
    Version {
        version: Version,
    },
    Error {
        message: String,
    },
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        serde_json::to_vec(message).map_err(|e| Error::Ipc(format!("encoding frame: {e}")))?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(Error::Ipc(format!("frame too large: {} bytes", payload.len())));
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly
/// between frames.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("frame too large: {len} bytes")));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| Error::Ipc(format!("decoding frame: {e}")))
}
