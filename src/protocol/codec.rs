//! Length-prefixed framing with bounded waits.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of body. Every
//! read and write is wrapped in a timeout so a stalled peer can only ever wedge its own
//! session.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{AppResult, EmulatorError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Bounds applied while reading frames from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest body accepted; anything larger is an unrecoverable framing error.
    pub max_frame_bytes: usize,
    /// How long to wait for the first byte of the next frame.
    pub idle_timeout: Duration,
    /// How long the rest of a started frame, or a write, may take.
    pub io_timeout: Duration,
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, limits: &FrameLimits) -> AppResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];

    // The first byte may take as long as the session is allowed to idle.
    let n = timeout(limits.idle_timeout, reader.read(&mut prefix))
        .await
        .map_err(|_| EmulatorError::Timeout("waiting for the next request"))??;
    if n == 0 {
        return Ok(None);
    }

    let mut filled = n;
    while filled < LENGTH_PREFIX_BYTES {
        let n = timeout(limits.io_timeout, reader.read(&mut prefix[filled..]))
            .await
            .map_err(|_| EmulatorError::Timeout("reading the length prefix"))??;
        if n == 0 {
            return Err(EmulatorError::Protocol(format!(
                "truncated length prefix: got {filled} of {LENGTH_PREFIX_BYTES} bytes"
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > limits.max_frame_bytes {
        return Err(EmulatorError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {} bytes",
            limits.max_frame_bytes
        )));
    }

    let mut body = BytesMut::zeroed(len);
    match timeout(limits.io_timeout, reader.read_exact(&mut body)).await {
        Err(_) => Err(EmulatorError::Timeout("reading the frame body")),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            EmulatorError::Protocol(format!("truncated frame: expected {len} bytes")),
        ),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(_)) => Ok(Some(body.freeze())),
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], io_timeout: Duration) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| {
        EmulatorError::Protocol(format!("frame of {} bytes cannot be framed", body.len()))
    })?;

    let write = async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(body).await?;
        writer.flush().await
    };
    timeout(io_timeout, write)
        .await
        .map_err(|_| EmulatorError::Timeout("writing a frame"))??;
    Ok(())
}
