//! Timeout-bounded I/O shared by the stream-backed transports.

use super::framing::{FrameBuffer, ResponseSpec};
use crate::error::{AppResult, ControllerError};
use bytes::Bytes;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

const READ_CHUNK: usize = 256;
const DRAIN_QUIET: Duration = Duration::from_millis(20);
const DRAIN_LIMIT: usize = 64 * 1024;

pub(crate) fn link_error(err: std::io::Error, limit: Duration) -> ControllerError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ControllerError::LinkTimeout(limit),
        _ => ControllerError::LinkBroken(err.to_string()),
    }
}

pub(crate) async fn write_all<S>(stream: &mut S, data: &[u8], limit: Duration) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
{
    let result = timeout(limit, async {
        stream.write_all(data).await?;
        stream.flush().await
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(link_error(e, limit)),
        Err(_) => Err(ControllerError::LinkTimeout(limit)),
    }
}

pub(crate) async fn read_frame<S>(
    stream: &mut S,
    buffer: &mut FrameBuffer,
    spec: &ResponseSpec,
    limit: Duration,
) -> AppResult<Bytes>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + limit;
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if let Some(frame) = buffer.try_frame(spec)? {
            return Ok(frame);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ControllerError::LinkTimeout(limit));
        }

        match timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                return Err(ControllerError::LinkBroken(
                    "connection closed by peer".to_string(),
                ))
            }
            Ok(Ok(n)) => buffer.extend(&chunk[..n]),
            // serial drivers report their internal poll timeout this way
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => continue,
            Ok(Err(e)) => return Err(link_error(e, limit)),
            Err(_) => return Err(ControllerError::LinkTimeout(limit)),
        }
    }
}

/// Read and drop whatever arrives until the link stays quiet briefly.
pub(crate) async fn drain<S>(stream: &mut S, buffer: &mut FrameBuffer) -> AppResult<usize>
where
    S: AsyncRead + Unpin,
{
    buffer.clear();
    let mut chunk = [0u8; READ_CHUNK];
    let mut dropped = 0;

    while dropped < DRAIN_LIMIT {
        match timeout(DRAIN_QUIET, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => dropped += n,
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => break,
            Ok(Err(e)) => return Err(link_error(e, DRAIN_QUIET)),
        }
    }
    Ok(dropped)
}
