//! Frame exchange helpers shared by client and server.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rft_protocol::wire::{MAX_CONTROL_LEN, read_frame_limited, write_frame};
use rft_protocol::{ErrorKind, Frame};

use crate::error::DataChannelError;

/// Reads the next control frame, bounded by `timeout` and `cancel`.
///
/// A clean close by the peer is a protocol error here: callers only use
/// this where a frame must follow. Payloads are capped at
/// [`MAX_CONTROL_LEN`], so a `CHUNK` announcing a large payload fails
/// before anything is buffered.
pub async fn recv_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<Frame, DataChannelError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DataChannelError::Cancelled),
        result = tokio::time::timeout(timeout, read_frame_limited(reader, MAX_CONTROL_LEN)) => {
            match result {
                Ok(Ok(Some(frame))) => Ok(frame),
                Ok(Ok(None)) => Err(DataChannelError::Protocol("connection closed by peer".into())),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(DataChannelError::Timeout),
            }
        }
    }
}

/// Sends an `ERROR` frame, ignoring failures.
///
/// The connection is about to be dropped either way.
pub async fn send_error<W: AsyncWrite + Unpin>(writer: &mut W, kind: ErrorKind, reason: String) {
    if let Err(e) = write_frame(writer, &Frame::Error { kind, reason }).await {
        debug!("could not deliver {kind} to peer: {e}");
    }
}

/// Converts a frame that arrived where another was expected into an error.
pub fn unexpected(frame: Frame, expected: &str) -> DataChannelError {
    match frame {
        Frame::Error { kind, reason } => DataChannelError::Rejected { kind, reason },
        other => DataChannelError::Protocol(format!(
            "expected {expected}, got {}",
            other.name()
        )),
    }
}
