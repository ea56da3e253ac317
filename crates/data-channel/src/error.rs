//! Error types for the data channel.

use rft_protocol::{ErrorKind, HandshakeError, WireError};
use rft_transfer::TransferError;

/// Errors produced by the TCP data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("invalid upload request: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("receiver rejected upload ({kind}): {reason}")]
    Rejected { kind: ErrorKind, reason: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DataChannelError {
    /// Failure category of a rejection, if the peer sent one.
    pub fn rejection_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
