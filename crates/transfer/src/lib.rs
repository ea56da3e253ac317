//! Resumable chunked transfer of a single file.
//!
//! The sender side reads the source with a [`ChunkProducer`]; the receiver
//! side negotiates a resume offset with [`Receiver::open_session`] and
//! appends the ordered chunk sequence to a staging file with
//! [`ReceiverSession::consume`], finalising by atomic rename. A
//! [`CreditWindow`] bounds how many chunks may be in flight.

mod chunked;
mod flow;
mod lifecycle;
mod receiver;
mod registry;
mod resume;
mod staging;
mod types;
mod validation;

pub use chunked::{ChunkProducer, calculate_file_checksum, checksum_bytes};
pub use flow::{ChunkSender, ChunkStream, CreditWindow, pipe};
pub use lifecycle::LifecycleSync;
pub use receiver::{DEFAULT_MAX_BLOCK_SIZE, Receiver, ReceiverSession, SessionOutcome};
pub use registry::{SessionGuard, SessionRegistry};
pub use resume::{ResumeDecision, decide_resume};
pub use staging::{FinalizeOutcome, StagingFile, StagingMeta, StagingPaths, finalize};
pub use types::{Chunk, SessionState, TransferSession};
pub use validation::validate_resolved_path;

use rft_catalog::CatalogError;
use rft_protocol::{ErrorKind, HandshakeError};

/// Errors produced by the transfer core.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("file already uploaded: {0}")]
    AlreadyUploaded(String),

    #[error("incompatible resume: {0}")]
    IncompatibleResume(String),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(#[from] CatalogError),

    #[error("session conflict: {0} is already being written")]
    SessionConflict(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HandshakeError> for TransferError {
    fn from(e: HandshakeError) -> Self {
        Self::MalformedHandshake(e.to_string())
    }
}

impl TransferError {
    /// Failure category reported to the peer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedHandshake(_) => ErrorKind::MalformedHandshake,
            Self::AlreadyUploaded(_) => ErrorKind::AlreadyUploaded,
            Self::IncompatibleResume(_) => ErrorKind::IncompatibleResume,
            Self::CatalogUnavailable(_) => ErrorKind::CatalogUnavailable,
            Self::SessionConflict(_) => ErrorKind::SessionConflict,
            Self::Channel(_) | Self::Io(_) => ErrorKind::Channel,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidPath(_) | Self::InvalidTransition(_) => ErrorKind::Internal,
        }
    }
}
