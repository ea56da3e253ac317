//! TCP data channel for resumable single-file uploads.
//!
//! One connection carries one upload. The sender opens with a handshake
//! frame and waits for the receiver's resume offset before streaming
//! chunks; the receiver paces the sender with credit frames.
//!
//! # Wire format
//!
//! See [`rft_protocol::wire`] for the frame layout.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::{UploadClient, UploadReport};
pub use error::DataChannelError;
pub use server::UploadServer;

use std::time::Duration;

/// Port the receiver listens on by default.
pub const DEFAULT_PORT: u16 = 8765;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for each side of the handshake exchange.
///
/// Covers the receiver's catalog round-trips before it can answer.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
