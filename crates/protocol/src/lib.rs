//! Wire protocol types for resumable single-file transfer.
//!
//! - [`handshake`]: the metadata record exchanged before streaming.
//! - [`status`]: catalog lifecycle states.
//! - [`wire`]: binary framing on the ordered byte-stream channel.

pub mod handshake;
pub mod status;
pub mod wire;

pub use handshake::{HandshakeError, TransferRequest};
pub use status::LifecycleStatus;
pub use wire::{ErrorKind, Frame, WireError};

/// Block size used when the sender does not specify one.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Suffix distinguishing a staging artifact from its final name.
pub const STAGING_SUFFIX: &str = ".part";

/// Suffix of the staging sidecar recording resume bookkeeping.
pub const STAGING_META_SUFFIX: &str = ".part.meta";

/// Default number of in-flight chunks the receiver grants the sender.
pub const DEFAULT_WINDOW: u32 = 2;
