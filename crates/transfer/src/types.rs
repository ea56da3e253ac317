use std::time::Instant;

use rft_protocol::LifecycleStatus;

use crate::TransferError;

/// One block of the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based position of this chunk in the file.
    pub sequence: u64,
    /// Raw chunk data. Shorter than the block size only for the final chunk.
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(sequence: u64, data: Vec<u8>) -> Self {
        Self { sequence, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Receiver-side session state.
///
/// `Active` moves to exactly one of `Completed` or `Paused`; both are final
/// for the session (a paused upload continues in a new session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Completed,
    Paused,
}

/// A transfer session, owned by the consumer for its whole lifetime.
#[derive(Debug)]
pub struct TransferSession {
    resolved_path: String,
    block_size: u32,
    resume_offset: u64,
    status: LifecycleStatus,
    state: SessionState,
    chunks_received: u64,
    bytes_received: u64,
    started_at: Instant,
    finished_at: Option<Instant>,
}

impl TransferSession {
    /// Creates an active session that starts after `resume_offset` blocks.
    pub fn new(
        resolved_path: String,
        block_size: u32,
        resume_offset: u64,
        status: LifecycleStatus,
    ) -> Self {
        Self {
            resolved_path,
            block_size,
            resume_offset,
            status,
            state: SessionState::Active,
            chunks_received: 0,
            bytes_received: 0,
            started_at: Instant::now(),
            finished_at: None,
        }
    }

    /// Records a chunk durably appended to staging.
    pub fn record_chunk(&mut self, bytes: usize) {
        self.chunks_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Sequence number the next chunk must carry.
    pub fn expected_sequence(&self) -> u64 {
        self.resume_offset + self.chunks_received + 1
    }

    /// Moves an active session to `to` and returns the lifecycle status the
    /// catalog must observe for it.
    pub fn transition(&mut self, to: SessionState) -> Result<LifecycleStatus, TransferError> {
        let status = match (self.state, to) {
            (SessionState::Active, SessionState::Completed) => LifecycleStatus::Uploaded,
            (SessionState::Active, SessionState::Paused) => LifecycleStatus::Paused,
            (from, to) => {
                return Err(TransferError::InvalidTransition(format!(
                    "{}: {from:?} -> {to:?}",
                    self.resolved_path
                )));
            }
        };
        self.state = to;
        self.status = status;
        self.finished_at = Some(Instant::now());
        Ok(status)
    }

    pub fn resolved_path(&self) -> &str {
        &self.resolved_path
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Whole blocks already staged before this session started.
    pub fn resume_offset(&self) -> u64 {
        self.resume_offset
    }

    pub fn status(&self) -> LifecycleStatus {
        self.status
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks_received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Time from session start to its transition (or to now if still active).
    pub fn elapsed(&self) -> std::time::Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.started_at)
    }
}
