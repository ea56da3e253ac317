use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use rft_catalog::Catalog;
use rft_protocol::{LifecycleStatus, TransferRequest};

use crate::TransferError;
use crate::chunked::calculate_file_checksum;
use crate::lifecycle::LifecycleSync;
use crate::registry::{SessionGuard, SessionRegistry};
use crate::resume::{ResumeDecision, decide_resume, reset_staging, truncate_staging};
use crate::staging::{FinalizeOutcome, StagingFile, StagingPaths, finalize};
use crate::types::{Chunk, SessionState, TransferSession};

/// Largest block size accepted when none is configured.
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Receiver-side entry point: turns handshakes into sessions.
#[derive(Clone)]
pub struct Receiver {
    catalog: Arc<dyn Catalog>,
    storage_root: PathBuf,
    registry: SessionRegistry,
    max_block_size: u32,
}

impl Receiver {
    pub fn new(catalog: Arc<dyn Catalog>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            storage_root: storage_root.into(),
            registry: SessionRegistry::new(),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }

    pub fn with_max_block_size(mut self, max: u32) -> Self {
        self.max_block_size = max;
        self
    }

    pub fn storage_root(&self) -> &std::path::Path {
        &self.storage_root
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Parses a handshake record and opens a session for it.
    pub async fn open_session(&self, handshake: &str) -> Result<ReceiverSession, TransferError> {
        let request = TransferRequest::parse(handshake)?;
        self.open_request(request).await
    }

    /// Opens a session for an already-parsed request.
    ///
    /// Resolves the storage path, claims it, computes the resume offset and
    /// informs the catalog. Nothing on disk changes if any of this fails.
    pub async fn open_request(
        &self,
        request: TransferRequest,
    ) -> Result<ReceiverSession, TransferError> {
        if request.block_size == 0 {
            return Err(TransferError::MalformedHandshake(
                "block size must be positive".into(),
            ));
        }
        if request.block_size > self.max_block_size {
            return Err(TransferError::MalformedHandshake(format!(
                "block size {} exceeds limit {}",
                request.block_size, self.max_block_size
            )));
        }

        let resolved = self.catalog.resolve_path(&request).await?;
        let paths = StagingPaths::new(&self.storage_root, &resolved)?;
        let guard = self.registry.register(&paths.final_path)?;
        let decision = decide_resume(&paths, &request).await?;
        let lifecycle = LifecycleSync::new(self.catalog.clone(), &request.api_key, &resolved);

        let (offset, status) = match decision {
            ResumeDecision::Resume {
                offset,
                truncate_to,
            } => {
                lifecycle.require(LifecycleStatus::Resumed).await?;
                if let Some(len) = truncate_to {
                    truncate_staging(&paths, len).await?;
                }
                (offset, LifecycleStatus::Resumed)
            }
            ResumeDecision::Fresh => {
                let reference = self.catalog.create_entry(&request).await?;
                tracing::debug!("catalog entry {reference} created for {resolved}");
                reset_staging(&paths, &request).await?;
                (0, LifecycleStatus::Initiated)
            }
        };

        let staging = StagingFile::open_append(&paths.staging).await?;
        let session = TransferSession::new(resolved, request.block_size, offset, status);
        tracing::info!(
            path = %session.resolved_path(),
            block_size = session.block_size(),
            resume_offset = offset,
            %status,
            "transfer session opened"
        );

        Ok(ReceiverSession {
            request,
            paths,
            session,
            lifecycle,
            staging,
            _guard: guard,
        })
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub resolved_path: String,
    pub final_path: PathBuf,
    /// Length of the final artifact.
    pub bytes: u64,
    /// Chunks received in this session.
    pub chunks: u64,
    /// Blocks already staged when the session started.
    pub resume_offset: u64,
    /// Hex SHA-256 of the final artifact.
    pub sha256: String,
}

/// One open session. Owns the staging file until it completes or pauses.
pub struct ReceiverSession {
    request: TransferRequest,
    paths: StagingPaths,
    session: TransferSession,
    lifecycle: LifecycleSync,
    staging: StagingFile,
    _guard: SessionGuard,
}

impl ReceiverSession {
    /// Blocks the sender must skip.
    pub fn resume_offset(&self) -> u64 {
        self.session.resume_offset()
    }

    pub fn block_size(&self) -> u32 {
        self.session.block_size()
    }

    pub fn resolved_path(&self) -> &str {
        self.session.resolved_path()
    }

    /// Status reported to the catalog when the session opened.
    pub fn status(&self) -> LifecycleStatus {
        self.session.status()
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn paths(&self) -> &StagingPaths {
        &self.paths
    }

    /// Appends `chunks` to staging until the sequence ends, then finalizes.
    ///
    /// On any error or on `cancel`, keeps the staging data, reports `PAUSED`
    /// and returns the error. Staging is trimmed to whole blocks first, so a
    /// short final chunk that was already appended is discarded and resent by
    /// the next session.
    pub async fn consume<S>(
        mut self,
        mut chunks: S,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, TransferError>
    where
        S: Stream<Item = Result<Chunk, TransferError>> + Unpin,
    {
        if let Err(e) = self.receive(&mut chunks, &cancel).await {
            return Err(pause(&mut self.session, &self.lifecycle, &self.paths, e).await);
        }
        self.complete().await
    }

    /// Ends a session that will never consume its chunks, e.g. because the
    /// channel dropped before streaming began. Takes the pause path and
    /// returns `error`.
    pub async fn abandon(mut self, error: TransferError) -> TransferError {
        pause(&mut self.session, &self.lifecycle, &self.paths, error).await
    }

    async fn receive<S>(
        &mut self,
        chunks: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError>
    where
        S: Stream<Item = Result<Chunk, TransferError>> + Unpin,
    {
        let block_size = self.session.block_size() as usize;
        let mut tail_seen = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                item = chunks.next() => item,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e),
            };

            let expected = self.session.expected_sequence();
            if chunk.sequence != expected {
                return Err(TransferError::Channel(format!(
                    "chunk {} arrived, expected {expected}",
                    chunk.sequence
                )));
            }
            if tail_seen {
                return Err(TransferError::Channel(format!(
                    "chunk {} follows the final short chunk",
                    chunk.sequence
                )));
            }
            if chunk.len() > block_size {
                return Err(TransferError::Channel(format!(
                    "chunk {} is {} bytes, block size is {block_size}",
                    chunk.sequence,
                    chunk.len()
                )));
            }
            tail_seen = chunk.len() < block_size;

            self.staging.append(&chunk.data).await?;
            self.session.record_chunk(chunk.len());
            tracing::trace!("chunk {} appended ({} bytes)", chunk.sequence, chunk.len());
        }

        if let Some(declared) = self.request.file_size {
            let staged = self.staging.len();
            if staged != declared {
                return Err(TransferError::Channel(format!(
                    "sequence ended at {staged} bytes, sender declared {declared}"
                )));
            }
        }
        Ok(())
    }

    async fn complete(self) -> Result<SessionOutcome, TransferError> {
        let ReceiverSession {
            paths,
            mut session,
            lifecycle,
            staging,
            _guard,
            ..
        } = self;
        let bytes = staging.len();

        let finalized = async {
            staging.close().await?;
            finalize(&paths).await
        }
        .await;
        match finalized {
            Ok(FinalizeOutcome::Renamed) => {}
            Ok(FinalizeOutcome::AlreadyFinal) => {
                tracing::warn!("{} was already finalized", paths.final_path.display());
            }
            Err(e) => return Err(pause(&mut session, &lifecycle, &paths, e).await),
        }

        let status = session.transition(SessionState::Completed)?;
        lifecycle.report(status).await;

        let final_path = paths.final_path.clone();
        let sha256 = tokio::task::spawn_blocking(move || calculate_file_checksum(&final_path))
            .await
            .map_err(std::io::Error::other)??;

        tracing::info!(
            path = %session.resolved_path(),
            bytes,
            chunks = session.chunks_received(),
            elapsed_ms = session.elapsed().as_millis() as u64,
            %sha256,
            "transfer complete"
        );

        Ok(SessionOutcome {
            resolved_path: session.resolved_path().to_string(),
            final_path: paths.final_path,
            bytes,
            chunks: session.chunks_received(),
            resume_offset: session.resume_offset(),
            sha256,
        })
    }
}

/// Moves the session to `PAUSED`, leaving staging at a whole-block length.
async fn pause(
    session: &mut TransferSession,
    lifecycle: &LifecycleSync,
    paths: &StagingPaths,
    error: TransferError,
) -> TransferError {
    trim_to_whole_blocks(paths, session.block_size()).await;
    if let Ok(status) = session.transition(SessionState::Paused) {
        lifecycle.report(status).await;
    }
    tracing::warn!(
        path = %session.resolved_path(),
        chunks = session.chunks_received(),
        "transfer paused: {error}"
    );
    error
}

async fn trim_to_whole_blocks(paths: &StagingPaths, block_size: u32) {
    let len = match tokio::fs::metadata(&paths.staging).await {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    let whole = len - len % u64::from(block_size);
    if whole != len {
        if let Err(e) = truncate_staging(paths, whole).await {
            tracing::warn!(
                "failed to trim {} to {whole} bytes: {e}",
                paths.staging.display()
            );
        }
    }
}
