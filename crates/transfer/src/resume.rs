use rft_protocol::TransferRequest;

use crate::TransferError;
use crate::staging::{StagingMeta, StagingPaths};

/// What the receiver does with an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Continue after `offset` whole blocks already staged. When
    /// `truncate_to` is set the staging file holds a complete short tail
    /// that must be cut back before the sender re-sends it.
    Resume {
        offset: u64,
        truncate_to: Option<u64>,
    },
    /// Start over with an empty staging file and a new catalog entry.
    Fresh,
}

/// Computes the resume offset for `request` from the on-disk state at `paths`.
///
/// Does not modify anything on disk.
pub async fn decide_resume(
    paths: &StagingPaths,
    request: &TransferRequest,
) -> Result<ResumeDecision, TransferError> {
    if !request.overwrite && tokio::fs::try_exists(&paths.final_path).await? {
        return Err(TransferError::AlreadyUploaded(
            paths.final_path.display().to_string(),
        ));
    }

    if request.block_size == 0 {
        return Err(TransferError::IncompatibleResume(
            "block size must be positive".into(),
        ));
    }
    if !request.resume {
        return Ok(ResumeDecision::Fresh);
    }
    let staged_len = match tokio::fs::metadata(&paths.staging).await {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ResumeDecision::Fresh),
        Err(e) => return Err(e.into()),
    };

    let block_size = u64::from(request.block_size);
    let mut declared_size = request.file_size;

    if let Some(meta) = StagingMeta::load(&paths.meta).await? {
        if meta.block_size != request.block_size {
            return Err(TransferError::IncompatibleResume(format!(
                "staging file was written with block size {}, request uses {}",
                meta.block_size, request.block_size
            )));
        }
        match (meta.file_size, request.file_size) {
            (Some(staged), Some(requested)) if staged != requested => {
                return Err(TransferError::IncompatibleResume(format!(
                    "staging file belongs to a {staged}-byte source, request declares {requested}"
                )));
            }
            (Some(staged), None) => declared_size = Some(staged),
            _ => {}
        }
    }

    if let Some(size) = declared_size.filter(|size| staged_len > *size) {
        return Err(TransferError::IncompatibleResume(format!(
            "staging file holds {staged_len} bytes, source is only {size}"
        )));
    }

    let offset = staged_len / block_size;
    let remainder = staged_len % block_size;
    let truncate_to = if remainder == 0 {
        None
    } else if declared_size == Some(staged_len) {
        // Every byte arrived but finalize never ran; re-receive the tail.
        Some(offset * block_size)
    } else {
        return Err(TransferError::IncompatibleResume(format!(
            "staging length {staged_len} is not a multiple of block size {block_size}"
        )));
    };

    tracing::debug!(
        "resume decision for {}: {staged_len} bytes staged, offset {offset}",
        paths.staging.display()
    );
    Ok(ResumeDecision::Resume {
        offset,
        truncate_to,
    })
}

/// Replaces any stale staging state with an empty staging file and a fresh sidecar.
pub async fn reset_staging(
    paths: &StagingPaths,
    request: &TransferRequest,
) -> Result<(), TransferError> {
    if let Some(parent) = paths.staging.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Creating with truncate discards whatever a previous session left.
    tokio::fs::File::create(&paths.staging).await?;
    StagingMeta {
        block_size: request.block_size,
        file_size: request.file_size,
    }
    .save(&paths.meta)
    .await
}

/// Cuts the staging file back to `len` bytes.
pub async fn truncate_staging(paths: &StagingPaths, len: u64) -> Result<(), TransferError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&paths.staging)
        .await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}
