use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;
use crate::types::Chunk;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
///
/// Blocking; call from `spawn_blocking` on the runtime.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkProducer
// ---------------------------------------------------------------------------

/// Reads a file sequentially in fixed-size blocks.
///
/// Produces a finite sequence: every chunk is exactly `block_size` bytes
/// except the last, which is whatever a read returned short (possibly
/// nothing). Once the last chunk or an error has been returned the producer
/// is exhausted; resuming requires a new producer.
pub struct ChunkProducer {
    file: tokio::fs::File,
    path: PathBuf,
    block_size: usize,
    sequence: u64,
    position: u64,
    file_size: u64,
    finished: bool,
}

impl ChunkProducer {
    /// Opens `path` and positions it after `resume_offset` whole blocks.
    ///
    /// The first chunk produced carries sequence number `resume_offset + 1`.
    pub async fn open(
        path: &Path,
        block_size: u32,
        resume_offset: u64,
    ) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(TransferError::IncompatibleResume(
                "block size must be positive".into(),
            ));
        }
        let mut file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();

        let position = resume_offset
            .checked_mul(u64::from(block_size))
            .filter(|p| *p <= file_size)
            .ok_or_else(|| {
                TransferError::IncompatibleResume(format!(
                    "resume offset {resume_offset} x {block_size} exceeds source size {file_size}"
                ))
            })?;
        if position > 0 {
            file.seek(SeekFrom::Start(position)).await?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size: block_size as usize,
            sequence: resume_offset,
            position,
            file_size,
            finished: false,
        })
    }

    /// Reads the next chunk. Returns `None` once the final chunk was produced.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Err(e.into());
                }
            }
        }
        buf.truncate(filled);

        if filled < self.block_size {
            self.finished = true;
        }
        self.sequence += 1;
        self.position += filled as u64;
        Ok(Some(Chunk::new(self.sequence, buf)))
    }

    /// Sequence number of the last chunk produced.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current byte position in the source.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total source size in bytes at open time.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Whether the final chunk (or an error) has been returned.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
