use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use rft_protocol::{STAGING_META_SUFFIX, STAGING_SUFFIX};

use crate::TransferError;
use crate::validation::validate_resolved_path;

/// On-disk locations for one resolved upload under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPaths {
    pub final_path: PathBuf,
    pub staging: PathBuf,
    pub meta: PathBuf,
}

impl StagingPaths {
    /// Validates `resolved` and places its artifacts under `root`.
    pub fn new(root: &Path, resolved: &str) -> Result<Self, TransferError> {
        validate_resolved_path(resolved)?;
        let final_path = root.join(resolved);
        let staging = root.join(format!("{resolved}{STAGING_SUFFIX}"));
        let meta = root.join(format!("{resolved}{STAGING_META_SUFFIX}"));
        Ok(Self {
            final_path,
            staging,
            meta,
        })
    }
}

/// Sidecar kept next to a staging file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingMeta {
    pub block_size: u32,
    #[serde(default)]
    pub file_size: Option<u64>,
}

impl StagingMeta {
    /// Loads the sidecar; `None` if it does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>, TransferError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            TransferError::IncompatibleResume(format!(
                "unreadable staging sidecar {}: {e}",
                path.display()
            ))
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), TransferError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// Append-only handle on a staging file.
///
/// Each [`append`](Self::append) either lands completely or leaves the file
/// at its previous length.
pub struct StagingFile {
    file: tokio::fs::File,
    path: PathBuf,
    len: u64,
}

impl StagingFile {
    /// Opens an existing staging file for appending.
    pub async fn open_append(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Appends `data`. On failure the file is truncated back to its prior length.
    pub async fn append(&mut self, data: &[u8]) -> Result<(), TransferError> {
        if data.is_empty() {
            return Ok(());
        }
        let written = async {
            self.file.write_all(data).await?;
            self.file.flush().await
        }
        .await;

        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(self.len).await {
                tracing::warn!(
                    "failed to roll back {} to {} bytes: {rollback}",
                    self.path.display(),
                    self.len
                );
            }
            return Err(e.into());
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// Bytes committed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes file data to storage and releases the handle.
    pub async fn close(self) -> Result<(), TransferError> {
        self.file.sync_all().await?;
        Ok(())
    }
}

/// Result of [`finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The staging file was renamed to the final name.
    Renamed,
    /// Nothing to do: the staging file is gone and the final artifact exists.
    AlreadyFinal,
}

/// Renames the staging file to its final name and drops the sidecar.
pub async fn finalize(paths: &StagingPaths) -> Result<FinalizeOutcome, TransferError> {
    match tokio::fs::rename(&paths.staging, &paths.final_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if tokio::fs::try_exists(&paths.final_path).await? {
                return Ok(FinalizeOutcome::AlreadyFinal);
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }

    match tokio::fs::remove_file(&paths.meta).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove {}: {e}", paths.meta.display()),
    }
    Ok(FinalizeOutcome::Renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_use_suffixes() {
        let paths = StagingPaths::new(Path::new("/srv"), "plant/scan.tif").unwrap();
        assert_eq!(paths.final_path, PathBuf::from("/srv/plant/scan.tif"));
        assert_eq!(paths.staging, PathBuf::from("/srv/plant/scan.tif.part"));
        assert_eq!(paths.meta, PathBuf::from("/srv/plant/scan.tif.part.meta"));
    }

    #[test]
    fn paths_reject_traversal() {
        assert!(matches!(
            StagingPaths::new(Path::new("/srv"), "../etc/passwd"),
            Err(TransferError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn meta_roundtrip_and_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.part.meta");
        assert_eq!(StagingMeta::load(&path).await.unwrap(), None);

        let meta = StagingMeta {
            block_size: 1000,
            file_size: Some(2500),
        };
        meta.save(&path).await.unwrap();
        assert_eq!(StagingMeta::load(&path).await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn corrupt_meta_is_incompatible() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.part.meta");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            StagingMeta::load(&path).await,
            Err(TransferError::IncompatibleResume(_))
        ));
    }

    #[tokio::test]
    async fn append_accumulates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.part");
        std::fs::write(&path, b"abc").unwrap();

        let mut staging = StagingFile::open_append(&path).await.unwrap();
        assert_eq!(staging.len(), 3);
        staging.append(b"def").await.unwrap();
        staging.append(b"").await.unwrap();
        assert_eq!(staging.len(), 6);
        staging.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn finalize_renames_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let paths = StagingPaths::new(dir.path(), "out.bin").unwrap();
        std::fs::write(&paths.staging, b"payload").unwrap();
        std::fs::write(&paths.meta, b"{}").unwrap();

        assert_eq!(finalize(&paths).await.unwrap(), FinalizeOutcome::Renamed);
        assert_eq!(std::fs::read(&paths.final_path).unwrap(), b"payload");
        assert!(!paths.staging.exists());
        assert!(!paths.meta.exists());

        assert_eq!(finalize(&paths).await.unwrap(), FinalizeOutcome::AlreadyFinal);
        assert_eq!(std::fs::read(&paths.final_path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn finalize_without_any_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let paths = StagingPaths::new(dir.path(), "missing.bin").unwrap();
        assert!(matches!(finalize(&paths).await, Err(TransferError::Io(_))));
    }
}
