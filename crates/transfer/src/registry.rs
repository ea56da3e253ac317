use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::TransferError;

/// Tracks which final paths have a session writing to them.
///
/// Cloning shares the same set.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for a new session.
    ///
    /// Fails with [`TransferError::SessionConflict`] if another session holds
    /// it. The claim is released when the returned guard is dropped.
    pub fn register(&self, path: &Path) -> Result<SessionGuard, TransferError> {
        if !self.lock().insert(path.to_path_buf()) {
            return Err(TransferError::SessionConflict(path.display().to_string()));
        }
        Ok(SessionGuard {
            registry: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive claim on a path; released on drop.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    path: PathBuf,
}

impl SessionGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_conflicts() {
        let registry = SessionRegistry::new();
        let path = Path::new("/srv/plant/scan.bin");

        let guard = registry.register(path).unwrap();
        assert!(registry.is_active(path));
        assert!(matches!(
            registry.register(path),
            Err(TransferError::SessionConflict(_))
        ));
        assert_eq!(guard.path(), path);
    }

    #[test]
    fn drop_releases_claim() {
        let registry = SessionRegistry::new();
        let path = Path::new("/srv/a.bin");
        {
            let _guard = registry.register(path).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
        assert!(registry.register(path).is_ok());
    }

    #[test]
    fn distinct_paths_coexist() {
        let registry = SessionRegistry::new();
        let _a = registry.register(Path::new("/srv/a.bin")).unwrap();
        let _b = registry.register(Path::new("/srv/b.bin")).unwrap();
        assert_eq!(registry.len(), 2);
    }
}
