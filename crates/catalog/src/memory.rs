//! In-process catalog.
//!
//! Resolves paths as `[directory/][savepoint/]fileName`, records every
//! call, and can be switched into failure modes. Used by the receiver in
//! offline mode and as the catalog double in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use rft_protocol::{LifecycleStatus, TransferRequest};

use crate::{Catalog, CatalogError, CatalogFuture};

/// A call observed by [`MemoryCatalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    Resolved { path: String, resume: bool },
    Created { path: String, file_size: Option<u64> },
    Status { path: String, status: LifecycleStatus },
}

#[derive(Default)]
struct Inner {
    events: Vec<CatalogEvent>,
    statuses: HashMap<String, LifecycleStatus>,
    unavailable: bool,
    fail_status_updates: bool,
}

/// Catalog kept entirely in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`CatalogError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Makes only `set_status` calls fail.
    pub fn set_fail_status_updates(&self, fail: bool) {
        self.lock().fail_status_updates = fail;
    }

    /// All calls observed so far, in order.
    pub fn events(&self) -> Vec<CatalogEvent> {
        self.lock().events.clone()
    }

    /// Lifecycle statuses recorded for `path`, in order.
    ///
    /// Entry creation counts as [`LifecycleStatus::Initiated`].
    pub fn history(&self, path: &str) -> Vec<LifecycleStatus> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                CatalogEvent::Created { path: p, .. } if p == path => {
                    Some(LifecycleStatus::Initiated)
                }
                CatalogEvent::Status { path: p, status } if p == path => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Latest status recorded for `path`.
    pub fn status(&self, path: &str) -> Option<LifecycleStatus> {
        self.lock().statuses.get(path).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(inner: &Inner) -> Result<(), CatalogError> {
        if inner.unavailable {
            return Err(CatalogError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

/// Builds the logical storage path for a request.
pub fn logical_path(request: &TransferRequest) -> String {
    [
        request.directory.as_deref(),
        request.savepoint.as_deref(),
        Some(request.file_name.as_str()),
    ]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
    .map(|s| s.trim_matches('/'))
    .collect::<Vec<_>>()
    .join("/")
}

impl Catalog for MemoryCatalog {
    fn resolve_path<'a>(&'a self, request: &'a TransferRequest) -> CatalogFuture<'a, String> {
        Box::pin(async move {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            let path = logical_path(request);
            inner.events.push(CatalogEvent::Resolved {
                path: path.clone(),
                resume: request.resume,
            });
            Ok(path)
        })
    }

    fn create_entry<'a>(&'a self, request: &'a TransferRequest) -> CatalogFuture<'a, String> {
        Box::pin(async move {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            let path = logical_path(request);
            inner.events.push(CatalogEvent::Created {
                path: path.clone(),
                file_size: request.file_size,
            });
            inner
                .statuses
                .insert(path.clone(), LifecycleStatus::Initiated);
            Ok(uuid::Uuid::new_v4().to_string())
        })
    }

    fn set_status<'a>(
        &'a self,
        _api_key: &'a str,
        path: &'a str,
        status: LifecycleStatus,
    ) -> CatalogFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            if inner.fail_status_updates {
                return Err(CatalogError::Unavailable("status endpoint down".into()));
            }
            inner.events.push(CatalogEvent::Status {
                path: path.to_string(),
                status,
            });
            inner.statuses.insert(path.to_string(), status);
            Ok(())
        })
    }
}
