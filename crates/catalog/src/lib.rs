//! Catalog service collaborator.
//!
//! The receiver consults the catalog at session boundaries only: to
//! resolve a logical upload to a storage path, to register a fresh entry,
//! and to record lifecycle transitions. [`Catalog`] is the narrow
//! capability set the transfer core depends on; [`HttpCatalog`] talks to
//! the real service and [`MemoryCatalog`] is an in-process stand-in.

pub mod http;
pub mod memory;

pub use http::HttpCatalog;
pub use memory::{CatalogEvent, MemoryCatalog, logical_path};

use std::future::Future;
use std::pin::Pin;

use rft_protocol::{LifecycleStatus, TransferRequest};

/// Errors produced by catalog calls.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog is not running: {0}")]
    Unavailable(String),

    #[error("catalog rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("catalog storage mismatch: {0}")]
    StorageMismatch(String),

    #[error("invalid catalog response: {0}")]
    InvalidResponse(String),
}

/// A boxed future returned by catalog methods.
pub type CatalogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CatalogError>> + Send + 'a>>;

/// Capabilities the transfer core needs from the catalog service.
pub trait Catalog: Send + Sync + 'static {
    /// Maps the request's logical identity to a storage path relative to
    /// the receiver's storage root.
    fn resolve_path<'a>(&'a self, request: &'a TransferRequest) -> CatalogFuture<'a, String>;

    /// Registers a new entry for a fresh (non-resumed) upload.
    ///
    /// Returns the catalog's external reference for the entry. A created
    /// entry starts in [`LifecycleStatus::Initiated`].
    fn create_entry<'a>(&'a self, request: &'a TransferRequest) -> CatalogFuture<'a, String>;

    /// Records a lifecycle transition for the upload at `path`.
    fn set_status<'a>(
        &'a self,
        api_key: &'a str,
        path: &'a str,
        status: LifecycleStatus,
    ) -> CatalogFuture<'a, ()>;
}
