use std::sync::Arc;

use rft_catalog::Catalog;
use rft_protocol::LifecycleStatus;

use crate::TransferError;

/// Reports one session's lifecycle transitions to the catalog.
#[derive(Clone)]
pub struct LifecycleSync {
    catalog: Arc<dyn Catalog>,
    api_key: String,
    path: String,
}

impl LifecycleSync {
    pub fn new(catalog: Arc<dyn Catalog>, api_key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            catalog,
            api_key: api_key.into(),
            path: path.into(),
        }
    }

    /// Records `status`; a failure aborts the session.
    ///
    /// Used at session start, before any bytes are accepted.
    pub async fn require(&self, status: LifecycleStatus) -> Result<(), TransferError> {
        self.catalog
            .set_status(&self.api_key, &self.path, status)
            .await?;
        tracing::debug!("catalog status for {}: {status}", self.path);
        Ok(())
    }

    /// Records `status`; a failure is logged and otherwise ignored.
    ///
    /// Used at terminal points where the transfer outcome is already decided.
    pub async fn report(&self, status: LifecycleStatus) -> bool {
        match self
            .catalog
            .set_status(&self.api_key, &self.path, status)
            .await
        {
            Ok(()) => {
                tracing::debug!("catalog status for {}: {status}", self.path);
                true
            }
            Err(e) => {
                tracing::warn!("failed to record {status} for {}: {e}", self.path);
                false
            }
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rft_catalog::MemoryCatalog;

    #[tokio::test]
    async fn require_propagates_failure() {
        let catalog = Arc::new(MemoryCatalog::new());
        let sync = LifecycleSync::new(catalog.clone(), "key", "plant/a.bin");

        sync.require(LifecycleStatus::Resumed).await.unwrap();
        assert_eq!(catalog.status("plant/a.bin"), Some(LifecycleStatus::Resumed));

        catalog.set_fail_status_updates(true);
        assert!(matches!(
            sync.require(LifecycleStatus::Resumed).await,
            Err(TransferError::CatalogUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn report_swallows_failure() {
        let catalog = Arc::new(MemoryCatalog::new());
        let sync = LifecycleSync::new(catalog.clone(), "key", "plant/a.bin");

        assert!(sync.report(LifecycleStatus::Uploaded).await);
        catalog.set_fail_status_updates(true);
        assert!(!sync.report(LifecycleStatus::Paused).await);
        assert_eq!(catalog.status("plant/a.bin"), Some(LifecycleStatus::Uploaded));
    }
}
