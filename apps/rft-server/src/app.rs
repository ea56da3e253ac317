//! Application orchestrator: wires catalog, receiver and listener together.

use std::sync::Arc;
use std::time::Duration;

use rft_catalog::{Catalog, HttpCatalog, MemoryCatalog};
use rft_data_channel::UploadServer;
use rft_transfer::Receiver;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the receiver until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    tokio::fs::create_dir_all(&config.storage_root).await?;

    // -- Catalog --
    let catalog = build_catalog(&config).await?;

    // -- Upload listener --
    let receiver =
        Receiver::new(catalog, &config.storage_root).with_max_block_size(config.max_block_size);
    let server = UploadServer::new(receiver, config.window, cancel.clone());
    let listener = UploadServer::bind(&config.listen_addr).await?;

    let server_task = tokio::spawn(async move { server.serve(listener).await });

    tracing::info!(window = config.window, "receiver ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = cancel.cancelled() => {}
    }

    // In-flight sessions observe the cancellation and pause.
    cancel.cancel();
    server_task.await??;
    Ok(())
}

async fn build_catalog(config: &Config) -> anyhow::Result<Arc<dyn Catalog>> {
    if config.catalog_url.is_empty() {
        tracing::warn!("no catalog_url configured, using in-process catalog");
        return Ok(Arc::new(MemoryCatalog::new()));
    }

    let catalog = HttpCatalog::new(
        &config.catalog_url,
        Duration::from_secs(config.catalog_timeout_secs),
    )?;
    if config.verify_storage {
        let root = config.storage_root.to_string_lossy();
        catalog.verify_storage(&config.admin_key, &root).await?;
        tracing::info!(storage = %root, "catalog storage verified");
    }
    tracing::info!(url = %config.catalog_url, "using catalog service");
    Ok(Arc::new(catalog))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_url_uses_memory_catalog() {
        let catalog = build_catalog(&Config::default()).await.unwrap();
        let request = rft_protocol::TransferRequest::new("key", "a.bin");
        assert_eq!(catalog.resolve_path(&request).await.unwrap(), "a.bin");
    }

    #[tokio::test]
    async fn unreachable_catalog_fails_verification() {
        let config = Config {
            catalog_url: "http://127.0.0.1:1".into(),
            verify_storage: true,
            catalog_timeout_secs: 2,
            ..Config::default()
        };
        assert!(build_catalog(&config).await.is_err());
    }
}
