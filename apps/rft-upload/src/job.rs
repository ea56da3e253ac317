//! Upload job file.
//!
//! A TOML document naming the receiver, the local source file, and the
//! request fields sent in the handshake:
//!
//! ```toml
//! server_addr = "ingest.example:8765"
//! source = "/data/scan-0042.tif"
//! api_key = "..."
//! file_name = "scan-0042.tif"
//! directory = "plant-a"
//! block_size = 65536
//! resume = true
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rft_protocol::TransferRequest;
use serde::Deserialize;

/// One upload to perform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Job {
    /// Receiver address (`host:port`).
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Local file to upload.
    pub source: PathBuf,

    #[serde(flatten)]
    pub request: TransferRequest,
}

fn default_server_addr() -> String {
    format!("127.0.0.1:{}", rft_data_channel::DEFAULT_PORT)
}

impl Job {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading job file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let job: Job = toml::from_str(content)?;
        anyhow::ensure!(!job.request.file_name.is_empty(), "file_name must not be empty");
        anyhow::ensure!(job.request.block_size > 0, "block_size must be positive");
        Ok(job)
    }

    /// Resolves `server_addr` to a socket address.
    pub async fn resolve_addr(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host(&self.server_addr)
            .await
            .with_context(|| format!("resolving {}", self.server_addr))?
            .next()
            .with_context(|| format!("{} resolved to no address", self.server_addr))
    }
}
