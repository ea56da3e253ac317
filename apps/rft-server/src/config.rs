//! Receiver configuration.
//!
//! Stored as TOML at `$RFT_SERVER_CONFIG`, or by default:
//! - Linux: `~/.config/rft/server.toml`
//! - Windows: `%APPDATA%/rft/server.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "RFT_SERVER_CONFIG";

/// Receiver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Address the upload listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory holding final and staging artifacts.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Catalog service base URL. Empty runs with an in-process catalog.
    #[serde(default)]
    pub catalog_url: String,

    /// Key for catalog admin endpoints.
    #[serde(default)]
    pub admin_key: String,

    /// Check at startup that the catalog stores files under `storage_root`.
    #[serde(default)]
    pub verify_storage: bool,

    /// Chunks a sender may have in flight.
    #[serde(default = "default_window")]
    pub window: u32,

    /// Largest block size accepted in a handshake.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u32,

    /// Catalog request timeout in seconds.
    #[serde(default = "default_catalog_timeout")]
    pub catalog_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", rft_data_channel::DEFAULT_PORT)
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/srv/rft")
}

fn default_window() -> u32 {
    rft_protocol::DEFAULT_WINDOW
}

fn default_max_block_size() -> u32 {
    rft_transfer::DEFAULT_MAX_BLOCK_SIZE
}

fn default_catalog_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_root: default_storage_root(),
            catalog_url: String::new(),
            admin_key: String::new(),
            verify_storage: false,
            window: default_window(),
            max_block_size: default_max_block_size(),
            catalog_timeout_secs: default_catalog_timeout(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.window > 0, "window must be at least 1");
        anyhow::ensure!(self.max_block_size > 0, "max_block_size must be positive");
        anyhow::ensure!(
            self.max_block_size <= rft_protocol::wire::MAX_BLOCK_SIZE,
            "max_block_size exceeds the wire limit of {} bytes",
            rft_protocol::wire::MAX_BLOCK_SIZE
        );
        anyhow::ensure!(
            !self.verify_storage || !self.catalog_url.is_empty(),
            "verify_storage requires catalog_url"
        );
        Ok(())
    }
}

/// Returns the configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("rft").join("server.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("rft")
            .join("server.toml"))
    }
}
