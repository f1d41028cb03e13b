//! Configuration loading and library root resolution
//!
//! Resolution priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the library root
pub const LIBRARY_ROOT_ENV: &str = "PML_LIBRARY_ROOT";
/// Environment variable naming the config file
pub const CONFIG_FILE_ENV: &str = "PML_CONFIG";

/// Service configuration, loadable from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Folder scanned by the filesystem asset source
    pub library_root: Option<PathBuf>,
    /// Data directory holding the snapshot database
    pub data_dir: Option<PathBuf>,
    /// HTTP bind address
    pub bind: String,
    /// Analysis worker count
    pub workers: usize,
    /// Retry ceiling per analyzer capability
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub retry_base_ms: u64,
    /// Backoff cap (milliseconds)
    pub retry_cap_ms: u64,
    /// Per-invocation capability timeout (milliseconds)
    pub capability_timeout_ms: u64,
    /// EventBus channel capacity
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            library_root: None,
            data_dir: None,
            bind: "127.0.0.1:5741".to_string(),
            workers: 4,
            max_attempts: 3,
            retry_base_ms: 100,
            retry_cap_ms: 5_000,
            capability_timeout_ms: 10_000,
            event_capacity: 1000,
        }
    }
}

impl ServiceConfig {
    /// Load configuration: CLI path override, then env var, then the
    /// platform config file, then compiled defaults.
    pub fn load(cli_config: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_config {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            return Self::from_file(Path::new(&path));
        }
        if let Some(path) = default_config_path() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Effective library root following the priority order
    pub fn resolve_library_root(&self, cli_arg: Option<&str>) -> PathBuf {
        if let Some(path) = cli_arg {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(LIBRARY_ROOT_ENV) {
            return PathBuf::from(path);
        }
        if let Some(root) = &self.library_root {
            return root.clone();
        }
        default_data_dir().join("library")
    }

    /// Effective data directory (snapshot database location)
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Snapshot database path inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.resolve_data_dir().join("pml.db")
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }
}

/// Default configuration file path for the platform
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pml").join("config.toml"))
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("pml"))
        .unwrap_or_else(|| PathBuf::from("./pml_data"))
}
