//! Configuration system for Dialtone.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DIALTONE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/dialtone/config.toml
//!   3. ~/.config/dialtone/config.toml
//!
//! The protocol core never reads this directly. The daemon converts the
//! relevant sections into plain limit structs at construction time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DialtoneConfig {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub transfer: TransferConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the client listener binds, e.g. "0.0.0.0:5190".
    pub listen_addr: String,
    /// Loopback port for the admin HTTP API.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Chunks sent per pacer drain pass.
    pub max_burst: usize,
    /// Max DATA payload per frame (token + stream id + data).
    pub max_frame_payload: usize,
    /// Frames that may sit in the socket writer queue before the pacer holds off.
    pub outbound_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Largest file accepted or served, in bytes.
    pub max_file_size: u64,
    /// Seconds without client activity before a transfer fails.
    pub inactivity_timeout_secs: u64,
    /// Root directory of the file store.
    pub storage_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Screen names allowed to sign on. Empty = any.
    pub screen_names: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5190".to_string(),
            api_port: 5191,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_burst: 16,
            max_frame_payload: crate::wire::DEFAULT_MAX_FRAME_PAYLOAD,
            outbound_window: 32,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_file_size: 2 * 1024 * 1024, // 2 MB
            inactivity_timeout_secs: 30,
            storage_path: data_dir().join("files"),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            screen_names: Vec::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("dialtone")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("dialtone")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DialtoneConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            DialtoneConfig::default()
        };
        config.apply_env_overrides(|k| std::env::var(k).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DIALTONE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DialtoneConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply DIALTONE_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DIALTONE_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(p) = lookup("DIALTONE_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(n) = lookup("DIALTONE_TRANSPORT__MAX_BURST").and_then(|v| v.parse().ok()) {
            self.transport.max_burst = n;
        }
        if let Some(n) =
            lookup("DIALTONE_TRANSPORT__MAX_FRAME_PAYLOAD").and_then(|v| v.parse().ok())
        {
            self.transport.max_frame_payload = n;
        }
        if let Some(n) = lookup("DIALTONE_TRANSFER__MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
            self.transfer.max_file_size = n;
        }
        if let Some(n) =
            lookup("DIALTONE_TRANSFER__INACTIVITY_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.transfer.inactivity_timeout_secs = n;
        }
        if let Some(v) = lookup("DIALTONE_TRANSFER__STORAGE_PATH") {
            self.transfer.storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DIALTONE_DIRECTORY__SCREEN_NAMES") {
            self.directory.screen_names = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}
