//! Configuration system for tblsync.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TBLSYNC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tblsync/config.toml
//!   3. ~/.config/tblsync/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::peers::{PeerSpec, DYNAMIC_PEERS};

/// Default UDP port for gossip traffic.
pub const DEFAULT_SYNC_PORT: u16 = 8484;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TblSyncConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub firewall: FirewallConfig,
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port, bound on all interfaces.
    pub port: u16,
    /// `host[:port]` peers, or `["OSPF-PEERS"]` for neighbor discovery.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding the host table.
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Push table membership to the packet filter. Off = log only.
    pub enabled: bool,
    /// Command prefix used to run pfctl.
    pub pfctl: Vec<String>,
    /// Log every table on export, not just ones with changes.
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub peer_refresh_secs: u64,
    pub full_resync_secs: u64,
    pub local_refresh_secs: u64,
    /// Upper bound on a single socket wait.
    pub poll_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SYNC_PORT,
            peers: vec![DYNAMIC_PEERS.to_string()],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("hosts.json"),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pfctl: vec!["/usr/bin/doas".to_string(), "/sbin/pfctl".to_string()],
            debug: false,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            peer_refresh_secs: 30,
            full_resync_secs: 60,
            local_refresh_secs: 10,
            poll_timeout_secs: 5,
        }
    }
}

impl NetworkConfig {
    pub fn peer_spec(&self) -> PeerSpec {
        PeerSpec::parse(&self.peers, self.port)
    }
}

impl TimerConfig {
    pub fn peer_refresh(&self) -> Duration {
        Duration::from_secs(self.peer_refresh_secs)
    }

    pub fn full_resync(&self) -> Duration {
        Duration::from_secs(self.full_resync_secs)
    }

    pub fn local_refresh(&self) -> Duration {
        Duration::from_secs(self.local_refresh_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tblsync")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tblsync")
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

impl TblSyncConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TblSyncConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TBLSYNC_CONFIG")
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
            let text = toml::to_string_pretty(&TblSyncConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TBLSYNC_* overrides from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TBLSYNC_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Some(v) = lookup("TBLSYNC_NETWORK__PEERS") {
            self.network.peers = vec![v];
        }
        if let Some(v) = lookup("TBLSYNC_STORAGE__DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TBLSYNC_FIREWALL__ENABLED") {
            self.firewall.enabled = v == "true" || v == "1";
        }
    }
}
