//! Configuration system for imux.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $IMUX_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/imux/config.toml
//!   3. ~/.config/imux/config.toml
//!
//! The same file serves both binaries: `imuxd` reads `[server]` and
//! `[[users]]`, `imux-ctl` reads `[client]`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuxConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the daemon accepts transport links on.
    pub listen_addr: String,
    /// Destination dialed for tunneled sockets. Empty disables tunneling.
    pub forward_addr: String,
    /// Root directory for file transfers; each session starts here.
    pub storage_path: PathBuf,
    /// Local status API port. 0 disables the API.
    pub api_port: u16,
    pub keypair_path: PathBuf,
    /// Out-of-order chunks held per socket before the gap is declared fatal.
    pub reorder_limit: usize,
    /// Read buffer for destinations before any chunk size was observed.
    pub default_chunk_size: usize,
    /// Delay before answering a failed login.
    pub auth_failure_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub keypair_path: PathBuf,
    pub known_hosts_path: PathBuf,
    /// Default `--networks` value.
    pub networks: String,
    pub chunk_size: usize,
    pub resume: bool,
    pub reorder_limit: usize,
}

/// A login the daemon accepts. The password is stored as a BLAKE3 hex digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub password_blake3: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4430".to_string(),
            forward_addr: String::new(),
            storage_path: data_dir().join("files"),
            api_port: 9101,
            keypair_path: config_dir().join("server.key"),
            reorder_limit: 1024,
            default_chunk_size: 5 * 1024 * 1024,
            auth_failure_delay_secs: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("client.key"),
            known_hosts_path: config_dir().join("known_hosts"),
            networks: "0.0.0.0:8".to_string(),
            chunk_size: 5 * 1024 * 1024,
            resume: true,
            reorder_limit: 1024,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("imux")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local").join("share"))
        .join("imux")
}

fn home_dir() -> PathBuf {
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
    #[error("invalid network spec {0:?}: {1}")]
    BadNetworkSpec(String, &'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ImuxConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            ImuxConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("IMUX_CONFIG")
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
            let text = toml::to_string_pretty(&ImuxConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Look up a user entry by name.
    pub fn user(&self, name: &str) -> Option<&UserEntry> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Apply IMUX_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("IMUX_SERVER__LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = std::env::var("IMUX_SERVER__FORWARD_ADDR") {
            self.server.forward_addr = v;
        }
        if let Ok(v) = std::env::var("IMUX_SERVER__STORAGE_PATH") {
            self.server.storage_path = PathBuf::from(v);
        }
        if let Some(p) = env_parse("IMUX_SERVER__API_PORT") {
            self.server.api_port = p;
        }
        if let Some(n) = env_parse("IMUX_SERVER__REORDER_LIMIT") {
            self.server.reorder_limit = n;
        }
        if let Ok(v) = std::env::var("IMUX_CLIENT__NETWORKS") {
            self.client.networks = v;
        }
        if let Some(n) = env_parse("IMUX_CLIENT__CHUNK_SIZE") {
            self.client.chunk_size = n;
        }
        if let Ok(v) = std::env::var("IMUX_CLIENT__RESUME") {
            self.client.resume = v == "true" || v == "1";
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ── Network spec ──────────────────────────────────────────────────────────────

/// One `<bind>:<count>` entry of a pool description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    pub bind: IpAddr,
    pub count: usize,
}

/// Which local addresses to dial the pool from, and how many links each.
///
/// Format: `<bind>:<count>[;<bind>:<count>...]`, e.g. `0.0.0.0:8` or
/// `10.0.0.2:4;10.0.1.2:4`. IPv6 binds may be bracketed: `[::]:4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub entries: Vec<NetworkEntry>,
}

impl NetworkSpec {
    /// Total number of links this spec asks for.
    pub fn total(&self) -> usize {
        self.entries.iter().map(|e| e.count).sum()
    }
}

impl FromStr for NetworkSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why| ConfigError::BadNetworkSpec(s.to_string(), why);
        let mut entries = Vec::new();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (bind, count) = part.rsplit_once(':').ok_or_else(|| bad("missing ':<count>'"))?;
            let bind = bind.trim_start_matches('[').trim_end_matches(']');
            let bind: IpAddr = bind.parse().map_err(|_| bad("bad bind address"))?;
            let count: usize = count.parse().map_err(|_| bad("bad link count"))?;
            if count == 0 {
                return Err(bad("link count must be positive"));
            }
            entries.push(NetworkEntry { bind, count });
        }
        if entries.is_empty() {
            return Err(bad("no entries"));
        }
        Ok(Self { entries })
    }
}
