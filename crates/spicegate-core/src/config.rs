//! Configuration system for spicegate.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SPICEGATE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/spicegate/config.toml
//!   3. ~/.config/spicegate/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpicegateConfig {
    pub network: NetworkConfig,
    pub handshake: HandshakeConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address tenants connect to.
    pub listen_addr: String,
    /// Local HTTP status API port. 0 = disabled.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Deadline for each single handshake step (one read, one write or one
    /// connect). A stalled peer fails its own handshake after this long.
    pub step_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Register the SPICE ticket authenticator.
    pub spice: bool,
    /// Passwords accepted for new sessions and where they lead.
    pub tickets: Vec<TicketEntry>,
}

/// One accepted ticket for a brand-new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketEntry {
    pub password: String,
    /// Compute host address, `host:port`.
    pub destination: String,
    /// Password presented to the compute host. Defaults to `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5900".to_string(),
            api_port: 9190,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 5,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            spice: true,
            tickets: Vec::new(),
        }
    }
}

impl HandshakeConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("spicegate")
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

impl SpicegateConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::file_path())
    }

    /// Load from an explicit path, still applying env overrides.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SpicegateConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SPICEGATE_CONFIG")
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
            let text = toml::to_string_pretty(&SpicegateConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SPICEGATE_* overrides, reading variables through `var`.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SPICEGATE_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = var("SPICEGATE_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Some(v) = var("SPICEGATE_HANDSHAKE__STEP_TIMEOUT_SECS") {
            if let Ok(s) = v.parse() {
                self.handshake.step_timeout_secs = s;
            }
        }
        if let Some(v) = var("SPICEGATE_AUTH__SPICE") {
            self.auth.spice = v == "true" || v == "1";
        }
    }
}
