//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `tandem` binary)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::Role;
use crate::error::{Result, TandemError};
use crate::transport::{IceServer, RtcConfiguration, DEFAULT_STUN_URL};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Negotiation engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Transaction configuration
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| TandemError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| TandemError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Engine settings
        if let Ok(val) = std::env::var("TANDEM_AUTO_CONNECT") {
            if let Ok(val) = val.parse() {
                config.engine.auto_connect = val;
            }
        }
        if let Ok(val) = std::env::var("TANDEM_ROLE") {
            config.engine.role = Role::parse(&val);
        }
        if let Ok(val) = std::env::var("TANDEM_WAIT_ONLINE") {
            if let Ok(val) = val.parse() {
                config.engine.wait_online_on_reconnection = val;
            }
        }
        if let Ok(urls) = std::env::var("TANDEM_ICE_SERVERS") {
            config.engine.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::new)
                .collect();
        }

        // Transfer settings
        if let Ok(val) = std::env::var("TANDEM_CHUNK_SIZE") {
            if let Ok(val) = val.parse() {
                config.transfer.chunk_size = val;
            }
        }

        config
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TandemError::Config(format!("Failed to serialize config: {e}")))
    }
}

/// Negotiation engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Start negotiating as soon as the engine is created
    #[serde(alias = "autoConnect")]
    pub auto_connect: bool,

    /// Extra ICE servers (the public STUN server is always included)
    #[serde(alias = "iceServers")]
    pub ice_servers: Vec<IceServer>,

    /// Fixed role; `None` runs the role-assignment protocol
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// On failure, wait for the network to come back before restarting ICE
    #[serde(alias = "waitOnlineOnReconnection")]
    pub wait_online_on_reconnection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            ice_servers: Vec::new(),
            role: None,
            wait_online_on_reconnection: true,
        }
    }
}

impl EngineConfig {
    /// Transport configuration: the public STUN server, then `ice_servers`
    pub fn rtc_configuration(&self) -> RtcConfiguration {
        let mut ice_servers = vec![IceServer::new(DEFAULT_STUN_URL)];
        ice_servers.extend(self.ice_servers.iter().cloned());
        RtcConfiguration { ice_servers }
    }
}

/// Transaction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Writer chunk size in bytes
    pub chunk_size: usize,

    /// Reader queue high-water mark in bytes
    pub reader_high_water_mark: usize,

    /// Interval between progress reports
    pub report_interval_ms: u64,

    /// Delay after the first processed byte before rate samples are trusted
    pub rate_warmup_ms: u64,

    /// Low-pass filter time constant of the rate estimator
    pub history_time_constant_secs: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200 * 1024,                   // 200 KiB
            reader_high_water_mark: 10 * 1024 * 1024, // 10 MiB
            report_interval_ms: 500,
            rate_warmup_ms: 1000,
            history_time_constant_secs: 10.0,
        }
    }
}
