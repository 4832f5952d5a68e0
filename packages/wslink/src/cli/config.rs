//! Configuration module
//!
//! Handles loading and saving the client configuration as TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::codec::DecodeMode;
use crate::connection::manager::ManagerOptions;

/// Main configuration structure for wslink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Batch session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket URL to connect to
    #[serde(default = "default_url")]
    pub url: String,

    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Closing handshake timeout in seconds
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,

    /// Reason sent with the close frame
    #[serde(default = "default_close_reason")]
    pub close_reason: String,

    /// Buffered messages per subscriber stream
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Inbound decoding (strict, lenient)
    #[serde(default)]
    pub decode_mode: DecodeMode,
}

/// Batch session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Batch identifier announced once the connection opens
    #[serde(default = "default_id_batch")]
    pub id_batch: String,

    /// Key the batch identifier is sent under
    #[serde(default = "default_batch_key")]
    pub batch_key: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_url() -> String {
    "ws://localhost:8081/ws-match".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_close_timeout() -> u64 {
    5
}

fn default_close_reason() -> String {
    "Client closing".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

fn default_id_batch() -> String {
    "12345".to_string()
}

fn default_batch_key() -> String {
    "idBatch".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_secs: default_connect_timeout(),
            close_timeout_secs: default_close_timeout(),
            close_reason: default_close_reason(),
            channel_capacity: default_channel_capacity(),
            decode_mode: DecodeMode::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id_batch: default_id_batch(),
            batch_key: default_batch_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ConnectionConfig {
    /// Manager options described by this section
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            close_reason: self.close_reason.clone(),
            channel_capacity: self.channel_capacity.max(1),
            decode_mode: self.decode_mode,
        }
    }
}

impl SessionConfig {
    /// The `{ <batch_key>: <id_batch> }` announcement
    pub fn announcement(&self) -> serde_json::Value {
        let mut fields = serde_json::Map::new();
        fields.insert(
            self.batch_key.clone(),
            serde_json::Value::String(self.id_batch.clone()),
        );
        serde_json::Value::Object(fields)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default_config())
        }
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}
