//! # Configuration Management Module
//!
//! TOML configuration for the chat client.
//!
//! ## Configuration Structure
//!
//! - [`DeviceConfig`] - which radio to connect to and how often to poll it
//! - [`StorageConfig`] - where the message cache lives and the text byte budget
//! - [`DeliveryConfig`] - direct-message retry ceiling and ack safety margin
//! - [`ReconnectConfig`] - exponential backoff for the device link
//! - [`ResponderConfig`] - optional auto-responder
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! target = "C2:4F:11:9A:00:01"
//! connect_timeout_ms = 15000
//! poll_interval_ms = 10000
//!
//! [storage]
//! cache_file = "messages.json"
//! max_message_bytes = 200
//!
//! [delivery]
//! max_retries = 2
//! ack_margin_ms = 3000
//!
//! [reconnect]
//! base_delay_ms = 2000
//! max_delay_ms = 30000
//!
//! [logging]
//! level = "info"
//! file = "meshchat.log"
//! ```
//!
//! Tunables are optional; anything left out falls back to the built-in policy.
//! Out-of-range values are clamped with a warning rather than rejected.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::delivery::DeliveryPolicy;
use crate::supervisor::BackoffPolicy;
use crate::validation::MAX_TEXT_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Connect target handed to the transport (BLE address, serial path, host:port).
    pub target: String,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Mailbox poll interval while connected. Push notifications trigger a pass regardless.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Connect immediately on start.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub cache_file: String,
    /// Outbound text budget in UTF-8 bytes. Never above the 200-byte frame limit.
    #[serde(default)]
    pub max_message_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeliveryConfig {
    /// Extra attempts after the first for an unacknowledged direct message.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Added to the device's own timeout estimate before a send counts as lost.
    #[serde(default)]
    pub ack_margin_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    pub enabled: bool,
    /// Also answer channel traffic, not only direct messages.
    #[serde(default)]
    pub reply_to_channels: bool,
    /// Reply text used by the built-in canned responder.
    #[serde(default)]
    pub canned_reply: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reply_to_channels: false,
            canned_reply: "Away from the radio; will reply later.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
const MIN_CONNECT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
const MIN_POLL_INTERVAL_MS: u64 = 1_000;
const MAX_RETRIES_CEILING: u32 = 5;

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        let mut ms = self
            .device
            .connect_timeout_ms
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if ms < MIN_CONNECT_TIMEOUT_MS {
            warn!(
                "Configured connect_timeout_ms={}ms is below {}ms; clamping",
                ms, MIN_CONNECT_TIMEOUT_MS
            );
            ms = MIN_CONNECT_TIMEOUT_MS;
        }
        Duration::from_millis(ms)
    }

    pub fn poll_interval(&self) -> Duration {
        let mut ms = self
            .device
            .poll_interval_ms
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if ms < MIN_POLL_INTERVAL_MS {
            warn!(
                "Configured poll_interval_ms={}ms is below {}ms; clamping",
                ms, MIN_POLL_INTERVAL_MS
            );
            ms = MIN_POLL_INTERVAL_MS;
        }
        Duration::from_millis(ms)
    }

    pub fn max_message_bytes(&self) -> usize {
        match self.storage.max_message_bytes {
            Some(0) | None => MAX_TEXT_BYTES,
            Some(n) if n > MAX_TEXT_BYTES => {
                warn!(
                    "Configured max_message_bytes={} exceeds the {}-byte frame limit; clamping",
                    n, MAX_TEXT_BYTES
                );
                MAX_TEXT_BYTES
            }
            Some(n) => n,
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        let mut policy = DeliveryPolicy::default();
        if let Some(retries) = self.delivery.max_retries {
            if retries > MAX_RETRIES_CEILING {
                warn!(
                    "Configured max_retries={} is above {}; clamping",
                    retries, MAX_RETRIES_CEILING
                );
            }
            policy.max_retries = retries.min(MAX_RETRIES_CEILING);
        }
        if let Some(margin) = self.delivery.ack_margin_ms {
            policy.ack_margin = Duration::from_millis(margin);
        }
        policy
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let mut policy = BackoffPolicy::default();
        if let Some(base) = self.reconnect.base_delay_ms.filter(|b| *b > 0) {
            policy.base = Duration::from_millis(base);
        }
        if let Some(cap) = self.reconnect.max_delay_ms.filter(|c| *c > 0) {
            policy.cap = Duration::from_millis(cap);
        }
        if policy.cap < policy.base {
            warn!(
                "Configured reconnect max_delay_ms={:?} is below base_delay_ms={:?}; raising cap",
                policy.cap, policy.base
            );
            policy.cap = policy.base;
        }
        policy
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig {
                target: String::new(),
                connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
                poll_interval_ms: Some(DEFAULT_POLL_INTERVAL_MS),
                auto_connect: true,
            },
            storage: StorageConfig {
                cache_file: "messages.json".to_string(),
                max_message_bytes: Some(MAX_TEXT_BYTES),
            },
            delivery: DeliveryConfig {
                max_retries: Some(2),
                ack_margin_ms: Some(3000),
            },
            reconnect: ReconnectConfig {
                base_delay_ms: Some(2000),
                max_delay_ms: Some(30000),
            },
            responder: ResponderConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshchat.log".to_string()),
            },
        }
    }
}
