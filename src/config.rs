//! # Configuration Management
//!
//! Centralized configuration for payment connections.
//!
//! This module provides structured configuration for the packet send loop, the transports
//! that carry packets, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`PAYMENT_STREAM_*`) via `from_env()`
//! - Direct instantiation with defaults
//!
//! ## Timeouts
//! A packet that outlives `packet_timeout` is treated like a rejection without data: the
//! path's capacity is unknown, so the packet amount search narrows.

use crate::core::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{PaymentError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Consecutive `T..` rejections tolerated before the streams in a packet fail
pub const DEFAULT_MAX_TEMPORARY_RETRIES: u32 = 3;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PaymentConfig {
    /// Send loop configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PaymentConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| PaymentError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| PaymentError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| PaymentError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<u64>("PAYMENT_STREAM_PACKET_TIMEOUT_MS") {
            config.connection.packet_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u32>("PAYMENT_STREAM_MAX_TEMPORARY_RETRIES") {
            config.connection.max_temporary_retries = val;
        }

        if let Some(val) = env_parse::<u64>("PAYMENT_STREAM_RETRY_DELAY_MS") {
            config.connection.retry_delay = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("PAYMENT_STREAM_INITIAL_MAX_PACKET_AMOUNT") {
            config.connection.initial_max_packet_amount = Some(val);
        }

        if let Some(val) = env_parse::<usize>("PAYMENT_STREAM_MAX_FRAME_SIZE") {
            config.transport.max_frame_size = val;
        }

        if let Ok(level) = std::env::var("PAYMENT_STREAM_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                PaymentError::ConfigError(format!("Invalid log level: {level}"))
            })?;
        }

        if let Some(val) = env_parse::<bool>("PAYMENT_STREAM_JSON_LOGS") {
            config.logging.json_format = val;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PaymentError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| PaymentError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PaymentError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Send loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Deadline for the reply to a single packet
    #[serde(with = "duration_serde")]
    pub packet_timeout: Duration,

    /// Consecutive temporary rejections before the packet's streams fail
    pub max_temporary_retries: u32,

    /// Pause after a temporary rejection
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,

    /// Cap on the very first packet; unset means the first packet carries everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_max_packet_amount: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            packet_timeout: timeout::DEFAULT_PACKET_TIMEOUT,
            max_temporary_retries: DEFAULT_MAX_TEMPORARY_RETRIES,
            retry_delay: timeout::DEFAULT_RETRY_DELAY,
            initial_max_packet_amount: None,
        }
    }
}

impl ConnectionConfig {
    /// Validate send loop configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.packet_timeout.as_millis() < 10 {
            errors.push("Packet timeout too short (minimum: 10ms)".to_string());
        } else if self.packet_timeout.as_secs() > 300 {
            errors.push("Packet timeout too long (maximum: 300s)".to_string());
        }

        if self.max_temporary_retries > 1000 {
            errors.push(format!(
                "Max temporary retries too large: {} (maximum: 1000)",
                self.max_temporary_retries
            ));
        }

        if self.retry_delay.as_secs() > 60 {
            errors.push("Retry delay too long (maximum: 60s)".to_string());
        }

        if self.initial_max_packet_amount == Some(0) {
            errors.push("Initial max packet amount must be greater than 0".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest frame accepted or produced by the framed transport
    pub max_frame_size: usize,

    /// Loopback exchange rate numerator
    pub exchange_rate_numerator: u64,

    /// Loopback exchange rate denominator
    pub exchange_rate_denominator: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            exchange_rate_numerator: 1,
            exchange_rate_denominator: 1,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 64 {
            errors.push("Max frame size too small (minimum: 64 bytes)".to_string());
        } else if self.max_frame_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum: 16 MB)",
                self.max_frame_size
            ));
        }

        if self.exchange_rate_denominator == 0 {
            errors.push("Exchange rate denominator cannot be 0".to_string());
        }

        if self.exchange_rate_numerator == 0 {
            errors.push("Exchange rate numerator cannot be 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("payment-stream"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
