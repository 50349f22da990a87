//! Hub and server configuration
//!
//! Both configs can be built from defaults or loaded from `REALTIME_*`
//! environment variables, and validated before use.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn validation_failed<T: Into<String>>(message: T) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Where a configuration value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    EnvVar(String),
    Default(String),
}

/// Default configuration values
pub struct HubDefaults;

impl HubDefaults {
    pub const SEND_QUEUE_CAPACITY: usize = 256;
    pub const DISPATCH_QUEUE_CAPACITY: usize = 256;
    pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;
    pub const WRITE_TIMEOUT_SECS: u64 = 10;
    pub const PING_INTERVAL_SECS: u64 = 54;
    pub const STALE_AFTER_SECS: u64 = 90;
    pub const SWEEP_INTERVAL_SECS: u64 = 30;
    pub const COALESCE_WRITES: bool = true;
}

/// Hub and per-client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Capacity of each client's outbound queue
    pub send_queue_capacity: usize,
    /// Capacity of the hub's internal broadcast queue
    pub dispatch_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Deadline for a single outbound write
    pub write_timeout_secs: u64,
    /// Interval between liveness probes on an idle connection
    pub ping_interval_secs: u64,
    /// A client silent for longer than this is considered dead
    pub stale_after_secs: u64,
    /// How often the hub sweeps for stale clients
    pub sweep_interval_secs: u64,
    /// Flush messages queued during a write as one batch, one frame each
    pub coalesce_writes: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: HubDefaults::SEND_QUEUE_CAPACITY,
            dispatch_queue_capacity: HubDefaults::DISPATCH_QUEUE_CAPACITY,
            max_message_size: HubDefaults::MAX_MESSAGE_SIZE,
            write_timeout_secs: HubDefaults::WRITE_TIMEOUT_SECS,
            ping_interval_secs: HubDefaults::PING_INTERVAL_SECS,
            stale_after_secs: HubDefaults::STALE_AFTER_SECS,
            sweep_interval_secs: HubDefaults::SWEEP_INTERVAL_SECS,
            coalesce_writes: HubDefaults::COALESCE_WRITES,
        }
    }
}

impl HubConfig {
    /// Load from `REALTIME_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            send_queue_capacity: env_or(
                "REALTIME_SEND_QUEUE_CAPACITY",
                HubDefaults::SEND_QUEUE_CAPACITY,
                "a positive number of messages",
            )?,
            dispatch_queue_capacity: env_or(
                "REALTIME_DISPATCH_QUEUE_CAPACITY",
                HubDefaults::DISPATCH_QUEUE_CAPACITY,
                "a positive number of messages",
            )?,
            max_message_size: env_or(
                "REALTIME_MAX_MESSAGE_SIZE",
                HubDefaults::MAX_MESSAGE_SIZE,
                "valid number of bytes",
            )?,
            write_timeout_secs: env_or(
                "REALTIME_WRITE_TIMEOUT",
                HubDefaults::WRITE_TIMEOUT_SECS,
                "valid number of seconds",
            )?,
            ping_interval_secs: env_or(
                "REALTIME_PING_INTERVAL",
                HubDefaults::PING_INTERVAL_SECS,
                "valid number of seconds",
            )?,
            stale_after_secs: env_or(
                "REALTIME_STALE_AFTER",
                HubDefaults::STALE_AFTER_SECS,
                "valid number of seconds",
            )?,
            sweep_interval_secs: env_or(
                "REALTIME_SWEEP_INTERVAL",
                HubDefaults::SWEEP_INTERVAL_SECS,
                "valid number of seconds",
            )?,
            coalesce_writes: env_or(
                "REALTIME_COALESCE_WRITES",
                HubDefaults::COALESCE_WRITES,
                "true or false",
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::validation_failed(
                "Send queue capacity must be greater than 0",
            ));
        }

        if self.dispatch_queue_capacity == 0 {
            return Err(ConfigError::validation_failed(
                "Dispatch queue capacity must be greater than 0",
            ));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::validation_failed(
                "Maximum message size must be greater than 0",
            ));
        }

        if self.write_timeout_secs == 0
            || self.ping_interval_secs == 0
            || self.sweep_interval_secs == 0
        {
            return Err(ConfigError::validation_failed(
                "Write timeout, ping interval and sweep interval must be greater than 0",
            ));
        }

        // A healthy idle peer must be probed before it can be reaped.
        if self.ping_interval_secs >= self.stale_after_secs {
            return Err(ConfigError::validation_failed(
                "Ping interval must be shorter than the staleness threshold",
            ));
        }

        Ok(())
    }

    /// Copy with every zero capacity, size and interval raised to its minimum
    pub fn clamped(&self) -> Self {
        Self {
            send_queue_capacity: self.send_queue_capacity.max(1),
            dispatch_queue_capacity: self.dispatch_queue_capacity.max(1),
            max_message_size: self.max_message_size.max(1),
            write_timeout_secs: self.write_timeout_secs.max(1),
            ping_interval_secs: self.ping_interval_secs.max(1),
            stale_after_secs: self.stale_after_secs.max(1),
            sweep_interval_secs: self.sweep_interval_secs.max(1),
            coalesce_writes: self.coalesce_writes,
        }
    }

    pub fn config_sources(&self) -> HashMap<String, ConfigSource> {
        [
            ("send_queue_capacity", "REALTIME_SEND_QUEUE_CAPACITY"),
            ("dispatch_queue_capacity", "REALTIME_DISPATCH_QUEUE_CAPACITY"),
            ("max_message_size", "REALTIME_MAX_MESSAGE_SIZE"),
            ("write_timeout_secs", "REALTIME_WRITE_TIMEOUT"),
            ("ping_interval_secs", "REALTIME_PING_INTERVAL"),
            ("stale_after_secs", "REALTIME_STALE_AFTER"),
            ("sweep_interval_secs", "REALTIME_SWEEP_INTERVAL"),
            ("coalesce_writes", "REALTIME_COALESCE_WRITES"),
        ]
        .into_iter()
        .map(|(field, var)| (field.to_string(), source_of(var)))
        .collect()
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Listener configuration for the WebSocket server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connections beyond this count are refused at accept time
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            host: env::var("REALTIME_HOST").unwrap_or(defaults.host),
            port: env_or("REALTIME_PORT", defaults.port, "valid port number")?,
            max_connections: env_or(
                "REALTIME_MAX_CONNECTIONS",
                defaults.max_connections,
                "a positive number of connections",
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::validation_failed("Host must not be empty"));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::validation_failed(
                "Maximum connections must be greater than 0",
            ));
        }

        Ok(())
    }

    /// `host:port` string suitable for binding
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or<T: FromStr>(key: &str, default: T, expected: &str) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            field: key.to_string(),
            value: raw,
            expected: expected.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn source_of(var: &str) -> ConfigSource {
    if env::var(var).is_ok() {
        ConfigSource::EnvVar(var.to_string())
    } else {
        ConfigSource::Default(var.to_string())
    }
}
