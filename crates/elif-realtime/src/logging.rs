//! Structured logging setup for realtime services
//!
//! The hub itself only emits `tracing` events; binaries embedding it call
//! [`init_logging`] once at startup to install a subscriber.

use serde_json::{json, Value};
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Emit JSON lines instead of text
    pub json_format: bool,
    /// Multi-line pretty output for development
    pub pretty_print: bool,
    /// Environment filter (e.g. "elif_realtime=debug,tokio_tungstenite=warn")
    pub env_filter: Option<String>,
    /// Service name included in the startup event
    pub service_name: Option<String>,
    /// Fields logged once with the initialization event
    pub global_fields: serde_json::Map<String, Value>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            pretty_print: false,
            env_filter: None,
            service_name: None,
            global_fields: serde_json::Map::new(),
        }
    }
}

impl LoggingConfig {
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            pretty_print: false,
            env_filter: Some("elif_realtime=info,tokio_tungstenite=warn,tungstenite=warn".to_string()),
            service_name: None,
            global_fields: {
                let mut fields = serde_json::Map::new();
                fields.insert("env".to_string(), json!("production"));
                fields
            },
        }
    }

    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            pretty_print: true,
            env_filter: Some("elif_realtime=debug,tokio_tungstenite=info".to_string()),
            service_name: None,
            global_fields: {
                let mut fields = serde_json::Map::new();
                fields.insert("env".to_string(), json!("development"));
                fields
            },
        }
    }

    pub fn with_service(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }

    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    pub fn with_global_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.global_fields.insert(key.into(), value.into());
        self
    }
}

/// Install a global tracing subscriber. `RUST_LOG` overrides the configured filter.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = config.env_filter.as_deref().unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(env_filter))?;

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stdout).json())
            .try_init()?;
    } else if config.pretty_print {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stdout).pretty())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stdout))
            .try_init()?;
    }

    let mut init = json!({
        "event": "logging_initialized",
        "level": config.level,
        "format": if config.json_format { "json" } else { "text" },
    });
    if let Some(name) = config.service_name {
        init["service"] = json!(name);
    }
    for (key, value) in config.global_fields {
        init[key] = value;
    }

    tracing::info!(target: "elif_realtime::logging", "{}", init);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let production = LoggingConfig::production();
        assert!(production.json_format);
        assert_eq!(production.global_fields.get("env"), Some(&json!("production")));

        let development = LoggingConfig::development().with_service("chat");
        assert!(development.pretty_print);
        assert_eq!(development.service_name.as_deref(), Some("chat"));
    }

    #[test]
    fn test_builder_fields() {
        let config = LoggingConfig::default()
            .with_env_filter("elif_realtime=trace")
            .with_global_field("region", "eu-1");

        assert_eq!(config.env_filter.as_deref(), Some("elif_realtime=trace"));
        assert_eq!(config.global_fields.get("region"), Some(&json!("eu-1")));
    }
}
