//! Process configuration
//!
//! Layered as built-in defaults, an optional TOML file, then `ROOMBRIDGE_*`
//! environment variables (`__` separates nested keys, e.g.
//! `ROOMBRIDGE_SOURCE__API_KEY`). Loaded once at startup and never mutated.

use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;
use roombridge_media::reassembler::{MAX_CAPACITY, MIN_CAPACITY};

const DEFAULT_CONFIG_FILE: &str = "roombridge.toml";

/// Credentials and address of one room endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub identity_prefix: Option<String>,
}

impl EndpointConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        for (field, value) in [
            ("url", &self.url),
            ("api_key", &self.api_key),
            ("api_secret", &self.api_secret),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(format!("{}.{}", section, field)));
            }
        }

        if !["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
        {
            return Err(ConfigError::Invalid {
                key: format!("{}.url", section),
                reason: format!("unsupported scheme in {}", self.url),
            });
        }

        Ok(())
    }
}

/// Tunables of the per-track relay workers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Reassembly window capacity in packets
    pub reassembly_window: usize,
    /// How long shutdown waits for workers to finish
    pub drain_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reassembly_window: 1000,
            drain_timeout_ms: 2000,
        }
    }
}

impl RelayConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub room: String,
    pub source: EndpointConfig,
    pub destination: EndpointConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

impl Config {
    /// Load from `roombridge.toml` (or `$ROOMBRIDGE_CONFIG`) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("ROOMBRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let builder = ::config::Config::builder()
            .add_source(::config::File::with_name(&path).required(false))
            .add_source(
                ::config::Environment::with_prefix("ROOMBRIDGE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("stun_servers")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(
        builder: ::config::ConfigBuilder<::config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.trim().is_empty() {
            return Err(ConfigError::Missing("room".to_string()));
        }

        self.source.validate("source")?;
        self.destination.validate("destination")?;

        let window = self.relay.reassembly_window;
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&window) {
            return Err(ConfigError::Invalid {
                key: "relay.reassembly_window".to_string(),
                reason: format!("must be between {} and {}", MIN_CAPACITY, MAX_CAPACITY),
            });
        }

        Ok(())
    }

    pub fn source_identity_prefix(&self) -> &str {
        self.source.identity_prefix.as_deref().unwrap_or("subscriber")
    }

    pub fn destination_identity_prefix(&self) -> &str {
        self.destination
            .identity_prefix
            .as_deref()
            .unwrap_or("publisher")
    }
}
