//! Configuration management

use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment variables overriding the configuration,
/// e.g. `CALLPLANE__CALLS__INCOMING_TIMEOUT_SECS=45`
pub const ENV_PREFIX: &str = "CALLPLANE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub calls: CallConfig,
    pub sound: SoundConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Seconds an incoming call may ring before it is declined
    pub incoming_timeout_secs: u64,
    /// Seconds without RTP before a running call is dropped; 0 disables the watchdog
    pub nortp_timeout_secs: u64,
    /// Live calls accepted at the same time
    pub max_calls: usize,
}

impl CallConfig {
    pub fn incoming_timeout(&self) -> Duration {
        Duration::from_secs(self.incoming_timeout_secs)
    }

    pub fn nortp_timeout(&self) -> Option<Duration> {
        (self.nortp_timeout_secs > 0).then(|| Duration::from_secs(self.nortp_timeout_secs))
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            incoming_timeout_secs: 30,
            nortp_timeout_secs: 30,
            max_calls: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundConfig {
    /// Keep ringing while an incoming call plays early media
    pub ring_during_incoming_early_media: bool,
    /// Let the remote party provide the ringback tone
    pub remote_ringback_tone: bool,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            ring_during_incoming_early_media: false,
            remote_ringback_tone: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the Prometheus scrape endpoint, e.g. `127.0.0.1:9000`.
    /// Metrics are only recorded when this is set.
    pub prometheus_listen: Option<String>,
}

impl Config {
    /// Load defaults, then the optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Config::default())
            .map_err(|e| DomainError::Config(e.to_string()))?;

        let mut builder = ::config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DomainError::Config(e.to_string()))
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DomainError::Config(e.to_string()))
    }
}
