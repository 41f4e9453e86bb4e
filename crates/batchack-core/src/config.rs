//! Configuration module
//!
//! Provide configuration management for the batching consumer.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use toml;

use crate::buffer::BatchBufferConfig;
use crate::transport::{QueueOptions, TransportConfig};
use crate::Error;

/// Configuration file format
#[derive(Debug, Clone, Copy)]
pub enum ConfigFormat {
    YAML,
    JSON,
    TOML,
}

/// Log format
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    JSON,
    #[default]
    PLAIN,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    #[serde(default)]
    pub format: LogFormat,
    /// Log file path
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::PLAIN,
            file_path: None,
        }
    }
}

/// Batch consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Queue to consume from
    pub queue: String,
    /// Queue durability
    #[serde(default = "default_durable")]
    pub durable: bool,
    /// Highest priority the queue recognizes, enables a priority queue
    pub max_priority: Option<u8>,
    /// Flush thresholds
    #[serde(flatten)]
    pub batch: BatchBufferConfig,
    /// Cadence of the periodic flush check
    #[serde(default = "default_check_interval", with = "duration")]
    pub check_interval: Duration,
}

fn default_durable() -> bool {
    true
}

fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}

impl ConsumerConfig {
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            name: self.queue.clone(),
            durable: self.durable,
            max_priority: self.max_priority,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.queue.is_empty() {
            return Err(Error::Config("queue must not be empty".to_string()));
        }
        if self.check_interval.is_zero() {
            return Err(Error::Config(
                "check_interval must be greater than 0".to_string(),
            ));
        }
        self.batch.validate()
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Broker transport
    pub transport: TransportConfig,
    /// Batch consumer
    pub consumer: ConsumerConfig,
}

impl AppConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Unable to read configuration file: {}", e)))?;

        // Determine the format based on the file extension.
        let Some(format) = get_format_from_path(path) else {
            return Err(Error::Config("The configuration file format cannot be determined. Please use YAML, JSON, or TOML format.".to_string()));
        };

        let config = Self::from_str(&content, format)?;
        config.consumer.validate()?;
        Ok(config)
    }

    pub fn from_str(content: &str, format: ConfigFormat) -> Result<Self, Error> {
        match format {
            ConfigFormat::YAML => serde_yaml::from_str(content)
                .map_err(|e| Error::Config(format!("YAML parsing error: {}", e))),
            ConfigFormat::JSON => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("JSON parsing error: {}", e))),
            ConfigFormat::TOML => toml::from_str(content)
                .map_err(|e| Error::Config(format!("TOML parsing error: {}", e))),
        }
    }
}

/// Get configuration format from file path.
fn get_format_from_path(path: &str) -> Option<ConfigFormat> {
    let path = path.to_lowercase();
    if path.ends_with(".yaml") || path.ends_with(".yml") {
        Some(ConfigFormat::YAML)
    } else if path.ends_with(".json") {
        Some(ConfigFormat::JSON)
    } else if path.ends_with(".toml") {
        Some(ConfigFormat::TOML)
    } else {
        None
    }
}

/// Durations written in humantime form, e.g. `5s` or `1m 30s`.
pub(crate) mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
