//! Runtime configuration.
//!
//! Every section has defaults, so an empty TOML document is a valid config.
//!
//! ```toml
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//!
//! [consumer]
//! max_concurrency = 5
//! max_delivery_attempts = 3
//! reply_channel = "responses"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub retry: RetryConfig,
    pub consumer: ConsumerConfig,
    pub pipeline: PipelineConfig,
    pub commands: CommandConfig,
}

/// Local retry of rate-limited processor calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Upper bound on in-flight messages per consumer.
    pub max_concurrency: usize,
    /// Deliveries before a failing message is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Where Response envelopes go. Falls back to the request's destination.
    pub reply_channel: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            max_delivery_attempts: 3,
            reply_channel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stage_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub execution_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 60_000,
        }
    }
}

impl CommandConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

impl RelayConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        if self.consumer.max_concurrency == 0 {
            return Err(ConfigError::Invalid("consumer.max_concurrency must be >= 1".into()));
        }
        if self.consumer.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "consumer.max_delivery_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
