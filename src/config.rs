use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::{
    distributed::DEFAULT_MAX_ATTEMPTS,
    error::{RateLimitError, Result},
    redis::RedisConfig,
};

/// Prefix for environment overrides, e.g. `RATE_LIMITER_RATE=5` or
/// `RATE_LIMITER_DISTRIBUTED__REDIS__URL=redis://cache:6379`.
pub const ENV_PREFIX: &str = "RATE_LIMITER";

/// Where bucket state lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Tokens refilled per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u32,
    pub backend: Backend,
    pub memory: MemoryConfig,
    pub distributed: DistributedConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
            backend: Backend::default(),
            memory: MemoryConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Evict buckets idle for this long. Unset keeps every bucket.
    pub idle_timeout_secs: Option<u64>,
}

impl MemoryConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Transaction attempts per call when writers conflict
    pub max_attempts: u32,
    /// Deadline for one transaction attempt. Unset defers to the client.
    pub attempt_timeout_ms: Option<u64>,
    pub redis: RedisConfig,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout_ms: Some(1_000),
            redis: RedisConfig::default(),
        }
    }
}

impl DistributedConfig {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

impl LimiterConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `RATE_LIMITER_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: LimiterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot describe a token bucket. Non-positive
    /// rates and an empty burst are valid and deny every request.
    pub fn validate(&self) -> Result<()> {
        if self.rate.is_nan() || self.rate.is_infinite() {
            return Err(RateLimitError::Config(format!(
                "rate must be a finite number, got {}",
                self.rate
            )));
        }

        if self.distributed.max_attempts == 0 {
            return Err(RateLimitError::Config(
                "distributed.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.distributed.redis.url.is_empty() && self.backend == Backend::Redis {
            return Err(RateLimitError::Config(
                "distributed.redis.url must be set for the redis backend".to_string(),
            ));
        }

        if self.rate <= 0.0 || self.burst == 0 {
            warn!(
                rate = self.rate,
                burst = self.burst,
                "Rate limiter configured to deny every request"
            );
        }

        Ok(())
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<LimiterConfig> {
    let config: LimiterConfig = serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<LimiterConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}
