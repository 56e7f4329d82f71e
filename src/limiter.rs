use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::{
    config::{Backend, LimiterConfig},
    distributed::DistributedLimiter,
    error::Result,
    memory::InMemoryLimiter,
    redis::RedisClient,
};

/// Admission decision per key.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Decide whether the operation identified by `key` may proceed now.
    ///
    /// `true` means one token has been consumed and recorded. `false` means
    /// the caller must not proceed; this covers both throttling and any
    /// failure to reach the backing state.
    async fn allow(&self, key: &str) -> bool;

    /// Health check for the backing state
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the limiter selected by `config`.
pub async fn build_limiter(config: &LimiterConfig) -> Result<Arc<dyn Limiter>> {
    config.validate()?;

    match config.backend {
        Backend::Memory => {
            let mut limiter = InMemoryLimiter::new(config.rate, config.burst);
            if let Some(idle) = config.memory.idle_timeout() {
                limiter = limiter.with_idle_timeout(idle);
            }
            info!(
                rate = limiter.rate(),
                burst = limiter.burst(),
                "In-memory rate limiter ready"
            );
            Ok(Arc::new(limiter))
        }
        Backend::Redis => {
            let client = RedisClient::new(config.distributed.redis.clone()).await?;
            let limiter = DistributedLimiter::new(Arc::new(client), config.rate, config.burst)
                .with_max_attempts(config.distributed.max_attempts)
                .with_attempt_timeout(config.distributed.attempt_timeout());
            info!(
                rate = config.rate,
                burst = config.burst,
                max_attempts = limiter.max_attempts(),
                "Redis rate limiter ready"
            );
            Ok(Arc::new(limiter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::load_config_from_yaml, error::RateLimitError};

    #[tokio::test]
    async fn test_build_memory_limiter() {
        let config = load_config_from_yaml("rate: 1.0\nburst: 2\nbackend: memory\n").unwrap();
        let limiter = build_limiter(&config).await.unwrap();

        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
        assert!(limiter.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let config = LimiterConfig {
            rate: f64::INFINITY,
            ..Default::default()
        };
        assert!(matches!(
            build_limiter(&config).await,
            Err(RateLimitError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_build_redis_limiter_requires_reachable_store() {
        let yaml = r#"
rate: 5.0
burst: 10
backend: redis
distributed:
  redis:
    url: redis://127.0.0.1:1
    connection_timeout_ms: 200
    command_timeout_ms: 200
"#;
        let config = load_config_from_yaml(yaml).unwrap();
        assert!(build_limiter(&config).await.is_err());
    }
}
