use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{ApplyFn, BucketStore, StoredBucket, Transition, LAST_FIELD, TOKENS_FIELD},
};

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Upper bound on pooled transaction connections
    pub max_connections: usize,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 16,
            connection_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Redis-backed bucket store.
///
/// Health checks go through a shared connection manager. Transactions check
/// a connection out of a pool for the whole WATCH..EXEC sequence: `WATCH`
/// state belongs to a connection and must not mix with other callers.
#[derive(Clone)]
pub struct RedisClient {
    pool: Pool,
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisClient {
    /// Create a new Redis client
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection_result =
            tokio::time::timeout(config.connection_timeout(), client.get_connection_manager())
                .await;

        let connection = match connection_result {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout_ms
                );
                return Err(RateLimitError::Timeout(config.connection_timeout()));
            }
        };

        let mut conn = connection.clone();
        let ping_result = tokio::time::timeout(
            config.command_timeout(),
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await;

        match ping_result {
            Ok(Ok(_)) => {
                info!("Redis PING successful");
            }
            Ok(Err(e)) => {
                warn!("Redis PING failed: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!("Redis PING timeout ({}ms)", config.command_timeout_ms);
                return Err(RateLimitError::Timeout(config.command_timeout()));
            }
        }

        let pool = create_pool(&config)?;

        info!("Redis client initialized successfully");
        Ok(Self {
            pool,
            connection,
            config,
        })
    }

    async fn pooled_connection(&self) -> Result<Connection> {
        let timeout = self.config.connection_timeout();
        match tokio::time::timeout(timeout, self.pool.get()).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(RateLimitError::Timeout(timeout)),
        }
    }
}

fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut settings = PoolSettings::from_url(config.url.clone());
    settings.pool = Some(PoolConfig::new(config.max_connections.max(1)));

    let pool = settings
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| RateLimitError::Config(format!("Failed to create Redis pool: {}", e)))?;

    info!(
        "Redis connection pool created (max_connections: {})",
        config.max_connections
    );
    Ok(pool)
}

/// Whole seconds for `EXPIRE`, rounded up.
fn expire_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Read, apply and conditionally write a key already under `WATCH`.
async fn write_watched(
    conn: &mut Connection,
    key: &str,
    ttl: Duration,
    apply: &ApplyFn<'_>,
) -> Result<Transition> {
    let (tokens, last): (Option<String>, Option<String>) = redis::cmd("HMGET")
        .arg(key)
        .arg(TOKENS_FIELD)
        .arg(LAST_FIELD)
        .query_async(conn)
        .await?;

    let transition = apply(&StoredBucket { tokens, last })?;

    // EXEC replies nil when the watched key changed after WATCH.
    let committed: Option<()> = redis::pipe()
        .atomic()
        .hset_multiple(
            key,
            &[
                (TOKENS_FIELD, transition.tokens.as_str()),
                (LAST_FIELD, transition.last.as_str()),
            ],
        )
        .ignore()
        .cmd("EXPIRE")
        .arg(key)
        .arg(expire_seconds(ttl))
        .ignore()
        .query_async(conn)
        .await?;

    match committed {
        Some(()) => Ok(transition),
        None => {
            debug!(key = %key, "EXEC aborted by concurrent write");
            Err(RateLimitError::TransactionConflict)
        }
    }
}

#[async_trait]
impl BucketStore for RedisClient {
    async fn transact(&self, key: &str, ttl: Duration, apply: &ApplyFn<'_>) -> Result<Transition> {
        let mut conn = self.pooled_connection().await?;

        // A cancelled attempt can return its connection to the pool still
        // watching another key.
        redis::pipe()
            .cmd("UNWATCH")
            .ignore()
            .cmd("WATCH")
            .arg(key)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        let outcome = write_watched(&mut conn, key, ttl, apply).await;
        if let Err(e) = &outcome {
            // EXEC already dropped the watch on conflict.
            if !e.is_conflict() {
                if let Err(unwatch) = redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await {
                    debug!(key = %key, error = %unwatch, "UNWATCH after failed attempt failed");
                }
            }
        }
        outcome
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(RateLimitError::Redis)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.command_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_redis_config_partial_yaml() {
        let config: RedisConfig = serde_yaml::from_str("url: redis://cache:6380/2").unwrap();
        assert_eq!(config.url, "redis://cache:6380/2");
        assert_eq!(config.command_timeout_ms, 1_000);
        assert_eq!(config.max_connections, 16);
    }

    #[test]
    fn test_expire_seconds_rounds_up() {
        assert_eq!(expire_seconds(Duration::from_secs(60)), 60);
        assert_eq!(expire_seconds(Duration::from_millis(70_001)), 71);
        assert_eq!(expire_seconds(Duration::from_secs(u64::MAX)), i64::MAX);
    }

    #[tokio::test]
    async fn test_transaction_pool_is_bounded() {
        let pool = create_pool(&RedisConfig::default()).unwrap();
        assert_eq!(pool.status().max_size, 16);

        let config = RedisConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert_eq!(create_pool(&config).unwrap().status().max_size, 1);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_fast() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout_ms: 200,
            command_timeout_ms: 200,
            ..Default::default()
        };
        assert!(RedisClient::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            RedisClient::new(config).await,
            Err(RateLimitError::Redis(_))
        ));
    }
}
