//! Token buckets persisted in a shared store.
//!
//! Every call runs an optimistic read-modify-write against the key
//! `rate:limiter:<key>`: the watched read returns the stored bucket, the
//! refill and admission decision are computed locally, and the write commits
//! only if nobody else touched the key in between. Conflicts are retried a
//! bounded number of times; every other failure denies immediately.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::{
    bucket::{admits_nothing, state_ttl, storage_key, TokenBucket},
    error::{RateLimitError, Result},
    limiter::Limiter,
    store::{BucketStore, StoredBucket, Transition},
    utils::{Clock, SystemClock},
};

/// Transaction attempts per call before giving up on conflicts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound on a single transaction attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Fail-closed token-bucket limiter over a [`BucketStore`].
pub struct DistributedLimiter {
    store: Arc<dyn BucketStore>,
    rate: f64,
    burst: u32,
    max_attempts: u32,
    attempt_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl DistributedLimiter {
    pub fn new(store: Arc<dyn BucketStore>, rate: f64, burst: u32) -> Self {
        Self {
            store,
            rate,
            burst,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: Some(DEFAULT_ATTEMPT_TIMEOUT),
            clock: Arc::new(SystemClock),
        }
    }

    /// Number of transaction attempts per call, at least one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Bound each attempt by `timeout`; `None` leaves it to the store client.
    /// An attempt that times out denies the call.
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn attempt(&self, key: &str, now: i64, ttl: Duration) -> Result<bool> {
        let (rate, burst) = (self.rate, self.burst);
        let apply = move |stored: &StoredBucket| -> Result<Transition> {
            let mut bucket = TokenBucket::from_stored(stored, burst, now)?;
            bucket.refill(rate, burst, now);
            let allowed = bucket.try_take();
            Ok(Transition::new(&bucket, allowed))
        };

        let transact = self.store.transact(key, ttl, &apply);
        let transition = match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, transact)
                .await
                .map_err(|_| RateLimitError::Timeout(limit))??,
            None => transact.await?,
        };

        Ok(transition.allowed)
    }
}

#[async_trait]
impl Limiter for DistributedLimiter {
    async fn allow(&self, key: &str) -> bool {
        if admits_nothing(self.rate, self.burst) {
            return false;
        }

        let storage_key = storage_key(key);
        let now = self.clock.now_nanos();
        let ttl = state_ttl(self.rate, self.burst);

        for attempt in 1..=self.max_attempts {
            match self.attempt(&storage_key, now, ttl).await {
                Ok(allowed) => {
                    trace!(key = %storage_key, attempt, allowed, "Distributed rate limit decision");
                    return allowed;
                }
                Err(e) if e.is_conflict() => {
                    debug!(
                        key = %storage_key,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Concurrent update on rate limit state, retrying"
                    );
                }
                Err(e) => {
                    warn!(key = %storage_key, attempt, error = %e, "Rate limit store failure, denying");
                    return false;
                }
            }
        }

        warn!(
            key = %storage_key,
            attempts = self.max_attempts,
            "Rate limit transaction kept conflicting, denying"
        );
        false
    }

    async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}
