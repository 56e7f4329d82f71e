use async_trait::async_trait;
use moka::future::Cache;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::{
    bucket::{admits_nothing, refill_duration, TokenBucket},
    limiter::Limiter,
    utils::{Clock, SystemClock},
};

/// Process-local token-bucket limiter.
///
/// Buckets live in a concurrent table keyed by the caller's key. Insertion of
/// a missing bucket is exclusive: concurrent first callers for the same key
/// all receive the single bucket that won. Each bucket carries its own lock,
/// so unrelated keys never contend.
pub struct InMemoryLimiter {
    rate: f64,
    burst: u32,
    buckets: Cache<String, Arc<Mutex<TokenBucket>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLimiter {
    /// Create a limiter refilling `rate` tokens per second up to `burst`.
    /// Buckets are kept for the lifetime of the limiter.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            buckets: Cache::builder().build(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Drop buckets that have not been touched for `idle`.
    ///
    /// The timeout is raised to at least the full-refill time, so an evicted
    /// bucket would have been full anyway and eviction never changes a decision.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        let idle = idle
            .max(refill_duration(self.rate, self.burst))
            .max(Duration::from_secs(1));
        self.buckets = Cache::builder().time_to_idle(idle).build();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Number of keys currently holding a bucket
    pub async fn tracked_keys(&self) -> u64 {
        self.buckets.run_pending_tasks().await;
        self.buckets.entry_count()
    }
}

#[async_trait]
impl Limiter for InMemoryLimiter {
    async fn allow(&self, key: &str) -> bool {
        if admits_nothing(self.rate, self.burst) {
            return false;
        }

        let burst = self.burst;
        let clock = &self.clock;
        let bucket = self
            .buckets
            .get_with_by_ref(key, async move {
                Arc::new(Mutex::new(TokenBucket::full(burst, clock.now_nanos())))
            })
            .await;

        // A panic while holding the lock cannot leave the bucket half-updated.
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(self.rate, self.burst, self.clock.now_nanos());
        let allowed = bucket.try_take();

        trace!(key = %key, allowed, tokens = bucket.tokens(), "In-memory rate limit decision");
        allowed
    }
}
