//! Shared key/value store seam used by the distributed limiter.

use async_trait::async_trait;
use std::time::Duration;

use crate::{bucket::TokenBucket, error::Result};

/// Hash field holding the token count
pub const TOKENS_FIELD: &str = "tokens";

/// Hash field holding the last refill timestamp (ns since epoch)
pub const LAST_FIELD: &str = "last";

/// Raw bucket fields as read from the store. `None` means the field is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredBucket {
    pub tokens: Option<String>,
    pub last: Option<String>,
}

/// Result of applying one admission decision to a bucket read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub tokens: String,
    pub last: String,
    pub allowed: bool,
}

impl Transition {
    pub fn new(bucket: &TokenBucket, allowed: bool) -> Self {
        Self {
            tokens: bucket.encode_tokens(),
            last: bucket.encode_last(),
            allowed,
        }
    }
}

/// Pure state transition evaluated between the watched read and the write.
pub type ApplyFn<'a> = dyn Fn(&StoredBucket) -> Result<Transition> + Send + Sync + 'a;

/// Store offering an optimistic read-modify-write on hash-like records.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Run a single optimistic attempt against `key`:
    ///
    /// 1. watch the key and read its `tokens`/`last` fields,
    /// 2. evaluate `apply` on what was read,
    /// 3. write the resulting fields and set `ttl`, committing only if no
    ///    other writer touched the key since step 1.
    ///
    /// A lost race must be reported as `RateLimitError::TransactionConflict`
    /// and leave the key untouched. Errors returned by `apply` abort the
    /// attempt without writing.
    async fn transact(&self, key: &str, ttl: Duration, apply: &ApplyFn<'_>) -> Result<Transition>;

    /// Check that the store is reachable
    async fn health_check(&self) -> Result<()>;
}
