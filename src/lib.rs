//! Keyed Rate Limiter
//!
//! Per-key token-bucket admission control. Each key owns a bucket holding up
//! to `burst` tokens, refilled continuously at `rate` tokens per second; a
//! call is admitted when it can take one whole token.
//!
//! Two backends implement the same [`Limiter`] contract:
//! [`InMemoryLimiter`] keeps buckets in process, [`DistributedLimiter`] keeps
//! them in a shared store (Redis) and updates them with optimistic
//! transactions. Both fail closed: any failure to decide is a denial.
//! [`middleware::RateLimitLayer`] plugs a limiter into a tower stack.

pub mod bucket;
pub mod config;
pub mod distributed;
pub mod error;
pub mod limiter;
pub mod memory;
pub mod middleware;
pub mod redis;
pub mod service;
pub mod store;
pub mod utils;

// Re-export main types
pub use config::{Backend, LimiterConfig};
pub use distributed::DistributedLimiter;
pub use error::{RateLimitError, Result};
pub use limiter::{build_limiter, Limiter};
pub use memory::InMemoryLimiter;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use redis::{RedisClient, RedisConfig};
pub use store::BucketStore;
