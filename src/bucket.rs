//! Token-bucket state shared by the in-memory and distributed limiters.

use std::time::Duration;

use crate::{
    error::{RateLimitError, Result},
    store::StoredBucket,
    utils::elapsed_secs,
};

/// Prefix of every key written to the shared store
pub const STORAGE_KEY_PREFIX: &str = "rate:limiter:";

/// Lower bound on the lifetime of persisted bucket state
pub const MIN_STATE_TTL: Duration = Duration::from_secs(60);

/// Slack added on top of the full-refill time
pub const STATE_TTL_BUFFER: Duration = Duration::from_secs(10);

// Ten years. Keeps `Duration::from_secs_f64` away from overflow for tiny rates.
const MAX_DURATION_SECS: f64 = 315_360_000.0;

/// Derive the shared-store key for a rate-limited subject. The key is
/// embedded verbatim, without escaping.
pub fn storage_key(key: &str) -> String {
    format!("{}{}", STORAGE_KEY_PREFIX, key)
}

/// Whether a limiter with these parameters can never admit anything.
pub fn admits_nothing(rate: f64, burst: u32) -> bool {
    rate.is_nan() || rate <= 0.0 || burst == 0
}

/// Time an empty bucket needs to refill completely.
pub fn refill_duration(rate: f64, burst: u32) -> Duration {
    if admits_nothing(rate, burst) {
        return Duration::ZERO;
    }
    Duration::from_secs_f64((burst as f64 / rate).min(MAX_DURATION_SECS))
}

/// TTL for persisted state: `max(60s, burst/rate + 10s)`.
///
/// An idle key outlives the point where its bucket would be full again, so
/// letting it expire never changes an admission decision.
pub fn state_ttl(rate: f64, burst: u32) -> Duration {
    (refill_duration(rate, burst) + STATE_TTL_BUFFER).max(MIN_STATE_TTL)
}

/// Mutable per-key bucket record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    tokens: f64,
    last: i64,
}

impl TokenBucket {
    /// A bucket holding `burst` tokens as of `now`
    pub fn full(burst: u32, now: i64) -> Self {
        Self {
            tokens: burst as f64,
            last: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last(&self) -> i64 {
        self.last
    }

    /// Add `elapsed * rate` tokens, capped at `burst`, and move `last` to `now`.
    pub fn refill(&mut self, rate: f64, burst: u32, now: i64) {
        let elapsed = elapsed_secs(self.last, now);
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(burst as f64);
        }
        self.last = now;
    }

    /// Consume one token if at least one is available.
    pub fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Rebuild a bucket from its stored fields. Missing fields mean the
    /// key has never been written (or has expired): full bucket as of `now`.
    pub fn from_stored(stored: &StoredBucket, burst: u32, now: i64) -> Result<Self> {
        let tokens = match stored.tokens.as_deref() {
            Some(raw) => {
                let value: f64 = raw.trim().parse().map_err(|_| {
                    RateLimitError::CorruptState(format!("unparseable tokens field {:?}", raw))
                })?;
                if !value.is_finite() {
                    return Err(RateLimitError::CorruptState(format!(
                        "non-finite tokens field {:?}",
                        raw
                    )));
                }
                value.clamp(0.0, burst as f64)
            }
            None => burst as f64,
        };

        let last = match stored.last.as_deref() {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                RateLimitError::CorruptState(format!("unparseable last field {:?}", raw))
            })?,
            None => now,
        };

        Ok(Self { tokens, last })
    }

    /// Tokens with exactly nine fractional digits, so repeated parse/format
    /// cycles cannot drift.
    pub fn encode_tokens(&self) -> String {
        format!("{:.9}", self.tokens)
    }

    pub fn encode_last(&self) -> String {
        self.last.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: i64 = 1_000_000_000;

    #[test]
    fn test_storage_key() {
        assert_eq!(storage_key("k"), "rate:limiter:k");
        assert_eq!(storage_key(""), "rate:limiter:");
        assert_eq!(storage_key(" "), "rate:limiter: ");
        assert_eq!(storage_key("用户:42"), "rate:limiter:用户:42");
    }

    #[test]
    fn test_state_ttl() {
        // Fast refill: floor wins.
        assert_eq!(state_ttl(10.0, 5), MIN_STATE_TTL);
        // 100 tokens at 1/s: 100s + 10s buffer.
        assert_eq!(state_ttl(1.0, 100), Duration::from_secs(110));
        assert_eq!(state_ttl(0.5, 30), Duration::from_secs(70));
        // Absurdly slow rates stay finite.
        assert!(state_ttl(1e-30, u32::MAX) > Duration::from_secs(86_400));
    }

    #[test]
    fn test_admits_nothing() {
        assert!(admits_nothing(0.0, 10));
        assert!(admits_nothing(-1.0, 10));
        assert!(admits_nothing(f64::NAN, 10));
        assert!(admits_nothing(1.0, 0));
        assert!(!admits_nothing(0.001, 1));
    }

    #[test]
    fn test_refill_is_capped() {
        let mut bucket = TokenBucket { tokens: 0.0, last: 0 };
        bucket.refill(2.0, 3, 10 * SECOND);
        assert_eq!(bucket.tokens(), 3.0);
        assert_eq!(bucket.last(), 10 * SECOND);
    }

    #[test]
    fn test_refill_ignores_backwards_clock() {
        let mut bucket = TokenBucket { tokens: 0.5, last: 10 * SECOND };
        bucket.refill(100.0, 3, 5 * SECOND);
        assert_eq!(bucket.tokens(), 0.5);
        assert_eq!(bucket.last(), 5 * SECOND);
    }

    #[test]
    fn test_take_requires_whole_token() {
        let mut bucket = TokenBucket { tokens: 1.5, last: 0 };
        assert!(bucket.try_take());
        assert_eq!(bucket.tokens(), 0.5);
        assert!(!bucket.try_take());
        assert_eq!(bucket.tokens(), 0.5);
    }

    #[test]
    fn test_from_stored_defaults_to_full() {
        let bucket = TokenBucket::from_stored(&StoredBucket::default(), 4, 77).unwrap();
        assert_eq!(bucket, TokenBucket::full(4, 77));
    }

    #[test]
    fn test_stored_format() {
        let bucket = TokenBucket { tokens: 2.0 / 3.0, last: 1_700_000_000_123_456_789 };
        assert_eq!(bucket.encode_tokens(), "0.666666667");
        assert_eq!(bucket.encode_last(), "1700000000123456789");
        assert_eq!(TokenBucket::full(3, 0).encode_tokens(), "3.000000000");
    }

    #[test]
    fn test_from_stored_clamps_and_rejects() {
        let stored = StoredBucket {
            tokens: Some("12.5".into()),
            last: Some("100".into()),
        };
        let bucket = TokenBucket::from_stored(&stored, 10, 0).unwrap();
        assert_eq!(bucket.tokens(), 10.0);
        assert_eq!(bucket.last(), 100);

        let garbage = StoredBucket {
            tokens: Some("lots".into()),
            last: None,
        };
        assert!(matches!(
            TokenBucket::from_stored(&garbage, 10, 0),
            Err(RateLimitError::CorruptState(_))
        ));

        let nan = StoredBucket {
            tokens: Some("NaN".into()),
            last: None,
        };
        assert!(TokenBucket::from_stored(&nan, 10, 0).is_err());
    }
}
