// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blocking token bucket.
//!
//! `acquire` never drops work: it reserves the tokens immediately (the bucket may
//! go negative) and sleeps until the debt is repaid. Concurrent callers queue up
//! behind one another in reservation order.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    /// Tokens per second; 0 means unlimited.
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `rate_per_sec` tokens per second with a `burst` capacity (at least one second of rate if 0).
    #[must_use]
    pub fn new(rate_per_sec: u64, burst: u64) -> Self {
        let burst = (if burst == 0 { rate_per_sec } else { burst }) as f64;
        Self {
            rate: rate_per_sec as f64,
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last_refill: Instant::now() }),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    /// Time the caller must wait to own `n` tokens, reserving them now.
    fn reserve(&self, n: u64) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        // a request larger than the burst is served as a full burst
        let n = (n as f64).min(self.burst);
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.tokens -= n;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.rate)
        }
    }

    pub async fn acquire(&self, n: u64) {
        let wait = self.reserve(n);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
