//! Token bucket limiting how many jobs a queue may start per period.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// At most `max` operations per `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    #[serde(with = "crate::config::duration_millis", rename = "duration_ms")]
    pub duration: Duration,
}

impl RateLimit {
    pub fn per_second(max: u32) -> Self {
        Self {
            max,
            duration: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit, now: Instant) -> Self {
        let capacity = limit.max.max(1) as f64;
        let secs = limit.duration.as_secs_f64().max(f64::EPSILON);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / secs,
            last_refill: now,
        }
    }

    /// Take a token, or report how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_rate))
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}
