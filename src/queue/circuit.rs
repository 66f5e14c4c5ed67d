//! Sliding-window circuit breaker
//!
//! One breaker exists per queue. It counts final job outcomes inside a
//! fixed window and opens once the window holds enough samples with an error
//! rate above the threshold:
//!
//! ```text
//! window age > window       → counters reset, window restarts
//! samples >= min_samples
//!   && failures/samples > t → open (admission rejected)
//! open && age >= cooldown   → closed, counters reset
//! ```
//!
//! Time is passed in explicitly so the breaker can be driven by the tokio
//! clock in production and by fixed instants in tests.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker tuning. Defaults: 60s window, 50% threshold, 10 samples, 30s cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    #[serde(with = "crate::config::duration_secs")]
    pub window: Duration,
    pub error_threshold: f64,
    pub min_samples: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            error_threshold: 0.5,
            min_samples: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Snapshot of the breaker for metrics and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CircuitBreakerState {
    pub failures: u32,
    pub successes: u32,
    pub is_open: bool,
    pub window_age_ms: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    failures: u32,
    successes: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            name: name.into(),
            config,
            failures: 0,
            successes: 0,
            window_start: now,
            opened_at: None,
        }
    }

    /// Whether admission is currently blocked.
    ///
    /// Clears the breaker when the cooldown has elapsed.
    pub fn is_open(&mut self, now: Instant) -> bool {
        let Some(opened_at) = self.opened_at else {
            return false;
        };

        if now.saturating_duration_since(opened_at) >= self.config.cooldown {
            info!(queue = %self.name, "circuit breaker closed after cooldown");
            self.opened_at = None;
            self.reset_window(now);
            return false;
        }

        true
    }

    pub fn record_success(&mut self, now: Instant) {
        self.record(true, now);
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.record(false, now);
    }

    fn record(&mut self, success: bool, now: Instant) {
        if now.saturating_duration_since(self.window_start) > self.config.window {
            self.reset_window(now);
        }

        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        if self.opened_at.is_some() {
            return;
        }

        let samples = self.failures + self.successes;
        if samples >= self.config.min_samples && self.error_rate() > self.config.error_threshold {
            warn!(
                queue = %self.name,
                failures = self.failures,
                samples,
                "circuit breaker opened"
            );
            self.opened_at = Some(now);
        }
    }

    /// Failure ratio within the current window (0.0 when empty).
    pub fn error_rate(&self) -> f64 {
        let samples = self.failures + self.successes;
        if samples == 0 {
            return 0.0;
        }
        self.failures as f64 / samples as f64
    }

    pub fn state(&mut self, now: Instant) -> CircuitBreakerState {
        let is_open = self.is_open(now);
        CircuitBreakerState {
            failures: self.failures,
            successes: self.successes,
            is_open,
            window_age_ms: now.saturating_duration_since(self.window_start).as_millis() as u64,
        }
    }

    fn reset_window(&mut self, now: Instant) {
        self.failures = 0;
        self.successes = 0;
        self.window_start = now;
    }
}
