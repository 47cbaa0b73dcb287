//! Per-endpoint token bucket and backoff state.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Pacing and retry policy for one endpoint key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Sustained admission rate
    pub requests_per_second: f64,
    /// Maximum number of tokens the bucket can hold
    pub burst_capacity: f64,
    /// Retries after the first attempt when the call is rate limited
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Upper bound of the random jitter, as a fraction of the backoff
    pub jitter_fraction: f64,
}

impl EndpointConfig {
    /// Policy used for endpoint keys that have no explicit configuration.
    pub fn conservative() -> Self {
        Self {
            requests_per_second: 1.0,
            burst_capacity: 1.0,
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }

    pub fn with_rate(mut self, requests_per_second: f64, burst_capacity: f64) -> Self {
        self.requests_per_second = requests_per_second;
        self.burst_capacity = burst_capacity;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        self.base_backoff_ms = base_ms;
        self.max_backoff_ms = max_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Backoff before jitter for the given number of consecutive errors.
    pub fn base_backoff(&self, consecutive_errors: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(consecutive_errors as i32);
        let raw = self.base_backoff_ms as f64 * exp;
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Backoff with jitter applied. `jitter_sample` is in `[0, 1]` and scales
    /// the jitter fraction, so the result lies in
    /// `[backoff, backoff * (1 + jitter_fraction)]`.
    pub fn backoff_with_jitter(&self, consecutive_errors: u32, jitter_sample: f64) -> Duration {
        let backoff = self.base_backoff(consecutive_errors);
        let sample = jitter_sample.clamp(0.0, 1.0);
        let jitter = backoff.as_secs_f64() * self.jitter_fraction.max(0.0) * sample;
        backoff + Duration::from_secs_f64(jitter)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Mutable state for one endpoint key.
#[derive(Debug)]
pub(crate) struct BucketState {
    pub tokens: f64,
    pub last_refill: Instant,
    pub rate_limited: bool,
    pub reset_at: Option<Instant>,
    pub consecutive_errors: u32,
}

impl BucketState {
    /// A fresh bucket starts full.
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            tokens: config.burst_capacity,
            last_refill: Instant::now(),
            rate_limited: false,
            reset_at: None,
            consecutive_errors: 0,
        }
    }

    pub fn refill(&mut self, config: &EndpointConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.requests_per_second).min(config.burst_capacity);
        self.last_refill = now;
    }

    /// Time until one whole token is available, zero if one already is.
    pub fn time_until_token(&self, config: &EndpointConfig) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let rate = config.requests_per_second.max(f64::EPSILON);
        Duration::from_secs_f64((1.0 - self.tokens) / rate)
    }

    /// Remaining cool-down, if one is active.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.reset_at
            .filter(|reset_at| *reset_at > now)
            .map(|reset_at| reset_at - now)
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.rate_limited = false;
        self.reset_at = None;
    }

    pub fn record_rate_limit(&mut self, wait: Duration, now: Instant) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.rate_limited = true;
        self.reset_at = Some(now + wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EndpointConfig {
        EndpointConfig::conservative()
            .with_rate(2.0, 3.0)
            .with_backoff(100, 1_000, 2.0)
            .with_jitter(0.25)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = config();
        assert_eq!(cfg.base_backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.base_backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.base_backoff(3), Duration::from_millis(800));
        assert_eq!(cfg.base_backoff(4), Duration::from_millis(1_000));
        assert_eq!(cfg.base_backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let cfg = config();
        let mut previous = Duration::ZERO;
        for errors in 0..8 {
            let base = cfg.base_backoff(errors);
            let low = cfg.backoff_with_jitter(errors, 0.0);
            let high = cfg.backoff_with_jitter(errors, 1.0);
            assert_eq!(low, base);
            assert!(high <= base.mul_f64(1.25) + Duration::from_micros(1));
            assert!(base >= previous, "backoff must be non-decreasing");
            previous = base;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_burst() {
        let cfg = config();
        let mut state = BucketState::new(&cfg);
        state.tokens = 0.0;

        tokio::time::advance(Duration::from_millis(500)).await;
        state.refill(&cfg, Instant::now());
        assert!((state.tokens - 1.0).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(60)).await;
        state.refill(&cfg, Instant::now());
        assert_eq!(state.tokens, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_token() {
        let cfg = config();
        let mut state = BucketState::new(&cfg);
        assert_eq!(state.time_until_token(&cfg), Duration::ZERO);

        state.tokens = 0.0;
        assert_eq!(state.time_until_token(&cfg), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_rate_limit() {
        let cfg = config();
        let mut state = BucketState::new(&cfg);
        let now = Instant::now();

        state.record_rate_limit(Duration::from_millis(300), now);
        assert!(state.rate_limited);
        assert_eq!(state.consecutive_errors, 1);
        assert_eq!(state.cooldown_remaining(now), Some(Duration::from_millis(300)));

        state.record_success();
        assert!(!state.rate_limited);
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(state.cooldown_remaining(now), None);
    }
}
