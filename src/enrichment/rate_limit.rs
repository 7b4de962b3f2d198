//! Adaptive rate limiting wrapper around governor.
//!
//! The quota drops while a provider's error rate is above threshold and
//! climbs back toward the configured base once it recovers.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Adaptive rate limiter that adjusts its quota based on error rate.
pub struct AdaptiveRateLimiter {
    limiter: Arc<DefaultDirectRateLimiter>,
    /// Base requests per second (configured)
    base_quota: u32,
    current_quota: u32,
    /// Success flags of recent requests
    window: VecDeque<bool>,
    window_size: usize,
    /// Error rate above which the quota is reduced
    error_threshold: f64,
    /// Never go below this
    min_quota: u32,
    last_adjustment: Instant,
    /// Minimum time between adjustments
    adjustment_interval: Duration,
}

fn quota(per_second: u32) -> Quota {
    Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
}

impl AdaptiveRateLimiter {
    pub fn new(base_requests_per_second: u32, window_size: usize, error_threshold: f64) -> Self {
        let base = base_requests_per_second.max(1);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota(base))),
            base_quota: base,
            current_quota: base,
            window: VecDeque::new(),
            window_size: window_size.max(2),
            error_threshold: error_threshold.clamp(0.0, 1.0),
            min_quota: (base / 4).max(1),
            last_adjustment: Instant::now(),
            adjustment_interval: Duration::from_secs(30),
        }
    }

    /// Current limiter; callers await `until_ready` on it without holding any lock.
    pub fn limiter(&self) -> Arc<DefaultDirectRateLimiter> {
        self.limiter.clone()
    }

    pub fn record_success(&mut self) {
        self.record(true);
    }

    pub fn record_failure(&mut self) {
        self.record(false);
    }

    fn record(&mut self, success: bool) {
        self.window.push_back(success);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        if self.should_adjust() {
            self.adjust_quota();
        }
    }

    fn should_adjust(&self) -> bool {
        self.window.len() >= self.window_size / 2
            && self.last_adjustment.elapsed() >= self.adjustment_interval
    }

    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let errors = self.window.iter().filter(|s| !**s).count();
        errors as f64 / self.window.len() as f64
    }

    fn adjust_quota(&mut self) {
        let error_rate = self.error_rate();
        let old_quota = self.current_quota;

        if error_rate > self.error_threshold {
            let reduction = 1.0 - (error_rate - self.error_threshold) * 0.5;
            let reduced = ((self.current_quota as f64) * reduction) as u32;
            self.current_quota = reduced.max(self.min_quota);
            warn!(
                "High error rate {:.2}%, reducing quota from {} to {} req/s",
                error_rate * 100.0,
                old_quota,
                self.current_quota
            );
        } else if error_rate < self.error_threshold * 0.5 {
            let increase = 1.0 + (self.error_threshold * 0.5 - error_rate) * 0.2;
            let raised = (((self.current_quota as f64) * increase).ceil()) as u32;
            self.current_quota = raised.min(self.base_quota);
        }

        if self.current_quota != old_quota {
            self.limiter = Arc::new(RateLimiter::direct(quota(self.current_quota)));
            self.last_adjustment = Instant::now();
            debug!("Rate limiter quota now {} req/s", self.current_quota);
        }
    }

    pub fn current_quota(&self) -> u32 {
        self.current_quota
    }
}
