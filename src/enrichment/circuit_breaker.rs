//! Circuit breaker for external data providers.
//!
//! Providers that keep failing are quarantined for a cooldown period and
//! retried afterwards in a degraded state.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const HISTORY_LEN: usize = 100;

/// State of a provider in the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// Provider is healthy and can be used
    Healthy,
    /// Provider is failing but still usable
    Degraded,
    /// Provider is quarantined until the cooldown expires
    CoolingDown,
}

/// Health tracking for a single provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub state: ProviderState,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub cooldown_start: Option<Instant>,
    /// Recent attempt history (success=true, failure=false)
    recent_attempts: VecDeque<bool>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            state: ProviderState::Healthy,
            consecutive_failures: 0,
            success_rate: 1.0,
            cooldown_start: None,
            recent_attempts: VecDeque::new(),
        }
    }

    fn record(&mut self, success: bool) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.recent_attempts.push_back(success);
        if self.recent_attempts.len() > HISTORY_LEN {
            self.recent_attempts.pop_front();
        }
        let successes = self.recent_attempts.iter().filter(|&&s| s).count();
        self.success_rate = successes as f64 / self.recent_attempts.len() as f64;
    }

    pub fn total_attempts(&self) -> usize {
        self.recent_attempts.len()
    }
}

/// Circuit breaker keyed by provider name.
pub struct CircuitBreaker {
    providers: HashMap<String, ProviderHealth>,
    /// Consecutive failures before a provider is marked degraded
    failure_threshold: u32,
    cooldown_duration: Duration,
    /// Sample size before the success rate is trusted
    sample_size: usize,
    /// Minimum success rate to stay out of cooldown
    min_success_rate: f64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_seconds: u64, sample_size: usize) -> Self {
        Self::with_cooldown(failure_threshold, Duration::from_secs(cooldown_seconds), sample_size)
    }

    pub fn with_cooldown(failure_threshold: u32, cooldown: Duration, sample_size: usize) -> Self {
        Self {
            providers: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown_duration: cooldown,
            sample_size,
            min_success_rate: 0.3,
        }
    }

    #[instrument(skip(self))]
    pub fn record_success(&mut self, provider: &str) {
        self.record(provider, true);
        debug!("Recorded success for provider {}", provider);
    }

    #[instrument(skip(self))]
    pub fn record_failure(&mut self, provider: &str) {
        self.record(provider, false);
        if let Some(health) = self.providers.get(provider) {
            warn!(
                "Recorded failure for provider {}: {} consecutive failures, {:.2}% success rate",
                provider,
                health.consecutive_failures,
                health.success_rate * 100.0
            );
        }
    }

    fn record(&mut self, provider: &str, success: bool) {
        let threshold = self.failure_threshold;
        let sample_size = self.sample_size;
        let min_success_rate = self.min_success_rate;

        let health = self
            .providers
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);
        health.record(success);

        match health.state {
            ProviderState::Healthy => {
                if health.consecutive_failures >= threshold {
                    health.state = ProviderState::Degraded;
                    debug!("Provider {} degraded", provider);
                }
            }
            ProviderState::Degraded => {
                if health.consecutive_failures >= threshold * 2
                    || (health.total_attempts() >= sample_size
                        && health.success_rate < min_success_rate)
                {
                    health.state = ProviderState::CoolingDown;
                    health.cooldown_start = Some(Instant::now());
                    warn!("Provider {} entering cooldown", provider);
                } else if health.consecutive_failures == 0 && health.success_rate > 0.7 {
                    health.state = ProviderState::Healthy;
                    debug!("Provider {} recovered", provider);
                }
            }
            ProviderState::CoolingDown => {}
        }
    }

    /// Whether a call to `provider` may go out now.
    pub fn is_available(&mut self, provider: &str) -> bool {
        let cooldown = self.cooldown_duration;
        let Some(health) = self.providers.get_mut(provider) else {
            return true;
        };
        match health.state {
            ProviderState::Healthy | ProviderState::Degraded => true,
            ProviderState::CoolingDown => match health.cooldown_start {
                Some(start) if start.elapsed() < cooldown => false,
                _ => {
                    health.state = ProviderState::Degraded;
                    health.cooldown_start = None;
                    health.consecutive_failures = 0;
                    debug!("Provider {} cooldown expired, retrying as degraded", provider);
                    true
                }
            },
        }
    }

    pub fn state(&self, provider: &str) -> ProviderState {
        self.providers
            .get(provider)
            .map(|h| h.state)
            .unwrap_or(ProviderState::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_is_available() {
        let mut cb = CircuitBreaker::new(3, 60, 50);
        assert!(cb.is_available("dexscreener"));
        assert_eq!(cb.state("dexscreener"), ProviderState::Healthy);
    }

    #[test]
    fn test_failures_degrade_then_cool_down() {
        let mut cb = CircuitBreaker::new(2, 60, 50);
        cb.record_failure("p");
        cb.record_failure("p");
        assert_eq!(cb.state("p"), ProviderState::Degraded);
        assert!(cb.is_available("p"));

        cb.record_failure("p");
        cb.record_failure("p");
        assert_eq!(cb.state("p"), ProviderState::CoolingDown);
        assert!(!cb.is_available("p"));
    }

    #[test]
    fn test_recovery_after_successes() {
        let mut cb = CircuitBreaker::new(3, 60, 50);
        for _ in 0..3 {
            cb.record_failure("p");
        }
        assert_eq!(cb.state("p"), ProviderState::Degraded);
        for _ in 0..10 {
            cb.record_success("p");
        }
        assert_eq!(cb.state("p"), ProviderState::Healthy);
    }

    #[test]
    fn test_cooldown_expires() {
        let mut cb = CircuitBreaker::with_cooldown(1, Duration::from_millis(10), 50);
        cb.record_failure("p");
        cb.record_failure("p");
        assert!(!cb.is_available("p"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.is_available("p"));
        assert_eq!(cb.state("p"), ProviderState::Degraded);
    }
}
