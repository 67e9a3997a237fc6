//! Per-provider circuit breaker.
//!
//! One registry per process; replicas each keep their own failure history and
//! make their own allow/deny decisions. There is no half-open trial budget:
//! once the cooldown elapses the counter resets and the next call is a normal
//! attempt whose outcome updates the counters as usual.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct ProviderState {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, ProviderState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Ok(()) when the call may proceed; Err(retry_after) when the circuit is
    /// open. Elapsed cooldown self-resets the counter and lets the call pass.
    pub fn check(&self, provider: &str) -> Result<(), Duration> {
        self.check_at(provider, Instant::now())
    }

    pub fn record(&self, provider: &str, success: bool) {
        self.record_at(provider, success, Instant::now())
    }

    fn check_at(&self, provider: &str, now: Instant) -> Result<(), Duration> {
        let mut states = self.states.lock().expect("breaker mutex poisoned");
        let state = states.entry(provider.to_string()).or_default();

        if state.consecutive_failures < self.threshold {
            return Ok(());
        }

        match state.last_failure_at {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= self.cooldown {
                    state.consecutive_failures = 0;
                    Ok(())
                } else {
                    Err(self.cooldown - elapsed)
                }
            }
            // threshold reached but no failure timestamp: treat as closed
            None => Ok(()),
        }
    }

    fn record_at(&self, provider: &str, success: bool, now: Instant) {
        let mut states = self.states.lock().expect("breaker mutex poisoned");
        let state = states.entry(provider.to_string()).or_default();

        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.last_failure_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60))
    }

    #[test]
    fn closed_until_threshold() {
        let b = breaker();
        let now = Instant::now();

        b.record_at("p", false, now);
        b.record_at("p", false, now);
        assert!(b.check_at("p", now).is_ok());

        b.record_at("p", false, now);
        assert!(b.check_at("p", now).is_err());
    }

    #[test]
    fn success_resets_counter() {
        let b = breaker();
        let now = Instant::now();

        b.record_at("p", false, now);
        b.record_at("p", false, now);
        b.record_at("p", true, now);
        b.record_at("p", false, now);
        b.record_at("p", false, now);
        assert!(b.check_at("p", now).is_ok());
    }

    #[test]
    fn open_reports_remaining_cooldown() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_at("p", false, now);
        }

        let retry_after = b.check_at("p", now + Duration::from_secs(10)).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(50));
    }

    #[test]
    fn cooldown_elapse_self_resets() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_at("p", false, now);
        }
        assert!(b.check_at("p", now).is_err());

        // after the cooldown the very next call goes through, regardless of
        // historical failure count
        let later = now + Duration::from_secs(61);
        assert!(b.check_at("p", later).is_ok());
        // and again: counter was reset, not just bypassed once
        assert!(b.check_at("p", later).is_ok());
    }

    #[test]
    fn providers_are_independent() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_at("a", false, now);
        }
        assert!(b.check_at("a", now).is_err());
        assert!(b.check_at("b", now).is_ok());
    }
}
