//! Client-side sliding-window limiter for LLM requests.
//!
//! Proactively throttles calls to stay within provider rate limits instead
//! of relying on 429 backpressure.

use crate::config::ConcurrencyConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-minute request and input-token limits (0 = unlimited).
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    pub rpm: usize,
    pub itpm: usize,
}

impl From<&ConcurrencyConfig> for RateLimitConfig {
    fn from(config: &ConcurrencyConfig) -> Self {
        Self {
            rpm: config.requests_per_minute,
            itpm: config.input_tokens_per_minute,
        }
    }
}

/// A sliding-window rate limiter that tracks request and token usage.
pub struct RequestLimiter {
    config: RateLimitConfig,
    /// (timestamp, input_tokens) for recent requests within the window.
    input_tokens_window: VecDeque<(Instant, usize)>,
    /// Timestamps of recent requests within the window.
    requests_window: VecDeque<Instant>,
    window: Duration,
}

impl RequestLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            input_tokens_window: VecDeque::new(),
            requests_window: VecDeque::new(),
            window: Duration::from_secs(60),
        }
    }

    /// Check if a request with the estimated token count can proceed now.
    ///
    /// Returns `None` if the request can proceed immediately, or `Some(delay)`
    /// indicating how long to wait before checking again.
    pub fn check(&mut self, estimated_input_tokens: usize) -> Option<Duration> {
        let now = Instant::now();
        self.prune(now);

        if self.config.rpm > 0 && self.requests_window.len() >= self.config.rpm {
            if let Some(&oldest) = self.requests_window.front() {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                if !wait.is_zero() {
                    return Some(wait);
                }
            }
        }

        if self.config.itpm > 0 {
            let current_input: usize = self.input_tokens_window.iter().map(|(_, t)| t).sum();
            if current_input + estimated_input_tokens > self.config.itpm {
                if let Some(&(oldest, _)) = self.input_tokens_window.front() {
                    let wait = self.window.saturating_sub(now.duration_since(oldest));
                    if !wait.is_zero() {
                        return Some(wait);
                    }
                }
            }
        }

        None
    }

    /// Record a dispatched request.
    pub fn record(&mut self, input_tokens: usize) {
        let now = Instant::now();
        self.input_tokens_window.push_back((now, input_tokens));
        self.requests_window.push_back(now);
    }

    pub fn has_limits(&self) -> bool {
        self.config.itpm > 0 || self.config.rpm > 0
    }

    /// Current (input_tokens, requests) within the window.
    pub fn current_usage(&mut self) -> (usize, usize) {
        self.prune(Instant::now());
        let input: usize = self.input_tokens_window.iter().map(|(_, t)| t).sum();
        (input, self.requests_window.len())
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self
            .input_tokens_window
            .front()
            .is_some_and(|(t, _)| *t < cutoff)
        {
            self.input_tokens_window.pop_front();
        }
        while self.requests_window.front().is_some_and(|t| *t < cutoff) {
            self.requests_window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_no_limits() {
        let mut limiter = RequestLimiter::new(RateLimitConfig::default());
        assert!(limiter.check(10000).is_none());
        assert!(!limiter.has_limits());
    }

    #[test]
    fn test_limiter_rpm() {
        let mut limiter = RequestLimiter::new(RateLimitConfig { rpm: 2, itpm: 0 });

        assert!(limiter.check(100).is_none());
        limiter.record(100);
        assert!(limiter.check(100).is_none());
        limiter.record(100);

        let delay = limiter.check(100);
        assert!(delay.is_some());
        assert!(delay.unwrap().as_secs() > 0);
    }

    #[test]
    fn test_limiter_itpm() {
        let mut limiter = RequestLimiter::new(RateLimitConfig { rpm: 0, itpm: 500 });

        assert!(limiter.check(400).is_none());
        limiter.record(400);
        assert!(limiter.check(200).is_some());
    }

    #[test]
    fn test_current_usage() {
        let mut limiter = RequestLimiter::new(RateLimitConfig::default());
        limiter.record(100);
        limiter.record(200);
        assert_eq!(limiter.current_usage(), (300, 2));
    }

    #[test]
    fn test_from_concurrency_config() {
        let config = ConcurrencyConfig {
            requests_per_minute: 30,
            ..Default::default()
        };
        let limiter = RequestLimiter::new(RateLimitConfig::from(&config));
        assert!(limiter.has_limits());
    }
}
