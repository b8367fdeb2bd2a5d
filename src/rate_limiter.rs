//! Rate Limiter: per-sender sliding one-hour window over messages that
//! have already passed every earlier gate.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60 * 60);

pub struct RateLimiter {
    windows: HashMap<String, VecDeque<Instant>>,
    max_per_hour: u32,
}

impl RateLimiter {
    pub fn new(max_per_hour: u32) -> Self {
        Self {
            windows: HashMap::new(),
            max_per_hour,
        }
    }

    fn prune(&mut self, prefix: &str) {
        let now = Instant::now();
        if let Some(window) = self.windows.get_mut(prefix) {
            while let Some(front) = window.front() {
                if now.duration_since(*front) > WINDOW {
                    window.pop_front();
                } else {
                    break;
                }
            }
            if window.is_empty() {
                self.windows.remove(prefix);
            }
        }
    }

    /// Whether another message from `prefix` is currently allowed,
    /// without recording it. Prunes the window as a side effect.
    pub fn check(&mut self, prefix: &str) -> bool {
        self.prune(prefix);
        let count = self.windows.get(prefix).map(|w| w.len()).unwrap_or(0);
        (count as u32) < self.max_per_hour
    }

    /// Record an admitted message. Callers must call this only after a
    /// message has cleared every gate ahead of the rate limiter.
    pub fn record(&mut self, prefix: &str) {
        self.windows
            .entry(prefix.to_string())
            .or_default()
            .push_back(Instant::now());
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_blocks() {
        let mut limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.check("prefix"));
            limiter.record("prefix");
        }
        assert!(!limiter.check("prefix"));
    }

    #[test]
    fn empty_window_is_evicted_from_map() {
        let mut limiter = RateLimiter::new(5);
        limiter.record("prefix");
        limiter.windows.get_mut("prefix").unwrap()[0] =
            Instant::now() - Duration::from_secs(2 * 60 * 60);
        assert!(limiter.check("prefix"));
        assert_eq!(limiter.len(), 0);
    }

    #[test]
    fn distinct_prefixes_have_independent_windows() {
        let mut limiter = RateLimiter::new(1);
        limiter.record("a");
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }
}
