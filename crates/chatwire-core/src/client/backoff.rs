//! Reconnect backoff policy.

use super::config::ReconnectConfig;
use std::time::Duration;

/// Exponential backoff with a cap and an attempt budget.
///
/// Attempt `n` (1-based) waits `min(base * 2^(n-1), max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: bool,
    attempts: u32,
}

impl Backoff {
    /// Build from the reconnect section of the client configuration.
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay(),
            max: config.max_delay(),
            max_attempts: config.max_attempts,
            jitter: config.jitter,
            attempts: 0,
        }
    }

    /// Override the configured jitter setting.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay for 1-based `attempt`, without jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }

    /// Count one more attempt and return how long to wait before it.
    ///
    /// Returns `None` once the attempt budget is spent; the counter is not
    /// advanced past the budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;
        let delay = self.delay_for(self.attempts);

        if !self.jitter {
            return Some(delay);
        }
        match jitter_percent() {
            Ok(pct) => Some(delay + delay * pct / 100),
            Err(e) => {
                tracing::warn!("No entropy for reconnect jitter, using plain delay: {}", e);
                Some(delay)
            }
        }
    }

    /// Attempts made since the last successful connection.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt budget is spent.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Uniform in `0..25`.
fn jitter_percent() -> Result<u32, getrandom::Error> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf)?;
    Ok(u32::from_le_bytes(buf) % 25)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(&config(6));
        let delays: Vec<u128> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
        assert!(backoff.exhausted());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(&config(10));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_large_attempt_saturates_at_cap() {
        let backoff = Backoff::new(&config(u32::MAX));
        assert_eq!(backoff.delay_for(64), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounded() {
        let mut backoff = Backoff::new(&config(5)).with_jitter(true);
        for attempt in 1..=5 {
            let base = backoff.delay_for(attempt);
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= base);
            assert!(delay < base + base / 4);
        }
    }

    #[test]
    fn test_jitter_from_config() {
        let mut plain = Backoff::new(&config(64));
        assert!(!plain.jitter);
        assert_eq!(plain.next_delay(), Some(Duration::from_secs(1)));

        let mut jittered = Backoff::new(&ReconnectConfig {
            jitter: true,
            ..config(64)
        });
        assert!(jittered.jitter);
        let delays: Vec<Duration> = std::iter::from_fn(|| jittered.next_delay())
            .skip(5)
            .collect();
        assert_eq!(delays.len(), 59);
        assert!(delays.iter().all(|d| *d >= Duration::from_secs(30)));
        assert!(delays.iter().all(|d| *d < Duration::from_millis(37_500)));
        // 59 draws from 0..25 all landing on zero is not a plausible outcome
        assert!(delays.iter().any(|d| *d > Duration::from_secs(30)));
    }

    #[test]
    fn test_jitter_percent_range() {
        for _ in 0..200 {
            assert!(jitter_percent().unwrap() < 25);
        }
    }

    #[test]
    fn test_zero_budget() {
        let mut backoff = Backoff::new(&config(0));
        assert!(backoff.exhausted());
        assert_eq!(backoff.next_delay(), None);
    }
}
