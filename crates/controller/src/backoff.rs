//! Reconnect backoff: doubling delays with an upper bound past which the
//! caller should stop trying.

use std::time::Duration;

/// Maximum random jitter added to each reconnect wait.
const MAX_JITTER_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Back to the initial interval; call after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Delay to wait before the next attempt, or `None` once the interval
    /// has grown past the maximum.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current > self.max {
            return None;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        Some(delay)
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Uniform jitter in `[0, 1000]` ms, spreads out reconnect storms.
pub fn jitter() -> Duration {
    Duration::from_millis(fastrand::u64(0..=MAX_JITTER_MS))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn doubles_from_one_to_thirty_two_then_gives_up() {
        let mut b = Backoff::new(secs(1), secs(32));
        let delays: Vec<u64> = std::iter::from_fn(|| b.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32]);
        assert_eq!(b.next_delay(), None, "stays exhausted");
    }

    #[test]
    fn reset_restores_initial_interval() {
        let mut b = Backoff::new(secs(1), secs(32));
        b.next_delay();
        b.next_delay();
        b.next_delay();
        assert_eq!(b.current(), secs(8));
        b.reset();
        assert_eq!(b.next_delay(), Some(secs(1)));
    }

    #[test]
    fn reset_after_exhaustion_allows_retry() {
        let mut b = Backoff::new(secs(1), secs(2));
        assert_eq!(b.next_delay(), Some(secs(1)));
        assert_eq!(b.next_delay(), Some(secs(2)));
        assert_eq!(b.next_delay(), None);
        b.reset();
        assert_eq!(b.next_delay(), Some(secs(1)));
    }

    #[test]
    fn jitter_stays_within_one_second() {
        for _ in 0..1000 {
            assert!(jitter() <= Duration::from_millis(1000));
        }
    }
}
