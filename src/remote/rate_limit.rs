use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

/// Rolling one-second call budget combined with a minimum spacing between calls.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rps: u32,
    min_interval: Duration,
    accepted: VecDeque<Instant>,
    last_accepted: Option<Instant>,
}

impl RateLimiter {
    pub fn new(rps: u32, min_interval: Duration) -> Self {
        Self {
            rps: rps.max(1),
            min_interval,
            accepted: VecDeque::new(),
            last_accepted: None,
        }
    }

    pub fn update(&mut self, rps: u32, min_interval: Duration) {
        self.rps = rps.max(1);
        self.min_interval = min_interval;
    }

    pub fn rps(&self) -> u32 {
        self.rps
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.accepted.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Reserve a slot for a call at `now`. Returns false when rate limited.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.accepted.len() >= self.rps as usize {
            return false;
        }
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.accepted.push_back(now);
        self.last_accepted = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_call_in_same_instant_is_rejected() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(2, Duration::ZERO);
        assert!(limiter.try_acquire(now));
        assert!(limiter.try_acquire(now));
        assert!(!limiter.try_acquire(now));
        assert!(limiter.try_acquire(now + Duration::from_secs(1)));
    }

    #[test]
    fn min_interval_spaces_calls() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(10, Duration::from_millis(600));
        assert!(limiter.try_acquire(now));
        assert!(!limiter.try_acquire(now + Duration::from_millis(599)));
        assert!(limiter.try_acquire(now + Duration::from_millis(600)));
    }

    #[test]
    fn rejected_calls_do_not_consume_budget() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(1, Duration::ZERO);
        assert!(limiter.try_acquire(now));
        for _ in 0..5 {
            assert!(!limiter.try_acquire(now + Duration::from_millis(500)));
        }
        assert!(limiter.try_acquire(now + Duration::from_secs(1)));
    }

    #[test]
    fn update_applies_new_limits() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(1, Duration::ZERO);
        assert!(limiter.try_acquire(now));
        limiter.update(3, Duration::ZERO);
        assert!(limiter.try_acquire(now));
        limiter.update(0, Duration::ZERO);
        assert_eq!(limiter.rps(), 1);
    }
}
