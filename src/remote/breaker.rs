use std::time::Duration;
use tokio::time::Instant;

pub const FAILURE_THRESHOLD: u32 = 3;
pub const COOLDOWN: Duration = Duration::from_secs(10);

/// Consecutive-failure circuit breaker. State only changes when a call completes;
/// `allow` is a pure check so a refused call never moves the breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open: bool,
    reopen_after: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            open: false,
            reopen_after: None,
        }
    }

    /// Closed, or open with the cooldown elapsed (the next call is a trial call).
    pub fn allow(&self, now: Instant) -> bool {
        if !self.open {
            return true;
        }
        self.reopen_after.map_or(true, |until| now >= until)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn on_success(&mut self) {
        if self.open {
            tracing::info!("Remote circuit breaker closed after a successful trial call");
        }
        self.consecutive_failures = 0;
        self.open = false;
        self.reopen_after = None;
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            if self.open {
                tracing::warn!("Remote trial call failed, circuit breaker stays open");
            } else {
                tracing::warn!(
                    "Remote circuit breaker opened after {} consecutive failures",
                    self.consecutive_failures
                );
            }
            self.open = true;
            self.reopen_after = Some(now + self.cooldown);
        }
    }
}
