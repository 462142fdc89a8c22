use std::time::{Duration, Instant};

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker guarding the storage write path.
///
/// Single-writer: only the consumer loop mutates it; probes and health
/// surfaces read the exported gauge. Closed never jumps to half-open
/// directly; the only path is closed -> open -> (cooldown) -> half-open.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    fail_threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(fail_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            fail_threshold: fail_threshold.max(1),
            cooldown,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Advance open -> half-open once the cooldown has elapsed, and report
    /// the current state.
    pub fn poll(&mut self, now: Instant) -> BreakerState {
        if self.state == BreakerState::Open {
            let elapsed = self
                .opened_at
                .map(|at| now.duration_since(at))
                .unwrap_or_default();
            if elapsed >= self.cooldown {
                self.state = BreakerState::HalfOpen;
                info!("circuit breaker half-open; admitting a probe insert");
            }
        }
        self.state
    }

    /// Remaining cooldown while open.
    pub fn time_until_probe(&self, now: Instant) -> Option<Duration> {
        if self.state != BreakerState::Open {
            return None;
        }
        let opened_at = self.opened_at?;
        Some(self.cooldown.saturating_sub(now.duration_since(opened_at)))
    }

    pub fn on_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            info!("circuit breaker closed; storage recovered");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Record a retryable failure that already exhausted in-place retries.
    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                // Failed probe: back to open with a fresh cooldown.
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                warn!(cooldown = ?self.cooldown, "probe insert failed; circuit breaker reopened");
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.fail_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    error!(
                        failures = self.consecutive_failures,
                        cooldown = ?self.cooldown,
                        "circuit breaker opened; pausing consumption"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}
