// Process-global circuit breaker guarding the upstream.
//
// CLOSED counts failures toward a threshold (successes count back down);
// OPEN rejects everything until the open window elapses; HALF_OPEN admits
// exactly one trial whose outcome decides the next state.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    open_for: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
            failure_threshold,
            open_for,
        }
    }

    /// Whether a dispatch may proceed. An OPEN breaker whose window has
    /// elapsed flips to HALF_OPEN and admits this caller as the single
    /// trial; further callers are rejected until the trial reports back.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::ZERO, |at| at.elapsed());
                if elapsed >= self.open_for {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!(
                        "[Breaker] OPEN window elapsed ({}s), admitting half-open trial",
                        elapsed.as_secs()
                    );
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    /// Report the outcome of a dispatch.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                if success {
                    inner.failure_count = inner.failure_count.saturating_sub(1);
                } else {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.failure_threshold {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        tracing::warn!(
                            "[Breaker] Tripped OPEN after {} failure(s)",
                            inner.failure_count
                        );
                    }
                }
            }
            BreakerState::HalfOpen => {
                if success {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.opened_at = None;
                    tracing::info!("[Breaker] Half-open trial succeeded, closing");
                } else {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!("[Breaker] Half-open trial failed, reopening");
                }
            }
            // A late report while OPEN changes nothing
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }
}
