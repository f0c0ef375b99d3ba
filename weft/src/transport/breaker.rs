//! Process-level circuit breaker consulted before every connect.
//!
//! Classic three-state machine: CLOSED counts consecutive failures and opens
//! at the threshold; OPEN fails connects fast until the cooldown elapses,
//! then admits one probe in HALF-OPEN; a success closes the breaker, a
//! failure re-opens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use thiserror::Error;

/// Connect refused because the breaker is open.
#[derive(Debug, Error)]
#[error("circuit breaker open, refusing connect")]
pub struct BreakerOpen;

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<(State, Instant)>,
}

static GLOBAL: Lazy<CircuitBreaker> = Lazy::new(|| CircuitBreaker::new(BreakerConfig::default()));

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new((State::Closed { failures: 0 }, Instant::now())),
        }
    }

    /// The process-wide breaker shared by all session transports.
    pub fn global() -> &'static CircuitBreaker {
        &GLOBAL
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (State, Instant)> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Gate one connect attempt.
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let mut guard = self.lock();
        match guard.0 {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open => {
                if guard.1.elapsed() >= self.config.cooldown {
                    guard.0 = State::HalfOpen;
                    Ok(())
                } else {
                    Err(BreakerOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.lock();
        guard.0 = State::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut guard = self.lock();
        match guard.0 {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::warn!(failures, "circuit breaker opened");
                    *guard = (State::Open, Instant::now());
                } else {
                    guard.0 = State::Closed { failures };
                }
            }
            State::HalfOpen => {
                tracing::warn!("circuit breaker re-opened from half-open");
                *guard = (State::Open, Instant::now());
            }
            State::Open => {}
        }
    }

    /// True while connects are refused.
    pub fn is_open(&self) -> bool {
        self.try_acquire_peek()
    }

    fn try_acquire_peek(&self) -> bool {
        let guard = self.lock();
        matches!(guard.0, State::Open) && guard.1.elapsed() < self.config.cooldown
    }
}
