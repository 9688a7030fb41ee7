//! Circuit breaker guarding backend dials.
//!
//! Policy: `Closed -> Open` after `max_failures` consecutive failures;
//! `Open -> HalfOpen` lazily once the cooldown has elapsed, triggered by
//! the next dial attempt; `HalfOpen -> Closed` after `max_probes`
//! consecutive successful probes; any half-open failure reopens. While
//! open (or over the probe budget) dials are rejected without touching the
//! network.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use quotient_shared::exception::{QuotientError, QuotientResult};
use quotient_shared::metrics::MetricsSink;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub max_failures: u32,
    /// How long the circuit stays open before probing.
    pub cooldown: Duration,
    /// Probe budget in the half-open window.
    pub max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown: Duration::from_secs(30),
            max_probes: 3,
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0=Closed, 1=Open, 2=HalfOpen.
    pub fn as_gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug)]
enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probes: u32, successes: u32 },
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: State,
    counters: Counters,
}

/// Point-in-time breaker statistics for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        metrics.set_circuit_state(CircuitState::Closed.as_gauge());
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                counters: Counters::default(),
            }),
            metrics,
        }
    }

    /// Check whether a dial may proceed. Must be paired with exactly one
    /// `record_success` / `record_failure` call when it returns `Ok`.
    pub fn before_dial(&self) -> QuotientResult<()> {
        let Ok(mut guard) = self.inner.lock() else {
            return Err(QuotientError::internal("circuit breaker lock poisoned"));
        };
        let inner = &mut *guard;
        inner.counters.total_requests += 1;

        match inner.state {
            State::Closed => Ok(()),
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.cooldown {
                    inner.state = State::HalfOpen {
                        probes: 1,
                        successes: 0,
                    };
                    info!(
                        state = CircuitState::HalfOpen.as_str(),
                        failures = inner.counters.consecutive_failures,
                        "circuit breaker probing backend"
                    );
                    self.metrics
                        .set_circuit_state(CircuitState::HalfOpen.as_gauge());
                    Ok(())
                } else {
                    inner.counters.total_rejections += 1;
                    Err(QuotientError::backend_unavailable("circuit breaker open"))
                }
            }
            State::HalfOpen {
                ref mut probes, ..
            } => {
                if *probes < self.config.max_probes {
                    *probes += 1;
                    Ok(())
                } else {
                    inner.counters.total_rejections += 1;
                    Err(QuotientError::backend_unavailable("circuit breaker open"))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let inner = &mut *guard;
        inner.counters.total_successes += 1;
        inner.counters.consecutive_failures = 0;

        if let State::HalfOpen {
            ref mut successes, ..
        } = inner.state
        {
            *successes += 1;
            if *successes >= self.config.max_probes {
                inner.state = State::Closed;
                info!(
                    state = CircuitState::Closed.as_str(),
                    "circuit breaker closed after successful recovery"
                );
                self.metrics
                    .set_circuit_state(CircuitState::Closed.as_gauge());
            }
        }
    }

    pub fn record_failure(&self) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let inner = &mut *guard;
        inner.counters.total_failures += 1;
        inner.counters.consecutive_failures += 1;

        match inner.state {
            State::Closed => {
                if inner.counters.consecutive_failures >= self.config.max_failures {
                    inner.state = State::Open {
                        opened_at: Instant::now(),
                    };
                    warn!(
                        state = CircuitState::Open.as_str(),
                        failures = inner.counters.consecutive_failures,
                        threshold = self.config.max_failures,
                        "circuit breaker opened"
                    );
                    self.metrics.set_circuit_state(CircuitState::Open.as_gauge());
                }
            }
            State::HalfOpen { .. } => {
                inner.state = State::Open {
                    opened_at: Instant::now(),
                };
                warn!(
                    state = CircuitState::Open.as_str(),
                    failures = inner.counters.consecutive_failures,
                    threshold = self.config.max_failures,
                    "circuit breaker reopened by failed probe"
                );
                self.metrics.set_circuit_state(CircuitState::Open.as_gauge());
            }
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.lock() {
            Ok(inner) => match inner.state {
                State::Closed => CircuitState::Closed,
                State::Open { .. } => CircuitState::Open,
                State::HalfOpen { .. } => CircuitState::HalfOpen,
            },
            Err(_) => CircuitState::Open,
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let state = self.state();
        match self.inner.lock() {
            Ok(inner) => BreakerStats {
                state,
                consecutive_failures: inner.counters.consecutive_failures,
                total_requests: inner.counters.total_requests,
                total_successes: inner.counters.total_successes,
                total_failures: inner.counters.total_failures,
                total_rejections: inner.counters.total_rejections,
            },
            Err(_) => BreakerStats {
                state,
                consecutive_failures: 0,
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
            },
        }
    }
}
