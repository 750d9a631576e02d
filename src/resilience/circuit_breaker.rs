//! A generic circuit breaker (closed/open/half-open), reusable by any
//! outbound dependency. Object-safe via [`CircuitBreakerBehavior`] so
//! consumers can work with `&dyn CircuitBreakerBehavior` for uniform health
//! reporting; concrete [`CircuitBreaker`] is preferred in hot paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::metrics::{CircuitBreakerMetrics, CircuitState};

pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self, duration: Duration);
    fn record_failure(&self, duration: Duration);
    fn is_healthy(&self) -> bool;
    fn force_open(&self);
    fn force_closed(&self);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures, while Closed, before the circuit opens.
    pub failure_threshold: u64,
    /// How long the circuit stays Open before a call is allowed through
    /// (transitioning it to HalfOpen) to probe recovery.
    pub open_duration: Duration,
    /// Consecutive successes required while HalfOpen before the circuit
    /// closes again; a failure at any point in HalfOpen reopens it.
    pub success_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u64,
    consecutive_half_open_successes: u64,
}

/// An outbound-call circuit breaker. One instance protects one named
/// dependency (e.g. "broker" or "result-backend").
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    half_open_calls: AtomicU64,
    total_duration_micros: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                consecutive_half_open_successes: 0,
            }),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            half_open_calls: AtomicU64::new(0),
            total_duration_micros: AtomicU64::new(0),
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_half_open_successes = 0;
            }
        }
        tracing::info!(circuit_breaker = %self.name, from_state = ?from, to_state = ?to, "circuit breaker state transition");
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        self.inner.read().unwrap().state
    }

    fn should_allow(&self) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        let mut inner = self.inner.write().unwrap();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            self.half_open_calls.fetch_add(1, Ordering::Relaxed);
            inner.consecutive_half_open_successes += 1;
            if inner.consecutive_half_open_successes >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        let mut inner = self.inner.write().unwrap();
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                self.half_open_calls.fetch_add(1, Ordering::Relaxed);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    fn force_open(&self) {
        let mut inner = self.inner.write().unwrap();
        self.transition(&mut inner, CircuitState::Open);
    }

    fn force_closed(&self) {
        let mut inner = self.inner.write().unwrap();
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read().unwrap();
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let success_count = self.success_count.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let total_duration = Duration::from_micros(self.total_duration_micros.load(Ordering::Relaxed));
        let failure_rate = if total_calls == 0 { 0.0 } else { failure_count as f64 / total_calls as f64 };
        let success_rate = if total_calls == 0 { 0.0 } else { success_count as f64 / total_calls as f64 };
        let average_duration = if total_calls == 0 {
            Duration::ZERO
        } else {
            total_duration / total_calls as u32
        };
        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            consecutive_failures: inner.consecutive_failures,
            half_open_calls: self.half_open_calls.load(Ordering::Relaxed),
            total_duration,
            current_state: inner.state,
            failure_rate,
            success_rate,
            average_duration,
        }
    }
}
