//! Generic circuit breaker, reusable by any outbound dependency (broker,
//! result backend), not just one messaging provider.

pub mod circuit_breaker;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};
pub use metrics::{CircuitBreakerMetrics, CircuitState, MetricsCollector};
