//! Reliability primitives used to guard collaborator calls.

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerState,
    CircuitBreakerStats, StateChange,
};
