//! Circuit Breaker Implementation
//!
//! Guards calls to flaky collaborators. After too many consecutive failures
//! the breaker opens and fails fast until the reset timeout has elapsed, then
//! lets trial calls through in half-open state.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker errors
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Breaker is open; the operation was not invoked
    Open,
    /// The operation ran and returned this error
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open)
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Open => None,
            CircuitBreakerError::Inner(e) => Some(e),
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open => write!(f, "Circuit breaker is open - operation blocked"),
            CircuitBreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Requests flow through normally
    #[default]
    Closed,
    /// Requests are blocked
    Open,
    /// Trial requests test whether the dependency recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time after the last failure before a trial call is allowed
    pub reset_timeout: Duration,

    /// Successes needed in half-open state to close the circuit
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
        }
    }
}

/// Notification passed to state-change callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: CircuitBreakerState,
    pub to: CircuitBreakerState,
    /// Failure count at the moment of the transition, before the reset
    pub failure_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Statistics for circuit breaker operations
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
    pub state_transitions: u64,
    pub current_state: CircuitBreakerState,
    pub failure_count: u32,
    pub success_count: u32,
}

impl CircuitBreakerStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    pub fn block_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.blocked_requests as f64 / self.total_requests as f64
        }
    }
}

type StateChangeCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    callbacks: RwLock<Vec<StateChangeCallback>>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    blocked_requests: AtomicU64,
    state_transitions: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
            callbacks: RwLock::new(Vec::new()),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a callback invoked after every state transition
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Run `operation` through the breaker.
    ///
    /// The operation is awaited with no lock held. When the breaker is open
    /// and the reset timeout has not elapsed it is not invoked at all.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let change = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitBreakerState::Open => {
                    let elapsed = inner
                        .last_failure
                        .map(|t| t.elapsed())
                        .unwrap_or(self.config.reset_timeout);
                    if elapsed >= self.config.reset_timeout {
                        Some(self.transition_locked(&mut inner, CircuitBreakerState::HalfOpen))
                    } else {
                        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
                        debug!(breaker = %self.name, "Circuit breaker open, blocking call");
                        return Err(CircuitBreakerError::Open);
                    }
                }
                CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => None,
            }
        };
        if let Some(change) = change {
            self.notify(&change);
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        let change = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitBreakerState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitBreakerState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.half_open_success_threshold {
                        Some(self.transition_locked(&mut inner, CircuitBreakerState::Closed))
                    } else {
                        None
                    }
                }
                // A call admitted before another caller re-opened the breaker
                CircuitBreakerState::Open => None,
            }
        };
        if let Some(change) = change {
            self.notify(&change);
        }
    }

    fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        let change = {
            let mut inner = self.inner.lock();
            inner.last_failure = Some(Instant::now());
            match inner.state {
                CircuitBreakerState::Closed => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        Some(self.transition_locked(&mut inner, CircuitBreakerState::Open))
                    } else {
                        None
                    }
                }
                CircuitBreakerState::HalfOpen => {
                    inner.failure_count += 1;
                    Some(self.transition_locked(&mut inner, CircuitBreakerState::Open))
                }
                CircuitBreakerState::Open => None,
            }
        };
        if let Some(change) = change {
            self.notify(&change);
        }
    }

    /// Caller must hold the inner lock; counters reset on every transition
    fn transition_locked(&self, inner: &mut BreakerInner, to: CircuitBreakerState) -> StateChange {
        let change = StateChange {
            from: inner.state,
            to,
            failure_count: inner.failure_count,
            timestamp: Utc::now(),
        };
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        if to == CircuitBreakerState::Open {
            inner.last_failure = Some(Instant::now());
        }
        self.state_transitions.fetch_add(1, Ordering::Relaxed);

        match to {
            CircuitBreakerState::Open => warn!(
                breaker = %self.name,
                from = %change.from,
                failures = change.failure_count,
                "Circuit breaker opened"
            ),
            CircuitBreakerState::HalfOpen => {
                info!(breaker = %self.name, "Circuit breaker half-open, testing recovery")
            }
            CircuitBreakerState::Closed => {
                info!(breaker = %self.name, from = %change.from, "Circuit breaker closed")
            }
        }
        change
    }

    fn notify(&self, change: &StateChange) {
        let callbacks: Vec<StateChangeCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(change);
        }
    }

    fn force(&self, to: CircuitBreakerState) {
        let change = {
            let mut inner = self.inner.lock();
            if inner.state == to {
                None
            } else {
                Some(self.transition_locked(&mut inner, to))
            }
        };
        if let Some(change) = change {
            self.notify(&change);
        }
    }

    pub fn force_open(&self) {
        self.force(CircuitBreakerState::Open);
    }

    pub fn force_closed(&self) {
        self.force(CircuitBreakerState::Closed);
    }

    pub fn force_half_open(&self) {
        self.force(CircuitBreakerState::HalfOpen);
    }

    /// Return to a pristine closed breaker, clearing statistics
    pub fn reset(&self) {
        self.force_closed();
        {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.last_failure = None;
        }
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.blocked_requests.store(0, Ordering::Relaxed);
        self.state_transitions.store(0, Ordering::Relaxed);
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            current_state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }
}
