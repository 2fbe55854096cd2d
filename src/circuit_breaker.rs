//! Per-relay circuit breakers.
//!
//! Stops the client from hammering relays that keep failing.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: `failure_threshold` consecutive failures recorded, requests
//!   are rejected until `reset_timeout` has elapsed since the last failure
//! - **HalfOpen**: Cool-down elapsed, one trial request decides whether the
//!   circuit closes again or re-opens
//!
//! The Open to HalfOpen transition is evaluated lazily whenever the state is
//! read; no timer is involved.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock);
//!
//! if breakers.can_request(url) {
//!     match connect(url).await {
//!         Ok(_) => breakers.record_success(url),
//!         Err(_) => breakers.record_failure(url),
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::CircuitConfig;
use crate::metrics::MetricsService;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    #[default]
    Closed,
    /// Failure threshold exceeded - requests fail fast
    Open,
    /// Testing recovery - one trial request allowed
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for metrics (0=closed, 1=open, 2=half-open).
    pub fn as_gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,

    /// Cool-down after the last failure before a trial is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitConfig> for CircuitBreakerConfig {
    fn from(config: &CircuitConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
        }
    }
}

/// Error returned when the circuit rejects a request.
#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    /// When the circuit will allow a trial request
    pub retry_after: Duration,
    /// Consecutive failures recorded when the request was rejected
    pub failure_count: u32,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Circuit breaker is open ({} consecutive failures), retry after {:?}",
            self.failure_count, self.retry_after
        )
    }
}

impl std::error::Error for CircuitOpenError {}

/// Result of a circuit breaker call.
pub type CircuitResult<T, E> = Result<T, CircuitError<E>>;

/// Error that can occur during a circuit breaker call.
#[derive(Debug)]
pub enum CircuitError<E> {
    /// The circuit is open, request rejected
    Open(CircuitOpenError),
    /// The underlying operation returned an error
    Service(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(e) => write!(f, "{}", e),
            Self::Service(e) => write!(f, "Service error: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(e) => Some(e),
            Self::Service(e) => Some(e),
        }
    }
}

/// Counters tracked by each circuit breaker.
#[derive(Debug, Default)]
pub struct CircuitMetrics {
    /// Total successful calls
    pub success_count: AtomicU64,
    /// Total failed calls
    pub failure_count: AtomicU64,
    /// Total rejected calls (circuit open)
    pub rejected_count: AtomicU64,
    /// Number of times the circuit opened
    pub open_count: AtomicU64,
    /// Number of state transitions
    pub transition_count: AtomicU64,
}

impl CircuitMetrics {
    /// Get total number of recorded outcomes.
    pub fn total_calls(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed) + self.failure_count.load(Ordering::Relaxed)
    }

    /// Reset counters.
    pub fn reset(&self) {
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.rejected_count.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state (after lazy evaluation).
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Time of the last failure (ms since epoch), 0 if none.
    pub last_failure_time: u64,
}

/// Internal state for circuit breaker.
struct InternalState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: u64,
    /// Whether the half-open trial has been handed out
    trial_in_flight: bool,
}

/// Thread-safe circuit breaker for a single relay.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    state: RwLock<InternalState>,
    metrics: CircuitMetrics,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(InternalState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: 0,
                trial_in_flight: false,
            }),
            metrics: CircuitMetrics::default(),
        }
    }

    /// Get current circuit state, moving Open to HalfOpen once the reset
    /// timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        self.check_state_transition();
        let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
        guard.state
    }

    /// Snapshot of state, failure count and last failure time.
    pub fn snapshot(&self) -> CircuitSnapshot {
        self.check_state_transition();
        let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
        CircuitSnapshot {
            state: guard.state,
            failure_count: guard.failure_count,
            last_failure_time: guard.last_failure_time,
        }
    }

    /// Get circuit breaker counters.
    pub fn metrics(&self) -> &CircuitMetrics {
        &self.metrics
    }

    /// Whether a request may be issued. False only while Open.
    ///
    /// In HalfOpen this stays true; callers must not issue more than one
    /// concurrent trial. [`CircuitBreaker::call`] enforces that itself.
    pub fn can_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Check if a guarded call is allowed (without actually making it).
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        self.try_acquire()
    }

    /// Execute a fallible operation through the circuit breaker.
    ///
    /// If the circuit is open, returns `CircuitError::Open` immediately.
    /// The outcome of the operation is recorded.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> CircuitResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(CircuitError::Open)?;

        let result = f().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        };

        result.map_err(CircuitError::Service)
    }

    /// Execute a synchronous fallible operation through the circuit breaker.
    pub fn call_sync<F, T, E>(&self, f: F) -> CircuitResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.try_acquire().map_err(CircuitError::Open)?;

        let result = f();

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        };

        result.map_err(CircuitError::Service)
    }

    /// Record a successful request. Returns the state after recording.
    pub fn record_success(&self) -> CircuitState {
        self.check_state_transition();
        self.metrics.success_count.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        guard.failure_count = 0;
        guard.trial_in_flight = false;
        if guard.state == CircuitState::HalfOpen {
            guard.state = CircuitState::Closed;
            self.metrics
                .transition_count
                .fetch_add(1, Ordering::Relaxed);
        }
        guard.state
    }

    /// Record a failed request. Returns the state after recording.
    pub fn record_failure(&self) -> CircuitState {
        self.check_state_transition();
        self.metrics.failure_count.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_ms();
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        guard.failure_count = guard.failure_count.saturating_add(1);
        guard.last_failure_time = now;
        guard.trial_in_flight = false;

        let trip = match guard.state {
            CircuitState::Closed => guard.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            guard.state = CircuitState::Open;
            self.metrics.open_count.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .transition_count
                .fetch_add(1, Ordering::Relaxed);
        }
        guard.state
    }

    /// Force the circuit to open (for testing or manual intervention).
    pub fn force_open(&self) {
        let now = self.clock.now_ms();
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        if guard.state != CircuitState::Open {
            guard.state = CircuitState::Open;
            guard.last_failure_time = now;
            self.metrics.open_count.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .transition_count
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Administrative reset back to Closed with no recorded failures.
    pub fn reset(&self) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.last_failure_time = 0;
        guard.trial_in_flight = false;
        self.metrics.reset();
    }

    // ========== Internal Methods ==========

    fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        self.check_state_transition();

        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());

        match guard.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                self.metrics.rejected_count.fetch_add(1, Ordering::Relaxed);
                Err(CircuitOpenError {
                    retry_after: self.retry_after(guard.last_failure_time),
                    failure_count: guard.failure_count,
                })
            }
            CircuitState::HalfOpen => {
                if guard.trial_in_flight {
                    self.metrics.rejected_count.fetch_add(1, Ordering::Relaxed);
                    Err(CircuitOpenError {
                        retry_after: Duration::from_secs(1),
                        failure_count: guard.failure_count,
                    })
                } else {
                    guard.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn retry_after(&self, last_failure_time: u64) -> Duration {
        let reopen_at = last_failure_time + self.config.reset_timeout.as_millis() as u64;
        Duration::from_millis(reopen_at.saturating_sub(self.clock.now_ms()))
    }

    fn check_state_transition(&self) {
        let now = self.clock.now_ms();
        let reset_ms = self.config.reset_timeout.as_millis() as u64;

        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());

        // Open -> HalfOpen strictly after the cool-down
        if guard.state == CircuitState::Open && now > guard.last_failure_time + reset_ms {
            guard.state = CircuitState::HalfOpen;
            guard.trial_in_flight = false;
            self.metrics
                .transition_count
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ========== Registry ==========

/// Circuit breakers keyed by relay URL.
///
/// Breakers are created on first use with the registry's configuration.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: Arc<MetricsService>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self::with_metrics(config, clock, Arc::new(MetricsService::disabled()))
    }

    /// Create an empty registry reporting state changes to `metrics`.
    pub fn with_metrics(
        config: CircuitBreakerConfig,
        clock: SharedClock,
        metrics: Arc<MetricsService>,
    ) -> Self {
        Self {
            config,
            clock,
            breakers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Get the breaker for `url`, creating it if needed.
    pub fn breaker(&self, url: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
        {
            return existing.clone();
        }

        let mut guard = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.config.clone(), self.clock.clone()))
            })
            .clone()
    }

    fn existing(&self, url: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    /// State of the circuit for `url`. Unknown relays are Closed.
    pub fn get_state(&self, url: &str) -> CircuitState {
        self.existing(url)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether a request to `url` may be issued.
    pub fn can_request(&self, url: &str) -> bool {
        self.get_state(url) != CircuitState::Open
    }

    /// Record a successful request to `url`.
    pub fn record_success(&self, url: &str) -> CircuitState {
        let breaker = self.breaker(url);
        let before = breaker.state();
        let after = breaker.record_success();
        self.report(url, before, after);
        after
    }

    /// Record a failed request to `url`.
    pub fn record_failure(&self, url: &str) -> CircuitState {
        let breaker = self.breaker(url);
        let before = breaker.state();
        let after = breaker.record_failure();
        self.report(url, before, after);
        after
    }

    /// Reset the circuit for `url` to Closed.
    pub fn reset(&self, url: &str) {
        if let Some(breaker) = self.existing(url) {
            breaker.reset();
            debug!("Circuit for {} reset", url);
        }
        self.metrics
            .circuit_breaker_state(url, CircuitState::Closed.as_gauge());
    }

    /// Drop the breaker for `url` entirely.
    pub fn remove(&self, url: &str) {
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
    }

    /// URLs whose circuit is currently Open.
    pub fn open_relays(&self) -> Vec<String> {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        breakers
            .into_iter()
            .filter(|(_, b)| b.state() == CircuitState::Open)
            .map(|(url, _)| url)
            .collect()
    }

    fn report(&self, url: &str, before: CircuitState, after: CircuitState) {
        if before == after {
            return;
        }
        self.metrics.circuit_breaker_state(url, after.as_gauge());
        if after == CircuitState::Open {
            info!("Circuit opened for relay {}", url);
            self.metrics.circuit_breaker_trip(url);
        } else {
            info!("Circuit for relay {} moved {:?} -> {:?}", url, before, after);
        }
    }
}

// ========== Tests ==========
