//! Circuit breaker for the upstream API.
//!
//! # States
//!
//! ```text
//! Closed   → Open:     failure_count >= failure_threshold
//! Open     → HalfOpen: recovery_timeout elapsed since the last failure
//! HalfOpen → Closed:   the probe succeeds (failure_count reset to 0)
//! HalfOpen → Open:     the probe fails (timer restarts)
//! ```
//!
//! While Open, [`CircuitBreaker::execute`] returns [`Error::CircuitOpen`] without
//! running the operation. Only one probe runs at a time in HalfOpen; concurrent
//! callers fail fast until it resolves. Calls admitted while Closed that finish
//! after the circuit opened leave the state untouched.
//!
//! Only retryable errors count as failures. A 4xx answer proves the upstream is
//! reachable, so it is recorded as a success.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::env_or;
use crate::error::{Error, Result};

/// Current position in the breaker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is let through.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Reads `UPGUARD_CIRCUIT_FAILURE_THRESHOLD` and `UPGUARD_CIRCUIT_RECOVERY_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: env_or(
                "UPGUARD_CIRCUIT_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )
            .max(1),
            recovery_timeout: Duration::from_secs(env_or(
                "UPGUARD_CIRCUIT_RECOVERY_SECS",
                defaults.recovery_timeout.as_secs(),
            )),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_secs_ago: Option<u64>,
}

/// Fails fast while the upstream is known to be unhealthy.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use upguard::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use upguard::{Error, UpstreamError};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let breaker = CircuitBreaker::new(
///     "records",
///     CircuitBreakerConfig {
///         failure_threshold: 1,
///         recovery_timeout: Duration::from_secs(30),
///     },
/// );
/// let failed: Result<(), Error> = breaker
///     .execute(|| async { Err(UpstreamError::Network("refused".into()).into()) })
///     .await;
/// assert!(failed.is_err());
/// assert_eq!(breaker.state(), CircuitState::Open);
///
/// let rejected = breaker.execute(|| async { Ok(()) }).await;
/// assert!(matches!(rejected, Err(Error::CircuitOpen)));
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A closed breaker. `name` tags its log lines and health snapshot.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current state, applying the Open → HalfOpen transition if it is due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// State, failure count and seconds since the last failure.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_secs_ago: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
        }
    }

    /// Forces the breaker back to Closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
    }

    /// Runs `operation` unless the circuit is open.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] when the call is rejected, otherwise whatever the
    /// operation returns.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Err(err) if err.is_retryable() => permit.failure(),
            _ => permit.success(),
        }
        result
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(Error::CircuitOpen),
        }
    }

    // Open → HalfOpen once the recovery timeout has passed.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .last_failure_at
            .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
            info!(circuit = %self.name, "circuit half-open, allowing probe");
        }
    }

    // Only the probe may move the breaker out of Open or HalfOpen. Calls admitted
    // while Closed that finish after the circuit opened are ignored.
    fn record_success(&self, probe: bool) {
        let mut inner = self.lock();
        if !probe && inner.state != CircuitState::Closed {
            debug!(circuit = %self.name, "late success ignored, circuit not closed");
            return;
        }
        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if !probe && inner.state != CircuitState::Closed {
            debug!(circuit = %self.name, "late failure ignored, circuit not closed");
            return;
        }
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(circuit = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    "failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked: every update is a
        // handful of field stores.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// Admission ticket for one call, remembering whether it is the HalfOpen probe.
// A probe permit dropped without an outcome (the
// caller's future was cancelled) frees the probe slot for the next caller.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}
