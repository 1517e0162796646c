//! Circuit breaker around a stage executor backend.
//!
//! Consecutive transient failures from one stage's executor open the circuit;
//! while open, jobs of that stage fail fast as transient so the retry policy
//! pushes them back instead of hammering a backend that is down. Permanent
//! failures describe the job, not the backend, and never trip the circuit.
//!
//! ```text
//! CLOSED --[N transient failures]--> OPEN --[recovery timeout]--> HALF_OPEN
//!   ^                                  ^                              |
//!   |                                  +--------[probe failure]-------+
//!   +---------------------------[M probe successes]-------------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::job::StageFailure;
use crate::retry::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successful probes needed in half-open state to close again.
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    /// Applied to the recovery timeout when the backend reported a rate limit.
    pub rate_limit_backoff_multiplier: f32,
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    recovery_timeout: Duration,
}

impl BreakerState {
    fn closed(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_error: None,
            recovery_timeout: config.recovery_timeout,
        }
    }

    fn time_until_half_open(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        self.opened_at
            .map(|t| self.recovery_timeout.saturating_sub(t.elapsed()))
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerState::closed(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error.clone(),
            time_until_half_open: inner.time_until_half_open(),
        }
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// An open circuit short-circuits into a transient [`StageFailure`]
    /// without invoking the operation.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, StageFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageFailure>>,
    {
        {
            let mut inner = self.lock();
            self.maybe_half_open(&mut inner);
            if inner.state == CircuitState::Open {
                let retry_after = inner
                    .time_until_half_open()
                    .unwrap_or(inner.recovery_timeout);
                return Err(StageFailure::transient(format!(
                    "circuit '{}' is open, retry after {}s",
                    self.name,
                    retry_after.as_secs()
                )));
            }
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(failure) => self.record_failure(failure),
        }
        result
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "Circuit closed after successful probes");
                    *inner = BreakerState::closed(&self.config);
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, failure: &StageFailure) {
        if failure.class == ErrorClass::Permanent {
            return;
        }
        let mut inner = self.lock();
        inner.last_error = Some(failure.message.clone());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %failure.message,
                        "Circuit opened"
                    );
                    self.open(&mut inner, failure.rate_limited);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(circuit = %self.name, error = %failure.message, "Probe failed, circuit reopened");
                inner.success_count = 0;
                self.open(&mut inner, failure.rate_limited);
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerState::closed(&self.config);
    }

    fn open(&self, inner: &mut BreakerState, rate_limited: bool) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        if rate_limited {
            let extended = inner.recovery_timeout.as_secs_f32()
                * self.config.rate_limit_backoff_multiplier;
            inner.recovery_timeout = std::cmp::min(
                Duration::from_secs_f32(extended),
                self.config.max_recovery_timeout,
            );
            tracing::info!(
                circuit = %self.name,
                recovery_timeout_secs = inner.recovery_timeout.as_secs(),
                "Rate limited, extended recovery timeout"
            );
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened) = inner.opened_at
            && opened.elapsed() >= inner.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit half-open");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
    }
}
