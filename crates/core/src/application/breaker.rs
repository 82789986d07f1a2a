// Circuit Breaker - fail fast while the collector is unreachable

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors matching this predicate neither trip nor heal the breaker
pub type FailurePredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that open the circuit
    pub failure_threshold: u32,
    /// Consecutive successes (while half-open) that close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub timeout: Duration,
    pub excluded: Option<FailurePredicate>,
}

impl CircuitBreakerConfig {
    pub fn exclude_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.excluded = Some(Arc::new(predicate));
        self
    }

    fn is_excluded(&self, err: &(dyn StdError + 'static)) -> bool {
        self.excluded.as_ref().map(|p| (**p)(err)).unwrap_or(false)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout: DEFAULT_OPEN_TIMEOUT,
            excluded: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("timeout", &self.timeout)
            .field("excluded", &self.excluded.is_some())
            .finish()
    }
}

/// Error returned through the breaker
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation
    Open { name: String, retry_after: Duration },
    /// The operation itself failed
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { name, retry_after } => write!(
                f,
                "Circuit breaker '{}' is open (retry in {:.1}s)",
                name,
                retry_after.as_secs_f64()
            ),
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: StdError + 'static> StdError for BreakerError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Config as reported in metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerConfigSnapshot {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_state_change: DateTime<Utc>,
    pub config: BreakerConfigSnapshot,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Last time the circuit opened
    opened_at: Option<Instant>,
    last_state_change: DateTime<Utc>,
}

impl BreakerState {
    fn transition(&mut self, name: &str, to: CircuitState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.last_state_change = Utc::now();
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.success_count = 0;
                warn!(breaker = %name, from = %from, "Circuit opened");
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                info!(breaker = %name, "Circuit half-open, allowing trial calls");
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.opened_at = None;
                info!(breaker = %name, from = %from, "Circuit closed");
            }
        }
    }

    fn remaining_open(&self, timeout: Duration) -> Duration {
        self.opened_at
            .map(|at| timeout.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Three-state circuit breaker shared by all workers.
///
/// The OPEN → HALF_OPEN transition is detected lazily on the next call. The
/// internal lock is released before the guarded operation runs.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_state_change: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    // State is plain counters; a poisoned guard is still coherent
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, applying the lazy OPEN → HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.refresh(&mut state);
        state.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Remaining open time, None unless the circuit is open
    pub fn retry_after(&self) -> Option<Duration> {
        let mut state = self.lock();
        self.refresh(&mut state);
        match state.state {
            CircuitState::Open => Some(state.remaining_open(self.config.timeout)),
            _ => None,
        }
    }

    /// Force the circuit closed and zero the counters
    pub fn reset(&self) {
        let mut state = self.lock();
        state.transition(&self.name, CircuitState::Closed);
        state.failure_count = 0;
        state.success_count = 0;
        info!(breaker = %self.name, "Circuit reset");
    }

    pub fn get_metrics(&self) -> CircuitMetrics {
        let mut state = self.lock();
        self.refresh(&mut state);
        CircuitMetrics {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_state_change: state.last_state_change,
            config: BreakerConfigSnapshot {
                failure_threshold: self.config.failure_threshold,
                success_threshold: self.config.success_threshold,
                timeout_seconds: self.config.timeout.as_secs_f64(),
            },
        }
    }

    /// Run a synchronous operation through the breaker
    pub fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: StdError + 'static,
    {
        self.admit()?;
        let result = operation();
        self.record(&result);
        result.map_err(BreakerError::Inner)
    }

    /// Run an async operation through the breaker
    pub async fn call_async<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        self.admit()?;
        let result = operation().await;
        self.record(&result);
        result.map_err(BreakerError::Inner)
    }

    fn refresh(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open
            && state.remaining_open(self.config.timeout).is_zero()
        {
            state.transition(&self.name, CircuitState::HalfOpen);
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut state = self.lock();
        self.refresh(&mut state);
        if state.state == CircuitState::Open {
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after: state.remaining_open(self.config.timeout),
            });
        }
        Ok(())
    }

    fn record<T, E: StdError + 'static>(&self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.on_success(),
            Err(e) if self.config.is_excluded(e) => {}
            Err(_) => self.on_failure(),
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.transition(&self.name, CircuitState::Closed);
                }
            }
            // Late result of a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.transition(&self.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.failure_count += 1;
                state.transition(&self.name, CircuitState::Open);
            }
            // Late result of a call admitted before the circuit opened; the
            // open window is not extended
            CircuitState::Open => state.failure_count += 1,
        }
    }
}
