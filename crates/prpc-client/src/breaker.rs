//! Circuit breaker guarding remote calls.
//!
//! One breaker exists per `{group}.{service}.{method}` name. It counts
//! outcomes over a rolling window and trips once enough requests were seen
//! and the error share crosses a threshold. After a sleep window a single
//! trial call is let through: success closes the circuit, failure reopens it.
//!
//! States:
//! - Closed: calls proceed and are counted
//! - Open: calls are rejected with `CircuitOpen` without running
//! - HalfOpen: one trial call in flight, others rejected

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use prpc_common::{PrpcError, Result};
use tokio::sync::Semaphore;

/// Circuit breaker configuration
///
/// # Default Configuration
///
/// - `timeout`: 1 second per call
/// - `max_concurrent_requests`: 100
/// - `sleep_window`: 5 seconds before probing recovery
/// - `request_volume_threshold`: 20 requests per window before tripping is considered
/// - `error_percent_threshold`: 50
/// - `rolling_window`: 10 seconds
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Execution deadline of one protected call
    pub timeout: Duration,
    /// Calls beyond this many in flight are rejected with `MaxConcurrency`
    pub max_concurrent_requests: usize,
    /// Time the circuit stays open before a trial is allowed
    pub sleep_window: Duration,
    /// Minimum requests in the window before the error rate is evaluated
    pub request_volume_threshold: u64,
    /// Error share (0-100) at which the circuit opens
    pub error_percent_threshold: u64,
    /// Length of the counting window
    pub rolling_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_concurrent_requests: 100,
            sleep_window: Duration::from_secs(5),
            request_volume_threshold: 20,
            error_percent_threshold: 50,
            rolling_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// The caller stopped waiting before the call finished
    Abandoned,
}

struct Window {
    started: Instant,
    requests: u64,
    failures: u64,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: 0,
            failures: 0,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    opened_at: Instant,
    trial_in_flight: bool,
    window: Window,
}

/// A circuit breaker for one protected operation.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    concurrency: Semaphore,
    inner: Mutex<BreakerInner>,
}

/// An admitted call. Dropping it unrecorded counts as [`Outcome::Abandoned`].
struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl Attempt<'_> {
    fn record(mut self, outcome: Outcome) {
        self.recorded = true;
        self.breaker.record(outcome, self.trial);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(Outcome::Abandoned, self.trial);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            concurrency: Semaphore::new(config.max_concurrent_requests),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                opened_at: Instant::now(),
                trial_in_flight: false,
                window: Window::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `call` under the breaker.
    ///
    /// # Errors
    ///
    /// - `CircuitOpen` if the circuit rejects the call; `call` is not run
    /// - `MaxConcurrency` if too many calls are in flight; `call` is not run
    /// - `Timeout` if `call` exceeds the configured deadline
    /// - whatever `call` returns otherwise
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .concurrency
            .try_acquire()
            .map_err(|_| PrpcError::MaxConcurrency(self.name.clone()))?;
        let attempt = self.admit()?;

        let result = match tokio::time::timeout(self.config.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(PrpcError::Timeout(self.config.timeout.as_millis() as u64)),
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            // The server answered; the service is up.
            Err(PrpcError::Remote(_)) => Outcome::Success,
            Err(_) => Outcome::Failure,
        };
        attempt.record(outcome);
        result
    }

    fn admit(&self) -> Result<Attempt<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                if inner.opened_at.elapsed() < self.config.sleep_window {
                    return Err(PrpcError::CircuitOpen(self.name.clone()));
                }
                tracing::info!(breaker = %self.name, "circuit half-open, probing");
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(PrpcError::CircuitOpen(self.name.clone()));
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(Attempt {
            breaker: self,
            trial,
            recorded: false,
        })
    }

    fn record(&self, outcome: Outcome, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                if outcome == Outcome::Success {
                    tracing::info!(breaker = %self.name, "circuit closed");
                    inner.state = BreakerState::Closed;
                    inner.window = Window::new();
                } else {
                    tracing::warn!(breaker = %self.name, "trial failed, circuit reopened");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Instant::now();
                }
            }
            BreakerState::Closed => {
                if outcome == Outcome::Abandoned {
                    return;
                }
                if inner.window.started.elapsed() >= self.config.rolling_window {
                    inner.window = Window::new();
                }
                inner.window.requests += 1;
                if outcome == Outcome::Failure {
                    inner.window.failures += 1;
                }

                let (requests, failures) = (inner.window.requests, inner.window.failures);
                if requests >= self.config.request_volume_threshold
                    && failures * 100 >= self.config.error_percent_threshold * requests
                {
                    tracing::warn!(
                        breaker = %self.name,
                        requests,
                        failures,
                        "circuit opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Instant::now();
                }
            }
            // Calls admitted before the circuit opened.
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }
}

/// Lazily created breakers, one per name, sharing one configuration.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, configuring it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "configure circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.config.clone()))
            })
            .clone()
    }
}

/// Breaker name of a method: `{group}.{service}.{method}`.
pub fn breaker_name(group: &str, service: &str, method: &str) -> String {
    format!("{}.{}.{}", group, service, method)
}
