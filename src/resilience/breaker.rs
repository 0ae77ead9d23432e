//! Per-dependency circuit breaker
//!
//! Wraps calls to one unreliable dependency with a failure-tracking state
//! machine that fails fast while the dependency is down, then probes for
//! recovery with a bounded number of trial calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerSettings;
use crate::error::{GambitError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failure threshold exceeded, calls rejected
    Open,
    /// Recovery period, limited trial calls allowed
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

/// Configuration for one circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes
    pub success_threshold: u32,
    /// Per-call timeout; a timed-out call counts as a failure
    pub call_timeout: Duration,
    /// How long the circuit stays open before the next trial call
    pub reset_duration: Duration,
    /// Maximum concurrent trial calls while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            reset_duration: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl From<BreakerSettings> for CircuitBreakerConfig {
    fn from(s: BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            call_timeout: Duration::from_millis(s.call_timeout_ms),
            reset_duration: Duration::from_secs(s.reset_secs),
            half_open_max_calls: s.half_open_max_calls,
        }
    }
}

/// Notifications emitted on breaker state changes
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// Any state transition
    Transition {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// Failure threshold crossed, circuit opened
    Opened { service: String, failures: u32 },
    /// Trial calls succeeded, circuit closed again
    Recovered { service: String },
}

/// Mutable breaker state, guarded by one lock so every transition is atomic
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    open_until: Option<Instant>,
    half_open_in_flight: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

/// Read-only snapshot of breaker state for dashboards and operators
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Seconds until the open circuit allows a trial call (None when not open)
    pub retry_in_secs: Option<u64>,
    pub uptime_secs: u64,
}

/// Circuit breaker for a single protected dependency
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    created_at: Instant,
    event_tx: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    /// Create a breaker with its own event channel
    pub fn new(service: &str, config: CircuitBreakerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self::with_event_sender(service, config, event_tx)
    }

    /// Create a breaker publishing to a shared event channel
    pub fn with_event_sender(
        service: &str,
        config: CircuitBreakerConfig,
        event_tx: broadcast::Sender<BreakerEvent>,
    ) -> Self {
        Self {
            service: service.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                open_until: None,
                half_open_in_flight: 0,
                last_failure: None,
                last_success: None,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            created_at: Instant::now(),
            event_tx,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Subscribe to breaker state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.event_tx.subscribe()
    }

    /// State as last recorded. An Open circuit moves to HalfOpen only when
    /// the next call is admitted, not when the deadline passes.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Execute an operation through the breaker.
    ///
    /// Applies the per-call timeout; a timeout counts as a failure. Returns
    /// the operation's result, or `BreakerOpen` without invoking it when the
    /// circuit rejects the call.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit().await?;

        self.total_requests.fetch_add(1, Ordering::SeqCst);

        let outcome = tokio::time::timeout(self.config.call_timeout, op()).await;

        match outcome {
            Ok(Ok(value)) => {
                self.on_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure().await;
                Err(e)
            }
            Err(_) => {
                self.on_failure().await;
                Err(GambitError::Timeout {
                    operation: self.service.clone(),
                    elapsed_ms: self.config.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Gate a call: pass through, reject, or admit a half-open trial
    async fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let due = inner
                    .open_until
                    .map(|deadline| Instant::now() >= deadline)
                    .unwrap_or(true);

                if !due {
                    return Err(GambitError::BreakerOpen {
                        service: self.service.clone(),
                    });
                }

                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.half_open_in_flight = 1;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(GambitError::BreakerOpen {
                        service: self.service.clone(),
                    });
                }
                inner.half_open_in_flight += 1;
                Ok(())
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_success = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.open_until = None;
                    inner.half_open_in_flight = 0;
                    let _ = self.event_tx.send(BreakerEvent::Recovered {
                        service: self.service.clone(),
                    });
                    info!(service = %self.service, "circuit breaker recovered");
                }
            }
            // A success completing after the circuit re-opened is discarded
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    self.open_circuit(&mut inner);
                    let _ = self.event_tx.send(BreakerEvent::Opened {
                        service: self.service.clone(),
                        failures,
                    });
                    warn!(
                        service = %self.service,
                        failures, "circuit breaker opened"
                    );
                } else {
                    debug!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        "failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // One failed trial call is enough to re-open
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                let failures = inner.consecutive_failures;
                self.open_circuit(&mut inner);
                let _ = self.event_tx.send(BreakerEvent::Opened {
                    service: self.service.clone(),
                    failures,
                });
                warn!(service = %self.service, "trial call failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    fn open_circuit(&self, inner: &mut BreakerInner) {
        self.transition(inner, CircuitState::Open);
        inner.open_until = Some(Instant::now() + self.config.reset_duration);
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        let _ = self.event_tx.send(BreakerEvent::Transition {
            service: self.service.clone(),
            from,
            to,
        });
        debug!(service = %self.service, %from, %to, "breaker transition");
    }

    /// Operator-triggered recovery: force Closed with zeroed counters
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.open_until = None;
        inner.half_open_in_flight = 0;
        info!(service = %self.service, "circuit breaker reset");
    }

    /// Snapshot of current counters and state; never mutates the breaker
    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        let retry_in_secs = match inner.state {
            CircuitState::Open => inner.open_until.map(|deadline| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .as_secs()
            }),
            _ => None,
        };

        CircuitStats {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: self.total_requests.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            last_failure: inner.last_failure,
            last_success: inner.last_success,
            retry_in_secs,
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}
