//! Retry engine with exponential backoff, jitter, and dead-letter hand-off
//!
//! Operation classes carry distinct retry profiles: market-data reads retry
//! aggressively with jitter, storage retries only connection-shaped errors,
//! trade execution retries transport errors a couple of times with
//! predictable (unjittered) timing, background maintenance retries over a
//! long horizon.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::dlq::{DeadLetterItem, DeadLetterQueue};
use crate::error::{GambitError, Result};

/// Decides whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&GambitError) -> bool + Send + Sync>;

/// Invoked once when an operation exhausts its attempts
pub type ExhaustionCallback = Arc<dyn Fn(&str, &GambitError) + Send + Sync>;

/// Retry tuning for one operation class
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Perturb each delay by ±25% to avoid synchronized retry storms
    pub jitter: bool,
    /// None retries every error
    pub retryable: Option<RetryPredicate>,
    /// Whether exhausted operations get an automatic DLQ replay schedule.
    /// Trade-critical operations set this false: silently replaying an
    /// order an hour later is never acceptable, so they wait for an
    /// operator instead.
    pub dlq_schedule: bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("has_predicate", &self.retryable.is_some())
            .field("dlq_schedule", &self.dlq_schedule)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retryable: None,
            dlq_schedule: true,
        }
    }
}

impl RetryPolicy {
    /// External read APIs (market scans, quotes): many jittered attempts
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retryable: Some(Arc::new(|e| e.is_transient())),
            dlq_schedule: true,
        }
    }

    /// Storage operations: connection/timeout errors only
    pub fn storage() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
            retryable: Some(Arc::new(|e| e.is_connection_error())),
            dlq_schedule: true,
        }
    }

    /// Trade execution: transport errors only, never business-rule
    /// rejections, no jitter so timing stays predictable
    pub fn trading() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
            retryable: Some(Arc::new(|e| e.is_transport_error())),
            dlq_schedule: false,
        }
    }

    /// Background maintenance jobs: long horizon, lenient
    pub fn maintenance() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
            retryable: Some(Arc::new(|e| e.is_transient())),
            dlq_schedule: true,
        }
    }

    /// Backoff before the attempt after `attempt` failed:
    /// `min(max_delay, base_delay * multiplier^(attempt-1))`, before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let raw = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }
}

/// What one retried call produced
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// How many times the operation was invoked
    pub attempts: u32,
    /// Total backoff slept between attempts
    pub total_delay: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Retry executor, optionally wired to a dead-letter queue
pub struct Retrier {
    dlq: Option<Arc<DeadLetterQueue>>,
    dlq_retry_delay: ChronoDuration,
    on_exhausted: Option<ExhaustionCallback>,
}

impl Retrier {
    pub fn new() -> Self {
        Self {
            dlq: None,
            dlq_retry_delay: ChronoDuration::seconds(3600),
            on_exhausted: None,
        }
    }

    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>, retry_delay: ChronoDuration) -> Self {
        self.dlq = Some(dlq);
        self.dlq_retry_delay = retry_delay;
        self
    }

    pub fn with_exhaustion_callback(mut self, callback: ExhaustionCallback) -> Self {
        self.on_exhausted = Some(callback);
        self
    }

    /// Retry an anonymous operation. Exhaustion is not dead-lettered.
    pub async fn execute<T, F, Fut>(&self, policy: &RetryPolicy, op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(None, serde_json::Value::Null, policy, op).await
    }

    /// Retry a named operation; on exhaustion the failure is dead-lettered
    /// with the supplied payload and the exhaustion callback fires.
    pub async fn execute_named<T, F, Fut>(
        &self,
        operation: &str,
        payload: serde_json::Value,
        policy: &RetryPolicy,
        op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(Some(operation), payload, policy, op).await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: Option<&str>,
        payload: serde_json::Value,
        policy: &RetryPolicy,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut total_delay = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation.unwrap_or("anonymous"),
                            attempt, "operation recovered after retries"
                        );
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_delay,
                    };
                }
                Err(e) => {
                    let retryable = policy
                        .retryable
                        .as_ref()
                        .map(|pred| pred(&e))
                        .unwrap_or(true);

                    if !retryable {
                        debug!(
                            operation = operation.unwrap_or("anonymous"),
                            attempt, error = %e, "error not retryable, stopping"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            total_delay,
                        };
                    }

                    if attempt >= policy.max_attempts {
                        warn!(
                            operation = operation.unwrap_or("anonymous"),
                            attempts = attempt, error = %e, "retries exhausted"
                        );
                        if let Some(name) = operation {
                            self.dead_letter(name, payload, &e, attempt, policy).await;
                        }
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            total_delay,
                        };
                    }

                    let delay = policy.jittered_delay(attempt);
                    debug!(
                        operation = operation.unwrap_or("anonymous"),
                        attempt, delay_ms = delay.as_millis() as u64, error = %e,
                        "retrying after backoff"
                    );
                    total_delay += delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        operation: &str,
        payload: serde_json::Value,
        error: &GambitError,
        attempts: u32,
        policy: &RetryPolicy,
    ) {
        if let Some(ref dlq) = self.dlq {
            let next_retry_at = policy
                .dlq_schedule
                .then(|| Utc::now() + self.dlq_retry_delay);
            dlq.push(DeadLetterItem::new(
                operation,
                payload,
                &error.to_string(),
                attempts,
                next_retry_at,
            ))
            .await;
        }

        if let Some(ref callback) = self.on_exhausted {
            callback(operation, error);
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: false,
            retryable: None,
            dlq_schedule: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_op_called_exactly_n_times() {
        let retrier = Retrier::new();
        let calls = AtomicU32::new(0);

        let outcome = retrier
            .execute::<(), _, _>(&fast_policy(4), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GambitError::Transport("down".into())) }
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40 ms of backoff between the four attempts
        assert_eq!(outcome.total_delay, Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let retrier = Retrier::new();

        let outcome = retrier
            .execute(&fast_policy(5), |attempt| async move {
                if attempt < 3 {
                    Err(GambitError::Transport("flaky".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.into_result().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_predicate_short_circuits() {
        let retrier = Retrier::new();
        let calls = AtomicU32::new(0);

        let policy = RetryPolicy {
            retryable: Some(Arc::new(|e| e.is_transient())),
            ..fast_policy(5)
        };

        let outcome = retrier
            .execute::<(), _, _>(&policy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GambitError::OrderRejected("bad params".into())) }
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_dead_letters_named_operation() {
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let retrier =
            Retrier::new().with_dlq(dlq.clone(), ChronoDuration::seconds(3600));

        let outcome = retrier
            .execute_named::<(), _, _>(
                "scan_markets",
                serde_json::json!({"universe": "us_equities"}),
                &fast_policy(3),
                |_| async { Err(GambitError::Transport("down".into())) },
            )
            .await;

        assert!(!outcome.is_success());
        let items = dlq.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, "scan_markets");
        assert_eq!(items[0].attempts, 3);
        assert!(items[0].next_retry_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trading_profile_dead_letter_is_unscheduled() {
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let retrier =
            Retrier::new().with_dlq(dlq.clone(), ChronoDuration::seconds(3600));

        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::trading()
        };

        let outcome = retrier
            .execute_named::<(), _, _>(
                "place_order",
                serde_json::json!({"symbol": "AAPL"}),
                &policy,
                |_| async { Err(GambitError::Transport("down".into())) },
            )
            .await;

        assert_eq!(outcome.attempts, 2);
        let items = dlq.items().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_predicate_short_circuit_is_not_dead_lettered() {
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let retrier =
            Retrier::new().with_dlq(dlq.clone(), ChronoDuration::seconds(3600));

        let outcome = retrier
            .execute_named::<(), _, _>(
                "place_order",
                serde_json::Value::Null,
                &RetryPolicy::trading(),
                |_| async { Err(GambitError::OrderRejected("below minimum".into())) },
            )
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(dlq.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_callback_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let retrier = Retrier::new().with_exhaustion_callback(Arc::new(move |op, _| {
            assert_eq!(op, "scan_markets");
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let _ = retrier
            .execute_named::<(), _, _>(
                "scan_markets",
                serde_json::Value::Null,
                &fast_policy(2),
                |_| async { Err(GambitError::Transport("down".into())) },
            )
            .await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_formula_without_jitter() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        // Capped at max_delay
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            ..Default::default()
        };

        for _ in 0..200 {
            let delay = policy.jittered_delay(1).as_millis() as i64;
            assert!((750..=1250).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_trading_profile_is_unjittered() {
        let policy = RetryPolicy::trading();
        assert!(!policy.jitter);
        assert!(!policy.dlq_schedule);
        assert_eq!(policy.jittered_delay(1), policy.delay_for(1));
    }
}
