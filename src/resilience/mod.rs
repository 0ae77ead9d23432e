//! Failure handling for unreliable dependencies
//!
//! Three cooperating layers: per-dependency circuit breakers that fail
//! fast, a retry engine with profile-specific backoff, and a dead-letter
//! queue for operations that exhausted their retries.

pub mod breaker;
pub mod dlq;
pub mod registry;
pub mod retry;

pub use breaker::{
    BreakerEvent, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats,
};
pub use dlq::{
    DeadLetterItem, DeadLetterQueue, DlqScheduler, DlqSchedulerConfig, DlqStats, ReplayHandler,
};
pub use registry::{BreakerConfigSource, BreakerRegistry, BreakerSystemHealth};
pub use retry::{ExhaustionCallback, Retrier, RetryOutcome, RetryPolicy, RetryPredicate};
