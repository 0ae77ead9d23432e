pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod health;
pub mod persistence;
pub mod pipeline;
pub mod resilience;

pub use config::AppConfig;
pub use error::{GambitError, Result};
pub use events::{BotEvent, EventBus, EventEnvelope};
pub use health::{Alert, AlertHub, AlertSeverity, HealthMonitor, SystemHealth};
pub use persistence::{DecisionRecord, DecisionStatus, DecisionStore, MemoryStore, PostgresStore};
pub use pipeline::{BotStatus, PipelineOrchestrator, RunStatus, RunTracker, Stage};
pub use resilience::{
    BreakerRegistry, CircuitBreaker, CircuitState, DeadLetterQueue, DlqScheduler, Retrier,
    RetryPolicy,
};
