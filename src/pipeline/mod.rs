//! Six-stage trading pipeline
//!
//! MarketScan → AssetSelection → StrategyGeneration → Validation →
//! Staging → Execution, tracked per run by correlation id.

pub mod context;
pub mod orchestrator;
pub mod stage;
pub mod worker;

pub use context::{RunState, RunStatus, RunTracker};
pub use orchestrator::{BotStatus, PipelineOrchestrator, SVC_ADVISOR, SVC_BROKERAGE};
pub use stage::Stage;
pub use worker::StageQueue;
