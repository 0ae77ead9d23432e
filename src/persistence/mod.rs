//! Decision store and audit trail
//!
//! Every pipeline stage writes a decision record keyed by the run's
//! correlation id, so a run can be reconstructed after the fact. Staged
//! strategies live here too, between the Staging stage and execution.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{StagedStatus, StagedStrategy};
use crate::error::Result;
use crate::pipeline::Stage;

/// Outcome of a single stage decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Accepted,
    Rejected,
    Failed,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Accepted => "accepted",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::Failed => "failed",
        }
    }
}

/// One stage's recorded input, output, and verdict for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage: Stage,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub confidence: Option<f64>,
    pub status: DecisionStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn accepted(
        run_id: Uuid,
        stage: Stage,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage,
            input,
            output,
            confidence: None,
            status: DecisionStatus::Accepted,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn rejected(
        run_id: Uuid,
        stage: Stage,
        input: serde_json::Value,
        reason: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage,
            input,
            output: serde_json::Value::Null,
            confidence: None,
            status: DecisionStatus::Rejected,
            error: Some(reason.to_string()),
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(run_id: Uuid, stage: Stage, error: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage,
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            confidence: None,
            status: DecisionStatus::Failed,
            error: Some(error.to_string()),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Free-form audit entry, optionally tied to a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: String,
    pub detail: String,
    pub correlation_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// Storage abstraction for run decisions, staged strategies, and audit
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn record_decision(&self, record: DecisionRecord) -> Result<()>;

    /// All decisions for a run, in recording order
    async fn decisions_for_run(&self, run_id: Uuid) -> Result<Vec<DecisionRecord>>;

    async fn save_staged_strategy(&self, staged: &StagedStrategy) -> Result<()>;

    /// Staged strategies still pending execution
    async fn due_staged_strategies(&self) -> Result<Vec<StagedStrategy>>;

    async fn update_staged_status(&self, id: Uuid, status: StagedStatus) -> Result<()>;

    async fn append_audit(
        &self,
        kind: &str,
        detail: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<()>;
}
