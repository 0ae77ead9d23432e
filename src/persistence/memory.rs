use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AuditEntry, DecisionRecord, DecisionStore};
use crate::domain::{StagedStatus, StagedStrategy};
use crate::error::Result;

/// In-memory store for dry-run mode and tests
#[derive(Default)]
pub struct MemoryStore {
    decisions: RwLock<Vec<DecisionRecord>>,
    staged: RwLock<Vec<StagedStrategy>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn record_decision(&self, record: DecisionRecord) -> Result<()> {
        self.decisions.write().await.push(record);
        Ok(())
    }

    async fn decisions_for_run(&self, run_id: Uuid) -> Result<Vec<DecisionRecord>> {
        Ok(self
            .decisions
            .read()
            .await
            .iter()
            .filter(|d| d.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn save_staged_strategy(&self, staged: &StagedStrategy) -> Result<()> {
        let mut guard = self.staged.write().await;
        if let Some(existing) = guard.iter_mut().find(|s| s.id == staged.id) {
            *existing = staged.clone();
        } else {
            guard.push(staged.clone());
        }
        Ok(())
    }

    async fn due_staged_strategies(&self) -> Result<Vec<StagedStrategy>> {
        Ok(self
            .staged
            .read()
            .await
            .iter()
            .filter(|s| s.status == StagedStatus::Pending)
            .cloned()
            .collect())
    }

    async fn update_staged_status(&self, id: Uuid, status: StagedStatus) -> Result<()> {
        let mut guard = self.staged.write().await;
        match guard.iter_mut().find(|s| s.id == id) {
            Some(staged) => {
                staged.status = status;
                Ok(())
            }
            None => Err(crate::error::GambitError::Validation(format!(
                "no staged strategy with id {id}"
            ))),
        }
    }

    async fn append_audit(
        &self,
        kind: &str,
        detail: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<()> {
        self.audit.write().await.push(AuditEntry {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            detail: detail.to_string(),
            correlation_id,
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
