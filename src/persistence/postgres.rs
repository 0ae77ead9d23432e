use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::{DecisionRecord, DecisionStatus, DecisionStore};
use crate::domain::{StagedStatus, StagedStrategy};
use crate::error::{GambitError, Result};
use crate::pipeline::Stage;

/// Postgres-backed decision store
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing tables if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_decisions (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                stage TEXT NOT NULL,
                input JSONB NOT NULL,
                output JSONB NOT NULL,
                confidence DOUBLE PRECISION,
                status TEXT NOT NULL,
                error TEXT,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_run_decisions_run_id ON run_decisions (run_id, recorded_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS staged_strategies (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                strategy JSONB NOT NULL,
                status TEXT NOT NULL,
                staged_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL,
                correlation_id UUID,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Decision store schema ready");
        Ok(())
    }

    fn decision_from_row(row: &sqlx::postgres::PgRow) -> Result<DecisionRecord> {
        let stage: String = row.get("stage");
        let status: String = row.get("status");
        Ok(DecisionRecord {
            id: row.get("id"),
            run_id: row.get("run_id"),
            stage: stage.parse::<Stage>()?,
            input: row.get("input"),
            output: row.get("output"),
            confidence: row.get("confidence"),
            status: match status.as_str() {
                "accepted" => DecisionStatus::Accepted,
                "rejected" => DecisionStatus::Rejected,
                "failed" => DecisionStatus::Failed,
                other => {
                    return Err(GambitError::Validation(format!(
                        "unknown decision status: {other}"
                    )))
                }
            },
            error: row.get("error"),
            recorded_at: row.get("recorded_at"),
        })
    }

    fn staged_from_row(row: &sqlx::postgres::PgRow) -> Result<StagedStrategy> {
        let strategy: serde_json::Value = row.get("strategy");
        let status: String = row.get("status");
        let staged_at: DateTime<Utc> = row.get("staged_at");
        Ok(StagedStrategy {
            id: row.get("id"),
            run_id: row.get("run_id"),
            strategy: serde_json::from_value(strategy)?,
            status: match status.as_str() {
                "pending" => StagedStatus::Pending,
                "executed" => StagedStatus::Executed,
                "skipped" => StagedStatus::Skipped,
                other => {
                    return Err(GambitError::Validation(format!(
                        "unknown staged status: {other}"
                    )))
                }
            },
            staged_at,
        })
    }

    fn staged_status_str(status: StagedStatus) -> &'static str {
        match status {
            StagedStatus::Pending => "pending",
            StagedStatus::Executed => "executed",
            StagedStatus::Skipped => "skipped",
        }
    }
}

#[async_trait]
impl DecisionStore for PostgresStore {
    async fn record_decision(&self, record: DecisionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_decisions (
                id, run_id, stage, input, output, confidence, status, error, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.run_id)
        .bind(record.stage.as_str())
        .bind(&record.input)
        .bind(&record.output)
        .bind(record.confidence)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        debug!(
            run_id = %record.run_id,
            stage = %record.stage,
            status = record.status.as_str(),
            "Recorded stage decision"
        );
        Ok(())
    }

    async fn decisions_for_run(&self, run_id: Uuid) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, stage, input, output, confidence, status, error, recorded_at
            FROM run_decisions
            WHERE run_id = $1
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decision_from_row).collect()
    }

    async fn save_staged_strategy(&self, staged: &StagedStrategy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO staged_strategies (id, run_id, strategy, status, staged_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET strategy = EXCLUDED.strategy, status = EXCLUDED.status
            "#,
        )
        .bind(staged.id)
        .bind(staged.run_id)
        .bind(serde_json::to_value(&staged.strategy)?)
        .bind(Self::staged_status_str(staged.status))
        .bind(staged.staged_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_staged_strategies(&self) -> Result<Vec<StagedStrategy>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, strategy, status, staged_at
            FROM staged_strategies
            WHERE status = 'pending'
            ORDER BY staged_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::staged_from_row).collect()
    }

    async fn update_staged_status(&self, id: Uuid, status: StagedStatus) -> Result<()> {
        let result = sqlx::query("UPDATE staged_strategies SET status = $1 WHERE id = $2")
            .bind(Self::staged_status_str(status))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GambitError::Validation(format!(
                "no staged strategy with id {id}"
            )));
        }
        Ok(())
    }

    async fn append_audit(
        &self,
        kind: &str,
        detail: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, kind, detail, correlation_id, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind)
        .bind(detail)
        .bind(correlation_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
