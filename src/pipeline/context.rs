//! Per-run state tracking keyed by correlation id
//!
//! Every pipeline run gets a v4 correlation id at intake. The tracker is
//! the single authority on what stage each run is in; stage workers must
//! go through `advance` so illegal jumps (skipping a stage, moving
//! backwards, touching a finished run) are rejected rather than recorded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::stage::Stage;
use crate::error::{GambitError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed { stage: Stage, error: String },
}

/// Snapshot of one run's progress
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub stage: Stage,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// Tracks every run the orchestrator has started
#[derive(Default)]
pub struct RunTracker {
    runs: RwLock<HashMap<Uuid, RunState>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run at the first stage and return its correlation id
    pub async fn begin_run(&self) -> Uuid {
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        self.runs.write().await.insert(
            run_id,
            RunState {
                run_id,
                stage: Stage::first(),
                status: RunStatus::Running,
                started_at: now,
                updated_at: now,
            },
        );
        run_id
    }

    /// Move a run to the next stage. Only the immediate successor of the
    /// run's current stage is legal.
    pub async fn advance(&self, run_id: Uuid, to: Stage) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| GambitError::UnexpectedState(format!("unknown run {run_id}")))?;

        if run.status != RunStatus::Running {
            return Err(GambitError::UnexpectedState(format!(
                "run {run_id} is no longer active"
            )));
        }

        match run.stage.next() {
            Some(next) if next == to => {
                run.stage = to;
                run.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(GambitError::InvalidStateTransition {
                from: run.stage.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// Mark a run finished. Legal from any stage (a run that stages
    /// nothing completes early).
    pub async fn complete(&self, run_id: Uuid) -> Result<()> {
        self.finish(run_id, RunStatus::Completed).await
    }

    /// Mark a run failed at the stage where the error happened
    pub async fn fail(&self, run_id: Uuid, stage: Stage, error: &str) -> Result<()> {
        self.finish(
            run_id,
            RunStatus::Failed {
                stage,
                error: error.to_string(),
            },
        )
        .await
    }

    async fn finish(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| GambitError::UnexpectedState(format!("unknown run {run_id}")))?;

        if run.status != RunStatus::Running {
            return Err(GambitError::UnexpectedState(format!(
                "run {run_id} already finished"
            )));
        }
        run.status = status;
        run.updated_at = Utc::now();
        Ok(())
    }

    pub async fn get(&self, run_id: Uuid) -> Option<RunState> {
        self.runs.read().await.get(&run_id).cloned()
    }

    /// Active runs currently sitting at `stage`
    pub async fn runs_at(&self, stage: Stage) -> Vec<RunState> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.is_active() && r.stage == stage)
            .cloned()
            .collect()
    }

    pub async fn active_runs(&self) -> Vec<RunState> {
        let mut runs: Vec<RunState> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub async fn all_runs(&self) -> Vec<RunState> {
        let mut runs: Vec<RunState> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_advances_through_all_stages() {
        let tracker = RunTracker::new();
        let run_id = tracker.begin_run().await;

        let mut stage = Stage::first();
        while let Some(next) = stage.next() {
            tracker.advance(run_id, next).await.unwrap();
            stage = next;
        }
        assert_eq!(tracker.get(run_id).await.unwrap().stage, Stage::Execution);

        tracker.complete(run_id).await.unwrap();
        assert_eq!(
            tracker.get(run_id).await.unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_skipping_a_stage_is_rejected() {
        let tracker = RunTracker::new();
        let run_id = tracker.begin_run().await;

        let err = tracker.advance(run_id, Stage::Validation).await.unwrap_err();
        assert!(matches!(err, GambitError::InvalidStateTransition { .. }));
        // Stage is unchanged after the rejected transition
        assert_eq!(tracker.get(run_id).await.unwrap().stage, Stage::MarketScan);
    }

    #[tokio::test]
    async fn test_moving_backwards_is_rejected() {
        let tracker = RunTracker::new();
        let run_id = tracker.begin_run().await;
        tracker.advance(run_id, Stage::AssetSelection).await.unwrap();

        let err = tracker.advance(run_id, Stage::MarketScan).await.unwrap_err();
        assert!(matches!(err, GambitError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_finished_run_cannot_advance() {
        let tracker = RunTracker::new();
        let run_id = tracker.begin_run().await;
        tracker.fail(run_id, Stage::MarketScan, "scan failed").await.unwrap();

        let err = tracker
            .advance(run_id, Stage::AssetSelection)
            .await
            .unwrap_err();
        assert!(matches!(err, GambitError::UnexpectedState(_)));

        // Finishing twice is also an error
        let err = tracker.complete(run_id).await.unwrap_err();
        assert!(matches!(err, GambitError::UnexpectedState(_)));
    }

    #[tokio::test]
    async fn test_runs_at_filters_by_stage_and_liveness() {
        let tracker = RunTracker::new();
        let a = tracker.begin_run().await;
        let b = tracker.begin_run().await;
        let c = tracker.begin_run().await;

        tracker.advance(b, Stage::AssetSelection).await.unwrap();
        tracker.fail(c, Stage::MarketScan, "boom").await.unwrap();

        let at_scan = tracker.runs_at(Stage::MarketScan).await;
        assert_eq!(at_scan.len(), 1);
        assert_eq!(at_scan[0].run_id, a);

        assert_eq!(tracker.runs_at(Stage::AssetSelection).await.len(), 1);
        assert_eq!(tracker.active_runs().await.len(), 2);
        assert_eq!(tracker.all_runs().await.len(), 3);
    }
}
