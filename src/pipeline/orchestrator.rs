//! Pipeline orchestrator
//!
//! Drives runs through the six stages. Every piece of protected work goes
//! through a circuit breaker and a retry profile; every stage outcome is
//! persisted as a decision record under the run's correlation id and
//! published on the event bus. A failed stage aborts its run without
//! touching other runs.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::{RunState, RunTracker};
use super::stage::Stage;
use super::worker::StageQueue;
use crate::adapters::{run_backtest, Brokerage, StrategyAdvisor};
use crate::config::PipelineConfig;
use crate::domain::{MarketSnapshot, OrderRequest, StagedStatus, StagedStrategy, StrategySpec};
use crate::error::{GambitError, Result};
use crate::events::{BotEvent, EventBus};
use crate::persistence::{DecisionRecord, DecisionStore};
use crate::resilience::{BreakerRegistry, Retrier, RetryPolicy};

/// Breaker/metric names for the two protected dependencies
pub const SVC_BROKERAGE: &str = "brokerage";
pub const SVC_ADVISOR: &str = "advisor";

/// Operator-facing view of bot state
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub running: bool,
    pub active_runs: usize,
    pub runs_per_stage: BTreeMap<String, usize>,
}

/// Per-run working data handed between stages
#[derive(Default)]
struct RunScratch {
    markets: Vec<MarketSnapshot>,
    candidates: Vec<MarketSnapshot>,
    strategy: Option<StrategySpec>,
    staged_id: Option<Uuid>,
}

/// What a stage body decided
enum StageVerdict {
    /// Stage passed; hand the run to the next stage
    Advance {
        input: serde_json::Value,
        output: serde_json::Value,
        confidence: Option<f64>,
    },
    /// Nothing worth trading; the run completes early without error
    Halt {
        input: serde_json::Value,
        reason: String,
    },
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    brokerage: Arc<dyn Brokerage>,
    advisor: Arc<dyn StrategyAdvisor>,
    store: Arc<dyn DecisionStore>,
    breakers: Arc<BreakerRegistry>,
    retrier: Arc<Retrier>,
    events: Arc<EventBus>,
    tracker: RunTracker,
    queue: StageQueue<(Uuid, Stage)>,
    scratch: RwLock<HashMap<Uuid, RunScratch>>,
    running: AtomicBool,
    monitor_generation: AtomicU64,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        brokerage: Arc<dyn Brokerage>,
        advisor: Arc<dyn StrategyAdvisor>,
        store: Arc<dyn DecisionStore>,
        breakers: Arc<BreakerRegistry>,
        retrier: Arc<Retrier>,
        events: Arc<EventBus>,
    ) -> Self {
        let queue = StageQueue::new(
            config.max_concurrent_jobs,
            Duration::from_millis(config.job_spacing_ms),
        );
        Self {
            config,
            brokerage,
            advisor,
            store,
            breakers,
            retrier,
            events,
            tracker: RunTracker::new(),
            queue,
            scratch: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            monitor_generation: AtomicU64::new(0),
        }
    }

    /// Start accepting runs and arm the execution monitor.
    /// Starting an already-running bot is an error.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GambitError::UnexpectedState(
                "bot is already running".to_string(),
            ));
        }
        info!("bot started");
        self.arm_stage_dispatch();
        self.spawn_execution_monitor();
        Ok(())
    }

    /// Route queued stage hand-offs into `run_stage`. The dispatcher holds
    /// a weak reference so it cannot keep a dropped orchestrator alive.
    fn arm_stage_dispatch(self: &Arc<Self>) {
        let orch = Arc::downgrade(self);
        self.queue.arm(move |(run_id, stage)| {
            let orch = orch.clone();
            async move {
                if let Some(orch) = orch.upgrade() {
                    orch.run_stage(run_id, stage).await;
                }
            }
        });
    }

    /// Stop intake and halt the execution monitor. In-flight stage jobs
    /// finish. Idempotent.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.events.publish(BotEvent::BotStopped).await;
            info!("bot stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Kick off one pipeline run; returns its correlation id
    pub async fn trigger_run(self: &Arc<Self>) -> Result<Uuid> {
        if !self.is_running() {
            return Err(GambitError::UnexpectedState(
                "bot is stopped, not accepting runs".to_string(),
            ));
        }

        let run_id = self.tracker.begin_run().await;
        self.scratch
            .write()
            .await
            .insert(run_id, RunScratch::default());
        self.events.publish(BotEvent::RunStarted { run_id }).await;
        info!(%run_id, "pipeline run started");

        self.enqueue_stage(run_id, Stage::first()).await?;
        Ok(run_id)
    }

    pub async fn status(&self) -> BotStatus {
        let active = self.tracker.active_runs().await;
        let mut runs_per_stage: BTreeMap<String, usize> = BTreeMap::new();
        for run in &active {
            *runs_per_stage.entry(run.stage.to_string()).or_insert(0) += 1;
        }
        BotStatus {
            running: self.is_running(),
            active_runs: active.len(),
            runs_per_stage,
        }
    }

    pub async fn runs(&self) -> Vec<RunState> {
        self.tracker.all_runs().await
    }

    pub async fn run_state(&self, run_id: Uuid) -> Option<RunState> {
        self.tracker.get(run_id).await
    }

    async fn enqueue_stage(&self, run_id: Uuid, stage: Stage) -> Result<()> {
        self.queue.enqueue((run_id, stage)).await
    }

    async fn run_stage(&self, run_id: Uuid, stage: Stage) {
        self.events
            .publish(BotEvent::StageStarted { run_id, stage })
            .await;
        debug!(%run_id, %stage, "stage started");

        match self.stage_body(run_id, stage).await {
            Ok(StageVerdict::Advance {
                input,
                output,
                confidence,
            }) => {
                let mut record = DecisionRecord::accepted(run_id, stage, input, output.clone());
                if let Some(c) = confidence {
                    record = record.with_confidence(c);
                }
                self.persist_decision(record).await;
                self.events
                    .publish(BotEvent::StageCompleted {
                        run_id,
                        stage,
                        output,
                    })
                    .await;

                match stage.next() {
                    Some(next) => {
                        if let Err(e) = self.tracker.advance(run_id, next).await {
                            error!(%run_id, %stage, error = %e, "stage hand-off rejected");
                            return;
                        }
                        if let Err(e) = self.enqueue_stage(run_id, next).await {
                            error!(%run_id, error = %e, "could not enqueue next stage");
                        }
                    }
                    None => self.finish_run(run_id).await,
                }
            }
            Ok(StageVerdict::Halt { input, reason }) => {
                info!(%run_id, %stage, %reason, "run halted without trade");
                self.persist_decision(DecisionRecord::rejected(run_id, stage, input, &reason))
                    .await;
                self.events
                    .publish(BotEvent::StageCompleted {
                        run_id,
                        stage,
                        output: json!({ "halted": true, "reason": reason }),
                    })
                    .await;
                self.finish_run(run_id).await;
            }
            Err(e) => {
                warn!(%run_id, %stage, error = %e, "stage failed, aborting run");
                self.persist_decision(DecisionRecord::failed(run_id, stage, &e.to_string()))
                    .await;
                self.events
                    .publish(BotEvent::PipelineFailed {
                        run_id,
                        stage,
                        error: e.to_string(),
                    })
                    .await;
                if let Err(e) = self.tracker.fail(run_id, stage, &e.to_string()).await {
                    error!(%run_id, error = %e, "could not mark run failed");
                }
                self.scratch.write().await.remove(&run_id);
            }
        }
    }

    async fn finish_run(&self, run_id: Uuid) {
        if let Err(e) = self.tracker.complete(run_id).await {
            error!(%run_id, error = %e, "could not mark run completed");
        }
        self.scratch.write().await.remove(&run_id);
        self.events.publish(BotEvent::RunCompleted { run_id }).await;
        info!(%run_id, "pipeline run completed");
    }

    async fn stage_body(&self, run_id: Uuid, stage: Stage) -> Result<StageVerdict> {
        match stage {
            Stage::MarketScan => self.market_scan(run_id).await,
            Stage::AssetSelection => self.asset_selection(run_id).await,
            Stage::StrategyGeneration => self.strategy_generation(run_id).await,
            Stage::Validation => self.validation(run_id).await,
            Stage::Staging => self.staging(run_id).await,
            Stage::Execution => self.execution(run_id).await,
        }
    }

    async fn market_scan(&self, run_id: Uuid) -> Result<StageVerdict> {
        let breaker = self.breakers.breaker(SVC_BROKERAGE);
        let markets = self
            .retrier
            .execute_named(
                "scan_markets",
                json!({ "run_id": run_id }),
                &RetryPolicy::aggressive(),
                |_| {
                    let breaker = breaker.clone();
                    let brokerage = self.brokerage.clone();
                    async move {
                        breaker
                            .execute(|| async move { brokerage.scan_markets().await })
                            .await
                    }
                },
            )
            .await
            .into_result()?;

        if markets.is_empty() {
            return Ok(StageVerdict::Halt {
                input: serde_json::Value::Null,
                reason: "market scan returned no markets".to_string(),
            });
        }

        let output = json!({ "markets": markets.len() });
        self.with_scratch(run_id, |s| s.markets = markets).await?;
        Ok(StageVerdict::Advance {
            input: serde_json::Value::Null,
            output,
            confidence: None,
        })
    }

    async fn asset_selection(&self, run_id: Uuid) -> Result<StageVerdict> {
        let mut markets = self.take_scratch(run_id, |s| std::mem::take(&mut s.markets)).await?;
        let input = json!({ "markets": markets.len() });

        // Most volatile movers first; the advisor decides direction later
        markets.sort_by(|a, b| {
            b.change_pct
                .abs()
                .cmp(&a.change_pct.abs())
                .then_with(|| b.volume_24h.cmp(&a.volume_24h))
        });
        markets.truncate(self.config.max_candidates);

        if markets.is_empty() {
            return Ok(StageVerdict::Halt {
                input,
                reason: "no candidates after selection".to_string(),
            });
        }

        let symbols: Vec<&str> = markets.iter().map(|m| m.symbol.as_str()).collect();
        let output = json!({ "candidates": symbols });
        self.with_scratch(run_id, |s| s.candidates = markets).await?;
        Ok(StageVerdict::Advance {
            input,
            output,
            confidence: None,
        })
    }

    async fn strategy_generation(&self, run_id: Uuid) -> Result<StageVerdict> {
        let candidates = self
            .take_scratch(run_id, |s| s.candidates.clone())
            .await?;
        let input = json!({
            "candidates": candidates.iter().map(|m| m.symbol.as_str()).collect::<Vec<_>>()
        });

        let breaker = self.breakers.breaker(SVC_ADVISOR);
        let strategy = self
            .retrier
            .execute_named(
                "propose_strategy",
                input.clone(),
                &RetryPolicy::aggressive(),
                |_| {
                    let breaker = breaker.clone();
                    let advisor = self.advisor.clone();
                    let candidates = candidates.clone();
                    async move {
                        breaker
                            .execute(|| async move { advisor.propose_strategy(&candidates).await })
                            .await
                    }
                },
            )
            .await
            .into_result()?;

        let output = serde_json::to_value(&strategy)?;
        let confidence = strategy.confidence;
        self.with_scratch(run_id, |s| s.strategy = Some(strategy))
            .await?;
        Ok(StageVerdict::Advance {
            input,
            output,
            confidence: Some(confidence),
        })
    }

    async fn validation(&self, run_id: Uuid) -> Result<StageVerdict> {
        let strategy = self
            .take_scratch(run_id, |s| s.strategy.clone())
            .await?
            .ok_or_else(|| {
                GambitError::UnexpectedState("validation reached without a strategy".to_string())
            })?;
        let input = serde_json::to_value(&strategy)?;

        let breaker = self.breakers.breaker(SVC_BROKERAGE);
        let days = self.config.backtest_days;
        let candles = self
            .retrier
            .execute_named(
                "fetch_candles",
                json!({ "symbol": strategy.symbol, "days": days }),
                &RetryPolicy::aggressive(),
                |_| {
                    let breaker = breaker.clone();
                    let brokerage = self.brokerage.clone();
                    let symbol = strategy.symbol.clone();
                    async move {
                        breaker
                            .execute(|| async move { brokerage.candles(&symbol, days).await })
                            .await
                    }
                },
            )
            .await
            .into_result()?;

        let summary = run_backtest(&candles, strategy.side, days);
        debug!(
            %run_id,
            symbol = %strategy.symbol,
            total_return = %summary.total_return,
            win_rate = %summary.win_rate,
            trades = summary.trades,
            "backtest complete"
        );

        if summary.total_return <= self.config.min_backtest_return {
            return Ok(StageVerdict::Halt {
                input,
                reason: format!(
                    "backtest return {} below minimum {}",
                    summary.total_return, self.config.min_backtest_return
                ),
            });
        }
        if summary.win_rate <= self.config.min_win_rate {
            return Ok(StageVerdict::Halt {
                input,
                reason: format!(
                    "backtest win rate {} below minimum {}",
                    summary.win_rate, self.config.min_win_rate
                ),
            });
        }

        Ok(StageVerdict::Advance {
            input,
            output: serde_json::to_value(&summary)?,
            confidence: None,
        })
    }

    async fn staging(&self, run_id: Uuid) -> Result<StageVerdict> {
        let strategy = self
            .take_scratch(run_id, |s| s.strategy.clone())
            .await?
            .ok_or_else(|| {
                GambitError::UnexpectedState("staging reached without a strategy".to_string())
            })?;
        let input = serde_json::to_value(&strategy)?;

        let staged = StagedStrategy::new(run_id, strategy);
        let staged_id = staged.id;

        self.retrier
            .execute(&RetryPolicy::storage(), |_| {
                let store = self.store.clone();
                let staged = staged.clone();
                async move { store.save_staged_strategy(&staged).await }
            })
            .await
            .into_result()?;

        self.store
            .append_audit(
                "strategy_staged",
                &format!("{} {} staged", staged.strategy.side, staged.strategy.symbol),
                Some(run_id),
            )
            .await?;

        self.with_scratch(run_id, |s| s.staged_id = Some(staged_id))
            .await?;
        Ok(StageVerdict::Advance {
            input,
            output: json!({ "staged_id": staged_id }),
            confidence: None,
        })
    }

    /// Terminal stage: the strategy is parked for the execution monitor,
    /// which re-evaluates it on its own clock while the bot runs.
    async fn execution(&self, run_id: Uuid) -> Result<StageVerdict> {
        let staged_id = self
            .take_scratch(run_id, |s| s.staged_id)
            .await?
            .ok_or_else(|| {
                GambitError::UnexpectedState("execution reached without a staged strategy".to_string())
            })?;

        Ok(StageVerdict::Advance {
            input: json!({ "staged_id": staged_id }),
            output: json!({ "staged_id": staged_id, "monitored": true }),
            confidence: None,
        })
    }

    fn spawn_execution_monitor(self: &Arc<Self>) {
        let orch = Arc::clone(self);
        // Each start supersedes any monitor still waiting on its tick from
        // before a stop; a stale monitor exits instead of running a cycle,
        // so two monitors can never race the same pending strategy into
        // duplicate orders.
        let generation = self.monitor_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = Duration::from_secs(self.config.monitor_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !orch.is_running()
                    || orch.monitor_generation.load(Ordering::SeqCst) != generation
                {
                    break;
                }
                if let Err(e) = orch.monitor_cycle().await {
                    warn!(error = %e, "execution monitor cycle failed");
                }
            }
            debug!(generation, "execution monitor stopped");
        });
    }

    /// One execution-monitor pass over every pending staged strategy.
    /// Per-strategy failures are contained; the cycle continues.
    pub async fn monitor_cycle(&self) -> Result<()> {
        let due = self.store.due_staged_strategies().await?;
        debug!(pending = due.len(), "execution monitor cycle");

        for staged in due {
            if let Err(e) = self.evaluate_staged(&staged).await {
                warn!(
                    staged_id = %staged.id,
                    symbol = %staged.strategy.symbol,
                    error = %e,
                    "staged strategy evaluation failed"
                );
            }
        }
        Ok(())
    }

    async fn evaluate_staged(&self, staged: &StagedStrategy) -> Result<()> {
        let strategy = &staged.strategy;

        let broker_breaker = self.breakers.breaker(SVC_BROKERAGE);
        let market = self
            .retrier
            .execute(&RetryPolicy::aggressive(), |_| {
                let breaker = broker_breaker.clone();
                let brokerage = self.brokerage.clone();
                let symbol = strategy.symbol.clone();
                async move {
                    breaker
                        .execute(|| async move { brokerage.quote(&symbol).await })
                        .await
                }
            })
            .await
            .into_result()?;

        let advisor_breaker = self.breakers.breaker(SVC_ADVISOR);
        let evaluation = self
            .retrier
            .execute(&RetryPolicy::aggressive(), |_| {
                let breaker = advisor_breaker.clone();
                let advisor = self.advisor.clone();
                let strategy = strategy.clone();
                let market = market.clone();
                async move {
                    breaker
                        .execute(|| async move {
                            advisor.evaluate_strategy(&strategy, &market).await
                        })
                        .await
                }
            })
            .await
            .into_result()?;

        if evaluation.confidence < self.config.execution_confidence {
            debug!(
                staged_id = %staged.id,
                symbol = %strategy.symbol,
                confidence = evaluation.confidence,
                cutoff = self.config.execution_confidence,
                "confidence below cutoff, staying staged"
            );
            return Ok(());
        }

        let order = OrderRequest {
            symbol: strategy.symbol.clone(),
            side: strategy.side,
            quantity: strategy.quantity,
            limit_price: Some(strategy.entry_price),
        };

        let placed = self
            .retrier
            .execute_named(
                "place_order",
                serde_json::to_value(&order)?,
                &RetryPolicy::trading(),
                |_| {
                    let breaker = broker_breaker.clone();
                    let brokerage = self.brokerage.clone();
                    let order = order.clone();
                    async move {
                        breaker
                            .execute(|| async move { brokerage.place_order(&order).await })
                            .await
                    }
                },
            )
            .await
            .into_result();

        match placed {
            Ok(receipt) => {
                self.update_staged(staged.id, StagedStatus::Executed).await?;
                self.store
                    .append_audit(
                        "trade_executed",
                        &format!("{} {} x{}", strategy.side, strategy.symbol, strategy.quantity),
                        Some(staged.run_id),
                    )
                    .await?;
                self.events
                    .publish(BotEvent::TradeExecuted {
                        run_id: staged.run_id,
                        symbol: strategy.symbol.clone(),
                        detail: serde_json::to_value(&receipt)?,
                    })
                    .await;
                info!(
                    run_id = %staged.run_id,
                    symbol = %strategy.symbol,
                    order_id = %receipt.order_id,
                    "trade executed"
                );
                Ok(())
            }
            Err(e) => {
                // Never silently retry a trade later: the failure is marked
                // Skipped here, and transport exhaustion has already parked
                // an unscheduled DLQ item for the operator.
                self.update_staged(staged.id, StagedStatus::Skipped).await?;
                self.store
                    .append_audit(
                        "order_failed",
                        &format!("{} {}: {}", strategy.side, strategy.symbol, e),
                        Some(staged.run_id),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn update_staged(&self, id: Uuid, status: StagedStatus) -> Result<()> {
        self.retrier
            .execute(&RetryPolicy::storage(), |_| {
                let store = self.store.clone();
                async move { store.update_staged_status(id, status).await }
            })
            .await
            .into_result()
    }

    async fn persist_decision(&self, record: DecisionRecord) {
        let outcome = self
            .retrier
            .execute(&RetryPolicy::storage(), |_| {
                let store = self.store.clone();
                let record = record.clone();
                async move { store.record_decision(record).await }
            })
            .await;

        if let Err(e) = outcome.into_result() {
            error!(
                run_id = %record.run_id,
                stage = %record.stage,
                error = %e,
                "could not persist decision record"
            );
        }
    }

    async fn with_scratch<F>(&self, run_id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut RunScratch),
    {
        let mut scratch = self.scratch.write().await;
        let entry = scratch
            .get_mut(&run_id)
            .ok_or_else(|| GambitError::UnexpectedState(format!("no scratch for run {run_id}")))?;
        f(entry);
        Ok(())
    }

    async fn take_scratch<F, T>(&self, run_id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut RunScratch) -> T,
    {
        let mut scratch = self.scratch.write().await;
        let entry = scratch
            .get_mut(&run_id)
            .ok_or_else(|| GambitError::UnexpectedState(format!("no scratch for run {run_id}")))?;
        Ok(f(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimAdvisor, SimBrokerage};
    use crate::persistence::{DecisionStatus, MemoryStore};
    use crate::pipeline::context::RunStatus;
    use crate::resilience::CircuitBreakerConfig;

    fn build(store: Arc<MemoryStore>) -> Arc<PipelineOrchestrator> {
        let config = PipelineConfig {
            job_spacing_ms: 0,
            monitor_interval_secs: 60,
            ..PipelineConfig::default()
        };
        Arc::new(PipelineOrchestrator::new(
            config,
            Arc::new(SimBrokerage),
            Arc::new(SimAdvisor),
            store,
            Arc::new(BreakerRegistry::uniform(CircuitBreakerConfig::default())),
            Arc::new(Retrier::new()),
            Arc::new(EventBus::with_defaults()),
        ))
    }

    async fn wait_for_finish(orch: &PipelineOrchestrator, run_id: Uuid) -> RunState {
        for _ in 0..1000 {
            if let Some(state) = orch.run_state(run_id).await {
                if !state.is_active() {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn test_stopped_bot_rejects_runs() {
        let orch = build(Arc::new(MemoryStore::new()));
        let err = orch.trigger_run().await.unwrap_err();
        assert!(matches!(err, GambitError::UnexpectedState(_)));
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let orch = build(Arc::new(MemoryStore::new()));
        orch.start().unwrap();
        assert!(orch.start().is_err());

        // Stop is idempotent
        orch.stop().await;
        orch.stop().await;
        assert!(orch.start().is_ok());
    }

    #[tokio::test]
    async fn test_full_run_records_decisions_in_stage_order() {
        let store = Arc::new(MemoryStore::new());
        let orch = build(store.clone());
        orch.start().unwrap();

        let run_id = orch.trigger_run().await.unwrap();
        let state = wait_for_finish(&orch, run_id).await;
        assert_eq!(state.status, RunStatus::Completed);

        let decisions = store.decisions_for_run(run_id).await.unwrap();
        let stages: Vec<Stage> = decisions.iter().map(|d| d.stage).collect();
        // The sim data trends up, so every gate passes through Execution
        assert_eq!(stages, Stage::ALL.to_vec());
        assert!(decisions
            .iter()
            .all(|d| d.status == DecisionStatus::Accepted));

        // Staging parked exactly one strategy for the monitor
        assert_eq!(store.due_staged_strategies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_cycle_executes_confident_strategy() {
        let store = Arc::new(MemoryStore::new());
        let orch = build(store.clone());
        orch.start().unwrap();

        let run_id = orch.trigger_run().await.unwrap();
        wait_for_finish(&orch, run_id).await;

        orch.monitor_cycle().await.unwrap();
        assert!(store.due_staged_strategies().await.unwrap().is_empty());

        let audits = store.audit_entries().await;
        assert!(audits.iter().any(|a| a.kind == "trade_executed"));
    }

    #[tokio::test]
    async fn test_stage_failure_aborts_run_with_failed_decision() {
        struct DownBrokerage;

        #[async_trait::async_trait]
        impl Brokerage for DownBrokerage {
            async fn scan_markets(&self) -> Result<Vec<MarketSnapshot>> {
                Err(GambitError::Transport("connection refused".into()))
            }
            async fn quote(&self, _: &str) -> Result<MarketSnapshot> {
                Err(GambitError::Transport("connection refused".into()))
            }
            async fn candles(&self, _: &str, _: u32) -> Result<Vec<crate::domain::Candle>> {
                Err(GambitError::Transport("connection refused".into()))
            }
            async fn place_order(
                &self,
                _: &OrderRequest,
            ) -> Result<crate::domain::OrderReceipt> {
                Err(GambitError::Transport("connection refused".into()))
            }
            async fn account(&self) -> Result<crate::domain::AccountInfo> {
                Err(GambitError::Transport("connection refused".into()))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let config = PipelineConfig {
            job_spacing_ms: 0,
            ..PipelineConfig::default()
        };
        let orch = Arc::new(PipelineOrchestrator::new(
            config,
            Arc::new(DownBrokerage),
            Arc::new(SimAdvisor),
            store.clone(),
            Arc::new(BreakerRegistry::uniform(CircuitBreakerConfig {
                failure_threshold: 100,
                ..CircuitBreakerConfig::default()
            })),
            Arc::new(Retrier::new()),
            Arc::new(EventBus::with_defaults()),
        ));
        orch.start().unwrap();

        let run_id = orch.trigger_run().await.unwrap();
        let state = wait_for_finish(&orch, run_id).await;
        assert!(matches!(
            state.status,
            RunStatus::Failed {
                stage: Stage::MarketScan,
                ..
            }
        ));

        let decisions = store.decisions_for_run(run_id).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].status, DecisionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_supersedes_previous_execution_monitor() {
        use std::sync::atomic::AtomicU32;

        // Counts monitor evaluations via the quote calls they make
        struct CountingBrokerage {
            inner: SimBrokerage,
            quotes: Arc<AtomicU32>,
        }

        #[async_trait::async_trait]
        impl Brokerage for CountingBrokerage {
            async fn scan_markets(&self) -> Result<Vec<MarketSnapshot>> {
                self.inner.scan_markets().await
            }
            async fn quote(&self, symbol: &str) -> Result<MarketSnapshot> {
                self.quotes.fetch_add(1, Ordering::SeqCst);
                self.inner.quote(symbol).await
            }
            async fn candles(&self, symbol: &str, n: u32) -> Result<Vec<crate::domain::Candle>> {
                self.inner.candles(symbol, n).await
            }
            async fn place_order(
                &self,
                order: &OrderRequest,
            ) -> Result<crate::domain::OrderReceipt> {
                self.inner.place_order(order).await
            }
            async fn account(&self) -> Result<crate::domain::AccountInfo> {
                self.inner.account().await
            }
        }

        let quotes = Arc::new(AtomicU32::new(0));
        let store = Arc::new(MemoryStore::new());
        let config = PipelineConfig {
            job_spacing_ms: 0,
            monitor_interval_secs: 60,
            // Unreachable cutoff keeps the staged strategy pending forever
            execution_confidence: 10.0,
            ..PipelineConfig::default()
        };
        let orch = Arc::new(PipelineOrchestrator::new(
            config,
            Arc::new(CountingBrokerage {
                inner: SimBrokerage,
                quotes: quotes.clone(),
            }),
            Arc::new(SimAdvisor),
            store.clone(),
            Arc::new(BreakerRegistry::uniform(CircuitBreakerConfig::default())),
            Arc::new(Retrier::new()),
            Arc::new(EventBus::with_defaults()),
        ));

        orch.start().unwrap();
        let run_id = orch.trigger_run().await.unwrap();
        wait_for_finish(&orch, run_id).await;
        assert_eq!(store.due_staged_strategies().await.unwrap().len(), 1);

        // Restart before the first monitor ever ticks
        orch.stop().await;
        orch.start().unwrap();

        // Both monitors wake within this window; only the fresh one may
        // evaluate the pending strategy
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(quotes.load(Ordering::SeqCst), 1);
        assert_eq!(store.due_staged_strategies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_keep_separate_correlation_ids() {
        let store = Arc::new(MemoryStore::new());
        let orch = build(store.clone());
        orch.start().unwrap();

        let a = orch.trigger_run().await.unwrap();
        let b = orch.trigger_run().await.unwrap();
        assert_ne!(a, b);

        wait_for_finish(&orch, a).await;
        wait_for_finish(&orch, b).await;

        for run_id in [a, b] {
            let stages: Vec<Stage> = store
                .decisions_for_run(run_id)
                .await
                .unwrap()
                .iter()
                .map(|d| d.stage)
                .collect();
            assert_eq!(stages, Stage::ALL.to_vec());
        }
    }
}
