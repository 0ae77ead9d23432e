use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use clap::Parser;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gambit::adapters::{
    Brokerage, RestAdvisor, RestBrokerage, SimAdvisor, SimBrokerage, StrategyAdvisor,
};
use gambit::api::{self, AdminState};
use gambit::cli::{self, Cli, Command};
use gambit::config::{AppConfig, LoggingConfig};
use gambit::domain::OrderRequest;
use gambit::error::{GambitError, Result};
use gambit::events::{BotEvent, EventBus};
use gambit::health::{
    AlertHub, AlertThresholds, HealthMonitor, HealthProbe, ProbeReport, ServiceCheckConfig,
};
use gambit::persistence::{DecisionStore, MemoryStore, PostgresStore};
use gambit::pipeline::{PipelineOrchestrator, SVC_BROKERAGE};
use gambit::resilience::{
    BreakerEvent, BreakerRegistry, DeadLetterItem, DeadLetterQueue, DlqScheduler,
    DlqSchedulerConfig, ReplayHandler, Retrier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, dry_run } => run_bot(config, dry_run).await?,
        Command::Status { admin_url } => {
            init_logging_simple();
            cli::show_status(&admin_url).await?;
        }
        Command::Breakers { admin_url, reset } => {
            init_logging_simple();
            cli::show_breakers(&admin_url, reset).await?;
        }
        Command::Dlq { admin_url, action } => {
            init_logging_simple();
            cli::run_dlq_action(&admin_url, action).await?;
        }
        Command::Alerts { admin_url, clear } => {
            init_logging_simple();
            cli::show_alerts(&admin_url, clear).await?;
        }
    }

    Ok(())
}

async fn run_bot(config_path: Option<String>, force_dry_run: bool) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(ref path) => AppConfig::load_from(std::path::Path::new(path))
            .with_context(|| format!("loading configuration from {path}"))?,
        None => AppConfig::load().context("loading configuration")?,
    };
    if force_dry_run {
        config.dry_run.enabled = true;
    }
    let dry_run = config.dry_run.enabled;

    init_logging(&config.logging);
    info!(dry_run, "gambit starting");

    // Core shared services
    let events = Arc::new(EventBus::with_defaults());
    let breakers = Arc::new(BreakerRegistry::new(Arc::new(config.clone())));
    let dlq = Arc::new(DeadLetterQueue::new(config.resilience.dlq_capacity));
    let retrier = Arc::new(Retrier::new().with_dlq(
        dlq.clone(),
        ChronoDuration::seconds(config.resilience.dlq_retry_secs as i64),
    ));

    // External collaborators and persistence, simulated in dry-run mode
    let brokerage: Arc<dyn Brokerage> = if dry_run {
        Arc::new(SimBrokerage)
    } else {
        Arc::new(RestBrokerage::new(
            &config.brokerage.rest_url,
            config.brokerage.api_key.clone(),
            Duration::from_millis(config.brokerage.request_timeout_ms),
        )?)
    };
    let advisor: Arc<dyn StrategyAdvisor> = if dry_run {
        Arc::new(SimAdvisor)
    } else {
        Arc::new(RestAdvisor::new(
            &config.advisor.rest_url,
            config.advisor.api_key.clone(),
            Duration::from_millis(config.advisor.request_timeout_ms),
        )?)
    };

    let mut pg_pool: Option<PgPool> = None;
    let store: Arc<dyn DecisionStore> = if dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await
            .context("connecting to database")?;
        let store = PostgresStore::new(pool.clone());
        store.ensure_schema().await?;
        pg_pool = Some(pool);
        Arc::new(store)
    };

    // DLQ replay scheduler
    let dlq_scheduler = Arc::new(DlqScheduler::new(
        dlq.clone(),
        Arc::new(ReplayRouter {
            brokerage: brokerage.clone(),
        }),
        DlqSchedulerConfig {
            scan_interval: Duration::from_secs(config.resilience.dlq_scan_secs),
            retry_interval: ChronoDuration::seconds(config.resilience.dlq_retry_secs as i64),
        },
    ));
    dlq_scheduler.start();

    // Health monitoring
    let alerts = Arc::new(AlertHub::new(config.health.alert_history_cap));
    let monitor = Arc::new(HealthMonitor::new(alerts.clone()));
    let check_config = ServiceCheckConfig {
        interval: Duration::from_secs(config.health.check_interval_secs),
        probe_timeout: Duration::from_millis(config.health.probe_timeout_ms),
        thresholds: AlertThresholds {
            max_error_rate_pct: config.health.max_error_rate_pct,
            max_response_time_ms: config.health.max_response_time_ms,
            max_consecutive_failures: config.health.max_consecutive_failures,
        },
    };
    monitor
        .register(
            SVC_BROKERAGE,
            Arc::new(BrokerageProbe {
                brokerage: brokerage.clone(),
            }),
            check_config.clone(),
        )
        .await;
    if let Some(pool) = pg_pool {
        monitor
            .register(
                "database",
                Arc::new(DatabaseProbe { pool }),
                check_config.clone(),
            )
            .await;
    }
    monitor.start().await;

    // Pipeline
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        config.pipeline.clone(),
        brokerage,
        advisor,
        store,
        breakers.clone(),
        retrier,
        events.clone(),
    ));
    orchestrator.start()?;

    spawn_breaker_forwarder(&breakers, &events);
    spawn_alert_forwarder(&alerts, &events);
    spawn_run_loop(&orchestrator, config.pipeline.run_interval_secs);

    // Admin server
    let admin_state = AdminState {
        orchestrator: orchestrator.clone(),
        breakers,
        dlq,
        dlq_scheduler: dlq_scheduler.clone(),
        health: monitor.clone(),
        events,
    };
    let admin_port = config.admin_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(admin_state, admin_port).await {
            error!(error = %e, "admin server exited");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    orchestrator.stop().await;
    monitor.stop();
    dlq_scheduler.stop();
    info!("gambit stopped");
    Ok(())
}

/// Trigger a pipeline run immediately, then on every interval tick. Ticks
/// while the bot is stopped are skipped, so an operator restart over the
/// admin API picks the schedule back up.
fn spawn_run_loop(orchestrator: &Arc<PipelineOrchestrator>, interval_secs: u64) {
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            if !orchestrator.is_running() {
                continue;
            }
            if let Err(e) = orchestrator.trigger_run().await {
                warn!(error = %e, "could not trigger pipeline run");
            }
        }
    });
}

fn spawn_breaker_forwarder(breakers: &Arc<BreakerRegistry>, events: &Arc<EventBus>) {
    let mut rx = breakers.subscribe();
    let events = events.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BreakerEvent::Transition { service, from, to }) => {
                    events
                        .publish(BotEvent::BreakerTransition { service, from, to })
                        .await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("breaker event forwarder lagged {} events", n);
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_alert_forwarder(alerts: &Arc<AlertHub>, events: &Arc<EventBus>) {
    let mut rx = alerts.subscribe();
    let events = events.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(alert) => {
                    events.publish(BotEvent::AlertRaised { alert }).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("alert forwarder lagged {} alerts", n);
                }
                Err(_) => break,
            }
        }
    });
}

/// Re-executes dead-lettered operations when the scheduler or an operator
/// replays them.
struct ReplayRouter {
    brokerage: Arc<dyn Brokerage>,
}

#[async_trait]
impl ReplayHandler for ReplayRouter {
    async fn replay(&self, item: &DeadLetterItem) -> Result<()> {
        match item.operation.as_str() {
            "scan_markets" => {
                self.brokerage.scan_markets().await?;
                Ok(())
            }
            "fetch_candles" => {
                let symbol = item.payload["symbol"].as_str().ok_or_else(|| {
                    GambitError::Internal("fetch_candles payload missing symbol".to_string())
                })?;
                let days = item.payload["days"].as_u64().unwrap_or(30) as u32;
                self.brokerage.candles(symbol, days).await?;
                Ok(())
            }
            "place_order" => {
                let order: OrderRequest = serde_json::from_value(item.payload.clone())?;
                self.brokerage.place_order(&order).await?;
                Ok(())
            }
            // Advisor reads are regenerated by the next run; nothing to replay
            "propose_strategy" => Ok(()),
            other => Err(GambitError::Internal(format!(
                "no replay route for operation {other}"
            ))),
        }
    }
}

struct BrokerageProbe {
    brokerage: Arc<dyn Brokerage>,
}

#[async_trait]
impl HealthProbe for BrokerageProbe {
    async fn probe(&self) -> Result<ProbeReport> {
        let started = std::time::Instant::now();
        self.brokerage.account().await?;
        Ok(ProbeReport::healthy().with_response_time(started.elapsed().as_millis() as u64))
    }
}

struct DatabaseProbe {
    pool: PgPool,
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    async fn probe(&self) -> Result<ProbeReport> {
        let started = std::time::Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(ProbeReport::healthy().with_response_time(started.elapsed().as_millis() as u64))
    }
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    // tracing_appender::rolling::daily panics if it cannot create the
    // initial log file, so writability is preflighted first.
    let file_layer = config.dir.as_ref().and_then(|dir| {
        if std::fs::create_dir_all(dir).is_err() {
            eprintln!("Warning: could not create log directory {dir}, file logging disabled");
            return None;
        }
        let test_path = std::path::Path::new(dir).join(".gambit_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(dir, "gambit.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not write to log directory {dir} ({e}), file logging disabled"
                );
                None
            }
        }
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
