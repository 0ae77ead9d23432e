use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub brokerage: BrokerageConfig,
    pub advisor: AdvisorConfig,
    pub resilience: ResilienceConfig,
    pub health: HealthConfig,
    pub pipeline: PipelineConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Admin/health server port (default: 8080)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

fn default_admin_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerageConfig {
    /// REST API endpoint for market data and order execution
    pub rest_url: String,
    /// API key sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    /// REST API endpoint for the AI decision service
    pub rest_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Circuit breaker tuning for one protected dependency
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the breaker closes
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// How long the breaker stays open before allowing a trial call
    #[serde(default = "default_reset_secs")]
    pub reset_secs: u64,
    /// Maximum concurrent trial calls while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_call_timeout_ms() -> u64 {
    10_000
}
fn default_reset_secs() -> u64 {
    60
}
fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            call_timeout_ms: default_call_timeout_ms(),
            reset_secs: default_reset_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    /// Breaker tuning applied to services without an explicit entry
    #[serde(default)]
    pub breaker_defaults: BreakerSettings,
    /// Per-service overrides keyed by dependency name
    #[serde(default)]
    pub breakers: std::collections::HashMap<String, BreakerSettings>,
    /// Dead-letter queue capacity (oldest evicted past this)
    #[serde(default = "default_dlq_capacity")]
    pub dlq_capacity: usize,
    /// Seconds between DLQ replay scans
    #[serde(default = "default_dlq_scan_secs")]
    pub dlq_scan_secs: u64,
    /// Delay before a freshly dead-lettered operation becomes due
    #[serde(default = "default_dlq_retry_secs")]
    pub dlq_retry_secs: u64,
}

fn default_dlq_capacity() -> usize {
    1000
}
fn default_dlq_scan_secs() -> u64 {
    60
}
fn default_dlq_retry_secs() -> u64 {
    3600
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_defaults: BreakerSettings::default(),
            breakers: std::collections::HashMap::new(),
            dlq_capacity: default_dlq_capacity(),
            dlq_scan_secs: default_dlq_scan_secs(),
            dlq_retry_secs: default_dlq_retry_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probes of each registered service
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Error-rate percentage that raises an alert
    #[serde(default = "default_max_error_rate_pct")]
    pub max_error_rate_pct: f64,
    /// Average response time ceiling in milliseconds
    #[serde(default = "default_max_response_time_ms")]
    pub max_response_time_ms: u64,
    /// Consecutive probe failures that raise a critical alert
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Alert history cap (oldest dropped past this)
    #[serde(default = "default_alert_history_cap")]
    pub alert_history_cap: usize,
}

fn default_check_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_max_error_rate_pct() -> f64 {
    25.0
}
fn default_max_response_time_ms() -> u64 {
    2_000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_alert_history_cap() -> usize {
    100
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_error_rate_pct: default_max_error_rate_pct(),
            max_response_time_ms: default_max_response_time_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            alert_history_cap: default_alert_history_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum simultaneously active stage jobs
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Minimum milliseconds between stage-job starts
    #[serde(default = "default_job_spacing_ms")]
    pub job_spacing_ms: u64,
    /// Minimum backtest total return for a strategy to pass Validation
    #[serde(default = "default_min_backtest_return")]
    pub min_backtest_return: Decimal,
    /// Minimum backtest win rate for a strategy to pass Validation
    #[serde(default = "default_min_win_rate")]
    pub min_win_rate: Decimal,
    /// Confidence cutoff for acting on a staged strategy
    #[serde(default = "default_execution_confidence")]
    pub execution_confidence: f64,
    /// Seconds between execution-monitor re-evaluations
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Seconds between automatically triggered pipeline runs
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,
    /// Trailing backtest window in days
    #[serde(default = "default_backtest_days")]
    pub backtest_days: u32,
    /// How many scan candidates the selection stage keeps
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_job_spacing_ms() -> u64 {
    250
}
fn default_min_backtest_return() -> Decimal {
    Decimal::new(2, 2) // 0.02 = 2%
}
fn default_min_win_rate() -> Decimal {
    Decimal::new(60, 2) // 0.60 = 60%
}
fn default_execution_confidence() -> f64 {
    0.7
}
fn default_monitor_interval_secs() -> u64 {
    60
}
fn default_run_interval_secs() -> u64 {
    300
}
fn default_backtest_days() -> u32 {
    30
}
fn default_max_candidates() -> usize {
    5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_spacing_ms: default_job_spacing_ms(),
            min_backtest_return: default_min_backtest_return(),
            min_win_rate: default_min_win_rate(),
            execution_confidence: default_execution_confidence(),
            monitor_interval_secs: default_monitor_interval_secs(),
            run_interval_secs: default_run_interval_secs(),
            backtest_days: default_backtest_days(),
            max_candidates: default_max_candidates(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,
    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DryRunConfig {
    /// Simulate brokerage/advisor calls and use in-memory persistence
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files (stdout only when unset)
    #[serde(default)]
    pub dir: Option<String>,
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info,gambit=debug,sqlx=warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            filter: default_log_filter(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment.
    ///
    /// Layering order (later wins): config/default.toml, config/{RUN_ENV}.toml,
    /// GAMBIT_-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let run_env = std::env::var("RUN_ENV").unwrap_or_else(|_| "default".to_string());

        let mut builder = Config::builder().add_source(File::with_name("config/default"));

        if run_env != "default" {
            builder =
                builder.add_source(File::with_name(&format!("config/{}", run_env)).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("GAMBIT")
                .prefix_separator("_")
                .separator("__"),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from an explicit file path (CLI --config)
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix("GAMBIT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Breaker settings for a named dependency, falling back to defaults
    pub fn breaker_settings(&self, service: &str) -> BreakerSettings {
        self.resilience
            .breakers
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.resilience.breaker_defaults.clone())
    }
}
