//! Per-service health monitor
//!
//! Each registered dependency gets its own timer-driven probe loop. Probe
//! results feed rolling metrics and a fixed-order alert evaluation; probe
//! errors never escape the loop.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::alerts::{Alert, AlertHub, AlertKind, AlertSeverity};
use super::metrics::{MetricsSnapshot, ServiceMetrics};
use crate::error::Result;

/// Health verdict reported by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Healthy => write!(f, "healthy"),
            ProbeStatus::Degraded => write!(f, "degraded"),
            ProbeStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What one probe invocation observed
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub status: ProbeStatus,
    /// Probe-measured response time; the monitor measures elapsed wall
    /// time when this is unset
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ProbeReport {
    pub fn healthy() -> Self {
        Self {
            status: ProbeStatus::Healthy,
            response_time_ms: None,
            error: None,
            metadata: None,
        }
    }

    pub fn degraded(reason: &str) -> Self {
        Self {
            status: ProbeStatus::Degraded,
            response_time_ms: None,
            error: Some(reason.to_string()),
            metadata: None,
        }
    }

    pub fn unhealthy(reason: &str) -> Self {
        Self {
            status: ProbeStatus::Unhealthy,
            response_time_ms: None,
            error: Some(reason.to_string()),
            metadata: None,
        }
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A dependency health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeReport>;
}

/// Alerting thresholds for one monitored service
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub max_error_rate_pct: f64,
    pub max_response_time_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_error_rate_pct: 25.0,
            max_response_time_ms: 2_000,
            max_consecutive_failures: 3,
        }
    }
}

/// Per-service schedule and thresholds
#[derive(Debug, Clone)]
pub struct ServiceCheckConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for ServiceCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Minimum probes before the error-rate alert may fire, to avoid noise
/// while the sample is still tiny after startup
const ERROR_RATE_MIN_SAMPLES: u64 = 10;

struct ServiceEntry {
    probe: Arc<dyn HealthProbe>,
    config: ServiceCheckConfig,
    metrics: ServiceMetrics,
    last_status: Option<ProbeStatus>,
}

/// Current view of one monitored service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ProbeStatus,
    pub metrics: MetricsSnapshot,
}

/// Aggregated view across all monitored services
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: ProbeStatus,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// Monitors registered dependencies with periodic probes
pub struct HealthMonitor {
    services: Arc<RwLock<HashMap<String, ServiceEntry>>>,
    alerts: Arc<AlertHub>,
    running: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(alerts: Arc<AlertHub>) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            alerts,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn alerts(&self) -> Arc<AlertHub> {
        self.alerts.clone()
    }

    /// Register a dependency for monitoring
    pub async fn register(
        &self,
        name: &str,
        probe: Arc<dyn HealthProbe>,
        config: ServiceCheckConfig,
    ) {
        let mut services = self.services.write().await;
        services.insert(
            name.to_string(),
            ServiceEntry {
                probe,
                config,
                metrics: ServiceMetrics::new(),
                last_status: None,
            },
        );
        debug!(service = name, "registered for health monitoring");
    }

    /// Start one probe loop per registered service
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let names: Vec<(String, Duration)> = {
            let services = self.services.read().await;
            services
                .iter()
                .map(|(name, entry)| (name.clone(), entry.config.interval))
                .collect()
        };

        info!(services = names.len(), "health monitor started");

        for (name, interval) in names {
            let services = self.services.clone();
            let alerts = self.alerts.clone();
            let running = self.running.clone();

            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                while running.load(Ordering::SeqCst) {
                    timer.tick().await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    Self::probe_once(&services, &alerts, &name).await;
                }

                debug!(service = %name, "probe loop stopped");
            });
        }
    }

    /// Stop all probe loops at their next tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Probe one service immediately (admin/on-demand path)
    pub async fn check_now(&self, name: &str) {
        Self::probe_once(&self.services, &self.alerts, name).await;
    }

    async fn probe_once(
        services: &RwLock<HashMap<String, ServiceEntry>>,
        alerts: &AlertHub,
        name: &str,
    ) {
        let (probe, timeout, thresholds) = {
            let guard = services.read().await;
            match guard.get(name) {
                Some(entry) => (
                    entry.probe.clone(),
                    entry.config.probe_timeout,
                    entry.config.thresholds.clone(),
                ),
                None => return,
            }
        };

        let started = Utc::now();
        let outcome = tokio::time::timeout(timeout, probe.probe()).await;
        let measured_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;

        // Timeout and probe errors are failed probes, never monitor failures
        let (status, response_time_ms, error) = match outcome {
            Ok(Ok(report)) => (
                report.status,
                report.response_time_ms.unwrap_or(measured_ms),
                report.error,
            ),
            Ok(Err(e)) => (ProbeStatus::Unhealthy, measured_ms, Some(e.to_string())),
            Err(_) => (
                ProbeStatus::Unhealthy,
                measured_ms,
                Some(format!("probe timed out after {}ms", timeout.as_millis())),
            ),
        };

        let mut guard = services.write().await;
        let entry = match guard.get_mut(name) {
            Some(entry) => entry,
            None => return,
        };

        let failed = status == ProbeStatus::Unhealthy;
        if failed {
            entry.metrics.record_failure(response_time_ms);
        } else {
            entry.metrics.record_success(response_time_ms);
        }
        entry.last_status = Some(status);

        if let Some(ref err) = error {
            warn!(service = name, %status, error = %err, "probe failed");
        }

        let snapshot = entry.metrics.snapshot();
        drop(guard);

        Self::evaluate_alerts(alerts, name, status, &thresholds, snapshot).await;
    }

    /// Evaluate conditions in fixed order; every condition that holds
    /// emits its alert (they are not mutually exclusive).
    async fn evaluate_alerts(
        alerts: &AlertHub,
        name: &str,
        status: ProbeStatus,
        thresholds: &AlertThresholds,
        metrics: MetricsSnapshot,
    ) {
        let error_rate = metrics.error_rate_pct;
        if metrics.requests >= ERROR_RATE_MIN_SAMPLES && error_rate > thresholds.max_error_rate_pct
        {
            let severity = if error_rate > 50.0 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            alerts
                .raise(Alert::new(
                    name,
                    AlertKind::HighErrorRate,
                    severity,
                    format!(
                        "error rate {:.1}% exceeds threshold {:.1}%",
                        error_rate, thresholds.max_error_rate_pct
                    ),
                    metrics.clone(),
                ))
                .await;
        }

        let avg_ms = metrics.avg_response_time_ms;
        if avg_ms > thresholds.max_response_time_ms as f64 {
            let severity = if avg_ms > (thresholds.max_response_time_ms * 2) as f64 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            alerts
                .raise(Alert::new(
                    name,
                    AlertKind::SlowResponse,
                    severity,
                    format!(
                        "average response time {:.0}ms exceeds {}ms",
                        avg_ms, thresholds.max_response_time_ms
                    ),
                    metrics.clone(),
                ))
                .await;
        }

        if metrics.consecutive_failures >= thresholds.max_consecutive_failures {
            alerts
                .raise(Alert::new(
                    name,
                    AlertKind::ConsecutiveFailures,
                    AlertSeverity::Critical,
                    format!(
                        "{} consecutive probe failures (threshold {})",
                        metrics.consecutive_failures, thresholds.max_consecutive_failures
                    ),
                    metrics.clone(),
                ))
                .await;
        }

        if status == ProbeStatus::Unhealthy {
            alerts
                .raise(Alert::new(
                    name,
                    AlertKind::ServiceDown,
                    AlertSeverity::Critical,
                    "service reported unhealthy".to_string(),
                    metrics,
                ))
                .await;
        }
    }

    /// Last-known status and metrics per service
    pub async fn service_statuses(&self) -> Vec<ServiceHealth> {
        let services = self.services.read().await;
        let mut statuses: Vec<ServiceHealth> = services
            .iter()
            .map(|(name, entry)| ServiceHealth {
                name: name.clone(),
                status: entry.last_status.unwrap_or(ProbeStatus::Healthy),
                metrics: entry.metrics.snapshot(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// System-wide summary: unhealthy when the unhealthy services are a
    /// majority, degraded when any service is degraded or a minority is
    /// unhealthy, healthy otherwise.
    pub async fn system_health(&self) -> SystemHealth {
        let services = self.services.read().await;
        let total = services.len();

        let mut healthy = 0;
        let mut degraded = 0;
        let mut unhealthy = 0;
        for entry in services.values() {
            match entry.last_status.unwrap_or(ProbeStatus::Healthy) {
                ProbeStatus::Healthy => healthy += 1,
                ProbeStatus::Degraded => degraded += 1,
                ProbeStatus::Unhealthy => unhealthy += 1,
            }
        }

        let overall = if total > 0 && unhealthy * 2 > total {
            ProbeStatus::Unhealthy
        } else if degraded > 0 || unhealthy > 0 {
            ProbeStatus::Degraded
        } else {
            ProbeStatus::Healthy
        };

        SystemHealth {
            overall,
            healthy,
            degraded,
            unhealthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GambitError;
    use std::sync::atomic::AtomicU32;

    struct ScriptedProbe {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<ProbeReport> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(GambitError::Transport("connection refused".into()))
            } else {
                Ok(ProbeReport::healthy().with_response_time(50))
            }
        }
    }

    struct FixedProbe(ProbeStatus);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self) -> Result<ProbeReport> {
            Ok(match self.0 {
                ProbeStatus::Healthy => ProbeReport::healthy().with_response_time(10),
                ProbeStatus::Degraded => {
                    ProbeReport::degraded("slow but alive").with_response_time(10)
                }
                ProbeStatus::Unhealthy => {
                    ProbeReport::unhealthy("maintenance").with_response_time(10)
                }
            })
        }
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(Arc::new(AlertHub::new(100)))
    }

    #[tokio::test]
    async fn test_probe_updates_metrics() {
        let m = monitor();
        m.register(
            "brokerage",
            Arc::new(ScriptedProbe {
                calls: AtomicU32::new(0),
                fail_first: 2,
            }),
            ServiceCheckConfig::default(),
        )
        .await;

        m.check_now("brokerage").await;
        m.check_now("brokerage").await;
        m.check_now("brokerage").await;

        let statuses = m.service_statuses().await;
        assert_eq!(statuses[0].metrics.requests, 3);
        assert_eq!(statuses[0].metrics.errors, 2);
        assert_eq!(statuses[0].metrics.consecutive_failures, 0);
        assert_eq!(statuses[0].status, ProbeStatus::Healthy);
    }

    #[tokio::test]
    async fn test_error_rate_alert_needs_min_samples() {
        let m = monitor();
        m.register(
            "advisor",
            Arc::new(ScriptedProbe {
                calls: AtomicU32::new(0),
                fail_first: u32::MAX,
            }),
            ServiceCheckConfig {
                thresholds: AlertThresholds {
                    max_error_rate_pct: 10.0,
                    // Keep the other conditions quiet for this test
                    max_consecutive_failures: 1000,
                    max_response_time_ms: 1_000_000,
                },
                ..Default::default()
            },
        )
        .await;

        for _ in 0..9 {
            m.check_now("advisor").await;
        }
        let rate_alerts = |alerts: &[Alert]| {
            alerts
                .iter()
                .filter(|a| a.kind == AlertKind::HighErrorRate)
                .count()
        };
        assert_eq!(rate_alerts(&m.alerts().recent().await), 0);

        // Probe 10 crosses the minimum sample size; rate is 100% > 50% so
        // the alert is critical.
        m.check_now("advisor").await;
        let alerts = m.alerts().recent().await;
        assert_eq!(rate_alerts(&alerts), 1);
        let alert = alerts
            .iter()
            .find(|a| a.kind == AlertKind::HighErrorRate)
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_service_down_alert_on_unhealthy_report() {
        let m = monitor();
        m.register(
            "storage",
            Arc::new(FixedProbe(ProbeStatus::Unhealthy)),
            ServiceCheckConfig::default(),
        )
        .await;

        m.check_now("storage").await;

        let alerts = m.alerts().recent().await;
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::ServiceDown && a.severity == AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn test_consecutive_failures_alert_is_critical() {
        let m = monitor();
        m.register(
            "brokerage",
            Arc::new(ScriptedProbe {
                calls: AtomicU32::new(0),
                fail_first: u32::MAX,
            }),
            ServiceCheckConfig {
                thresholds: AlertThresholds {
                    max_consecutive_failures: 3,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await;

        for _ in 0..3 {
            m.check_now("brokerage").await;
        }

        let alerts = m.alerts().recent().await;
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::ConsecutiveFailures
                && a.severity == AlertSeverity::Critical));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        struct HangingProbe;

        #[async_trait]
        impl HealthProbe for HangingProbe {
            async fn probe(&self) -> Result<ProbeReport> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ProbeReport::healthy())
            }
        }

        let m = monitor();
        m.register(
            "brokerage",
            Arc::new(HangingProbe),
            ServiceCheckConfig {
                probe_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .await;

        m.check_now("brokerage").await;

        let statuses = m.service_statuses().await;
        assert_eq!(statuses[0].status, ProbeStatus::Unhealthy);
        assert_eq!(statuses[0].metrics.errors, 1);
    }

    #[tokio::test]
    async fn test_system_health_majority_rule() {
        let m = monitor();
        m.register(
            "a",
            Arc::new(FixedProbe(ProbeStatus::Unhealthy)),
            ServiceCheckConfig::default(),
        )
        .await;
        m.register(
            "b",
            Arc::new(FixedProbe(ProbeStatus::Unhealthy)),
            ServiceCheckConfig::default(),
        )
        .await;
        m.register(
            "c",
            Arc::new(FixedProbe(ProbeStatus::Healthy)),
            ServiceCheckConfig::default(),
        )
        .await;

        m.check_now("a").await;
        m.check_now("b").await;
        m.check_now("c").await;

        // Two of three unhealthy: majority, so the system is unhealthy
        let health = m.system_health().await;
        assert_eq!(health.overall, ProbeStatus::Unhealthy);
        assert_eq!(health.unhealthy, 2);
    }

    #[tokio::test]
    async fn test_system_health_minority_is_degraded() {
        let m = monitor();
        m.register(
            "a",
            Arc::new(FixedProbe(ProbeStatus::Unhealthy)),
            ServiceCheckConfig::default(),
        )
        .await;
        m.register(
            "b",
            Arc::new(FixedProbe(ProbeStatus::Healthy)),
            ServiceCheckConfig::default(),
        )
        .await;
        m.register(
            "c",
            Arc::new(FixedProbe(ProbeStatus::Healthy)),
            ServiceCheckConfig::default(),
        )
        .await;

        m.check_now("a").await;
        m.check_now("b").await;
        m.check_now("c").await;

        let health = m.system_health().await;
        assert_eq!(health.overall, ProbeStatus::Degraded);
    }

    #[tokio::test]
    async fn test_all_healthy_summary() {
        let m = monitor();
        m.register(
            "a",
            Arc::new(FixedProbe(ProbeStatus::Healthy)),
            ServiceCheckConfig::default(),
        )
        .await;
        m.check_now("a").await;

        let health = m.system_health().await;
        assert_eq!(health.overall, ProbeStatus::Healthy);
        assert_eq!(health.healthy, 1);
    }
}
