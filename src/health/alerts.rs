//! Alert types and the capped alert history
//!
//! Alerts are immutable once raised. History keeps the newest first and
//! drops the oldest past the configured cap; live delivery goes through a
//! broadcast channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, warn};

use super::metrics::MetricsSnapshot;

/// What condition the alert reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    SlowResponse,
    ConsecutiveFailures,
    ServiceDown,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::HighErrorRate => write!(f, "high_error_rate"),
            AlertKind::SlowResponse => write!(f, "slow_response"),
            AlertKind::ConsecutiveFailures => write!(f, "consecutive_failures"),
            AlertKind::ServiceDown => write!(f, "service_down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// One raised alert with the metrics that triggered it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub service: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub metrics: MetricsSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        service: &str,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        metrics: MetricsSnapshot,
    ) -> Self {
        Self {
            service: service.to_string(),
            kind,
            severity,
            message,
            metrics,
            timestamp: Utc::now(),
        }
    }
}

/// Capped alert history plus live fan-out
pub struct AlertHub {
    history: RwLock<VecDeque<Alert>>,
    cap: usize,
    tx: broadcast::Sender<Alert>,
}

impl AlertHub {
    pub fn new(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            history: RwLock::new(VecDeque::with_capacity(cap)),
            cap: cap.max(1),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Record an alert: log, append to history (newest first), broadcast
    pub async fn raise(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Warning => warn!(
                service = %alert.service, kind = %alert.kind, "{}", alert.message
            ),
            AlertSeverity::Critical => error!(
                service = %alert.service, kind = %alert.kind, "{}", alert.message
            ),
        }

        {
            let mut history = self.history.write().await;
            if history.len() >= self.cap {
                history.pop_back();
            }
            history.push_front(alert.clone());
        }

        let _ = self.tx.send(alert);
    }

    /// Alert history, newest first
    pub async fn recent(&self) -> Vec<Alert> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Drop the history. Idempotent.
    pub async fn clear(&self) {
        self.history.write().await.clear();
    }
}
