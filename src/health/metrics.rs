//! Rolling per-dependency performance metrics
//!
//! In-memory only; mutated by the health monitor after each probe and read
//! by reporting consumers. Never persisted across restarts.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cumulative probe metrics for one dependency
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests: u64,
    pub errors: u64,
    pub total_response_time_ms: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests: 0,
            errors: 0,
            total_response_time_ms: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            started_at: Utc::now(),
        }
    }

    pub fn record_success(&mut self, response_time_ms: u64) {
        self.requests += 1;
        self.total_response_time_ms += response_time_ms;
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, response_time_ms: u64) {
        self.requests += 1;
        self.errors += 1;
        self.total_response_time_ms += response_time_ms;
        self.consecutive_failures += 1;
        self.last_failure = Some(Utc::now());
    }

    /// Cumulative error rate in percent
    pub fn error_rate_pct(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.errors as f64 / self.requests as f64) * 100.0
        }
    }

    /// Average probe response time in milliseconds
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.requests as f64
        }
    }

    /// Seconds since this dependency started being monitored
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests,
            errors: self.errors,
            error_rate_pct: self.error_rate_pct(),
            avg_response_time_ms: self.avg_response_time_ms(),
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_failure: self.last_failure,
            uptime_secs: self.uptime_secs(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy with derived rates, attached to alerts and reports
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub error_rate_pct: f64,
    pub avg_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}
