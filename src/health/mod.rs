//! Dependency health monitoring and alerting

pub mod alerts;
pub mod metrics;
pub mod monitor;

pub use alerts::{Alert, AlertHub, AlertKind, AlertSeverity};
pub use metrics::{MetricsSnapshot, ServiceMetrics};
pub use monitor::{
    AlertThresholds, HealthMonitor, HealthProbe, ProbeReport, ProbeStatus, ServiceCheckConfig,
    ServiceHealth, SystemHealth,
};
