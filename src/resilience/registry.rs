//! Registry of circuit breakers keyed by dependency name
//!
//! Breakers are created lazily on first use and live for the process
//! lifetime. The registry is constructed explicitly and injected wherever a
//! protected call is made; there is no global instance.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::breaker::{BreakerEvent, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
use crate::config::AppConfig;

/// Breaker-derived view of overall dependency health
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSystemHealth {
    pub healthy: bool,
    pub open_services: Vec<String>,
    pub half_open_services: Vec<String>,
    pub total_breakers: usize,
}

/// Looks up per-service breaker configuration
pub trait BreakerConfigSource: Send + Sync {
    fn config_for(&self, service: &str) -> CircuitBreakerConfig;
}

impl BreakerConfigSource for AppConfig {
    fn config_for(&self, service: &str) -> CircuitBreakerConfig {
        self.breaker_settings(service).into()
    }
}

/// Uniform configuration for every service
pub struct UniformBreakerConfig(pub CircuitBreakerConfig);

impl BreakerConfigSource for UniformBreakerConfig {
    fn config_for(&self, _service: &str) -> CircuitBreakerConfig {
        self.0.clone()
    }
}

/// Shared registry of per-dependency circuit breakers
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config_source: Arc<dyn BreakerConfigSource>,
    event_tx: broadcast::Sender<BreakerEvent>,
}

impl BreakerRegistry {
    pub fn new(config_source: Arc<dyn BreakerConfigSource>) -> Self {
        let (event_tx, _) = broadcast::channel(128);
        Self {
            breakers: DashMap::new(),
            config_source,
            event_tx,
        }
    }

    /// Registry where every breaker shares one configuration
    pub fn uniform(config: CircuitBreakerConfig) -> Self {
        Self::new(Arc::new(UniformBreakerConfig(config)))
    }

    /// Breaker for a dependency, created on first use
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }

        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_event_sender(
                    service,
                    self.config_source.config_for(service),
                    self.event_tx.clone(),
                ))
            })
            .clone()
    }

    /// Subscribe to transitions from every breaker in the registry
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.event_tx.subscribe()
    }

    /// Stats for all known breakers
    pub async fn all_stats(&self) -> Vec<CircuitStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();

        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Force every breaker closed. Idempotent.
    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    /// Aggregate health derived from breaker states
    pub async fn system_health(&self) -> BreakerSystemHealth {
        let stats = self.all_stats().await;
        let open_services: Vec<String> = stats
            .iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.service.clone())
            .collect();
        let half_open_services: Vec<String> = stats
            .iter()
            .filter(|s| s.state == CircuitState::HalfOpen)
            .map(|s| s.service.clone())
            .collect();

        BreakerSystemHealth {
            healthy: open_services.is_empty(),
            open_services,
            half_open_services,
            total_breakers: stats.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GambitError;

    #[tokio::test]
    async fn test_lazy_creation_returns_same_instance() {
        let registry = BreakerRegistry::uniform(CircuitBreakerConfig::default());
        let a = registry.breaker("brokerage");
        let b = registry.breaker("brokerage");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all_stats().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_all_closes_open_breakers() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let registry = BreakerRegistry::uniform(config);

        let breaker = registry.breaker("advisor");
        let _ = breaker
            .execute::<(), _, _>(|| async { Err(GambitError::Transport("down".into())) })
            .await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!registry.system_health().await.healthy);

        registry.reset_all().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(registry.system_health().await.healthy);

        // Idempotent
        registry.reset_all().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_event_channel_sees_all_breakers() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let registry = BreakerRegistry::uniform(config);
        let mut rx = registry.subscribe();

        let breaker = registry.breaker("storage");
        let _ = breaker
            .execute::<(), _, _>(|| async { Err(GambitError::Transport("down".into())) })
            .await;

        let event = rx.recv().await.unwrap();
        match event {
            BreakerEvent::Transition { service, .. } => assert_eq!(service, "storage"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
