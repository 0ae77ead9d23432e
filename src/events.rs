//! Typed event bus for pipeline and resilience notifications.
//!
//! Every observable transition in the bot (stage hand-offs, breaker trips,
//! alerts, trade executions) is published here as a typed event. Observers
//! subscribe through a broadcast channel; a slow subscriber that falls more
//! than the channel capacity behind loses the oldest events rather than
//! applying backpressure to publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::health::Alert;
use crate::pipeline::Stage;
use crate::resilience::CircuitState;

/// Events published by the bot core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BotEvent {
    RunStarted {
        run_id: Uuid,
    },
    StageStarted {
        run_id: Uuid,
        stage: Stage,
    },
    StageCompleted {
        run_id: Uuid,
        stage: Stage,
        output: serde_json::Value,
    },
    PipelineFailed {
        run_id: Uuid,
        stage: Stage,
        error: String,
    },
    RunCompleted {
        run_id: Uuid,
    },
    BotStopped,
    TradeExecuted {
        run_id: Uuid,
        symbol: String,
        detail: serde_json::Value,
    },
    BreakerTransition {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },
    AlertRaised {
        alert: Alert,
    },
}

impl BotEvent {
    /// Correlation id this event belongs to, when it is run-scoped
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            BotEvent::RunStarted { run_id }
            | BotEvent::StageStarted { run_id, .. }
            | BotEvent::StageCompleted { run_id, .. }
            | BotEvent::PipelineFailed { run_id, .. }
            | BotEvent::RunCompleted { run_id }
            | BotEvent::TradeExecuted { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

/// A published event together with its timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: BotEvent,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast-based event bus with a bounded recent-event ring
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    recent: Arc<RwLock<VecDeque<EventEnvelope>>>,
    recent_cap: usize,
}

impl EventBus {
    pub fn new(channel_capacity: usize, recent_cap: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self {
            tx,
            recent: Arc::new(RwLock::new(VecDeque::with_capacity(recent_cap))),
            recent_cap,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(256, 100)
    }

    /// Subscribe to the live event stream
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Publish an event. Send errors (no subscribers) are not failures.
    pub async fn publish(&self, event: BotEvent) {
        let envelope = EventEnvelope {
            event,
            timestamp: Utc::now(),
        };

        {
            let mut recent = self.recent.write().await;
            if recent.len() >= self.recent_cap {
                recent.pop_front();
            }
            recent.push_back(envelope.clone());
        }

        let _ = self.tx.send(envelope);
    }

    /// Most recent events, newest last
    pub async fn recent(&self) -> Vec<EventEnvelope> {
        self.recent.read().await.iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::with_defaults();
        let mut rx = bus.subscribe();

        let run_id = Uuid::new_v4();
        bus.publish(BotEvent::RunStarted { run_id }).await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.run_id(), Some(run_id));
    }

    #[tokio::test]
    async fn test_recent_ring_is_capped() {
        let bus = EventBus::new(16, 3);
        for _ in 0..5 {
            bus.publish(BotEvent::BotStopped).await;
        }
        assert_eq!(bus.recent().await.len(), 3);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::with_defaults();
        bus.publish(BotEvent::BotStopped).await;
        assert_eq!(bus.recent().await.len(), 1);
    }
}
