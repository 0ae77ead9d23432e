//! Dead-letter queue for operations that exhausted their retries
//!
//! Bounded in-memory store with FIFO eviction. A background scheduler
//! periodically replays due items through a registered handler; items
//! without a scheduled retry (trade-critical operations) are only replayed
//! by explicit operator action.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{GambitError, Result};

/// An operation parked after retry exhaustion
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterItem {
    pub id: Uuid,
    pub operation: String,
    pub payload: serde_json::Value,
    pub last_error: String,
    /// Attempt count when retries were exhausted
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// None means never auto-replayed; operator action required
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeadLetterItem {
    pub fn new(
        operation: &str,
        payload: serde_json::Value,
        last_error: &str,
        attempts: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            payload,
            last_error: last_error.to_string(),
            attempts,
            created_at: Utc::now(),
            next_retry_at,
        }
    }
}

/// Summary statistics for operators
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub len: usize,
    pub capacity: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Handler invoked to re-attempt a dead-lettered operation
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, item: &DeadLetterItem) -> Result<()>;
}

#[derive(Default)]
struct DlqInner {
    items: HashMap<Uuid, DeadLetterItem>,
    /// Insertion order, oldest first; drives FIFO eviction
    order: VecDeque<Uuid>,
}

/// Bounded dead-letter queue
pub struct DeadLetterQueue {
    capacity: usize,
    inner: RwLock<DlqInner>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(DlqInner::default()),
        }
    }

    /// Insert an item, evicting the oldest entry when at capacity.
    /// Returns the evicted item's id, if any.
    pub async fn push(&self, item: DeadLetterItem) -> Option<Uuid> {
        let mut inner = self.inner.write().await;

        let evicted = if inner.order.len() >= self.capacity {
            inner.order.pop_front().map(|oldest| {
                inner.items.remove(&oldest);
                warn!(id = %oldest, "dead-letter queue full, evicted oldest item");
                oldest
            })
        } else {
            None
        };

        debug!(id = %item.id, operation = %item.operation, "operation dead-lettered");
        inner.order.push_back(item.id);
        inner.items.insert(item.id, item);
        evicted
    }

    pub async fn get(&self, id: Uuid) -> Option<DeadLetterItem> {
        self.inner.read().await.items.get(&id).cloned()
    }

    /// All items, oldest first
    pub async fn items(&self) -> Vec<DeadLetterItem> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    /// Remove one item. Idempotent; returns whether it existed.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let existed = inner.items.remove(&id).is_some();
        if existed {
            inner.order.retain(|x| *x != id);
        }
        existed
    }

    /// Drop everything. Idempotent.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.items.clear();
        inner.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> DlqStats {
        let inner = self.inner.read().await;
        let oldest = inner
            .order
            .front()
            .and_then(|id| inner.items.get(id))
            .map(|i| i.created_at);
        let newest = inner
            .order
            .back()
            .and_then(|id| inner.items.get(id))
            .map(|i| i.created_at);
        DlqStats {
            len: inner.order.len(),
            capacity: self.capacity,
            oldest,
            newest,
        }
    }

    /// Items whose scheduled retry has passed. Unscheduled items are skipped.
    pub async fn due_items(&self, now: DateTime<Utc>) -> Vec<DeadLetterItem> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id))
            .filter(|item| item.next_retry_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Push a failed replay back out by `delay`, recording the new error.
    /// Items with no schedule stay unscheduled: trading operations wait for
    /// an operator even after a failed manual replay.
    pub async fn reschedule(&self, id: Uuid, delay: ChronoDuration, error: &str) {
        let mut inner = self.inner.write().await;
        if let Some(item) = inner.items.get_mut(&id) {
            item.next_retry_at = item.next_retry_at.map(|_| Utc::now() + delay);
            item.last_error = error.to_string();
            item.attempts += 1;
        }
    }
}

/// Configuration for the replay scheduler
#[derive(Debug, Clone)]
pub struct DlqSchedulerConfig {
    /// Interval between scans for due items
    pub scan_interval: Duration,
    /// Delay applied when a replay fails
    pub retry_interval: ChronoDuration,
}

impl Default for DlqSchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            retry_interval: ChronoDuration::seconds(3600),
        }
    }
}

/// Background task replaying due dead-letter items
pub struct DlqScheduler {
    queue: Arc<DeadLetterQueue>,
    handler: Arc<dyn ReplayHandler>,
    config: DlqSchedulerConfig,
    running: Arc<AtomicBool>,
}

impl DlqScheduler {
    pub fn new(
        queue: Arc<DeadLetterQueue>,
        handler: Arc<dyn ReplayHandler>,
        config: DlqSchedulerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replay every currently-due item once. Exposed for targeted runs and tests.
    pub async fn process_cycle(&self) -> (u64, u64) {
        Self::run_cycle(&self.queue, &self.handler, self.config.retry_interval).await
    }

    async fn run_cycle(
        queue: &DeadLetterQueue,
        handler: &Arc<dyn ReplayHandler>,
        retry_interval: ChronoDuration,
    ) -> (u64, u64) {
        let due = queue.due_items(Utc::now()).await;
        if due.is_empty() {
            return (0, 0);
        }

        let mut processed = 0u64;
        let mut succeeded = 0u64;

        for item in due {
            processed += 1;
            match handler.replay(&item).await {
                Ok(()) => {
                    queue.remove(item.id).await;
                    succeeded += 1;
                    info!(id = %item.id, operation = %item.operation, "dead-letter replay succeeded");
                }
                Err(e) => {
                    queue.reschedule(item.id, retry_interval, &e.to_string()).await;
                    warn!(id = %item.id, operation = %item.operation, error = %e, "dead-letter replay failed");
                }
            }
        }

        (processed, succeeded)
    }

    /// Start the scheduler daemon
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            interval_secs = self.config.scan_interval.as_secs(),
            "DLQ scheduler started"
        );

        let queue = self.queue.clone();
        let handler = self.handler.clone();
        let retry_interval = self.config.retry_interval;
        let scan_interval = self.config.scan_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(scan_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately; skip it so a fresh queue
            // is not scanned before anything can be due.
            timer.tick().await;

            while running.load(Ordering::SeqCst) {
                timer.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let (processed, succeeded) =
                    Self::run_cycle(&queue, &handler, retry_interval).await;
                if processed > 0 {
                    info!("DLQ cycle complete: {}/{} succeeded", succeeded, processed);
                }
            }

            info!("DLQ scheduler stopped");
        });
    }

    /// Stop the scheduler daemon
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Operator-triggered replay of one item, scheduled or not
    pub async fn replay_now(&self, id: Uuid) -> Result<()> {
        let item = self
            .queue
            .get(id)
            .await
            .ok_or_else(|| GambitError::NotFound(format!("no dead-letter item {}", id)))?;

        match self.handler.replay(&item).await {
            Ok(()) => {
                self.queue.remove(id).await;
                info!(%id, operation = %item.operation, "operator replay succeeded");
                Ok(())
            }
            Err(e) => {
                self.queue
                    .reschedule(id, self.config.retry_interval, &e.to_string())
                    .await;
                error!(%id, operation = %item.operation, error = %e, "operator replay failed");
                Err(e)
            }
        }
    }
}
