//! Stage job queue: bounded concurrency with paced job starts
//!
//! Stage hand-offs are enqueued here as plain job payloads instead of
//! spawned futures. A single dispatcher task pulls jobs in FIFO order,
//! hands each to the handler installed when the queue is armed, holds
//! starts to at most `max_concurrent` in flight, and keeps a minimum
//! spacing between consecutive starts so a burst of runs cannot stampede
//! the upstream APIs behind the stages.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{GambitError, Result};

const QUEUE_DEPTH: usize = 256;

pub struct StageQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    max_concurrent: usize,
    job_spacing: Duration,
}

impl<T: Send + 'static> StageQueue<T> {
    pub fn new(max_concurrent: usize, job_spacing: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            max_concurrent: max_concurrent.max(1),
            job_spacing,
        }
    }

    /// Install the job handler and start the dispatcher. The first call
    /// wins; arming an already-armed queue is a no-op.
    pub fn arm<H, Fut>(&self, handler: H)
    where
        H: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = match self.rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(rx) = rx {
            tokio::spawn(dispatch(
                rx,
                handler,
                self.max_concurrent,
                self.job_spacing,
            ));
        }
    }

    /// Queue a job for dispatch. Fails once the dispatcher has shut down.
    pub async fn enqueue(&self, job: T) -> Result<()> {
        self.tx.send(job).await.map_err(|_| GambitError::Cancelled)
    }
}

async fn dispatch<T, H, Fut>(
    mut rx: mpsc::Receiver<T>,
    handler: H,
    max_concurrent: usize,
    spacing: Duration,
) where
    T: Send + 'static,
    H: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut last_start: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        if let Some(prev) = last_start {
            let since = prev.elapsed();
            if since < spacing {
                tokio::time::sleep(spacing - since).await;
            }
        }
        last_start = Some(Instant::now());

        let fut = handler(job);
        tokio::spawn(async move {
            fut.await;
            drop(permit);
        });
    }

    debug!("stage queue dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_job_starts_are_spaced() {
        let queue = StageQueue::new(4, Duration::from_millis(250));
        let (done_tx, mut done_rx) = mpsc::channel(8);
        queue.arm(move |_: u32| {
            let done = done_tx.clone();
            async move {
                let _ = done.send(Instant::now()).await;
            }
        });

        for i in 0..3 {
            queue.enqueue(i).await.unwrap();
        }

        let mut starts = Vec::new();
        for _ in 0..3 {
            starts.push(done_rx.recv().await.unwrap());
        }
        starts.sort();

        assert!(starts[1] - starts[0] >= Duration::from_millis(250));
        assert!(starts[2] - starts[1] >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_capped() {
        let queue = StageQueue::new(2, Duration::ZERO);
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (done_tx, mut done_rx) = mpsc::channel(8);

        {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            queue.arm(move |_: u32| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let done = done_tx.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = done.send(()).await;
                }
            });
        }

        for i in 0..5 {
            queue.enqueue(i).await.unwrap();
        }

        for _ in 0..5 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let queue = StageQueue::new(1, Duration::ZERO);
        let (done_tx, mut done_rx) = mpsc::channel(8);
        queue.arm(move |i: u32| {
            let done = done_tx.clone();
            async move {
                let _ = done.send(i).await;
            }
        });

        for i in 0..4u32 {
            queue.enqueue(i).await.unwrap();
        }

        for expected in 0..4u32 {
            assert_eq!(done_rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_second_arm_is_ignored() {
        let queue = StageQueue::new(1, Duration::ZERO);
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        {
            let first = first.clone();
            queue.arm(move |_: u32| {
                let first = first.clone();
                async move {
                    first.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        {
            let second = second.clone();
            queue.arm(move |_: u32| {
                let second = second.clone();
                async move {
                    second.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        queue.enqueue(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }
}
