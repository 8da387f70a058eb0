//! Backpressure-aware bounded worker pool (C7): jobs are submitted with a
//! progressive timeout that tightens as queue utilization rises.

use async_channel::{bounded, Receiver, Sender};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Inner {
    capacity: usize,
    depth: AtomicI64,
    processed: AtomicI64,
    sender: Sender<Job>,
}

/// A fixed-size pool of worker tasks draining a bounded queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// `workers` tasks are spawned immediately; the queue capacity is
    /// `8 * workers`.
    pub fn new(workers: usize) -> Self {
        let capacity = (workers.max(1)) * 8;
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(capacity);
        let inner = Arc::new(Inner {
            capacity,
            depth: AtomicI64::new(0),
            processed: AtomicI64::new(0),
            sender,
        });

        for id in 0..workers.max(1) {
            let receiver = receiver.clone();
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Ok(job) = receiver.recv().await {
                    inner.depth.fetch_sub(1, Ordering::SeqCst);
                    job.await;
                    inner.processed.fetch_add(1, Ordering::SeqCst);
                }
                debug!(worker = id, "worker pool shard exiting");
            });
        }

        WorkerPool { inner }
    }

    fn timeout_for_utilization(&self) -> Duration {
        let depth = self.inner.depth.load(Ordering::SeqCst).max(0) as f64;
        let util = depth / self.inner.capacity as f64;
        if util > 0.9 {
            Duration::from_millis(100)
        } else if util > 0.7 {
            Duration::from_millis(500)
        } else if util > 0.5 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(5)
        }
    }

    /// Submit a job. Returns `false` if admission was rejected under
    /// backpressure (caller should treat this as "close the stream").
    pub async fn submit(&self, job: Job) -> bool {
        let t = self.timeout_for_utilization();
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        match timeout(t, self.inner.sender.send(job)).await {
            Ok(Ok(())) => true,
            _ => {
                self.inner.depth.fetch_sub(1, Ordering::SeqCst);
                warn!(timeout_ms = t.as_millis() as u64, "worker pool submission rejected");
                false
            }
        }
    }

    pub fn processed(&self) -> i64 {
        self.inner.processed.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> i64 {
        self.inner.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn shutdown(&self) {
        self.inner.sender.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn jobs_run_and_are_counted() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            let ok = pool
                .submit(Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
            assert!(ok);
        }
        // give workers a chance to drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.processed(), 10);
    }

    #[tokio::test]
    async fn saturated_queue_is_rejected_quickly() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Notify::new());
        // Block the single worker and fill the queue (capacity = 8) plus
        // the one in-flight job, then push one more: it should be
        // rejected within the shortest backpressure tier.
        let gate_wait = gate.clone();
        pool.submit(Box::pin(async move {
            gate_wait.notified().await;
        }))
        .await;

        for _ in 0..pool.capacity() {
            pool.submit(Box::pin(async {})).await;
        }

        let start = tokio::time::Instant::now();
        let ok = pool.submit(Box::pin(async {})).await;
        let elapsed = start.elapsed();
        assert!(!ok);
        assert!(elapsed < Duration::from_secs(1));

        gate.notify_one();
    }
}
