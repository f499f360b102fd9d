//! Bounded worker pool for subprocess-backed jobs
//!
//! A semaphore caps how many transcoder processes run at once. Requests that
//! cannot start immediately wait in a bounded queue for at most
//! `queue_timeout`; beyond either bound they fail with `ResourceExhausted`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    queue_limit: usize,
    queue_timeout: Duration,
    waiting: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

/// Slot in the pool; frees itself on drop.
#[derive(Debug)]
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(capacity: usize, queue_limit: usize, queue_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_limit,
            queue_timeout,
            waiting: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn retry_after(&self) -> Duration {
        self.queue_timeout.max(Duration::from_secs(1))
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> JobPermit {
        self.running.fetch_add(1, Ordering::SeqCst);
        JobPermit {
            _permit: permit,
            running: Arc::clone(&self.running),
        }
    }

    /// Acquire a slot, queueing within the configured bounds.
    pub async fn admit(&self) -> Result<JobPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(self.grant(permit)),
            Err(TryAcquireError::Closed) => return Err(PipelineError::processing("worker pool closed")),
            Err(TryAcquireError::NoPermits) => {}
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot(Arc::clone(&self.waiting));
        if queued >= self.queue_limit {
            warn!(capacity = self.capacity, queued, "worker pool saturated, rejecting job");
            return Err(PipelineError::ResourceExhausted { retry_after: self.retry_after() });
        }

        debug!(position = queued + 1, "job queued for worker slot");
        match tokio::time::timeout(self.queue_timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(self.grant(permit)),
            Ok(Err(_)) => Err(PipelineError::processing("worker pool closed")),
            Err(_) => {
                warn!(timeout_secs = self.queue_timeout.as_secs_f64(), "queued job timed out waiting for a worker");
                Err(PipelineError::ResourceExhausted { retry_after: self.retry_after() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_capacity() {
        let pool = Arc::new(WorkerPool::new(2, 64, Duration::from_secs(10)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = pool.admit().await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let pool = WorkerPool::new(1, 0, Duration::from_secs(10));
        let _held = pool.admit().await.unwrap();

        let started = Instant::now();
        let err = pool.admit().await.unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhausted { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_queue_timeout_rejects() {
        let pool = WorkerPool::new(1, 4, Duration::from_millis(50));
        let _held = pool.admit().await.unwrap();
        let err = pool.admit().await.unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhausted { retry_after } if retry_after >= Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_queued_job_runs_after_release() {
        let pool = Arc::new(WorkerPool::new(1, 4, Duration::from_secs(5)));
        let held = pool.admit().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.waiting(), 1);
        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
