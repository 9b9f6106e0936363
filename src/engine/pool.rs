// src/engine/pool.rs

//! Admission control for whole graphs.
//!
//! The graph executor never limits its own fan-out; the pool caps how many
//! submitted jobs (typically "validate and run one graph") are in flight.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of concurrently running jobs.
    pub size: usize,
    /// Jobs submitted since the pool was created.
    pub total: usize,
    pub running: usize,
    pub waiting: usize,
}

#[derive(Default)]
struct Counters {
    size: AtomicUsize,
    total: AtomicUsize,
    running: AtomicUsize,
    waiting: AtomicUsize,
}

/// Bounded pool of concurrently running jobs. Clones share the same limit.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let counters = Counters::default();
        counters.size.store(size, Ordering::SeqCst);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            counters: Arc::new(counters),
        }
    }

    /// Twice the available parallelism.
    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2)
    }

    /// Queue a job. It starts once a slot is free; the handle yields its
    /// output.
    pub fn submit<F>(&self, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        counters.total.fetch_add(1, Ordering::SeqCst);
        counters.waiting.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only fails if
            // that invariant breaks; run the job unthrottled in that case.
            let permit = permits.acquire_owned().await.ok();
            counters.waiting.fetch_sub(1, Ordering::SeqCst);
            counters.running.fetch_add(1, Ordering::SeqCst);

            let output = job.await;

            counters.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            output
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.counters.size.load(Ordering::SeqCst),
            total: self.counters.total.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            waiting: self.counters.waiting.load(Ordering::SeqCst),
        }
    }

    /// Change the concurrency limit. Shrinking never interrupts running
    /// jobs; the surplus slots are retired as those jobs finish.
    pub fn set_size(&self, size: usize) {
        let size = size.max(1);
        let old = self.counters.size.swap(size, Ordering::SeqCst);
        debug!(old, new = size, "worker pool resized");

        if size > old {
            self.permits.add_permits(size - old);
        } else if size < old {
            let surplus = (old - size) as u32;
            let permits = Arc::clone(&self.permits);
            tokio::spawn(async move {
                if let Ok(retired) = permits.acquire_many_owned(surplus).await {
                    retired.forget();
                }
            });
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(Self::default_size())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    #[tokio::test]
    async fn limits_concurrency() {
        let pool = WorkerPool::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let peak = Arc::clone(&peak);
            let live = Arc::clone(&live);
            handles.push(pool.submit(async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);

        let stats = pool.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn grow_releases_waiters() {
        let pool = WorkerPool::new(1);
        let blocker = Arc::new(Notify::new());

        let held = {
            let blocker = Arc::clone(&blocker);
            pool.submit(async move { blocker.notified().await })
        };
        let queued = pool.submit(async { 7 });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiting, 1);

        pool.set_size(2);
        let value = tokio::time::timeout(Duration::from_secs(1), queued)
            .await
            .expect("second slot opened")
            .unwrap();
        assert_eq!(value, 7);

        blocker.notify_one();
        held.await.unwrap();
        assert_eq!(pool.stats().size, 2);
    }
}
