//! Async work queue with a concurrency ceiling.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Runs submitted futures with at most `concurrency` of them in flight.
/// Clone is cheap and shares the limit.
#[derive(Clone)]
pub struct TaskQueue {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a slot, run `task`, and hand back its output.
    pub async fn add<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self.permits.acquire().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        self.running.fetch_add(1, Ordering::SeqCst);
        let output = task.await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        drop(permit);
        output
    }

    /// Tasks waiting for a slot.
    pub fn size(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Tasks currently running.
    pub fn pending(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}
