//! Bounded executor for lake publish and txn-log cleanup RPCs.
//!
//! At most `size` futures run at once; up to `QUEUE_LIMIT` more wait for a
//! permit. Submissions beyond that are rejected with `TooManyTasks`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use holo_txn::{TxnError, TxnResult};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Largest accepted executor size.
pub const HARD_LIMIT: usize = 4096;
/// Submissions allowed to wait for a permit.
pub const QUEUE_LIMIT: usize = 4096;

pub struct BoundedExecutor {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    size: AtomicUsize,
    queued: Arc<AtomicUsize>,
}

/// `requested` when it lies in (0, HARD_LIMIT], otherwise `default`.
pub fn normalize_size(requested: i64, default: usize) -> usize {
    if requested <= 0 || requested as u64 > HARD_LIMIT as u64 {
        return default;
    }
    requested as usize
}

impl BoundedExecutor {
    pub fn new(name: &'static str, requested: i64, default: usize) -> Self {
        let size = normalize_size(requested, default);
        if size as i64 != requested {
            tracing::warn!(executor = name, requested, size, "invalid executor size, using default");
        }
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(size)),
            size: AtomicUsize::new(size),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Submissions still waiting for a permit.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn submit<F, T>(&self, fut: F) -> TxnResult<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let prev = self.queued.fetch_add(1, Ordering::AcqRel);
        if prev >= QUEUE_LIMIT {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(executor = self.name, queued = prev, "executor queue full");
            return Err(TxnError::TooManyTasks);
        }
        let semaphore = self.semaphore.clone();
        let queued = self.queued.clone();
        Ok(tokio::spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            queued.fetch_sub(1, Ordering::AcqRel);
            fut.await
        }))
    }

    /// Live resize. Invalid sizes are ignored and the current size kept.
    pub fn resize(&self, requested: i64) -> bool {
        if requested <= 0 || requested as u64 > HARD_LIMIT as u64 {
            tracing::warn!(executor = self.name, requested, "ignoring invalid executor size");
            return false;
        }
        let new_size = requested as usize;
        let old_size = self.size.swap(new_size, Ordering::AcqRel);
        if new_size > old_size {
            self.semaphore.add_permits(new_size - old_size);
        } else if new_size < old_size {
            // Shrink by retiring permits as running futures release them.
            let semaphore = self.semaphore.clone();
            let excess = (old_size - new_size) as u32;
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(excess).await {
                    permits.forget();
                }
            });
        }
        if new_size != old_size {
            tracing::info!(executor = self.name, old_size, new_size, "executor resized");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn sizes_outside_range_fall_back() {
        assert_eq!(normalize_size(0, 512), 512);
        assert_eq!(normalize_size(-3, 512), 512);
        assert_eq!(normalize_size(4097, 512), 512);
        assert_eq!(normalize_size(4096, 512), 4096);
        assert_eq!(normalize_size(8, 512), 8);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let executor = BoundedExecutor::new("test", 1, 1);
        let (tx, rx) = oneshot::channel::<()>();
        let first = executor
            .submit(async move {
                let _ = rx.await;
                1
            })
            .expect("submit");
        let second = executor.submit(async { 2 }).expect("submit");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        assert_eq!(executor.queued(), 1);

        tx.send(()).expect("release");
        assert_eq!(first.await.expect("join"), 1);
        assert_eq!(second.await.expect("join"), 2);
        assert_eq!(executor.queued(), 0);
    }

    #[tokio::test]
    async fn resize_ignores_invalid_values() {
        let executor = BoundedExecutor::new("test", 2, 2);
        assert!(!executor.resize(0));
        assert!(!executor.resize(5000));
        assert_eq!(executor.size(), 2);
        assert!(executor.resize(8));
        assert_eq!(executor.size(), 8);
    }
}
