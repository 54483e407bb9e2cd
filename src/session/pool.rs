use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Bounded worker pool without a queue.
///
/// A submission either gets a free slot right away or is rejected; it is
/// never held back waiting for one.
pub struct DispatchPool {
    slots: Arc<Semaphore>,
    tasks: JoinSet<()>,
    capacity: usize,
}

impl DispatchPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            tasks: JoinSet::new(),
            capacity,
        }
    }

    /// Run `task` on a free slot. Returns `false` if every slot is busy or
    /// the pool was shut down.
    pub fn try_submit<F>(&mut self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();

        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            return false;
        };
        self.tasks.spawn(async move {
            task.await;
            drop(permit);
        });
        true
    }

    /// Abort every running task and refuse new ones. Does not wait.
    pub fn shutdown_now(&mut self) {
        self.slots.close();
        self.tasks.abort_all();
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently holding a slot.
    pub fn active(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(err) = result
                && err.is_panic()
            {
                error!("dispatch worker panicked: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn should_reject_when_saturated() {
        let mut pool = DispatchPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let mut releases = Vec::new();

        for _ in 0..2 {
            let (tx, rx) = oneshot::channel::<()>();
            releases.push(tx);
            let ran = Arc::clone(&ran);
            assert!(pool.try_submit(async move {
                let _ = rx.await;
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(pool.active(), 2);

        let extra = Arc::clone(&ran);
        assert!(!pool.try_submit(async move {
            extra.fetch_add(100, Ordering::SeqCst);
        }));

        for tx in releases {
            tx.send(()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn should_free_slot_when_task_finishes() {
        let mut pool = DispatchPool::new(1);
        let (tx, rx) = oneshot::channel::<()>();

        assert!(pool.try_submit(async move {
            let _ = tx.send(());
        }));
        rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(pool.try_submit(async {}));
    }

    #[tokio::test]
    async fn should_abort_tasks_on_shutdown_now() {
        let mut pool = DispatchPool::new(4);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            assert!(pool.try_submit(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.shutdown_now();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(!pool.try_submit(async {}));
    }
}
