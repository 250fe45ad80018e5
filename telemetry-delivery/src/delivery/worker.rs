use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounded pool for background delivery work.
///
/// Jobs run as tasks on the given runtime, at most `workers` at a time.
/// Entry points that must not block (lifecycle callbacks) hand work to the
/// pool and return immediately.
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(handle: Handle, workers: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Pool on the runtime of the calling task, if any.
    pub fn current(workers: usize) -> Option<Self> {
        Handle::try_current().ok().map(|handle| Self::new(handle, workers))
    }

    pub fn spawn<F>(&self, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("Worker semaphore should not be closed");
            job.await;
        })
    }

    /// Run a job once `delay` has elapsed. The delay does not hold a worker.
    pub fn spawn_after<F>(&self, delay: Duration, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _permit = permits
                .acquire_owned()
                .await
                .expect("Worker semaphore should not be closed");
            job.await;
        })
    }

    /// Run blocking file I/O off the async workers. `None` if the job panicked.
    pub async fn run_blocking<F, T>(&self, job: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match self.handle.spawn_blocking(job).await {
            Ok(value) => Some(value),
            Err(e) => {
                log::error!("[DELIVERY] Blocking job failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spawned_jobs_run() {
        let pool = WorkerPool::current(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let counter = counter.clone();
                pool.spawn(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_run_blocking_returns_value_and_survives_panic() {
        let pool = WorkerPool::current(1).unwrap();
        assert_eq!(pool.run_blocking(|| 21 * 2).await, Some(42));

        let failed: Option<()> = pool.run_blocking(|| panic!("boom")).await;
        assert!(failed.is_none());
    }

    #[tokio::test]
    async fn test_spawn_after_waits_for_delay() {
        let pool = WorkerPool::current(1).unwrap();
        let started = std::time::Instant::now();
        pool.spawn_after(Duration::from_millis(20), async {}).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
