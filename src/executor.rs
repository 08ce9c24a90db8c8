use anyhow::Context;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const DEFAULT_MAX_BLOCKING_TASKS: usize = 4;

/// Runs blocking closures on Tokio's blocking pool, at most `max_tasks` at a time.
#[derive(Debug, Clone)]
pub struct BlockingExecutor {
    permits: Arc<Semaphore>,
}

impl BlockingExecutor {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_tasks.max(1))),
        }
    }

    /// Runs `job` off the async workers and waits for its result.
    ///
    /// The permit travels with the job, so it is only released once the closure has really returned, even if
    /// the awaiting future is dropped first.
    pub async fn run<F, T>(&self, job: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("Blocking executor is shut down")?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .context("Blocking task panicked")?
    }
}

impl Default for BlockingExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCKING_TASKS)
    }
}
