use std::future::Future;
use std::sync::Arc;
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::{AbortHandle, JoinError, JoinSet};

/// Spawns tasks onto a [`JoinSet`] while holding at most `max_concurrent`
/// of them alive. Every task stays owned by the spawner until it is joined,
/// and every output is handed back by [`LimitedSpawner::join_all`].
pub struct LimitedSpawner<T> {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<T>,
    finished: Vec<Result<T, JoinError>>,
}

impl<T: Send + 'static> LimitedSpawner<T> {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            tasks: JoinSet::new(),
            finished: Vec::new(),
        }
    }

    /// Waits for a free slot, then spawns `f`.
    pub async fn spawn<F>(&mut self, f: F) -> Result<AbortHandle, AcquireError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.reap();
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        Ok(self.tasks.spawn(async move {
            let _permit = permit;
            f.await
        }))
    }

    // Finished tasks leave the set but keep their output for join_all
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.finished.push(result);
        }
    }

    /// Number of tasks spawned and not yet finished.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Joins every task, in completion order.
    pub async fn join_all(mut self) -> Vec<Result<T, JoinError>> {
        let mut results = std::mem::take(&mut self.finished);
        while let Some(result) = self.tasks.join_next().await {
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_basic_spawn() {
        let mut spawner = LimitedSpawner::new(2);

        spawner.spawn(async { 42 }).await.unwrap();
        let results = spawner.join_all().await;

        assert_eq!(results.len(), 1);
        assert_eq!(*results[0].as_ref().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_concurrent_limit() {
        let mut spawner = LimitedSpawner::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let completed = Arc::new(AtomicUsize::new(0));

        // Spawn 5 tasks, but only 2 should run concurrently
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            let max_concurrent = Arc::clone(&max_concurrent);
            let completed = Arc::clone(&completed);

            spawner
                .spawn(async move {
                    let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(current, Ordering::SeqCst);

                    sleep(Duration::from_millis(50)).await;

                    counter.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        // Tasks reaped by later spawns are still returned
        let results = spawner.join_all().await;
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert!(max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_zero_limit() {
        let mut spawner = LimitedSpawner::new(0);

        // acquire_owned() blocks indefinitely with 0 permits
        let result =
            tokio::time::timeout(Duration::from_millis(100), spawner.spawn(async { 42 })).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_task_failure_releases_permit() {
        let mut spawner = LimitedSpawner::new(1);

        spawner
            .spawn(async {
                panic!("Test panic");
            })
            .await
            .unwrap();

        // The second spawn only gets a permit once the panicked task released it
        let second = tokio::time::timeout(Duration::from_secs(1), spawner.spawn(async {})).await;
        assert!(second.is_ok());

        let results = spawner.join_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_reaped_outputs_are_kept() {
        let mut spawner = LimitedSpawner::new(4);

        for i in 0..3 {
            spawner.spawn(async move { i }).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        spawner.spawn(async { 99 }).await.unwrap();
        assert_eq!(spawner.running(), 1);

        let mut outputs = spawner
            .join_all()
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>();
        outputs.sort();
        assert_eq!(outputs, vec![0, 1, 2, 99]);
    }
}
