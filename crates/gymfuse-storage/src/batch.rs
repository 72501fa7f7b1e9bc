//! Bounded concurrent batch execution.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("concurrency limiter closed")]
    LimiterClosed,
    #[error("{0}")]
    Worker(String),
    #[error("worker task aborted: {0}")]
    Aborted(String),
}

/// Counting semaphore over in-flight external calls. Waiters are served in
/// arrival order.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BatchError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BatchError::LimiterClosed)
    }

    /// Run `fut` while holding one permit.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, BatchError> {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// Fixed pause between batches, not a retry backoff.
    pub inter_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrency: 3,
            inter_batch_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchProgress {
    pub completed_batches: usize,
    pub total_batches: usize,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total_batches == 0 {
            return 100.0;
        }
        (self.completed_batches as f64 / self.total_batches as f64) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Success(T),
    Failure(BatchError),
}

impl<T> ItemOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success(_))
    }
}

/// Outcome for the input at `index`, regardless of completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport<T> {
    pub index: usize,
    pub outcome: ItemOutcome<T>,
}

#[derive(Debug, Clone)]
pub struct BatchRunReport<T> {
    pub items: Vec<ItemReport<T>>,
    pub succeeded: usize,
    pub failed: usize,
    pub total_batches: usize,
}

impl<T> BatchRunReport<T> {
    pub fn successes(self) -> impl Iterator<Item = (usize, T)> {
        self.items.into_iter().filter_map(|item| match item.outcome {
            ItemOutcome::Success(value) => Some((item.index, value)),
            ItemOutcome::Failure(_) => None,
        })
    }
}

pub struct BatchOrchestrator {
    config: BatchConfig,
    limiter: ConcurrencyLimiter,
}

impl BatchOrchestrator {
    pub fn new(config: BatchConfig) -> Self {
        let limiter = ConcurrencyLimiter::new(config.max_concurrency);
        Self::with_limiter(config, limiter)
    }

    /// Share an existing limiter, e.g. one bounding every fetch in the process.
    pub fn with_limiter(config: BatchConfig, limiter: ConcurrencyLimiter) -> Self {
        Self { config, limiter }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub async fn process<I, T, E, W, Fut>(&self, items: Vec<I>, worker: W) -> BatchRunReport<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
        W: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.process_with_progress(items, worker, |_| {}).await
    }

    /// Run `worker` once per item. Items are split into sequential batches of
    /// `batch_size`; inside a batch every item runs concurrently under the
    /// limiter and all of them settle before the next batch starts. A failing
    /// or panicking item never cancels its siblings.
    pub async fn process_with_progress<I, T, E, W, Fut, P>(
        &self,
        items: Vec<I>,
        worker: W,
        mut on_progress: P,
    ) -> BatchRunReport<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
        W: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: FnMut(BatchProgress),
    {
        let batch_size = self.config.batch_size.max(1);
        let total_items = items.len();
        let total_batches = total_items.div_ceil(batch_size);
        let worker = Arc::new(worker);

        let mut report = BatchRunReport {
            items: Vec::with_capacity(total_items),
            succeeded: 0,
            failed: 0,
            total_batches,
        };

        let mut remaining = items.into_iter();
        let mut start = 0usize;
        for batch_no in 0..total_batches {
            let batch: Vec<I> = remaining.by_ref().take(batch_size).collect();
            let span = info_span!("batch", batch = batch_no + 1, total_batches, size = batch.len());

            let mut handles = Vec::with_capacity(batch.len());
            for (offset, item) in batch.into_iter().enumerate() {
                let limiter = self.limiter.clone();
                let worker = Arc::clone(&worker);
                let task = async move {
                    match limiter.acquire().await {
                        Ok(_permit) => (*worker)(item)
                            .await
                            .map_err(|e| BatchError::Worker(e.to_string())),
                        Err(err) => Err(err),
                    }
                };
                handles.push((start + offset, tokio::spawn(task.instrument(span.clone()))));
            }
            start += handles.len();

            for (index, handle) in handles {
                let outcome = match handle.await {
                    Ok(Ok(value)) => ItemOutcome::Success(value),
                    Ok(Err(err)) => ItemOutcome::Failure(err),
                    Err(join_err) => ItemOutcome::Failure(BatchError::Aborted(join_err.to_string())),
                };
                match &outcome {
                    ItemOutcome::Success(_) => report.succeeded += 1,
                    ItemOutcome::Failure(err) => {
                        report.failed += 1;
                        warn!(index, error = %err, "batch item failed");
                    }
                }
                report.items.push(ItemReport { index, outcome });
            }

            let progress = BatchProgress {
                completed_batches: batch_no + 1,
                total_batches,
            };
            info!(
                completed = progress.completed_batches,
                total = progress.total_batches,
                percent = progress.percent(),
                "batch complete"
            );
            on_progress(progress);

            if batch_no + 1 < total_batches && !self.config.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    fn config(batch_size: usize, max_concurrency: usize, delay_ms: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            max_concurrency,
            inter_batch_delay: Duration::from_millis(delay_ms),
        }
    }

    #[tokio::test]
    async fn worker_runs_exactly_once_per_item_despite_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orchestrator = BatchOrchestrator::new(config(3, 2, 0));
        let counter = Arc::clone(&calls);
        let report = orchestrator
            .process((0..10).collect(), move |n: usize| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if n % 3 == 0 {
                        Err(format!("item {n} rejected"))
                    } else {
                        Ok(n * 10)
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(report.total_batches, 4);
        assert_eq!(report.succeeded, 6);
        assert_eq!(report.failed, 4);
        for item in &report.items {
            match &item.outcome {
                ItemOutcome::Success(v) => assert_eq!(*v, item.index * 10),
                ItemOutcome::Failure(BatchError::Worker(msg)) => {
                    assert_eq!(msg, &format!("item {} rejected", item.index))
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn outcomes_are_attributed_by_index_not_completion_order() {
        let orchestrator = BatchOrchestrator::new(config(4, 4, 0));
        let report = orchestrator
            .process(vec![40u64, 30, 20, 10], |ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, String>(ms)
            })
            .await;
        let values: Vec<_> = report.successes().collect();
        assert_eq!(values, vec![(0, 40), (1, 30), (2, 20), (3, 10)]);
    }

    #[tokio::test]
    async fn panicking_item_is_isolated() {
        let orchestrator = BatchOrchestrator::new(config(5, 5, 0));
        let report = orchestrator
            .process((0..5).collect(), |n: usize| async move {
                if n == 3 {
                    panic!("worker blew up");
                }
                Ok::<_, String>(n)
            })
            .await;
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            report.items[3].outcome,
            ItemOutcome::Failure(BatchError::Aborted(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_work_never_exceeds_limiter_capacity() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let orchestrator = BatchOrchestrator::new(config(8, 2, 0));
        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let report = orchestrator
            .process((0..16).collect(), move |_n: usize| {
                let (f, p) = (Arc::clone(&f), Arc::clone(&p));
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await;
        assert_eq!(report.succeeded, 16);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(orchestrator.limiter().available(), 2);
    }

    #[tokio::test]
    async fn progress_is_reported_per_batch_and_delay_is_applied_between_batches() {
        let orchestrator = BatchOrchestrator::new(config(2, 2, 30));
        let mut seen = Vec::new();
        let started = Instant::now();
        let report = orchestrator
            .process_with_progress(
                (0..5).collect(),
                |n: usize| async move { Ok::<_, String>(n) },
                |p| seen.push(p.percent().round() as u32),
            )
            .await;
        assert_eq!(report.total_batches, 3);
        assert_eq!(seen, vec![33, 67, 100]);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn empty_input_runs_no_batches() {
        let orchestrator = BatchOrchestrator::new(config(3, 1, 1000));
        let report = orchestrator
            .process(Vec::<usize>::new(), |n: usize| async move { Ok::<_, String>(n) })
            .await;
        assert_eq!(report.total_batches, 0);
        assert!(report.items.is_empty());
    }

    #[tokio::test]
    async fn limiter_grants_permits_in_arrival_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = limiter.acquire().await.unwrap();

        let mut tasks = Vec::new();
        for label in ["first", "second", "third"] {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                order.lock().unwrap().push(label);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped_to_one() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert_eq!(limiter.run(async { 7 }).await.unwrap(), 7);
    }
}
