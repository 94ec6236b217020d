//! Parallel task executor
//!
//! [`ParallelExecutor`] composes the global [`Semaphore`], the per-domain
//! [`DomainRateLimiter`], the [`AdaptiveConcurrencyController`], the
//! [`ConcurrencyQueue`] and a [`RetryConfig`] into one facade.
//!
//! Every attempt of a task acquires a global permit, then its domain's permit,
//! then runs. Backoff delays between attempts hold neither permit. A single
//! task's failure is reported in its [`TaskResult`], never as an `Err`.
//!
//! # Example
//!
//! ```ignore
//! let executor = ParallelExecutor::new(ParallelExecutorConfig::default())?;
//! let batch = executor
//!     .execute_batch(urls.iter().map(|u| executor.task(u, fetch_fn(u))).collect())
//!     .await;
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::adaptive::{AdaptiveConcurrencyController, AdaptiveConfig, ConcurrencySnapshot};
use super::domain_limiter::{DomainRateLimiter, DomainWindowState, RateLimiterConfig};
use super::queue::{ConcurrencyQueue, QueueConfig, QueueStats};
use super::resource_monitor::{ResourceMonitor, ResourceMonitorConfig, ResourceSnapshot};
use super::semaphore::{Semaphore, SemaphoreStats};
use super::stream::TaskStream;
use super::task::{BatchResult, Task, TaskResult};
use crate::error::{Error, FetchError, QueueError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics;
use crate::utils::retry::RetryConfig;
use crate::utils::{duration_ms, IdGenerator, UuidIdGenerator};

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelExecutorConfig {
    /// Global bound on in-flight attempts
    pub max_concurrency: usize,

    pub rate_limiter: RateLimiterConfig,
    pub queue: QueueConfig,
    pub resource_monitor: ResourceMonitorConfig,
    pub adaptive: AdaptiveConfig,

    /// Let the adaptive controller move the effective concurrency
    pub enable_adaptive: bool,

    /// Retry failed attempts with backoff
    pub enable_retry: bool,

    /// Retry budget and backoff curve
    pub retry: RetryConfig,

    /// Per-attempt deadline in milliseconds
    pub task_timeout_ms: Option<u64>,
}

impl Default for ParallelExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            rate_limiter: RateLimiterConfig::default(),
            queue: QueueConfig::default(),
            resource_monitor: ResourceMonitorConfig::default(),
            adaptive: AdaptiveConfig::default(),
            enable_adaptive: true,
            enable_retry: true,
            retry: RetryConfig::default(),
            task_timeout_ms: None,
        }
    }
}

impl ParallelExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::config("max_concurrency must be greater than 0"));
        }
        if self.task_timeout_ms == Some(0) {
            return Err(Error::config("task_timeout_ms must be greater than 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::config("retry.multiplier must be at least 1.0"));
        }
        self.rate_limiter.validate()?;
        self.queue.validate()?;
        self.resource_monitor.validate()?;
        self.adaptive.validate(self.max_concurrency)?;
        Ok(())
    }

    pub fn max_retries(&self) -> u32 {
        if self.enable_retry {
            self.retry.max_retries
        } else {
            0
        }
    }
}

/// Read-only view of every sub-component
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub running: bool,
    pub queue: QueueStats,
    pub semaphore: SemaphoreStats,
    pub domains: Vec<DomainWindowState>,
    pub adaptive: ConcurrencySnapshot,
    pub resources: ResourceSnapshot,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_retries: u64,
}

pub(crate) struct ExecutorInner<T> {
    config: ParallelExecutorConfig,
    semaphore: Semaphore,
    limiter: DomainRateLimiter,
    monitor: Arc<ResourceMonitor>,
    adaptive: AdaptiveConcurrencyController,
    pub(crate) queue: ConcurrencyQueue<T>,
    events: EventBus,
    ids: Arc<dyn IdGenerator>,
    running: AtomicBool,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl<T: Send + 'static> ExecutorInner<T> {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.adaptive.start();
            tracing::debug!("Executor started");
        }
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        self.adaptive.effective_concurrency()
    }

    /// Apply the controller's latest target to the global semaphore
    fn sync_concurrency(&self) {
        let target = self.adaptive.effective_concurrency();
        if self.semaphore.limit() != target {
            self.semaphore.set_limit(target);
            metrics::set_effective_concurrency(target);
        }
    }

    fn retry_policy(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.config.max_retries(),
            ..self.config.retry.clone()
        }
    }

    /// One attempt: global permit, then domain permit, then the task body
    async fn attempt(&self, task: &Task<T>) -> anyhow::Result<T> {
        self.sync_concurrency();
        let _permit = self.semaphore.acquire().await;
        let _domain = self.limiter.acquire(&task.url).await;

        let started = Instant::now();
        let body = (task.execute)();
        let result = match self.config.task_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), body).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::Error::new(FetchError::Timeout)),
            },
            None => body.await,
        };

        let elapsed = started.elapsed();
        self.monitor.record(elapsed, result.is_ok());
        if result.is_ok() {
            self.adaptive.record_success(duration_ms(elapsed));
        } else {
            self.adaptive.record_failure(duration_ms(elapsed));
        }
        result
    }

    pub(crate) async fn run_task(&self, task: Task<T>) -> TaskResult<T> {
        let started = Instant::now();
        tracing::debug!(task_id = %task.id, url = %task.url, "Task started");
        self.events.emit(EngineEvent::TaskStart {
            task_id: task.id.clone(),
            url: task.url.clone(),
        });

        let outcome = self
            .retry_policy()
            .run(
                |_| self.attempt(&task),
                is_retryable,
                |retry, delay, error| {
                    metrics::record_retry("executor");
                    self.events.emit(EngineEvent::Retrying {
                        id: task.id.clone(),
                        url: task.url.clone(),
                        retry,
                        delay_ms: duration_ms(delay),
                        error: format!("{error:#}"),
                    });
                },
            )
            .await;

        let elapsed = started.elapsed();
        let elapsed_ms = duration_ms(elapsed);
        self.retries
            .fetch_add(u64::from(outcome.retries), Ordering::Relaxed);

        match outcome.result {
            Ok(value) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                metrics::record_task("success", elapsed);
                tracing::debug!(
                    task_id = %task.id,
                    duration_ms = elapsed_ms,
                    retries = outcome.retries,
                    "Task completed"
                );
                self.events.emit(EngineEvent::TaskComplete {
                    task_id: task.id.clone(),
                    url: task.url.clone(),
                    duration_ms: elapsed_ms,
                    retries: outcome.retries,
                });
                TaskResult::succeeded(&task, value, elapsed_ms, outcome.retries)
            }
            Err(e) => {
                let error = format!("{e:#}");
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_task("failure", elapsed);
                tracing::warn!(
                    task_id = %task.id,
                    url = %task.url,
                    retries = outcome.retries,
                    error = %error,
                    "Task failed"
                );
                self.events.emit(EngineEvent::TaskError {
                    task_id: task.id.clone(),
                    url: task.url.clone(),
                    error: error.clone(),
                    retries: outcome.retries,
                });
                TaskResult::failed(&task, error, elapsed_ms, outcome.retries)
            }
        }
    }
}

/// A permanent fetch failure anywhere in the chain ends retrying early
fn is_retryable(error: &anyhow::Error) -> bool {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<FetchError>())
        .map_or(true, FetchError::is_recoverable)
}

/// Builder for [`ParallelExecutor`]
pub struct ParallelExecutorBuilder {
    config: ParallelExecutorConfig,
    ids: Arc<dyn IdGenerator>,
    events: EventBus,
}

impl ParallelExecutorBuilder {
    pub fn new(config: ParallelExecutorConfig) -> Self {
        Self {
            config,
            ids: Arc::new(UuidIdGenerator),
            events: EventBus::default(),
        }
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Publish on a shared bus instead of a private one
    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build<T: Send + 'static>(self) -> Result<ParallelExecutor<T>> {
        let config = self.config;
        config.validate()?;

        let monitor = Arc::new(ResourceMonitor::new(config.resource_monitor.clone())?);
        let adaptive = AdaptiveConcurrencyController::new(
            config.adaptive.clone(),
            config.max_concurrency,
            config.enable_adaptive,
            Arc::clone(&monitor),
        )?;

        Ok(ParallelExecutor {
            inner: Arc::new(ExecutorInner {
                semaphore: Semaphore::new(config.max_concurrency)?,
                limiter: DomainRateLimiter::new(config.rate_limiter.clone())?,
                queue: ConcurrencyQueue::new(config.queue.clone())?,
                monitor,
                adaptive,
                events: self.events,
                ids: self.ids,
                running: AtomicBool::new(false),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                config,
            }),
        })
    }
}

/// Task-execution facade; clones share all state
pub struct ParallelExecutor<T> {
    inner: Arc<ExecutorInner<T>>,
}

impl<T> Clone for ParallelExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for ParallelExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.inner.config)
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ParallelExecutor<T> {
    /// Build an executor; invalid configuration is rejected here
    pub fn new(config: ParallelExecutorConfig) -> Result<Self> {
        ParallelExecutorBuilder::new(config).build()
    }

    /// Build an executor whose task ids come from `ids`
    pub fn with_id_generator(config: ParallelExecutorConfig, ids: Arc<dyn IdGenerator>) -> Result<Self> {
        ParallelExecutorBuilder::new(config).id_generator(ids).build()
    }

    pub fn config(&self) -> &ParallelExecutorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Build a task for `url` with a generated id
    pub fn task<F, Fut>(&self, url: impl Into<String>, f: F) -> Task<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Task::new(self.inner.ids.next_id(), url, f)
    }

    /// Run one task to a settled result
    pub async fn execute(&self, task: Task<T>) -> TaskResult<T> {
        self.inner.start();
        self.inner.run_task(task).await
    }

    /// Run all tasks concurrently; results come back in input order
    pub async fn execute_batch(&self, tasks: Vec<Task<T>>) -> BatchResult<T> {
        self.inner.start();
        let started = Instant::now();
        let total = tasks.len();
        tracing::debug!(total, "Executing batch");

        let results =
            futures::future::join_all(tasks.into_iter().map(|task| self.inner.run_task(task)))
                .await;

        let batch = BatchResult::from_results(results, duration_ms(started.elapsed()));
        tracing::info!(
            total = batch.total,
            succeeded = batch.succeeded,
            failed = batch.failed,
            duration_ms = batch.total_duration_ms,
            "Batch finished"
        );
        batch
    }

    /// Run tasks through a refilling pool; results arrive in completion order
    pub fn execute_stream(&self, tasks: Vec<Task<T>>) -> TaskStream<T> {
        self.inner.start();
        TaskStream::from_tasks(Arc::clone(&self.inner), tasks)
    }

    /// Queue a task for [`process_queue`](Self::process_queue)
    pub fn enqueue(&self, task: Task<T>) -> std::result::Result<String, QueueError> {
        let id = self.inner.queue.enqueue(task)?;
        tracing::trace!(task_id = %id, "Task queued");
        Ok(id)
    }

    /// Withdraw a queued task; false when it is not (or no longer) queued
    pub fn dequeue(&self, id: &str) -> bool {
        self.inner.queue.remove(id)
    }

    /// Drain the internal queue; results arrive in completion order
    pub fn process_queue(&self) -> TaskStream<T> {
        self.inner.start();
        TaskStream::from_queue(Arc::clone(&self.inner))
    }

    /// Run `f` under the global and domain limits without retry
    ///
    /// Lets collaborators with their own retry policy share this executor's limits.
    pub async fn run_guarded<F, Fut, R>(&self, url: &str, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.inner.start();
        self.inner.sync_concurrency();
        let _permit = self.inner.semaphore.acquire().await;
        self.inner.limiter.with_limit(url, f).await
    }

    pub fn start(&self) {
        self.inner.start();
    }

    /// Stop adaptive control and stop streams from launching new tasks
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.adaptive.stop();
            tracing::debug!("Executor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn effective_concurrency(&self) -> usize {
        self.inner.effective_concurrency()
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.size()
    }

    pub fn get_stats(&self) -> ExecutorStats {
        let inner = &self.inner;
        ExecutorStats {
            running: inner.is_running(),
            queue: inner.queue.stats(),
            semaphore: inner.semaphore.stats(),
            domains: inner.limiter.stats(),
            adaptive: inner.adaptive.snapshot(),
            resources: inner.monitor.snapshot(),
            tasks_succeeded: inner.succeeded.load(Ordering::Relaxed),
            tasks_failed: inner.failed.load(Ordering::Relaxed),
            total_retries: inner.retries.load(Ordering::Relaxed),
        }
    }

    /// Stop, clear the queue and return every component to its initial state
    pub fn reset(&self) {
        self.stop();
        let inner = &self.inner;
        inner.queue.clear();
        inner.adaptive.reset();
        inner.semaphore.reset();
        inner.limiter.reset();
        inner.monitor.reset();
        inner.succeeded.store(0, Ordering::Relaxed);
        inner.failed.store(0, Ordering::Relaxed);
        inner.retries.store(0, Ordering::Relaxed);
        tracing::debug!("Executor reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SequentialIdGenerator;
    use std::sync::atomic::AtomicU32;

    fn config(max_concurrency: usize) -> ParallelExecutorConfig {
        ParallelExecutorConfig {
            max_concurrency,
            enable_adaptive: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        assert!(ParallelExecutor::<()>::new(config(0)).is_err());
        assert!(ParallelExecutor::<()>::new(ParallelExecutorConfig {
            task_timeout_ms: Some(0),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_custom_id_generator() {
        let executor: ParallelExecutor<()> =
            ParallelExecutor::with_id_generator(config(2), Arc::new(SequentialIdGenerator::new("job")))
                .unwrap();
        let a = executor.task("https://a.test", || async { Ok(()) });
        let b = executor.task("https://b.test", || async { Ok(()) });
        assert_eq!(a.id, "job-1");
        assert_eq!(b.id, "job-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let executor = ParallelExecutor::new(config(2)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let task = executor.task("https://flaky.test", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(5)
            }
        });

        let result = executor.execute(task).await;
        assert!(result.success);
        assert_eq!(result.retries, 2);
        assert_eq!(result.result, Some(5));
        assert_eq!(executor.get_stats().total_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_fetch_error_not_retried() {
        let executor: ParallelExecutor<()> = ParallelExecutor::new(config(2)).unwrap();
        let task = executor.task("https://gone.test", || async {
            Err(anyhow::Error::new(FetchError::from_status(404)))
        });

        let result = executor.execute(task).await;
        assert!(!result.success);
        assert_eq!(result.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_disabled() {
        let executor: ParallelExecutor<()> = ParallelExecutor::new(ParallelExecutorConfig {
            enable_retry: false,
            ..config(2)
        })
        .unwrap();
        let task = executor.task("https://a.test", || async { anyhow::bail!("nope") });
        let result = executor.execute(task).await;
        assert!(!result.success);
        assert_eq!(result.retries, 0);
        assert_eq!(result.error.as_deref(), Some("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_counts_as_failure() {
        let executor: ParallelExecutor<()> = ParallelExecutor::new(ParallelExecutorConfig {
            task_timeout_ms: Some(100),
            enable_retry: false,
            ..config(2)
        })
        .unwrap();
        let task = executor.task("https://slow.test", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });

        let result = executor.execute(task).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue() {
        let executor: ParallelExecutor<()> = ParallelExecutor::new(config(2)).unwrap();
        let id = executor
            .enqueue(executor.task("https://a.test", || async { Ok(()) }))
            .unwrap();
        assert_eq!(executor.queue_size(), 1);
        assert!(executor.dequeue(&id));
        assert!(!executor.dequeue(&id));
        assert_eq!(executor.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let executor: ParallelExecutor<()> = ParallelExecutor::new(config(2)).unwrap();
        executor
            .execute(executor.task("https://a.test", || async { Ok(()) }))
            .await;
        executor
            .enqueue(executor.task("https://b.test", || async { Ok(()) }))
            .unwrap();
        assert!(executor.is_running());

        executor.reset();
        let stats = executor.get_stats();
        assert!(!stats.running);
        assert_eq!(stats.queue.total, 0);
        assert_eq!(stats.tasks_succeeded, 0);
        assert_eq!(stats.resources.sample_count, 0);
        assert!(stats.domains.is_empty());
    }
}
