//! Completion-order result stream
//!
//! A [`TaskStream`] pulls tasks from its source (an explicit list or the
//! executor's queue) and keeps up to the effective concurrency of them
//! running. Each task runs on its own tokio task, so work already started
//! finishes even if the stream is closed or dropped. Before every refill the
//! stream checks that it is still open and that the executor is running.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::executor::ExecutorInner;
use super::task::{Task, TaskResult};

enum Source<T> {
    List(VecDeque<Task<T>>),
    Queue,
}

/// One-shot stream of [`TaskResult`]s in completion order
pub struct TaskStream<T> {
    executor: Arc<ExecutorInner<T>>,
    source: Source<T>,
    in_flight: FuturesUnordered<BoxFuture<'static, TaskResult<T>>>,
    closed: bool,
    yielded: usize,
}

impl<T: Send + 'static> TaskStream<T> {
    pub(crate) fn from_tasks(executor: Arc<ExecutorInner<T>>, tasks: Vec<Task<T>>) -> Self {
        Self::with_source(executor, Source::List(tasks.into()))
    }

    pub(crate) fn from_queue(executor: Arc<ExecutorInner<T>>) -> Self {
        Self::with_source(executor, Source::Queue)
    }

    fn with_source(executor: Arc<ExecutorInner<T>>, source: Source<T>) -> Self {
        Self {
            executor,
            source,
            in_flight: FuturesUnordered::new(),
            closed: false,
            yielded: 0,
        }
    }

    /// Stop launching tasks; in-flight results are still yielded
    ///
    /// Tasks not yet started are dropped for a list source and left in
    /// place for a queue source.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Source::List(pending) = &mut self.source {
            if !pending.is_empty() {
                tracing::debug!(dropped = pending.len(), "Task stream closed with tasks pending");
            }
            pending.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tasks currently running for this stream
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Results handed out so far
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    fn next_task(&mut self) -> Option<Task<T>> {
        match &mut self.source {
            Source::List(pending) => pending.pop_front(),
            Source::Queue => self.executor.queue.dequeue(),
        }
    }

    fn refill(&mut self) {
        if self.closed || !self.executor.is_running() {
            return;
        }

        while self.in_flight.len() < self.executor.effective_concurrency() {
            let Some(task) = self.next_task() else {
                break;
            };

            let task_id = task.id.clone();
            let url = task.url.clone();
            let executor = Arc::clone(&self.executor);
            let handle = tokio::spawn(async move { executor.run_task(task).await });

            self.in_flight.push(
                handle
                    .map(move |joined| {
                        joined.unwrap_or_else(|e| TaskResult {
                            task_id,
                            url,
                            success: false,
                            result: None,
                            error: Some(format!("task aborted: {e}")),
                            duration_ms: 0,
                            retries: 0,
                        })
                    })
                    .boxed(),
            );
        }
    }
}

impl<T: Send + 'static> Stream for TaskStream<T> {
    type Item = TaskResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        this.refill();

        if this.in_flight.is_empty() {
            return Poll::Ready(None);
        }

        match this.in_flight.poll_next_unpin(cx) {
            Poll::Ready(Some(result)) => {
                this.yielded += 1;
                // Start the replacement before handing the result out.
                this.refill();
                Poll::Ready(Some(result))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.source {
            Source::List(pending) => {
                let n = self.in_flight.len() + pending.len();
                (n, Some(n))
            }
            Source::Queue => (self.in_flight.len(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::concurrency::{ParallelExecutor, ParallelExecutorConfig};
    use futures::StreamExt;
    use std::time::Duration;

    fn executor(max_concurrency: usize) -> ParallelExecutor<u64> {
        ParallelExecutor::new(ParallelExecutorConfig {
            max_concurrency,
            enable_adaptive: false,
            rate_limiter: crate::concurrency::RateLimiterConfig {
                max_per_domain: max_concurrency,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_yields_in_completion_order() {
        let executor = executor(4);
        let tasks = [300u64, 100, 200]
            .into_iter()
            .map(|ms| {
                executor.task(format!("https://t.test/{ms}"), move || async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                })
            })
            .collect();

        let order: Vec<u64> = executor
            .execute_stream(tasks)
            .filter_map(|r| async move { r.result })
            .collect()
            .await;
        assert_eq!(order, vec![100, 200, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_closes_early() {
        let executor = executor(1);
        let tasks = (0..5u64)
            .map(|i| executor.task(format!("https://t.test/{i}"), move || async move { Ok(i) }))
            .collect();

        let mut stream = executor.execute_stream(tasks);
        let first = stream.next().await.unwrap();
        assert_eq!(first.result, Some(0));

        stream.close();
        // The replacement started before close still arrives.
        let rest: Vec<_> = stream.collect().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].result, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_queue_drains_by_priority() {
        use crate::concurrency::Priority;

        let executor = executor(1);
        for (i, priority) in [Priority::Low, Priority::High, Priority::Normal]
            .into_iter()
            .enumerate()
        {
            let i = i as u64;
            executor
                .enqueue(
                    executor
                        .task(format!("https://q.test/{i}"), move || async move { Ok(i) })
                        .with_priority(priority),
                )
                .unwrap();
        }

        let order: Vec<u64> = executor
            .process_queue()
            .filter_map(|r| async move { r.result })
            .collect()
            .await;
        assert_eq!(order, vec![1, 2, 0]);
        assert_eq!(executor.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_stopped_executor_launches_nothing() {
        let executor = executor(2);
        executor
            .enqueue(executor.task("https://q.test", || async { Ok(1) }))
            .unwrap();

        let mut stream = executor.process_queue();
        executor.stop();
        assert!(stream.next().await.is_none());
        assert_eq!(executor.queue_size(), 1);
    }
}
