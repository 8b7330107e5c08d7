//! Worker implementation for taskforge.
//!
//! A worker repeatedly picks the next ready task across the server's queues,
//! runs its handler under a time limit and settles the outcome: success
//! discards the task, failure schedules a retry or dead-letters it.

use crate::config::{RetryPolicy, ServerConfig};
use crate::core::registry::{HandlerRegistry, RunResult, TaskContext};
use crate::error::ForgeResult;
use crate::queue::{QueueAdapter, TaskQueue, dead_key, pending_key, scheduled_key};
use crate::task::{DeadLetterTask, FailureOutcome, Task};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::ForgeMetrics;

/// Statistics about worker performance
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Number of running workers
    pub active_workers: usize,
    /// Tasks whose handler succeeded
    pub tasks_completed: u64,
    /// Handler runs that failed, panicked or timed out
    pub tasks_failed: u64,
    /// Failed tasks scheduled for another attempt
    pub tasks_retried: u64,
    /// Tasks moved to the dead-letter queue
    pub tasks_dead_lettered: u64,
    /// Malformed tasks and tasks without a handler
    pub tasks_dropped: u64,
    /// Average handler run time
    pub avg_task_duration: Option<Duration>,
}

/// How a dequeued task left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Retried,
    /// `ran` is false when the deadline passed before the handler started.
    DeadLettered { ran: bool },
    Dropped,
}

/// Shared sink for worker statistics and, when enabled, Prometheus metrics.
#[derive(Clone, Default)]
pub(crate) struct StatsRecorder {
    stats: Arc<Mutex<WorkerStats>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ForgeMetrics>>,
}

impl StatsRecorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Arc<ForgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) async fn snapshot(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    async fn worker_started(&self) {
        self.stats.lock().await.active_workers += 1;
    }

    async fn worker_stopped(&self) {
        let mut stats = self.stats.lock().await;
        stats.active_workers = stats.active_workers.saturating_sub(1);
    }

    pub(crate) async fn record(&self, queue: &str, outcome: Outcome, duration: Option<Duration>) {
        let mut stats = self.stats.lock().await;

        match outcome {
            Outcome::Completed => stats.tasks_completed += 1,
            Outcome::Retried => {
                stats.tasks_failed += 1;
                stats.tasks_retried += 1;
            }
            Outcome::DeadLettered { ran } => {
                if ran {
                    stats.tasks_failed += 1;
                }
                stats.tasks_dead_lettered += 1;
            }
            Outcome::Dropped => stats.tasks_dropped += 1,
        }

        if let Some(duration) = duration {
            // Simple moving average
            stats.avg_task_duration = Some(match stats.avg_task_duration {
                Some(avg) => (avg + duration) / 2,
                None => duration,
            });
        }
        drop(stats);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            match outcome {
                Outcome::Completed => metrics.processed(queue),
                Outcome::Retried => {
                    metrics.failed(queue);
                    metrics.retried(queue);
                }
                Outcome::DeadLettered { ran } => {
                    if ran {
                        metrics.failed(queue);
                    }
                    metrics.dead(queue);
                }
                Outcome::Dropped => metrics.dropped(queue),
            }
            if let Some(duration) = duration {
                metrics.observe(queue, duration);
            }
        }

        #[cfg(not(feature = "metrics"))]
        let _ = queue;
    }
}

/// Decides which queue a worker polls first.
///
/// In strict mode the order is always highest priority first. Otherwise every
/// queue owns `priority` slots in a rotation and each turn starts one slot
/// further, so a queue is polled first in proportion to its priority.
#[derive(Debug, Clone)]
pub(crate) struct QueueSelector {
    strict: bool,
    queues: Vec<String>,
    slots: Vec<usize>,
}

impl QueueSelector {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        let queues: Vec<String> = config.queues.iter().map(|q| q.name.clone()).collect();
        let slots = config
            .queues
            .iter()
            .enumerate()
            .flat_map(|(index, q)| std::iter::repeat_n(index, q.priority.max(1) as usize))
            .collect();

        if config.strict_priority {
            Self {
                strict: true,
                queues: config.queues_by_priority(),
                slots: Vec::new(),
            }
        } else {
            Self {
                strict: false,
                queues,
                slots,
            }
        }
    }

    /// Poll order for the given turn.
    pub(crate) fn order(&self, turn: usize) -> Vec<&str> {
        if self.strict || self.slots.is_empty() {
            return self.queues.iter().map(String::as_str).collect();
        }

        let start = turn % self.slots.len();
        let mut seen = vec![false; self.queues.len()];
        let mut order = Vec::with_capacity(self.queues.len());
        for offset in 0..self.slots.len() {
            let index = self.slots[(start + offset) % self.slots.len()];
            if !seen[index] {
                seen[index] = true;
                order.push(self.queues[index].as_str());
            }
        }
        order
    }
}

/// State every worker of one server run shares.
pub(crate) struct WorkerShared {
    pub(crate) queue: TaskQueue,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) selector: QueueSelector,
    pub(crate) config: ServerConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) stats: StatsRecorder,
    pub(crate) shutdown: CancellationToken,
}

/// Individual worker that processes tasks
pub struct Worker {
    id: usize,
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<WorkerShared>) -> Self {
        Self { id, shared }
    }

    /// Run until the server's shutdown token is cancelled.
    ///
    /// Cancellation is observed between iterations; a task already dequeued
    /// is always settled before the worker exits.
    pub async fn run(self) {
        info!("Worker {} started", self.id);
        self.shared.stats.worker_started().await;

        let mut turn = self.id;
        while !self.shared.shutdown.is_cancelled() {
            let next = {
                let order = self.shared.selector.order(turn);
                self.next_task(&order).await
            };
            turn = turn.wrapping_add(1);

            match next {
                Ok(Some((queue, item))) => self.process(&queue, item).await,
                Ok(None) => {}
                Err(e) => {
                    if e.is_transient() {
                        warn!("Worker {} failed to dequeue, backing off: {}", self.id, e);
                    } else {
                        error!("Worker {} failed to dequeue: {}", self.id, e);
                    }
                    tokio::select! {
                        _ = self.shared.shutdown.cancelled() => {}
                        _ = sleep(self.shared.config.poll_interval()) => {}
                    }
                }
            }
        }

        self.shared.stats.worker_stopped().await;
        info!("Worker {} stopped", self.id);
    }

    /// Take the next item, or wait one poll interval for work to arrive.
    async fn next_task(&self, order: &[&str]) -> ForgeResult<Option<(String, Vec<u8>)>> {
        let queue = &self.shared.queue;

        for name in order {
            match queue.dequeue(&pending_key(name)).await {
                Ok(item) => return Ok(Some((name.to_string(), item))),
                Err(e) if e.is_empty_queue() => continue,
                Err(e) => return Err(e),
            }
        }

        let poll_interval = self.shared.config.poll_interval();
        let Some(first) = order.first() else {
            sleep(poll_interval).await;
            return Ok(None);
        };

        match queue
            .dequeue_with_timeout(&pending_key(first), poll_interval)
            .await
        {
            Ok(item) => Ok(Some((first.to_string(), item))),
            Err(e) if e.is_timeout() || e.is_empty_queue() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run one dequeued item to completion and settle its outcome.
    pub(crate) async fn process(&self, queue: &str, item: Vec<u8>) {
        let shared = &self.shared;

        let task: Task = match serde_json::from_slice(&item) {
            Ok(task) => task,
            Err(e) => {
                warn!("Worker {} dropping malformed task on '{}': {}", self.id, queue, e);
                shared.stats.record(queue, Outcome::Dropped, None).await;
                return;
            }
        };

        let now = Utc::now();
        if task.is_expired(now) {
            let mut task = task;
            let reason = "deadline exceeded".to_string();
            task.last_error = Some(reason.clone());
            let dead = DeadLetterTask {
                task,
                reason,
                failed_at: now,
            };
            if self.dead_letter(&dead).await {
                shared
                    .stats
                    .record(queue, Outcome::DeadLettered { ran: false }, None)
                    .await;
            }
            return;
        }

        let Some(handler) = shared.registry.get(&task.name) else {
            warn!(
                "Worker {} dropping task {}: no handler registered for '{}'",
                self.id, task.id, task.name
            );
            shared.stats.record(queue, Outcome::Dropped, None).await;
            return;
        };

        let mut limit = task.timeout.unwrap_or(shared.config.default_task_timeout());
        if let Some(deadline) = task.deadline {
            let left = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            limit = limit.min(left);
        }

        let started = Instant::now();
        let deadline = started.checked_add(limit).unwrap_or_else(|| far_future(started));
        // Cancelled on timeout only; stop() lets running handlers finish.
        let token = CancellationToken::new();
        let ctx = TaskContext::new(&task, deadline, token.clone());
        debug!(
            "Worker {} running task {} ({}) with limit {:?}",
            self.id, task.id, task.name, limit
        );

        let run = {
            let task = task.clone();
            async move { handler.handle(ctx, task).await }
        };
        let mut handle = tokio::spawn(run);

        let (result, failure) = match timeout(limit, &mut handle).await {
            Ok(Ok(Ok(()))) => (RunResult::Success, None),
            Ok(Ok(Err(e))) => (RunResult::Failed, Some(e.to_string())),
            Ok(Err(join_error)) => (
                RunResult::Failed,
                Some(format!("handler panicked: {}", join_error)),
            ),
            Err(_) => {
                token.cancel();
                handle.abort();
                (
                    RunResult::TimedOut,
                    Some(format!("handler timed out after {:?}", limit)),
                )
            }
        };
        let duration = started.elapsed();
        shared.registry.record(&task.name, result, duration).await;

        let Some(reason) = failure else {
            debug!("Worker {} completed task {} in {:?}", self.id, task.id, duration);
            shared
                .stats
                .record(queue, Outcome::Completed, Some(duration))
                .await;
            return;
        };

        warn!("Worker {} task {} failed: {}", self.id, task.id, reason);
        match task.fail(reason, Utc::now(), &shared.retry) {
            FailureOutcome::Retry(task) => match self.schedule_retry(&task).await {
                Ok(()) => {
                    info!(
                        "Task {} retry {}/{} at {}",
                        task.id, task.retry_count, task.max_retry, task.process_at
                    );
                    shared
                        .stats
                        .record(queue, Outcome::Retried, Some(duration))
                        .await;
                }
                Err(e) => error!("Failed to schedule retry of task {}: {}", task.id, e),
            },
            FailureOutcome::Dead(dead) => {
                if self.dead_letter(&dead).await {
                    shared
                        .stats
                        .record(queue, Outcome::DeadLettered { ran: true }, Some(duration))
                        .await;
                }
            }
        }
    }

    /// Schedule the next attempt, ignoring the queue capacity.
    async fn schedule_retry(&self, task: &Task) -> ForgeResult<()> {
        let item = serde_json::to_vec(task)?;
        self.shared
            .queue
            .schedule_uncapped(&scheduled_key(&task.queue), item, task.process_at)
            .await
    }

    /// Store the record in the dead-letter queue. Returns whether it was written.
    async fn dead_letter(&self, dead: &DeadLetterTask) -> bool {
        let key = dead_key(&dead.task.queue);
        let written = match serde_json::to_vec(dead) {
            Ok(item) => self.shared.queue.enqueue_uncapped(&key, item).await,
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(()) => {
                error!(
                    "Task {} ({}) moved to '{}': {}",
                    dead.task.id, dead.task.name, key, dead.reason
                );
                true
            }
            Err(e) => {
                error!("Failed to dead-letter task {}: {}", dead.task.id, e);
                false
            }
        }
    }
}

/// Stand-in deadline for timeouts too large to add to an [`Instant`].
fn far_future(from: Instant) -> Instant {
    from + Duration::from_secs(86400 * 365 * 30)
}
