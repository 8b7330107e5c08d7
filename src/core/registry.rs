//! Handler registry for taskforge.
//!
//! Each [`Server`](crate::Server) owns one [`HandlerRegistry`] mapping task
//! names to [`Handler`]s. Handlers are registered while the server is stopped;
//! `start` snapshots the registry into an `Arc` the workers read from, so
//! lookups on the hot path never take a lock.
//!
//! # Examples
//!
//! ```rust
//! use taskforge::prelude::*;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("email:send", |ctx: TaskContext, task: Task| async move {
//!     tracing::info!("sending {} bytes for task {}", task.payload.len(), ctx.task_id);
//!     Ok::<(), BoxError>(())
//! });
//! assert!(registry.contains("email:send"));
//! ```

use crate::error::BoxError;
use crate::task::{Task, TaskId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-run information handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Id of the task being processed
    pub task_id: TaskId,
    /// Queue the task was taken from
    pub queue: String,
    /// Retries performed before this run
    pub retry_count: u32,
    /// The run is aborted at this instant
    pub deadline: Instant,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(task: &Task, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id.clone(),
            queue: task.queue.clone(),
            retry_count: task.retry_count,
            deadline,
            cancel,
        }
    }

    /// Time left before the run is aborted.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the run timed out. Stopping the server does not cancel a run.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run times out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Processes tasks of one name.
///
/// Implemented for every `Fn(TaskContext, Task) -> impl Future<Output = Result<(), BoxError>>`,
/// so plain async closures work as handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the task. An error (or a panic) counts as a failed attempt.
    async fn handle(&self, ctx: TaskContext, task: Task) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, task: Task) -> Result<(), BoxError> {
        (self)(ctx, task).await
    }
}

/// Execution statistics for one task name.
#[derive(Debug, Clone, Default)]
pub struct HandlerStats {
    /// Total number of handler runs
    pub total_executed: u64,
    /// Number of successful runs
    pub successful: u64,
    /// Number of failed runs, timeouts included
    pub failed: u64,
    /// Number of runs aborted by their timeout
    pub timed_out: u64,
    /// Average run time
    pub avg_duration: Option<Duration>,
}

/// How a single handler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunResult {
    Success,
    Failed,
    TimedOut,
}

/// Handlers by task name, plus their statistics.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    stats: Arc<RwLock<HashMap<String, HandlerStats>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H)
    where
        H: Handler + 'static,
    {
        self.register_arc(name, Arc::new(handler));
    }

    pub(crate) fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!("Replacing handler for task '{}'", name);
        } else {
            tracing::debug!("Registered handler for task '{}'", name);
        }
    }

    /// Look up the handler for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Statistics for one task name.
    pub async fn stats(&self, name: &str) -> Option<HandlerStats> {
        self.stats.read().await.get(name).cloned()
    }

    /// Statistics for every task name that has run.
    pub async fn all_stats(&self) -> HashMap<String, HandlerStats> {
        self.stats.read().await.clone()
    }

    pub(crate) async fn record(&self, name: &str, result: RunResult, duration: Duration) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(name.to_string()).or_default();

        entry.total_executed += 1;
        match result {
            RunResult::Success => entry.successful += 1,
            RunResult::Failed => entry.failed += 1,
            RunResult::TimedOut => {
                entry.failed += 1;
                entry.timed_out += 1;
            }
        }

        // Exponential moving average
        entry.avg_duration = Some(match entry.avg_duration {
            Some(avg) => {
                let alpha = 0.1;
                Duration::from_secs_f64(
                    alpha * duration.as_secs_f64() + (1.0 - alpha) * avg.as_secs_f64(),
                )
            }
            None => duration,
        });
    }
}
