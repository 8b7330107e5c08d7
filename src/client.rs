//! Producer-side API.
//!
//! A [`Client`] turns a handler name and a payload into a [`Task`], persists
//! it through the shared [`QueueAdapter`] and returns a [`TaskInfo`] snapshot.
//! Tasks due now go to `Q:pending`; tasks with a future process time go to
//! `Q:scheduled`, from where the server's scheduler promotes them.

use crate::config::QueueConfig;
use crate::error::ForgeResult;
use crate::queue::{
    QueueAdapter, QueueAdapterExt, QueueFactory, QueueStats, pending_key, scheduled_key,
};
use crate::task::{Task, TaskInfo, TaskOptions, TaskState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Enqueues tasks onto a queue adapter.
#[derive(Clone)]
pub struct Client {
    queue: Arc<dyn QueueAdapter>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over an existing adapter.
    pub fn new(queue: Arc<dyn QueueAdapter>) -> Self {
        Self { queue }
    }

    /// Create a client with its own adapter built from `config`.
    pub async fn from_config(config: &QueueConfig) -> ForgeResult<Self> {
        Ok(Self::new(QueueFactory::from_config(config).await?))
    }

    /// The adapter this client writes to.
    pub fn queue(&self) -> &Arc<dyn QueueAdapter> {
        &self.queue
    }

    /// Enqueue a task. Honours `with_delay` / `with_process_at` in `opts`.
    pub async fn enqueue(
        &self,
        name: &str,
        payload: Vec<u8>,
        opts: TaskOptions,
    ) -> ForgeResult<TaskInfo> {
        let task = Task::new(name, payload, &opts, Utc::now())?;
        self.persist(task).await
    }

    /// Enqueue a task to run after `delay`. A zero delay runs it immediately.
    pub async fn enqueue_in(
        &self,
        name: &str,
        delay: Duration,
        payload: Vec<u8>,
        opts: TaskOptions,
    ) -> ForgeResult<TaskInfo> {
        self.enqueue(name, payload, opts.with_delay(delay)).await
    }

    /// Enqueue a task to run at `at`. A time at or before now runs it immediately.
    pub async fn enqueue_at(
        &self,
        name: &str,
        at: DateTime<Utc>,
        payload: Vec<u8>,
        opts: TaskOptions,
    ) -> ForgeResult<TaskInfo> {
        self.enqueue(name, payload, opts.with_process_at(at)).await
    }

    /// Enqueue a task whose payload is `value` encoded as JSON.
    pub async fn enqueue_json<T>(
        &self,
        name: &str,
        value: &T,
        opts: TaskOptions,
    ) -> ForgeResult<TaskInfo>
    where
        T: Serialize + ?Sized,
    {
        self.enqueue(name, serde_json::to_vec(value)?, opts).await
    }

    /// Sizes of the pending, scheduled and dead sub-queues of `queue`.
    pub async fn queue_stats(&self, queue: &str) -> ForgeResult<QueueStats> {
        QueueStats::collect(self.queue.as_ref(), queue).await
    }

    async fn persist(&self, task: Task) -> ForgeResult<TaskInfo> {
        if task.is_scheduled(task.created_at) {
            self.queue
                .schedule_json(&scheduled_key(&task.queue), &task, task.process_at)
                .await?;
            debug!(
                "Scheduled task {} ({}) on '{}' for {}",
                task.id, task.name, task.queue, task.process_at
            );
            Ok(task.info(TaskState::Scheduled))
        } else {
            self.queue
                .enqueue_json(&pending_key(&task.queue), &task)
                .await?;
            debug!("Enqueued task {} ({}) on '{}'", task.id, task.name, task.queue);
            Ok(task.info(TaskState::Pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForgeError;
    use crate::queue::{InMemoryQueue, QueueAdapterExt};
    use tokio_test::assert_ok;

    fn client() -> Client {
        Client::new(Arc::new(InMemoryQueue::new()))
    }

    #[tokio::test]
    async fn test_enqueue_goes_to_pending() {
        let client = client();
        let info = client
            .enqueue("email:send", b"hi".to_vec(), TaskOptions::new())
            .await
            .unwrap();

        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(info.queue, "default");
        assert_eq!(info.created_at, info.process_at);

        let stored: Task = client
            .queue()
            .dequeue_json(&pending_key("default"))
            .await
            .unwrap();
        assert_eq!(stored.id, info.id);
        assert_eq!(stored.payload, b"hi".to_vec());
    }

    #[tokio::test]
    async fn test_delay_invariant() {
        let client = client();
        let delay = Duration::from_secs(60);
        let info = client
            .enqueue_in("report", delay, vec![], TaskOptions::new())
            .await
            .unwrap();

        assert_eq!(info.state, TaskState::Scheduled);
        assert_eq!(
            info.process_at,
            info.created_at + chrono::Duration::from_std(delay).unwrap()
        );

        let stats = client.queue_stats("default").await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.scheduled, 1);
    }

    #[tokio::test]
    async fn test_zero_delay_and_past_time_are_immediate() {
        let client = client();

        let info = client
            .enqueue_in("a", Duration::ZERO, vec![], TaskOptions::new())
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Pending);

        let info = client
            .enqueue_at(
                "a",
                Utc::now() - chrono::Duration::minutes(1),
                vec![],
                TaskOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(client.queue_stats("default").await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_method_argument_wins_over_options() {
        let client = client();
        let opts = TaskOptions::new().with_delay(Duration::from_secs(3600));

        let info = client
            .enqueue_in("a", Duration::ZERO, vec![], opts.clone())
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Pending);

        let info = client.enqueue("a", vec![], opts).await.unwrap();
        assert_eq!(info.state, TaskState::Scheduled);
    }

    #[tokio::test]
    async fn test_options_are_applied() {
        let client = client();
        let deadline = Utc::now() + chrono::Duration::minutes(5);
        let info = client
            .enqueue(
                "a",
                vec![],
                TaskOptions::new()
                    .with_queue("critical")
                    .with_max_retry(7)
                    .with_deadline(deadline)
                    .with_task_id("fixed-id"),
            )
            .await
            .unwrap();

        assert_eq!(info.id, "fixed-id");
        assert_eq!(info.queue, "critical");
        assert_eq!(info.max_retry, 7);
        assert_eq!(info.deadline, Some(deadline));
        assert_eq!(client.queue_stats("critical").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let client = client();

        let err = client.enqueue("", vec![], TaskOptions::new()).await.unwrap_err();
        assert!(matches!(err, ForgeError::InvalidArgument { .. }));

        let err = client
            .enqueue("a", vec![], TaskOptions::new().with_queue(""))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        assert_eq!(client.queue_stats("default").await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_storage_errors_are_returned() {
        let client = Client::new(Arc::new(InMemoryQueue::with_config(
            QueueConfig::default().with_max_size(1),
        )));

        assert_ok!(client.enqueue("a", vec![], TaskOptions::new()).await);
        let err = client.enqueue("a", vec![], TaskOptions::new()).await.unwrap_err();
        assert!(matches!(err, ForgeError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn test_enqueue_json_payload() {
        let client = client();
        client
            .enqueue_json("a", &serde_json::json!({"to": "x@y.z"}), TaskOptions::new())
            .await
            .unwrap();

        let task: Task = client
            .queue()
            .dequeue_json(&pending_key("default"))
            .await
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&task.payload).unwrap();
        assert_eq!(payload["to"], "x@y.z");
    }

    #[tokio::test]
    async fn test_from_config() {
        let client = Client::from_config(&QueueConfig::in_memory()).await.unwrap();
        assert_ok!(client.enqueue("a", vec![], TaskOptions::new()).await);
    }
}
