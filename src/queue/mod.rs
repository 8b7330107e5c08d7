//! Queue adapters for taskforge.
//!
//! taskforge stores tasks through a [`QueueAdapter`], a small contract over
//! named FIFO queues of serialized items plus time-ordered scheduled sets:
//! - **In-Memory**: fast, lightweight, for development and single-process applications
//! - **Redis**: distributed and persistent, for multi-process setups
//!
//! Every logical queue `Q` is backed by three named sub-queues, see
//! [`pending_key`], [`scheduled_key`] and [`dead_key`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use taskforge::prelude::*;
//!
//! # async fn run() -> ForgeResult<()> {
//! // In-memory queue (default)
//! let queue = InMemoryQueue::new();
//! queue.enqueue_json("default:pending", &"hello").await?;
//!
//! // Redis queue (requires redis-queue feature)
//! # #[cfg(feature = "redis-queue")]
//! let queue = RedisQueue::new(RedisConfig::new("redis://localhost:6379"), QueueConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{QueueBackendConfig, QueueConfig};
use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryQueue;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisQueue;

/// Ready-to-run tasks of `queue`.
pub fn pending_key(queue: &str) -> String {
    format!("{}:pending", queue)
}

/// Delayed tasks and retries of `queue`, ordered by process time.
pub fn scheduled_key(queue: &str) -> String {
    format!("{}:scheduled", queue)
}

/// Dead-letter records of `queue`.
pub fn dead_key(queue: &str) -> String {
    format!("{}:dead", queue)
}

/// Sizes of the sub-queues behind one logical queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks ready to run
    pub pending: u64,
    /// Tasks waiting for their process time
    pub scheduled: u64,
    /// Dead-letter records
    pub dead: u64,
}

impl QueueStats {
    /// Collect the sizes of `queue`'s sub-queues.
    pub async fn collect(adapter: &dyn QueueAdapter, queue: &str) -> ForgeResult<Self> {
        Ok(Self {
            pending: adapter.size(&pending_key(queue)).await?,
            scheduled: adapter.scheduled_size(&scheduled_key(queue)).await?,
            dead: adapter.size(&dead_key(queue)).await?,
        })
    }
}

/// Storage contract every backend implements.
///
/// Items are opaque serialized bytes. Queues are FIFO: items come out in the
/// order they went in. Implementations own their synchronization and must be
/// safe to call from many workers at once.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Append an item to the tail of `queue`.
    async fn enqueue(&self, queue: &str, item: Vec<u8>) -> ForgeResult<()>;

    /// Append several items in order. An empty batch is a no-op.
    async fn enqueue_batch(&self, queue: &str, items: Vec<Vec<u8>>) -> ForgeResult<()>;

    /// Remove the head of `queue`, failing with [`ForgeError::EmptyQueue`] when there is none.
    async fn dequeue(&self, queue: &str) -> ForgeResult<Vec<u8>>;

    /// Like [`dequeue`](Self::dequeue) but waits up to `timeout` for an item,
    /// failing with [`ForgeError::Timeout`].
    async fn dequeue_with_timeout(&self, queue: &str, timeout: Duration) -> ForgeResult<Vec<u8>>;

    /// Number of items in `queue`.
    async fn size(&self, queue: &str) -> ForgeResult<u64>;

    async fn is_empty(&self, queue: &str) -> ForgeResult<bool> {
        Ok(self.size(queue).await? == 0)
    }

    /// Remove every item stored under `queue`, ready or scheduled.
    async fn clear(&self, queue: &str) -> ForgeResult<()>;

    /// Insert an item into the scheduled set `queue`, due at `process_at`.
    async fn schedule(&self, queue: &str, item: Vec<u8>, process_at: DateTime<Utc>)
    -> ForgeResult<()>;

    /// Append an item to `queue` ignoring the configured capacity.
    ///
    /// Used for dead-letter records, which must not be lost to a full queue.
    async fn enqueue_uncapped(&self, queue: &str, item: Vec<u8>) -> ForgeResult<()>;

    /// Insert into the scheduled set ignoring the configured capacity.
    ///
    /// Used for retries of tasks that were already admitted once.
    async fn schedule_uncapped(
        &self,
        queue: &str,
        item: Vec<u8>,
        process_at: DateTime<Utc>,
    ) -> ForgeResult<()>;

    /// Atomically move up to `limit` items due at `now` from the scheduled set
    /// to the tail of `pending`, earliest first. Returns how many moved.
    async fn promote_due(
        &self,
        scheduled: &str,
        pending: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ForgeResult<usize>;

    /// Number of items in the scheduled set `queue`.
    async fn scheduled_size(&self, queue: &str) -> ForgeResult<u64>;

    /// Health check for the backend
    async fn health_check(&self) -> ForgeResult<()> {
        Ok(())
    }
}

/// Typed helpers over any [`QueueAdapter`], using JSON as the wire format.
#[async_trait]
pub trait QueueAdapterExt: QueueAdapter {
    async fn enqueue_json<T>(&self, queue: &str, value: &T) -> ForgeResult<()>
    where
        T: Serialize + Sync,
    {
        self.enqueue(queue, serde_json::to_vec(value)?).await
    }

    async fn enqueue_batch_json<T>(&self, queue: &str, values: &[T]) -> ForgeResult<()>
    where
        T: Serialize + Sync,
    {
        let items = values
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;
        self.enqueue_batch(queue, items).await
    }

    async fn dequeue_json<T>(&self, queue: &str) -> ForgeResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let item = self.dequeue(queue).await?;
        Ok(serde_json::from_slice(&item)?)
    }

    async fn dequeue_json_with_timeout<T>(&self, queue: &str, timeout: Duration) -> ForgeResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let item = self.dequeue_with_timeout(queue, timeout).await?;
        Ok(serde_json::from_slice(&item)?)
    }

    async fn schedule_json<T>(
        &self,
        queue: &str,
        value: &T,
        process_at: DateTime<Utc>,
    ) -> ForgeResult<()>
    where
        T: Serialize + Sync,
    {
        self.schedule(queue, serde_json::to_vec(value)?, process_at).await
    }
}

impl<A: QueueAdapter + ?Sized> QueueAdapterExt for A {}

/// Shared handle to a queue adapter
pub type TaskQueue = Arc<dyn QueueAdapter>;

/// Factory methods for creating queue adapters
pub struct QueueFactory;

impl QueueFactory {
    /// Create an in-memory queue
    pub fn in_memory(config: QueueConfig) -> TaskQueue {
        Arc::new(InMemoryQueue::with_config(config))
    }

    /// Create a Redis queue
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub async fn redis(
        redis_config: crate::config::RedisConfig,
        config: QueueConfig,
    ) -> ForgeResult<TaskQueue> {
        let queue = RedisQueue::new(redis_config, config).await?;
        Ok(Arc::new(queue))
    }

    /// Create the backend selected by `config.backend`.
    pub async fn from_config(config: &QueueConfig) -> ForgeResult<TaskQueue> {
        match &config.backend {
            QueueBackendConfig::InMemory => Ok(Self::in_memory(config.clone())),
            #[cfg(feature = "redis-queue")]
            QueueBackendConfig::Redis(redis_config) => {
                Self::redis(redis_config.clone(), config.clone()).await
            }
        }
    }
}

pub(crate) fn unlimited_or(capacity: usize) -> Option<usize> {
    (capacity > 0).then_some(capacity)
}

pub(crate) fn full(queue: &str, capacity: usize) -> ForgeError {
    ForgeError::QueueFull {
        queue: queue.to_string(),
        capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio_test::assert_ok;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
    }

    #[test]
    fn test_sub_queue_names() {
        assert_eq!(pending_key("emails"), "emails:pending");
        assert_eq!(scheduled_key("emails"), "emails:scheduled");
        assert_eq!(dead_key("emails"), "emails:dead");
    }

    #[tokio::test]
    async fn test_json_helpers_through_trait_object() {
        let queue: TaskQueue = QueueFactory::in_memory(QueueConfig::default());

        assert_ok!(queue.enqueue_json("jobs", &Job { id: 1 }).await);
        assert_ok!(
            queue
                .enqueue_batch_json("jobs", &[Job { id: 2 }, Job { id: 3 }])
                .await
        );

        let first: Job = queue.dequeue_json("jobs").await.unwrap();
        let second: Job = queue
            .dequeue_json_with_timeout("jobs", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first, Job { id: 1 });
        assert_eq!(second, Job { id: 2 });
        assert_eq!(queue.size("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_item_is_serialization_error() {
        let queue = InMemoryQueue::new();
        queue.enqueue("jobs", b"not json".to_vec()).await.unwrap();

        let err = queue.dequeue_json::<Job>("jobs").await.unwrap_err();
        assert!(matches!(err, ForgeError::SerializationError(_)));
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let queue = InMemoryQueue::new();
        queue.enqueue(&pending_key("q"), vec![1]).await.unwrap();
        queue
            .schedule(&scheduled_key("q"), vec![2], Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let stats = QueueStats::collect(&queue, "q").await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                scheduled: 1,
                dead: 0
            }
        );
    }

    #[tokio::test]
    async fn test_queue_factory() {
        let queue = QueueFactory::from_config(&QueueConfig::in_memory()).await.unwrap();
        assert!(queue.health_check().await.is_ok());
        assert!(queue.is_empty("anything").await.unwrap());
    }
}
