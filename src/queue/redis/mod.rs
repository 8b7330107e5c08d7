//! Redis queue implementation for taskforge.
//!
//! This adapter uses Redis as the storage layer, providing distributed
//! queue capabilities suitable for multi-process and multi-server deployments.
//!
//! # Layout
//!
//! - ready queues are lists (`RPUSH` / `LPOP`)
//! - scheduled sets are sorted sets scored by epoch milliseconds
//! - every key is prefixed with [`RedisConfig::key_prefix`]
//!
//! # Features
//!
//! - **Distributed**: Multiple processes can share the same queues
//! - **Persistent**: Tasks survive process restarts
//! - **Atomic operations**: Batches, capacity checks and promotion run as Lua scripts

use super::{QueueAdapter, QueueConfig, full, unlimited_or};
use crate::config::RedisConfig;
use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};

use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, info};

/// Redis queue adapter
pub struct RedisQueue {
    /// Redis connection manager
    conn: ConnectionManager,
    /// Redis configuration
    config: RedisConfig,
    /// Per named queue; `None` means unlimited
    capacity: Option<usize>,
    /// Pre-compiled Lua scripts for atomic operations
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("config", &self.config)
            .field("capacity", &self.capacity)
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

/// Pre-compiled Lua scripts for atomic Redis operations
#[derive(Debug)]
struct RedisScripts {
    /// Capacity-checked RPUSH of one or more items
    push: Script,
    /// Capacity-checked ZADD with a tie-breaking sequence prefix
    schedule: Script,
    /// Move due members from a sorted set to the tail of a list
    promote: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            push: Script::new(
                r#"
                local key = KEYS[1]
                local capacity = tonumber(ARGV[1])
                local count = #ARGV - 1

                if capacity > 0 and redis.call('LLEN', key) + count > capacity then
                    return -1
                end

                for i = 2, #ARGV do
                    redis.call('RPUSH', key, ARGV[i])
                end

                return count
            "#,
            ),
            schedule: Script::new(
                r#"
                local key = KEYS[1]
                local seq_key = KEYS[2]
                local capacity = tonumber(ARGV[1])
                local score = tonumber(ARGV[2])

                if capacity > 0 and redis.call('ZCARD', key) >= capacity then
                    return -1
                end

                local seq = redis.call('INCR', seq_key)
                redis.call('ZADD', key, score, string.format('%020d', seq) .. ':' .. ARGV[3])
                return 1
            "#,
            ),
            promote: Script::new(
                r#"
                local scheduled_key = KEYS[1]
                local pending_key = KEYS[2]
                local now = tonumber(ARGV[1])
                local limit = tonumber(ARGV[2])

                local due = redis.call('ZRANGEBYSCORE', scheduled_key, '-inf', now, 'LIMIT', 0, limit)

                for i = 1, #due do
                    local member = due[i]
                    redis.call('ZREM', scheduled_key, member)
                    local sep = string.find(member, ':', 1, true)
                    redis.call('RPUSH', pending_key, string.sub(member, sep + 1))
                end

                return #due
            "#,
            ),
        }
    }
}

fn storage_error(action: &'static str) -> impl FnOnce(redis::RedisError) -> ForgeError {
    move |e| ForgeError::queue(format!("Failed to {}: {}", action, e), e)
}

impl RedisQueue {
    /// Connect to Redis and create the adapter
    pub async fn new(redis_config: RedisConfig, queue_config: QueueConfig) -> ForgeResult<Self> {
        let client = Client::open(redis_config.connection_string.as_str())?;

        debug!(
            "🔧 Configuring Redis queue with prefix: {}",
            redis_config.key_prefix
        );

        let conn = timeout(
            Duration::from_secs(redis_config.connect_timeout_secs),
            client.get_connection_manager(),
        )
        .await
        .map_err(|e| ForgeError::queue("Timed out connecting to Redis", e))?
        .map_err(storage_error("create Redis connection manager"))?;

        info!("✅ Connected to Redis");

        Ok(Self {
            conn,
            config: redis_config,
            capacity: unlimited_or(queue_config.max_queue_size),
            scripts: RedisScripts::new(),
        })
    }

    /// Create the adapter from a queue configuration selecting the Redis backend
    pub async fn from_config(queue_config: QueueConfig) -> ForgeResult<Self> {
        let redis_config = match &queue_config.backend {
            crate::config::QueueBackendConfig::Redis(config) => config.clone(),
            _ => {
                return Err(ForgeError::config(
                    "Redis configuration not found in queue config",
                ));
            }
        };
        Self::new(redis_config, queue_config).await
    }

    /// Full Redis key for a named queue
    fn key(&self, queue: &str) -> String {
        format!("{}:{}", self.config.key_prefix, queue)
    }

    /// Sequence counter used to order scheduled items with equal scores
    fn seq_key(&self, queue: &str) -> String {
        format!("{}:{}:seq", self.config.key_prefix, queue)
    }

    /// Push `items` onto `queue`; a `capacity` of `None` skips the size check.
    async fn push(
        &self,
        queue: &str,
        items: &[Vec<u8>],
        capacity: Option<usize>,
    ) -> ForgeResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.push.prepare_invoke();
        invocation.key(self.key(queue)).arg(capacity.unwrap_or(0));
        for item in items {
            invocation.arg(item.as_slice());
        }

        let pushed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(storage_error("enqueue items"))?;

        match (pushed, capacity) {
            (-1, Some(capacity)) => Err(full(queue, capacity)),
            _ => Ok(()),
        }
    }

    async fn insert_scheduled(
        &self,
        queue: &str,
        item: &[u8],
        process_at: DateTime<Utc>,
        capacity: Option<usize>,
    ) -> ForgeResult<()> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .scripts
            .schedule
            .key(self.key(queue))
            .key(self.seq_key(queue))
            .arg(capacity.unwrap_or(0))
            .arg(process_at.timestamp_millis())
            .arg(item)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_error("schedule item"))?;

        match (added, capacity) {
            (-1, Some(capacity)) => Err(full(queue, capacity)),
            _ => Ok(()),
        }
    }

    async fn pop(&self, queue: &str) -> ForgeResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.lpop(self.key(queue), None::<NonZeroUsize>)
            .await
            .map_err(storage_error("dequeue item"))
    }
}

#[async_trait]
impl QueueAdapter for RedisQueue {
    async fn enqueue(&self, queue: &str, item: Vec<u8>) -> ForgeResult<()> {
        self.push(queue, std::slice::from_ref(&item), self.capacity)
            .await
    }

    async fn enqueue_batch(&self, queue: &str, items: Vec<Vec<u8>>) -> ForgeResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.push(queue, &items, self.capacity).await
    }

    async fn dequeue(&self, queue: &str) -> ForgeResult<Vec<u8>> {
        self.pop(queue)
            .await?
            .ok_or_else(|| ForgeError::empty(queue))
    }

    async fn dequeue_with_timeout(&self, queue: &str, wait: Duration) -> ForgeResult<Vec<u8>> {
        // Polls instead of BLPOP so the shared multiplexed connection never blocks.
        let deadline = Instant::now() + wait;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if let Some(item) = self.pop(queue).await? {
                return Ok(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ForgeError::Timeout {
                    queue: queue.to_string(),
                    timeout: wait,
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn size(&self, queue: &str) -> ForgeResult<u64> {
        let mut conn = self.conn.clone();
        conn.llen(self.key(queue))
            .await
            .map_err(storage_error("get queue length"))
    }

    async fn clear(&self, queue: &str) -> ForgeResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(self.key(queue))
            .del(self.seq_key(queue))
            .query_async::<()>(&mut conn)
            .await
            .map_err(storage_error("clear queue"))?;

        debug!("Cleared queue '{}'", queue);
        Ok(())
    }

    async fn schedule(
        &self,
        queue: &str,
        item: Vec<u8>,
        process_at: DateTime<Utc>,
    ) -> ForgeResult<()> {
        self.insert_scheduled(queue, &item, process_at, self.capacity)
            .await
    }

    async fn enqueue_uncapped(&self, queue: &str, item: Vec<u8>) -> ForgeResult<()> {
        self.push(queue, std::slice::from_ref(&item), None).await
    }

    async fn schedule_uncapped(
        &self,
        queue: &str,
        item: Vec<u8>,
        process_at: DateTime<Utc>,
    ) -> ForgeResult<()> {
        self.insert_scheduled(queue, &item, process_at, None).await
    }

    async fn promote_due(
        &self,
        scheduled: &str,
        pending: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ForgeResult<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let moved: usize = self
            .scripts
            .promote
            .key(self.key(scheduled))
            .key(self.key(pending))
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_error("promote scheduled items"))?;

        if moved > 0 {
            debug!("Moved {} scheduled items to '{}'", moved, pending);
        }
        Ok(moved)
    }

    async fn scheduled_size(&self, queue: &str) -> ForgeResult<u64> {
        let mut conn = self.conn.clone();
        conn.zcard(self.key(queue))
            .await
            .map_err(storage_error("get scheduled set size"))
    }

    async fn health_check(&self) -> ForgeResult<()> {
        let mut conn = self.conn.clone();

        // Simple ping to check Redis connectivity
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(storage_error("ping Redis"))?;

        if pong != "PONG" {
            return Err(ForgeError::QueueError {
                message: "Redis health check failed: unexpected response".to_string(),
                source: None,
            });
        }

        debug!("Redis queue health check passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{pending_key, scheduled_key};

    // These tests require a running Redis instance:
    // cargo test --features redis-queue -- --ignored

    async fn connect(prefix: &str) -> RedisQueue {
        let redis_config = RedisConfig::new("redis://localhost:6379").with_key_prefix(prefix);
        RedisQueue::new(redis_config, QueueConfig::default())
            .await
            .expect("Failed to create Redis queue")
    }

    #[tokio::test]
    #[ignore] // Ignore by default since it requires Redis
    async fn test_redis_fifo() {
        let queue = connect("taskforge-test-fifo").await;
        queue.clear("q").await.unwrap();

        queue.enqueue("q", b"one".to_vec()).await.unwrap();
        queue
            .enqueue_batch("q", vec![b"two".to_vec(), b"three".to_vec()])
            .await
            .unwrap();

        assert_eq!(queue.size("q").await.unwrap(), 3);
        assert_eq!(queue.dequeue("q").await.unwrap(), b"one".to_vec());
        assert_eq!(queue.dequeue("q").await.unwrap(), b"two".to_vec());
        assert_eq!(queue.dequeue("q").await.unwrap(), b"three".to_vec());
        assert!(queue.dequeue("q").await.unwrap_err().is_empty_queue());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_dequeue_timeout() {
        let queue = connect("taskforge-test-timeout").await;
        queue.clear("q").await.unwrap();

        let err = queue
            .dequeue_with_timeout("q", Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_promote_due() {
        let queue = connect("taskforge-test-promote").await;
        let scheduled = scheduled_key("q");
        let pending = pending_key("q");
        queue.clear(&scheduled).await.unwrap();
        queue.clear(&pending).await.unwrap();

        let now = Utc::now();
        let past = now - chrono::Duration::seconds(1);
        queue.schedule(&scheduled, b"a".to_vec(), past).await.unwrap();
        queue.schedule(&scheduled, b"a".to_vec(), past).await.unwrap();
        queue
            .schedule(&scheduled, b"later".to_vec(), now + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(queue.scheduled_size(&scheduled).await.unwrap(), 3);
        assert_eq!(queue.promote_due(&scheduled, &pending, now, 10).await.unwrap(), 2);
        assert_eq!(queue.dequeue(&pending).await.unwrap(), b"a".to_vec());
        assert_eq!(queue.dequeue(&pending).await.unwrap(), b"a".to_vec());
        assert_eq!(queue.scheduled_size(&scheduled).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_uncapped_writes() {
        let redis_config =
            RedisConfig::new("redis://localhost:6379").with_key_prefix("taskforge-test-uncapped");
        let queue = RedisQueue::new(redis_config, QueueConfig::default().with_max_size(1))
            .await
            .expect("Failed to create Redis queue");
        queue.clear("q").await.unwrap();
        queue.clear("s").await.unwrap();
        let at = Utc::now();

        queue.enqueue("q", b"one".to_vec()).await.unwrap();
        assert!(matches!(
            queue.enqueue("q", b"two".to_vec()).await,
            Err(ForgeError::QueueFull { .. })
        ));
        queue.enqueue_uncapped("q", b"two".to_vec()).await.unwrap();
        assert_eq!(queue.size("q").await.unwrap(), 2);

        queue.schedule("s", b"one".to_vec(), at).await.unwrap();
        assert!(queue.schedule("s", b"two".to_vec(), at).await.is_err());
        queue.schedule_uncapped("s", b"two".to_vec(), at).await.unwrap();
        assert_eq!(queue.scheduled_size("s").await.unwrap(), 2);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_health_check() {
        let queue = connect("taskforge-test-health").await;
        assert!(queue.health_check().await.is_ok());
    }
}
