//! In-memory queue implementation for taskforge.
//!
//! This adapter keeps every named queue in process memory. It is meant for
//! development, testing and single-process applications where persistence
//! across restarts is not required.
//!
//! # Features
//!
//! - **FIFO**: ready queues are `VecDeque`s, scheduled sets are ordered by due time
//! - **Thread-safe**: one async mutex guards all state, so batches and promotion are atomic
//! - **Blocking dequeue**: waiters are woken as soon as an item arrives
//! - **Zero dependencies**: no external services required

use super::{QueueAdapter, full, unlimited_or};
use crate::config::QueueConfig;
use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Scheduled entries are keyed by due time, then insertion order.
type ScheduledSet = BTreeMap<(i64, u64), Vec<u8>>;

#[derive(Debug, Default)]
struct State {
    ready: HashMap<String, VecDeque<Vec<u8>>>,
    scheduled: HashMap<String, ScheduledSet>,
    seq: u64,
}

/// In-memory queue adapter
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    /// Woken on every insert into a ready queue
    arrivals: Notify,
    /// Per named queue; `None` means unlimited
    capacity: Option<usize>,
}

impl InMemoryQueue {
    /// Create a new in-memory queue with default configuration
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create a new in-memory queue with custom configuration
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            capacity: unlimited_or(config.max_queue_size),
        }
    }

    fn check_capacity(&self, queue: &str, current: usize, adding: usize) -> ForgeResult<()> {
        match self.capacity {
            Some(capacity) if current + adding > capacity => Err(full(queue, capacity)),
            _ => Ok(()),
        }
    }

    async fn push(&self, queue: &str, items: Vec<Vec<u8>>, capped: bool) -> ForgeResult<()> {
        {
            let mut state = self.state.lock().await;
            let ready = state.ready.entry(queue.to_string()).or_default();
            if capped {
                self.check_capacity(queue, ready.len(), items.len())?;
            }
            ready.extend(items);
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn insert_scheduled(
        &self,
        queue: &str,
        item: Vec<u8>,
        process_at: DateTime<Utc>,
        capped: bool,
    ) -> ForgeResult<()> {
        let mut state = self.state.lock().await;
        state.seq += 1;
        let seq = state.seq;
        let set = state.scheduled.entry(queue.to_string()).or_default();
        if capped {
            self.check_capacity(queue, set.len(), 1)?;
        }
        set.insert((process_at.timestamp_millis(), seq), item);
        Ok(())
    }

    async fn try_pop(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().await;
        state.ready.get_mut(queue).and_then(VecDeque::pop_front)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueue {
    async fn enqueue(&self, queue: &str, item: Vec<u8>) -> ForgeResult<()> {
        self.push(queue, vec![item], true).await
    }

    async fn enqueue_batch(&self, queue: &str, items: Vec<Vec<u8>>) -> ForgeResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.push(queue, items, true).await
    }

    async fn dequeue(&self, queue: &str) -> ForgeResult<Vec<u8>> {
        self.try_pop(queue)
            .await
            .ok_or_else(|| ForgeError::empty(queue))
    }

    async fn dequeue_with_timeout(&self, queue: &str, timeout: Duration) -> ForgeResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so an insert in between is not missed.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(queue).await {
                return Ok(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ForgeError::Timeout {
                    queue: queue.to_string(),
                    timeout,
                });
            }
        }
    }

    async fn size(&self, queue: &str) -> ForgeResult<u64> {
        let state = self.state.lock().await;
        Ok(state.ready.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn clear(&self, queue: &str) -> ForgeResult<()> {
        let mut state = self.state.lock().await;
        let removed = state.ready.remove(queue).map_or(0, |q| q.len())
            + state.scheduled.remove(queue).map_or(0, |s| s.len());
        tracing::debug!("Cleared {} items from queue '{}'", removed, queue);
        Ok(())
    }

    async fn schedule(
        &self,
        queue: &str,
        item: Vec<u8>,
        process_at: DateTime<Utc>,
    ) -> ForgeResult<()> {
        self.insert_scheduled(queue, item, process_at, true).await
    }

    async fn enqueue_uncapped(&self, queue: &str, item: Vec<u8>) -> ForgeResult<()> {
        self.push(queue, vec![item], false).await
    }

    async fn schedule_uncapped(
        &self,
        queue: &str,
        item: Vec<u8>,
        process_at: DateTime<Utc>,
    ) -> ForgeResult<()> {
        self.insert_scheduled(queue, item, process_at, false).await
    }

    async fn promote_due(
        &self,
        scheduled: &str,
        pending: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ForgeResult<usize> {
        let now_ms = now.timestamp_millis();
        let moved = {
            let mut state = self.state.lock().await;
            let due: Vec<Vec<u8>> = match state.scheduled.get_mut(scheduled) {
                Some(set) => {
                    let mut due = Vec::new();
                    while due.len() < limit {
                        match set.first_key_value() {
                            Some((&(at, _), _)) if at <= now_ms => {
                                if let Some((_, item)) = set.pop_first() {
                                    due.push(item);
                                }
                            }
                            _ => break,
                        }
                    }
                    due
                }
                None => return Ok(0),
            };
            let moved = due.len();
            if moved > 0 {
                state
                    .ready
                    .entry(pending.to_string())
                    .or_default()
                    .extend(due);
            }
            moved
        };

        if moved > 0 {
            self.arrivals.notify_waiters();
        }
        Ok(moved)
    }

    async fn scheduled_size(&self, queue: &str) -> ForgeResult<u64> {
        let state = self.state.lock().await;
        Ok(state.scheduled.get(queue).map_or(0, |s| s.len() as u64))
    }

    async fn health_check(&self) -> ForgeResult<()> {
        let state = self.state.lock().await;
        tracing::debug!(
            "Queue health check: {} ready queues, {} scheduled sets",
            state.ready.len(),
            state.scheduled.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryQueue::new();
        for i in 0..5u8 {
            queue.enqueue("q", vec![i]).await.unwrap();
        }

        for i in 0..5u8 {
            assert_eq!(queue.dequeue("q").await.unwrap(), vec![i]);
        }
        assert!(queue.dequeue("q").await.unwrap_err().is_empty_queue());
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let queue = InMemoryQueue::new();
        queue.enqueue("a", vec![1]).await.unwrap();

        assert!(queue.dequeue("b").await.unwrap_err().is_empty_queue());
        assert_eq!(queue.size("a").await.unwrap(), 1);
        assert_eq!(queue.size("b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch() {
        let queue = InMemoryQueue::new();
        assert_ok!(queue.enqueue_batch("q", vec![]).await);
        assert!(queue.is_empty("q").await.unwrap());

        queue.enqueue("q", vec![0]).await.unwrap();
        queue
            .enqueue_batch("q", vec![vec![1], vec![2]])
            .await
            .unwrap();

        assert_eq!(queue.dequeue("q").await.unwrap(), vec![0]);
        assert_eq!(queue.dequeue("q").await.unwrap(), vec![1]);
        assert_eq!(queue.dequeue("q").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_dequeue_with_timeout_expires() {
        let queue = InMemoryQueue::new();
        let started = Instant::now();

        let err = queue
            .dequeue_with_timeout("q", Duration::from_millis(30))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_dequeue_with_timeout_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .dequeue_with_timeout("q", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("q", b"wake".to_vec()).await.unwrap();

        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item, b"wake".to_vec());
    }

    #[tokio::test]
    async fn test_promote_due_moves_only_due_items_in_order() {
        let queue = InMemoryQueue::new();
        let now = Utc::now();

        queue
            .schedule("s", vec![2], now - chrono::Duration::seconds(1))
            .await
            .unwrap();
        queue
            .schedule("s", vec![1], now - chrono::Duration::seconds(5))
            .await
            .unwrap();
        queue
            .schedule("s", vec![3], now + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(queue.promote_due("s", "p", now, 100).await.unwrap(), 2);
        assert_eq!(queue.scheduled_size("s").await.unwrap(), 1);
        assert_eq!(queue.dequeue("p").await.unwrap(), vec![1]);
        assert_eq!(queue.dequeue("p").await.unwrap(), vec![2]);
        assert!(queue.dequeue("p").await.is_err());
    }

    #[tokio::test]
    async fn test_promote_due_respects_limit_and_ties() {
        let queue = InMemoryQueue::new();
        let at = Utc::now() - chrono::Duration::seconds(1);
        for i in 0..5u8 {
            queue.schedule("s", vec![i], at).await.unwrap();
        }

        assert_eq!(queue.promote_due("s", "p", Utc::now(), 3).await.unwrap(), 3);
        assert_eq!(queue.promote_due("s", "p", Utc::now(), 3).await.unwrap(), 2);
        assert_eq!(queue.promote_due("s", "p", Utc::now(), 3).await.unwrap(), 0);

        for i in 0..5u8 {
            assert_eq!(queue.dequeue("p").await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_queue_size_limit() {
        let config = QueueConfig {
            max_queue_size: 2,
            ..Default::default()
        };
        let queue = InMemoryQueue::with_config(config);

        queue.enqueue("q", vec![1]).await.unwrap();
        queue.enqueue("q", vec![2]).await.unwrap();

        let err = queue.enqueue("q", vec![3]).await.unwrap_err();
        assert!(matches!(err, ForgeError::QueueFull { capacity: 2, .. }));
        assert_err!(queue.enqueue_batch("other", vec![vec![1], vec![2], vec![3]]).await);
        assert_eq!(queue.size("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_uncapped_writes_ignore_size_limit() {
        let queue = InMemoryQueue::with_config(QueueConfig::default().with_max_size(1));
        let at = Utc::now();

        queue.enqueue("q", vec![1]).await.unwrap();
        assert_err!(queue.enqueue("q", vec![2]).await);
        assert_ok!(queue.enqueue_uncapped("q", vec![2]).await);
        assert_eq!(queue.size("q").await.unwrap(), 2);

        queue.schedule("s", vec![1], at).await.unwrap();
        assert_err!(queue.schedule("s", vec![2], at).await);
        assert_ok!(queue.schedule_uncapped("s", vec![2], at).await);
        assert_eq!(queue.scheduled_size("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let queue = InMemoryQueue::new();
        queue.enqueue("q", vec![1]).await.unwrap();
        queue.schedule("q", vec![2], Utc::now()).await.unwrap();
        queue.enqueue("keep", vec![3]).await.unwrap();

        queue.clear("q").await.unwrap();

        assert_eq!(queue.size("q").await.unwrap(), 0);
        assert_eq!(queue.scheduled_size("q").await.unwrap(), 0);
        assert_eq!(queue.size("keep").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_see_each_item_once() {
        let queue = Arc::new(InMemoryQueue::new());
        let items: Vec<Vec<u8>> = (0..200u16).map(|i| i.to_be_bytes().to_vec()).collect();
        queue.enqueue_batch("q", items).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Ok(item) = queue.dequeue("q").await {
                    got.push(item);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
