//! Task definition, enqueue options and failure handling.
//!
//! A [`Task`] is the unit of work that travels through the queues. It is
//! created by the [`Client`](crate::client::Client), mutated only by the
//! server's workers (retry bookkeeping) and destroyed on success or when it is
//! moved to the dead-letter queue.

use crate::config::{DEFAULT_QUEUE, RetryPolicy};
use crate::error::{ForgeError, ForgeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = String;

/// Retries allowed when no option says otherwise.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// Ready to be picked up by a worker
    Pending,
    /// Waiting in the scheduled set for its process time
    Scheduled,
    /// A handler is running it
    Processing,
    /// Failed and waiting for its next attempt
    Retrying,
    /// Handler succeeded
    Completed,
    /// Moved to the dead-letter queue
    Dead,
}

impl TaskState {
    /// Lowercase label used in logs and [`TaskInfo`].
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Processing => "processing",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work as stored in the queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Handler key
    pub name: String,
    /// Opaque payload handed to the handler untouched
    pub payload: Vec<u8>,
    /// Logical queue the task belongs to
    pub queue: String,
    /// Maximum number of retries after the first attempt
    pub max_retry: u32,
    /// Retries performed so far
    pub retry_count: u32,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may run
    pub process_at: DateTime<Utc>,
    /// The task is never executed after this instant
    pub deadline: Option<DateTime<Utc>>,
    /// Handler time limit; the server default applies when unset
    pub timeout: Option<Duration>,
    /// Reason of the most recent failure
    pub last_error: Option<String>,
}

/// A task that exhausted its retries or missed its deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterTask {
    /// The task as it was when it failed for the last time
    pub task: Task,
    /// Why it was dead-lettered
    pub reason: String,
    /// When it was dead-lettered
    pub failed_at: DateTime<Utc>,
}

/// What to do with a task whose handler failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Schedule the task again at its new `process_at`
    Retry(Task),
    /// Give up and move the task to the dead-letter queue
    Dead(DeadLetterTask),
}

/// Read-only snapshot of a task returned to producers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    /// Identifier assigned at enqueue
    pub id: TaskId,
    /// Task type, used to pick the handler
    pub name: String,
    /// Logical queue the task was placed on
    pub queue: String,
    /// State at the time of the snapshot
    pub state: TaskState,
    /// Retries allowed after the first attempt
    pub max_retry: u32,
    /// Retries used so far
    pub retry_count: u32,
    /// When the task was enqueued
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may run
    pub process_at: DateTime<Utc>,
    /// Time after which the task is dead-lettered without running
    pub deadline: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a validated task from enqueue options.
    ///
    /// `process_at` is `now` for immediate tasks; a delay or absolute time in
    /// the options moves it forward. Times at or before `now` are immediate.
    pub fn new(
        name: impl Into<String>,
        payload: Vec<u8>,
        opts: &TaskOptions,
        now: DateTime<Utc>,
    ) -> ForgeResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ForgeError::invalid("task name must not be empty"));
        }
        if opts.queue.trim().is_empty() {
            return Err(ForgeError::invalid("queue name must not be empty"));
        }
        let id = match &opts.task_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ForgeError::invalid("task id must not be empty"));
            }
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        if let Some(deadline) = opts.deadline {
            if deadline <= now {
                return Err(ForgeError::invalid(format!(
                    "deadline {} is already in the past",
                    deadline
                )));
            }
        }

        let process_at = match opts.schedule {
            Some(ProcessAt::Delay(delay)) => add_duration(now, delay)?,
            Some(ProcessAt::At(at)) => at,
            None => now,
        }
        .max(now);

        Ok(Self {
            id,
            name,
            payload,
            queue: opts.queue.clone(),
            max_retry: opts.max_retry,
            retry_count: 0,
            created_at: now,
            process_at,
            deadline: opts.deadline,
            timeout: opts.timeout,
            last_error: None,
        })
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Whether the task should wait in the scheduled set.
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        self.process_at > now
    }

    /// Record a handler failure.
    ///
    /// With retries left the task comes back with `retry_count + 1` and a
    /// `process_at` pushed out by the policy's backoff for that attempt.
    /// Otherwise it becomes a [`DeadLetterTask`] carrying `reason`.
    pub fn fail(
        mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> FailureOutcome {
        let mut reason = reason.into();
        if reason.is_empty() {
            reason = "unknown error".to_string();
        }

        if self.can_retry() {
            self.retry_count += 1;
            let delay = policy.backoff(self.retry_count);
            self.process_at = add_duration(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.last_error = Some(reason);
            FailureOutcome::Retry(self)
        } else {
            self.last_error = Some(reason.clone());
            FailureOutcome::Dead(DeadLetterTask {
                task: self,
                reason,
                failed_at: now,
            })
        }
    }

    /// Snapshot for producers.
    pub fn info(&self, state: TaskState) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            queue: self.queue.clone(),
            state,
            max_retry: self.max_retry,
            retry_count: self.retry_count,
            created_at: self.created_at,
            process_at: self.process_at,
            deadline: self.deadline,
        }
    }
}

fn add_duration(at: DateTime<Utc>, delay: Duration) -> ForgeResult<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| ForgeError::invalid(format!("delay {:?} is out of range", delay)))
}

/// When a task should first run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessAt {
    /// Relative to the enqueue time
    Delay(Duration),
    /// Absolute time
    At(DateTime<Utc>),
}

/// Options accepted by the enqueue operations.
///
/// ```rust
/// use std::time::Duration;
/// use taskforge::task::TaskOptions;
///
/// let opts = TaskOptions::new()
///     .with_queue("critical")
///     .with_max_retry(5)
///     .with_timeout(Duration::from_secs(10));
/// assert_eq!(opts.queue, "critical");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub queue: String,
    pub max_retry: u32,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub schedule: Option<ProcessAt>,
    pub task_id: Option<TaskId>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            timeout: None,
            deadline: None,
            schedule: None,
            task_id: None,
        }
    }
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Bound a single handler run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The task is dead-lettered instead of run once this passes.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Run after `delay`. Replaces an earlier `with_process_at`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.schedule = Some(ProcessAt::Delay(delay));
        self
    }

    /// Run at `at`. Replaces an earlier `with_delay`.
    pub fn with_process_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Some(ProcessAt::At(at));
        self
    }

    pub fn with_task_id(mut self, id: impl Into<TaskId>) -> Self {
        self.task_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_new_task_defaults() {
        let at = now();
        let task = assert_ok!(Task::new("email:send", b"hi".to_vec(), &TaskOptions::new(), at));

        assert_eq!(task.queue, "default");
        assert_eq!(task.max_retry, 3);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.created_at, task.process_at);
        assert!(!task.is_scheduled(at));
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_delay_and_process_at() {
        let at = now();
        let delayed = Task::new(
            "a",
            vec![],
            &TaskOptions::new().with_delay(Duration::from_secs(60)),
            at,
        )
        .unwrap();
        assert_eq!(delayed.process_at, at + chrono::Duration::seconds(60));
        assert!(delayed.is_scheduled(at));

        let past = Task::new(
            "a",
            vec![],
            &TaskOptions::new().with_process_at(at - chrono::Duration::seconds(5)),
            at,
        )
        .unwrap();
        assert_eq!(past.process_at, at);
        assert!(!past.is_scheduled(at));

        let opts = TaskOptions::new()
            .with_delay(Duration::from_secs(60))
            .with_process_at(at + chrono::Duration::seconds(5));
        assert_eq!(opts.schedule, Some(ProcessAt::At(at + chrono::Duration::seconds(5))));
    }

    #[test]
    fn test_validation() {
        let at = now();
        assert!(
            Task::new("", vec![], &TaskOptions::new(), at)
                .unwrap_err()
                .is_validation()
        );
        assert_err!(Task::new("a", vec![], &TaskOptions::new().with_queue(""), at));
        assert_err!(Task::new("a", vec![], &TaskOptions::new().with_task_id(" "), at));
        assert_err!(Task::new(
            "a",
            vec![],
            &TaskOptions::new().with_deadline(at - chrono::Duration::seconds(1)),
            at
        ));

        let task = assert_ok!(Task::new(
            "a",
            vec![],
            &TaskOptions::new().with_task_id("order-42"),
            at
        ));
        assert_eq!(task.id, "order-42");
    }

    #[test]
    fn test_retry_is_monotonic() {
        let policy = RetryPolicy::quadratic(1000);
        let at = now();
        let mut task = Task::new("a", vec![], &TaskOptions::new().with_max_retry(3), at).unwrap();

        let mut last_delay = chrono::Duration::zero();
        for attempt in 1..=3 {
            match task.fail("boom", at, &policy) {
                FailureOutcome::Retry(next) => {
                    assert_eq!(next.retry_count, attempt);
                    let delay = next.process_at - at;
                    assert!(delay > last_delay);
                    assert_eq!(delay, chrono::Duration::seconds(i64::from(attempt * attempt)));
                    assert_eq!(next.last_error.as_deref(), Some("boom"));
                    last_delay = delay;
                    task = next;
                }
                FailureOutcome::Dead(_) => panic!("attempt {} should retry", attempt),
            }
        }

        assert!(!task.can_retry());
        assert!(matches!(task.fail("boom", at, &policy), FailureOutcome::Dead(_)));
    }

    #[test]
    fn test_dead_letter_content() {
        let at = now();
        let task = Task::new("a", b"x".to_vec(), &TaskOptions::new().with_max_retry(0), at).unwrap();
        let id = task.id.clone();

        match task.fail("handler exploded", at, &RetryPolicy::default()) {
            FailureOutcome::Dead(dead) => {
                assert_eq!(dead.task.id, id);
                assert_eq!(dead.reason, "handler exploded");
                assert_eq!(dead.failed_at, at);
                assert_eq!(dead.task.retry_count, 0);
            }
            FailureOutcome::Retry(_) => panic!("max_retry = 0 must dead-letter"),
        }
    }

    #[test]
    fn test_empty_reason_is_replaced() {
        let at = now();
        let task = Task::new("a", vec![], &TaskOptions::new().with_max_retry(0), at).unwrap();
        match task.fail("", at, &RetryPolicy::default()) {
            FailureOutcome::Dead(dead) => assert!(!dead.reason.is_empty()),
            FailureOutcome::Retry(_) => unreachable!(),
        }
    }

    #[test]
    fn test_expiry_and_info() {
        let at = now();
        let task = Task::new(
            "a",
            vec![],
            &TaskOptions::new().with_deadline(at + chrono::Duration::seconds(10)),
            at,
        )
        .unwrap();

        assert!(!task.is_expired(at));
        assert!(task.is_expired(at + chrono::Duration::seconds(10)));

        let info = task.info(TaskState::Pending);
        assert_eq!(info.id, task.id);
        assert_eq!(info.state.as_str(), "pending");
        assert_eq!(info.deadline, task.deadline);
    }
}
