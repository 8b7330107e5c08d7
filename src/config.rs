//! Configuration types for taskforge.
//!
//! This module contains all configuration structures used throughout taskforge,
//! including server settings, queue backend configuration, retry policy and logging.

use crate::error::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Name of the queue tasks land in when no queue is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Main configuration for taskforge.
///
/// # Examples
///
/// ```rust
/// use taskforge::config::{ForgeConfig, ServerConfig};
///
/// // Use default configuration
/// let config = ForgeConfig::default();
///
/// // Custom configuration
/// let config = ForgeConfig {
///     server: ServerConfig::with_concurrency(8)
///         .with_queue("critical", 6)
///         .with_strict_priority(true),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Worker pool and scheduler configuration
    pub server: ServerConfig,

    /// Queue backend configuration
    pub queue: QueueConfig,

    /// Retry policy for failed tasks
    pub retry: RetryPolicy,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// A logical queue and its weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePriority {
    /// Logical queue name
    pub name: String,
    /// Higher is polled first (strict) or more often (weighted)
    pub priority: u32,
}

impl QueuePriority {
    /// Create a queue entry.
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Server configuration: worker pool, scheduler loop and shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Number of concurrent workers
    pub concurrency: usize,

    /// Logical queues served by this server
    pub queues: Vec<QueuePriority>,

    /// Always drain higher priority queues first
    pub strict_priority: bool,

    /// Scheduler tick (in milliseconds)
    pub scheduler_interval_ms: u64,

    /// Maximum number of due tasks promoted per queue in one scheduler call
    pub scheduler_batch_size: usize,

    /// How long an idle worker waits before polling again (in milliseconds)
    pub poll_interval_ms: u64,

    /// Time to wait for workers to finish on stop (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Handler timeout for tasks that carry none (in seconds)
    pub default_task_timeout_secs: u64,

    /// Health monitor log interval (in seconds)
    pub health_check_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            queues: vec![QueuePriority::new(DEFAULT_QUEUE, 1)],
            strict_priority: false,
            scheduler_interval_ms: 1000,
            scheduler_batch_size: 100,
            poll_interval_ms: 100,
            shutdown_timeout_secs: 30,
            default_task_timeout_secs: 30 * 60,
            health_check_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Create a server configuration with a specific number of workers.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Add a queue, or change the priority of one already listed.
    pub fn with_queue(mut self, name: impl Into<String>, priority: u32) -> Self {
        let name = name.into();
        match self.queues.iter_mut().find(|q| q.name == name) {
            Some(existing) => existing.priority = priority,
            None => self.queues.push(QueuePriority::new(name, priority)),
        }
        self
    }

    /// Replace the queue list.
    pub fn with_queues(mut self, queues: Vec<QueuePriority>) -> Self {
        self.queues = queues;
        self
    }

    /// Enable or disable strict priority.
    pub fn with_strict_priority(mut self, strict: bool) -> Self {
        self.strict_priority = strict;
        self
    }

    /// Set the scheduler tick.
    pub fn with_scheduler_interval(mut self, interval_ms: u64) -> Self {
        self.scheduler_interval_ms = interval_ms;
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Set the default handler timeout.
    pub fn with_default_task_timeout(mut self, timeout_secs: u64) -> Self {
        self.default_task_timeout_secs = timeout_secs;
        self
    }

    /// Queue names, highest priority first. Ties keep configuration order.
    pub fn queues_by_priority(&self) -> Vec<String> {
        let mut queues = self.queues.clone();
        queues.sort_by(|a, b| b.priority.cmp(&a.priority));
        queues.into_iter().map(|q| q.name).collect()
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Queue backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of items per named queue (0 = unlimited)
    pub max_queue_size: usize,

    /// Queue-specific backend configuration
    pub backend: QueueBackendConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 0, // unlimited
            backend: QueueBackendConfig::InMemory,
        }
    }
}

impl QueueConfig {
    /// Create configuration for in-memory queue.
    pub fn in_memory() -> Self {
        Self {
            backend: QueueBackendConfig::InMemory,
            ..Default::default()
        }
    }

    /// Create configuration for Redis queue.
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub fn redis(connection_string: impl Into<String>) -> Self {
        Self {
            backend: QueueBackendConfig::Redis(RedisConfig::new(connection_string)),
            ..Default::default()
        }
    }

    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }
}

/// Queue backend-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueBackendConfig {
    /// In-memory queue (default)
    InMemory,

    /// Redis queue configuration
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    Redis(RedisConfig),
}

/// Redis queue configuration.
#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// Time allowed for the initial connection (in seconds)
    pub connect_timeout_secs: u64,

    /// Poll interval used by blocking dequeues (in milliseconds)
    pub poll_interval_ms: u64,
}

#[cfg(feature = "redis-queue")]
impl RedisConfig {
    /// Configuration with default prefix and timeouts.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            key_prefix: "taskforge".to_string(),
            connect_timeout_secs: 10,
            poll_interval_ms: 50,
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Unit delay the backoff strategy is applied to (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,     // 1 second
            max_delay_ms: 3_600_000, // 1 hour
            backoff_strategy: BackoffStrategy::Quadratic,
        }
    }
}

impl RetryPolicy {
    /// Quadratic backoff over the given unit: 1, 4, 9, ... units.
    pub fn quadratic(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            backoff_strategy: BackoffStrategy::Quadratic,
            ..Default::default()
        }
    }

    /// Create a retry policy with exponential backoff.
    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Create a retry policy with linear backoff.
    pub fn linear(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            backoff_strategy: BackoffStrategy::Linear { increment_ms: 1000 },
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before the `retry_count`-th retry (1-based).
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let n = u64::from(retry_count.max(1));
        let base = self.base_delay_ms;
        let delay_ms = match &self.backoff_strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear { increment_ms } => {
                base.saturating_add(increment_ms.saturating_mul(n - 1))
            }
            BackoffStrategy::Quadratic => base.saturating_mul(n.saturating_mul(n)),
            BackoffStrategy::Exponential { multiplier } => {
                let factor = multiplier.powi((n - 1).min(i32::MAX as u64) as i32);
                let ms = base as f64 * factor;
                if ms.is_finite() && ms < u64::MAX as f64 {
                    ms as u64
                } else {
                    u64::MAX
                }
            }
        };
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + (attempt - 1) * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Quadratic backoff (base * attempt²)
    Quadratic,

    /// Exponential backoff (base * multiplier^(attempt - 1))
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, overridden by `RUST_LOG` when set
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber for this configuration.
    ///
    /// Fails if a global subscriber is already installed.
    pub fn init(&self) -> ForgeResult<()> {
        let level: tracing::Level = self.level.clone().into();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.include_targets);

        let result = if self.json_format {
            builder.json().try_init()
        } else {
            builder.with_ansi(self.colored).try_init()
        };

        result.map_err(|e| ForgeError::config(format!("Failed to install logger: {}", e)))
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl ForgeConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                concurrency: 2,
                health_check_interval_secs: 10,
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 1000,
                ..Default::default()
            },
            retry: RetryPolicy::default(),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            server: ServerConfig {
                concurrency: num_cpus::get() * 2,
                shutdown_timeout_secs: 60,
                health_check_interval_secs: 60,
                ..Default::default()
            },
            queue: QueueConfig::default(),
            retry: RetryPolicy::default().with_max_delay(6 * 3_600_000),
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_targets: false,
            },
        }
    }

    /// Create a configuration for testing: one worker and millisecond timings.
    pub fn testing() -> Self {
        Self {
            server: ServerConfig {
                concurrency: 1,
                scheduler_interval_ms: 10,
                poll_interval_ms: 10,
                shutdown_timeout_secs: 5,
                default_task_timeout_secs: 10,
                health_check_interval_secs: 1,
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 1000,
                ..Default::default()
            },
            retry: RetryPolicy::quadratic(10),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.concurrency == 0 {
            errors.push("Concurrency must be greater than 0".to_string());
        }

        if self.server.concurrency > 1000 {
            errors.push("Concurrency should not exceed 1000".to_string());
        }

        if self.server.queues.is_empty() {
            errors.push("At least one queue must be configured".to_string());
        }

        for queue in &self.server.queues {
            if queue.name.is_empty() {
                errors.push("Queue names must not be empty".to_string());
            }
            if queue.priority == 0 {
                errors.push(format!("Queue '{}' must have a priority above 0", queue.name));
            }
        }

        let mut names: Vec<&str> = self.server.queues.iter().map(|q| q.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            errors.push("Queue names must be unique".to_string());
        }

        if self.server.scheduler_interval_ms == 0 {
            errors.push("Scheduler interval must be greater than 0".to_string());
        }

        if self.server.scheduler_batch_size == 0 {
            errors.push("Scheduler batch size must be greater than 0".to_string());
        }

        if self.server.poll_interval_ms == 0 {
            errors.push("Poll interval must be greater than 0".to_string());
        }

        if self.server.health_check_interval_secs == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if self.retry.base_delay_ms == 0 {
            errors.push("Retry base delay must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ForgeConfig::default();
        assert!(config.server.concurrency > 0);
        assert_eq!(config.server.queues, vec![QueuePriority::new("default", 1)]);
        assert_eq!(config.server.default_task_timeout(), Duration::from_secs(1800));
        assert_eq!(config.server.scheduler_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(ForgeConfig::development().validate().is_ok());
        assert!(ForgeConfig::production().validate().is_ok());

        let testing = ForgeConfig::testing();
        assert_eq!(testing.server.concurrency, 1);
        assert!(matches!(testing.logging.level, LogLevel::Debug));
        assert!(testing.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ForgeConfig::default();
        config.server.concurrency = 0;
        assert!(config.validate().is_err());

        config.server.concurrency = 1;
        config.server.queues = vec![QueuePriority::new("a", 1), QueuePriority::new("a", 2)];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("unique")));

        config.server.queues = vec![QueuePriority::new("", 1)];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must not be empty")));
    }

    #[test]
    fn test_queues_by_priority_is_stable() {
        let config = ServerConfig::default()
            .with_queue("critical", 6)
            .with_queue("low", 1)
            .with_queue("mid", 3);

        assert_eq!(
            config.queues_by_priority(),
            vec!["critical", "mid", "default", "low"]
        );
    }

    #[test]
    fn test_with_queue_updates_existing() {
        let config = ServerConfig::default().with_queue("default", 5);
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[0].priority, 5);
    }

    #[test]
    fn test_quadratic_backoff() {
        let policy = RetryPolicy::quadratic(1000);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(9));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::quadratic(1000).with_max_delay(5000);
        assert_eq!(policy.backoff(10), Duration::from_secs(5));

        let exponential = RetryPolicy::exponential(100);
        assert_eq!(exponential.backoff(1), Duration::from_millis(100));
        assert_eq!(exponential.backoff(3), Duration::from_millis(400));
        assert_eq!(exponential.backoff(200), Duration::from_millis(3_600_000));
    }

    #[test]
    fn test_retry_policies() {
        let fixed = RetryPolicy::fixed(250);
        assert_eq!(fixed.backoff(1), fixed.backoff(7));
        assert!(matches!(fixed.backoff_strategy, BackoffStrategy::Fixed));

        let linear = RetryPolicy::linear(500);
        assert_eq!(linear.backoff(1), Duration::from_millis(500));
        assert_eq!(linear.backoff(3), Duration::from_millis(2500));
    }

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::with_concurrency(8)
            .with_strict_priority(true)
            .with_poll_interval(25)
            .with_shutdown_timeout(3)
            .with_default_task_timeout(60);

        assert_eq!(config.concurrency, 8);
        assert!(config.strict_priority);
        assert_eq!(config.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(config.default_task_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = ForgeConfig::testing();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ForgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.server.queues, config.server.queues);
        assert_eq!(parsed.retry.base_delay_ms, 10);
    }
}
