//! Error types for taskforge operations.

use std::time::Duration;
use thiserror::Error;

/// Result type used throughout taskforge.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Boxed error returned by task handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for taskforge operations.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// The queue had no item to hand out
    #[error("Queue '{queue}' is empty")]
    EmptyQueue {
        /// Queue that was polled
        queue: String,
    },

    /// A blocking dequeue gave up waiting
    #[error("Timed out after {timeout:?} waiting on queue '{queue}'")]
    Timeout {
        /// Queue that was polled
        queue: String,
        /// How long the caller waited
        timeout: Duration,
    },

    /// The backing store refused the item because the queue is at capacity
    #[error("Queue '{queue}' is full (max size: {capacity})")]
    QueueFull {
        /// Queue that rejected the item
        queue: String,
        /// Configured capacity
        capacity: usize,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Storage backend error
    #[error("Queue error: {message}")]
    QueueError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A caller passed something malformed
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// `start` was called on a running server
    #[error("server is already started")]
    AlreadyRunning,

    /// `stop` was called on a stopped server
    #[error("server is not started")]
    NotRunning,

    /// Handlers cannot change while workers are reading the registry
    #[error("cannot register handler '{name}' while the server is running")]
    RegistryLocked {
        /// Handler name that was rejected
        name: String,
    },

    /// Redis connection error
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl ForgeError {
    /// Create a new queue error
    pub fn queue<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::QueueError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an empty queue error
    pub fn empty(queue: impl Into<String>) -> Self {
        Self::EmptyQueue {
            queue: queue.into(),
        }
    }

    /// True for the "nothing to dequeue" kind.
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, Self::EmptyQueue { .. })
    }

    /// True when a blocking dequeue timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Storage-side failures a worker should retry on its next iteration.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueError { .. } | Self::QueueFull { .. } => true,
            #[cfg(feature = "redis-queue")]
            Self::Redis(_) => true,
            _ => false,
        }
    }

    /// Malformed requests and lifecycle misuse.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. }
                | Self::AlreadyRunning
                | Self::NotRunning
                | Self::RegistryLocked { .. }
        )
    }
}
