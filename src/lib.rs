//! # taskforge
//!
//! An async task queue for Rust applications.
//!
//! ## Features
//!
//! - **Delayed Tasks**: enqueue now, after a delay or at a point in time
//! - **Retries**: failed tasks come back with quadratic backoff
//! - **Dead-Letter Queues**: tasks out of retries are kept for inspection
//! - **Priorities**: strict or weighted polling across named queues
//! - **Pluggable Storage**: in-memory, or Redis with the `redis-queue` feature
//! - **Observability**: `tracing` logs, and Prometheus with the `metrics` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use taskforge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ForgeResult<()> {
//!     let config = ForgeConfig::development();
//!     config.logging.init()?;
//!
//!     let server = Server::new(config);
//!     server
//!         .register_handler("email:send", |ctx: TaskContext, task: Task| async move {
//!             let to = String::from_utf8_lossy(&task.payload).to_string();
//!             tracing::info!("sending email to {} (attempt {})", to, ctx.retry_count + 1);
//!             Ok::<(), BoxError>(())
//!         })
//!         .await?;
//!
//!     let client = server.client();
//!     client
//!         .enqueue_in(
//!             "email:send",
//!             Duration::from_secs(5),
//!             b"user@example.com".to_vec(),
//!             TaskOptions::new().with_max_retry(5),
//!         )
//!         .await?;
//!
//!     server.run_until_signal().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod queue;
pub mod task;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::client::Client;
    pub use crate::config::*;
    pub use crate::core::{Handler, HandlerRegistry, HandlerStats, Server, TaskContext, WorkerStats};
    pub use crate::error::{BoxError, ForgeError, ForgeResult};
    pub use crate::queue::{
        InMemoryQueue, QueueAdapter, QueueAdapterExt, QueueFactory, QueueStats, TaskQueue,
    };
    pub use crate::task::{
        DeadLetterTask, Task, TaskId, TaskInfo, TaskOptions, TaskState,
    };
    pub use async_trait::async_trait;

    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub use crate::queue::RedisQueue;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::ForgeMetrics;
}

pub use crate::client::Client;
pub use crate::core::Server;
pub use crate::error::{BoxError, ForgeError, ForgeResult};
pub use crate::task::{Task, TaskInfo, TaskOptions};
