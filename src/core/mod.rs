//! The taskforge server.
//!
//! A [`Server`] owns a handler registry and, while running, an [`Engine`]
//! with the worker pool, the scheduler and the health monitor. Servers can be
//! started and stopped repeatedly; each run gets a fresh cancellation token.

use crate::client::Client;
use crate::config::ForgeConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::queue::{QueueFactory, TaskQueue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod engine;
pub mod registry;
pub mod worker;

pub use engine::Engine;
pub use registry::{Handler, HandlerRegistry, HandlerStats, TaskContext};
pub use worker::{Worker, WorkerStats};

use worker::StatsRecorder;

#[cfg(feature = "metrics")]
use crate::metrics::ForgeMetrics;

/// Processes tasks from a queue adapter.
///
/// # Examples
///
/// ```rust,no_run
/// use taskforge::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> ForgeResult<()> {
///     let server = Server::new(ForgeConfig::default());
///     server
///         .register_handler("email:send", |ctx: TaskContext, task: Task| async move {
///             tracing::info!("task {} carries {} bytes", ctx.task_id, task.payload.len());
///             Ok::<(), BoxError>(())
///         })
///         .await?;
///
///     server.client().enqueue("email:send", b"hi".to_vec(), TaskOptions::new()).await?;
///     server.run_until_signal().await
/// }
/// ```
pub struct Server {
    config: ForgeConfig,
    queue: TaskQueue,
    registry: RwLock<HandlerRegistry>,
    engine: RwLock<Option<Engine>>,
    stats: StatsRecorder,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server with an in-memory queue built from `config.queue`.
    pub fn new(config: ForgeConfig) -> Self {
        let queue = QueueFactory::in_memory(config.queue.clone());
        Self::with_adapter(config, queue)
    }

    /// Create a server over an existing adapter, e.g. one shared with clients.
    pub fn with_adapter(config: ForgeConfig, queue: TaskQueue) -> Self {
        Self {
            config,
            queue,
            registry: RwLock::new(HandlerRegistry::new()),
            engine: RwLock::new(None),
            stats: StatsRecorder::new(),
        }
    }

    /// Create a server with the backend selected by `config.queue.backend`.
    pub async fn from_config(config: ForgeConfig) -> ForgeResult<Self> {
        let queue = QueueFactory::from_config(&config.queue).await?;
        Ok(Self::with_adapter(config, queue))
    }

    /// Report task outcomes to Prometheus.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn with_metrics(mut self, metrics: Arc<ForgeMetrics>) -> Self {
        self.stats = self.stats.with_metrics(metrics);
        self
    }

    /// A client that enqueues onto this server's adapter.
    pub fn client(&self) -> Client {
        Client::new(Arc::clone(&self.queue))
    }

    /// Register `handler` for tasks named `name`.
    ///
    /// Fails with [`ForgeError::RegistryLocked`] while the server is running.
    pub async fn register_handler<H>(&self, name: impl Into<String>, handler: H) -> ForgeResult<()>
    where
        H: Handler + 'static,
    {
        self.register_handlers([(name.into(), Arc::new(handler) as Arc<dyn Handler>)])
            .await
    }

    /// Register several handlers at once.
    pub async fn register_handlers<I>(&self, handlers: I) -> ForgeResult<()>
    where
        I: IntoIterator<Item = (String, Arc<dyn Handler>)>,
    {
        let engine = self.engine.read().await;
        let mut registry = self.registry.write().await;
        for (name, handler) in handlers {
            if engine.is_some() {
                return Err(ForgeError::RegistryLocked { name });
            }
            registry.register_arc(name, handler);
        }
        Ok(())
    }

    /// Start processing. Returns once the loops are spawned.
    ///
    /// Fails with [`ForgeError::ConfigError`] when the configuration does not validate.
    pub async fn start(&self) -> ForgeResult<()> {
        let mut engine = self.engine.write().await;
        if engine.is_some() {
            return Err(ForgeError::AlreadyRunning);
        }
        self.config
            .validate()
            .map_err(|errors| ForgeError::config(errors.join("; ")))?;

        let registry = self.registry.read().await;
        if registry.is_empty() {
            tracing::warn!("Starting server without any registered handler");
        }
        let snapshot = Arc::new(registry.clone());
        drop(registry);

        *engine = Some(Engine::start(
            &self.config,
            Arc::clone(&self.queue),
            snapshot,
            self.stats.clone(),
        ));

        tracing::info!(
            "Server started with {} workers",
            self.config.server.concurrency
        );
        Ok(())
    }

    /// Stop processing and wait for the loops to exit.
    pub async fn stop(&self) -> ForgeResult<()> {
        let mut guard = self.engine.write().await;
        let engine = guard.take().ok_or(ForgeError::NotRunning)?;
        tracing::info!("Server stopping after {:?}", engine.uptime());
        engine.shutdown().await;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Start, wait for Ctrl-C, then stop.
    pub async fn run_until_signal(&self) -> ForgeResult<()> {
        self.start().await?;

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        } else {
            tracing::info!("Received Ctrl-C, shutting down...");
        }

        self.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.engine.read().await.is_some()
    }

    /// Worker statistics accumulated across runs.
    pub async fn worker_stats(&self) -> WorkerStats {
        self.stats.snapshot().await
    }

    /// Handler statistics by task name.
    pub async fn handler_stats(&self) -> HashMap<String, HandlerStats> {
        self.registry.read().await.all_stats().await
    }

    /// Check the queue backend and, while running, the worker pool.
    pub async fn health_check(&self) -> ForgeResult<()> {
        self.queue.health_check().await?;

        if self.is_running().await && self.config.server.concurrency > 0 {
            let stats = self.stats.snapshot().await;
            if stats.active_workers == 0 {
                return Err(ForgeError::config("No active workers"));
            }
        }
        Ok(())
    }

    /// The configuration used by this server.
    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }
}
