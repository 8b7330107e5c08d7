//! The taskforge engine: one running instance of a server.
//!
//! The engine owns every background loop of a server run:
//! - the worker pool
//! - the scheduler that promotes due tasks into their pending queues
//! - the health monitor
//!
//! All loops share one [`CancellationToken`]. Stopping cancels it and waits
//! for the loops to drain.

use crate::config::ForgeConfig;
use crate::core::registry::HandlerRegistry;
use crate::core::worker::{QueueSelector, StatsRecorder, Worker, WorkerShared};
use crate::queue::{QueueAdapter, QueueStats, TaskQueue, pending_key, scheduled_key};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The background loops of one server run.
pub struct Engine {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
    started_at: Instant,
}

impl Engine {
    /// Spawn the workers, the scheduler and the health monitor.
    pub(crate) fn start(
        config: &ForgeConfig,
        queue: TaskQueue,
        registry: Arc<HandlerRegistry>,
        stats: StatsRecorder,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let server = &config.server;
        let queues: Vec<String> = server.queues.iter().map(|q| q.name.clone()).collect();

        info!(
            "Starting taskforge engine with {} workers on queues {:?}",
            server.concurrency, queues
        );

        let shared = Arc::new(WorkerShared {
            queue: Arc::clone(&queue),
            registry,
            selector: QueueSelector::new(server),
            config: server.clone(),
            retry: config.retry.clone(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
        });

        let mut handles = Vec::with_capacity(server.concurrency + 2);
        for worker_id in 0..server.concurrency {
            let worker = Worker::new(worker_id, Arc::clone(&shared));
            handles.push(tokio::spawn(worker.run()));
        }

        handles.push(tokio::spawn(run_scheduler(
            Arc::clone(&queue),
            queues.clone(),
            server.scheduler_interval(),
            server.scheduler_batch_size,
            shutdown.clone(),
        )));

        handles.push(tokio::spawn(run_monitor(
            queue,
            queues,
            stats,
            server.concurrency,
            server.health_check_interval(),
            shutdown.clone(),
        )));

        Self {
            shutdown,
            handles,
            shutdown_timeout: server.shutdown_timeout(),
            started_at: Instant::now(),
        }
    }

    /// Cancel every loop and wait up to the shutdown timeout for them to exit.
    ///
    /// Loops still running when the timeout expires are aborted; that is
    /// logged, not returned.
    pub(crate) async fn shutdown(mut self) {
        info!("Shutting down taskforge engine...");
        self.shutdown.cancel();

        let joined = timeout(self.shutdown_timeout, join_all(self.handles.iter_mut())).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Engine task ended abnormally: {}", e);
                    }
                }
                info!("Taskforge engine shutdown complete");
            }
            Err(_) => {
                warn!(
                    "Engine did not stop within {:?}, aborting remaining tasks",
                    self.shutdown_timeout
                );
                for handle in &self.handles {
                    handle.abort();
                }
            }
        }
    }

    /// Time since the engine started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Move due tasks of every queue into its pending queue.
///
/// Each queue is drained in batches until a batch comes back short or empty.
/// Returns how many tasks moved in total.
pub(crate) async fn promote_all(
    queue: &dyn QueueAdapter,
    queues: &[String],
    batch_size: usize,
) -> usize {
    let mut total = 0;
    for name in queues {
        let scheduled = scheduled_key(name);
        let pending = pending_key(name);
        loop {
            match queue
                .promote_due(&scheduled, &pending, Utc::now(), batch_size)
                .await
            {
                Ok(moved) => {
                    total += moved;
                    if moved == 0 || moved < batch_size {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to promote scheduled tasks of '{}': {}", name, e);
                    break;
                }
            }
        }
    }
    total
}

async fn run_scheduler(
    queue: TaskQueue,
    queues: Vec<String>,
    every: Duration,
    batch_size: usize,
    shutdown: CancellationToken,
) {
    info!("Scheduler started");
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let moved = promote_all(queue.as_ref(), &queues, batch_size).await;
                if moved > 0 {
                    debug!("Promoted {} scheduled tasks", moved);
                }
            }
        }
    }

    info!("Scheduler stopped");
}

async fn run_monitor(
    queue: TaskQueue,
    queues: Vec<String>,
    stats: StatsRecorder,
    expected_workers: usize,
    every: Duration,
    shutdown: CancellationToken,
) {
    info!("Health monitor started");
    let started_at = Instant::now();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = queue.health_check().await {
            warn!("Queue backend health check failed: {}", e);
        }

        for name in &queues {
            match QueueStats::collect(queue.as_ref(), name).await {
                Ok(s) => info!(
                    "HEALTH CHECK - Queue '{}' | pending: {} scheduled: {} dead: {}",
                    name, s.pending, s.scheduled, s.dead
                ),
                Err(e) => error!("Failed to collect stats for '{}': {}", name, e),
            }
        }

        let worker_stats = stats.snapshot().await;
        info!(
            "HEALTH CHECK - Workers: {}/{} | completed: {} failed: {} retried: {} dead: {} dropped: {} | Uptime: {:?}",
            worker_stats.active_workers,
            expected_workers,
            worker_stats.tasks_completed,
            worker_stats.tasks_failed,
            worker_stats.tasks_retried,
            worker_stats.tasks_dead_lettered,
            worker_stats.tasks_dropped,
            started_at.elapsed()
        );
    }

    info!("Health monitor stopped");
}
