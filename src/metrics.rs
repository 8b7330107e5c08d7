//! Prometheus metrics for the worker pool.
//!
//! Enabled with the `metrics` feature. Create a [`ForgeMetrics`] against your
//! own `prometheus::Registry` and attach it with
//! [`Server::with_metrics`](crate::Server::with_metrics).

use crate::error::{ForgeError, ForgeResult};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Task counters and handler latency, labelled by queue.
#[derive(Debug, Clone)]
pub struct ForgeMetrics {
    processed: IntCounterVec,
    failed: IntCounterVec,
    retried: IntCounterVec,
    dead: IntCounterVec,
    dropped: IntCounterVec,
    duration: HistogramVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> ForgeResult<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["queue"])
        .map_err(|e| ForgeError::config(format!("Invalid metric {}: {}", name, e)))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| ForgeError::config(format!("Failed to register {}: {}", name, e)))?;
    Ok(counter)
}

impl ForgeMetrics {
    /// Create the metrics and register them into `registry`.
    pub fn new(registry: &Registry) -> ForgeResult<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "taskforge_task_duration_seconds",
                "Handler execution time in seconds",
            ),
            &["queue"],
        )
        .map_err(|e| ForgeError::config(format!("Invalid duration histogram: {}", e)))?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(|e| ForgeError::config(format!("Failed to register histogram: {}", e)))?;

        Ok(Self {
            processed: counter(
                registry,
                "taskforge_tasks_processed_total",
                "Tasks whose handler succeeded",
            )?,
            failed: counter(
                registry,
                "taskforge_tasks_failed_total",
                "Handler runs that returned an error, panicked or timed out",
            )?,
            retried: counter(
                registry,
                "taskforge_tasks_retried_total",
                "Failed tasks scheduled for another attempt",
            )?,
            dead: counter(
                registry,
                "taskforge_tasks_dead_total",
                "Tasks moved to the dead-letter queue",
            )?,
            dropped: counter(
                registry,
                "taskforge_tasks_dropped_total",
                "Malformed tasks and tasks without a handler",
            )?,
            duration,
        })
    }

    pub(crate) fn processed(&self, queue: &str) {
        self.processed.with_label_values(&[queue]).inc();
    }

    pub(crate) fn failed(&self, queue: &str) {
        self.failed.with_label_values(&[queue]).inc();
    }

    pub(crate) fn retried(&self, queue: &str) {
        self.retried.with_label_values(&[queue]).inc();
    }

    pub(crate) fn dead(&self, queue: &str) {
        self.dead.with_label_values(&[queue]).inc();
    }

    pub(crate) fn dropped(&self, queue: &str) {
        self.dropped.with_label_values(&[queue]).inc();
    }

    pub(crate) fn observe(&self, queue: &str, duration: Duration) {
        self.duration
            .with_label_values(&[queue])
            .observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let registry = Registry::new();
        let metrics = ForgeMetrics::new(&registry).unwrap();

        metrics.processed("default");
        metrics.processed("default");
        metrics.dead("critical");
        metrics.observe("default", Duration::from_millis(5));

        let text = prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(text.contains(r#"taskforge_tasks_processed_total{queue="default"} 2"#));
        assert!(text.contains(r#"taskforge_tasks_dead_total{queue="critical"} 1"#));
        assert!(text.contains("taskforge_task_duration_seconds_count"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        assert!(ForgeMetrics::new(&registry).is_ok());
        assert!(matches!(
            ForgeMetrics::new(&registry),
            Err(ForgeError::ConfigError { .. })
        ));
    }
}
