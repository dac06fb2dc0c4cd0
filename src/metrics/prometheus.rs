//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by forge-queue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all forge-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks inserted by push, postpone promotion or cron, labeled by worker.
pub static TASKS_PUSHED: OnceLock<CounterVec> = OnceLock::new();

/// Tasks whose reduce succeeded, labeled by worker.
pub static TASKS_COMPLETED: OnceLock<CounterVec> = OnceLock::new();

/// Tasks and chunks deleted after exceeding their retry budget, labeled by
/// worker and entity (task/chunk).
pub static EXHAUSTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job callback failures, labeled by worker and stage.
pub static JOB_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Chunks processed successfully, labeled by worker.
pub static CHUNKS_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Chunks currently processed by this process, labeled by worker.
pub static CHUNKS_IN_FLIGHT: OnceLock<GaugeVec> = OnceLock::new();

/// Callback duration in seconds, labeled by worker and stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Cardinality of each queue set at the last stats call.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Until then every recording method of
/// [`super::MetricsCollector`] is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_pushed = CounterVec::new(
        Opts::new("forge_queue_tasks_pushed_total", "Total tasks inserted"),
        &["worker"],
    )?;

    let tasks_completed = CounterVec::new(
        Opts::new(
            "forge_queue_tasks_completed_total",
            "Total tasks reduced and deleted",
        ),
        &["worker"],
    )?;

    let exhausted_total = CounterVec::new(
        Opts::new(
            "forge_queue_exhausted_total",
            "Total tasks and chunks dropped after exceeding their retry budget",
        ),
        &["worker", "entity"],
    )?;

    let job_failures = CounterVec::new(
        Opts::new("forge_queue_job_failures_total", "Total job callback failures"),
        &["worker", "stage"],
    )?;

    let chunks_processed = CounterVec::new(
        Opts::new(
            "forge_queue_chunks_processed_total",
            "Total chunks processed successfully",
        ),
        &["worker"],
    )?;

    let chunks_in_flight = GaugeVec::new(
        Opts::new(
            "forge_queue_chunks_in_flight",
            "Chunks currently processed by this instance",
        ),
        &["worker"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "forge_queue_stage_duration_seconds",
            "Job callback duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["worker", "stage"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("forge_queue_depth", "Number of tasks in each queue set"),
        &["set"],
    )?;

    registry.register(Box::new(tasks_pushed.clone()))?;
    registry.register(Box::new(tasks_completed.clone()))?;
    registry.register(Box::new(exhausted_total.clone()))?;
    registry.register(Box::new(job_failures.clone()))?;
    registry.register(Box::new(chunks_processed.clone()))?;
    registry.register(Box::new(chunks_in_flight.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_PUSHED.set(tasks_pushed);
    let _ = TASKS_COMPLETED.set(tasks_completed);
    let _ = EXHAUSTED_TOTAL.set(exhausted_total);
    let _ = JOB_FAILURES.set(job_failures);
    let _ = CHUNKS_PROCESSED.set(chunks_processed);
    let _ = CHUNKS_IN_FLIGHT.set(chunks_in_flight);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(pushed) = TASKS_PUSHED.get() {
            pushed.with_label_values(&["export-test"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        if REGISTRY.get().is_some() {
            assert!(metrics.contains("forge_queue_tasks_pushed_total"));
        }
    }
}
