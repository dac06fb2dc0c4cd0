//! Metric recording helpers for queue operations.
//!
//! `MetricsCollector` wraps the raw Prometheus statics with consistent
//! labels. Every method silently does nothing until
//! [`super::init_metrics`] has run, so library users who never initialize
//! metrics pay nothing.

use super::prometheus::{
    CHUNKS_IN_FLIGHT, CHUNKS_PROCESSED, EXHAUSTED_TOTAL, JOB_FAILURES, QUEUE_DEPTH,
    STAGE_DURATION, TASKS_COMPLETED, TASKS_PUSHED,
};

/// Entity dropped after exceeding its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustedEntity {
    Task,
    Chunk,
}

impl ExhaustedEntity {
    fn as_str(&self) -> &'static str {
        match self {
            ExhaustedEntity::Task => "task",
            ExhaustedEntity::Chunk => "chunk",
        }
    }
}

/// Metrics collector for recording queue operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a task inserted into `pending`.
    pub fn record_pushed(&self, worker: &str) {
        if let Some(pushed) = TASKS_PUSHED.get() {
            pushed.with_label_values(&[worker]).inc();
        }
    }

    /// Record a task reduced and deleted.
    pub fn record_completed(&self, worker: &str) {
        if let Some(completed) = TASKS_COMPLETED.get() {
            completed.with_label_values(&[worker]).inc();
        }
    }

    /// Record a task or chunk dropped after its final retry.
    pub fn record_exhausted(&self, worker: &str, entity: ExhaustedEntity) {
        if let Some(exhausted) = EXHAUSTED_TOTAL.get() {
            exhausted
                .with_label_values(&[worker, entity.as_str()])
                .inc();
        }

        tracing::trace!(
            worker = worker,
            entity = entity.as_str(),
            "Recorded exhaustion metric"
        );
    }

    /// Record one finished callback run.
    ///
    /// # Arguments
    ///
    /// * `worker` - Worker name
    /// * `stage` - Callback stage ("map", "process" or "reduce")
    /// * `success` - Whether the callback returned `Ok`
    /// * `duration_secs` - Callback duration in seconds
    pub fn record_stage(&self, worker: &str, stage: &str, success: bool, duration_secs: f64) {
        if let Some(duration) = STAGE_DURATION.get() {
            duration
                .with_label_values(&[worker, stage])
                .observe(duration_secs);
        }

        if success {
            if stage == "process" {
                if let Some(processed) = CHUNKS_PROCESSED.get() {
                    processed.with_label_values(&[worker]).inc();
                }
            }
        } else if let Some(failures) = JOB_FAILURES.get() {
            failures.with_label_values(&[worker, stage]).inc();
        }
    }

    /// Adjust the in-flight chunk gauge by `delta`.
    pub fn add_in_flight(&self, worker: &str, delta: f64) {
        if let Some(in_flight) = CHUNKS_IN_FLIGHT.get() {
            in_flight.with_label_values(&[worker]).add(delta);
        }
    }

    /// Record the cardinality of a queue set.
    pub fn set_queue_depth(&self, set: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[set]).set(depth as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_without_init_is_noop() {
        let collector = MetricsCollector::new();

        collector.record_pushed("resize");
        collector.record_completed("resize");
        collector.record_exhausted("resize", ExhaustedEntity::Chunk);
        collector.record_stage("resize", "process", false, 0.2);
        collector.add_in_flight("resize", 1.0);
        collector.set_queue_depth("pending", 3);
    }

    #[test]
    fn test_collector_records_after_init() {
        let _ = crate::metrics::init_metrics();
        let collector = MetricsCollector::new();

        collector.record_stage("collector-test", "process", true, 0.05);

        if let Some(processed) = CHUNKS_PROCESSED.get() {
            assert!(processed.with_label_values(&["collector-test"]).get() >= 1.0);
        }
    }

    #[test]
    fn test_exhausted_entity_labels() {
        assert_eq!(ExhaustedEntity::Task.as_str(), "task");
        assert_eq!(ExhaustedEntity::Chunk.as_str(), "chunk");
    }
}
