//! Metrics module for Prometheus-based monitoring.
//!
//! Counts pushed, completed and exhausted tasks, job failures per stage,
//! processed and in-flight chunks, and callback durations.
//!
//! # Example
//!
//! ```ignore
//! use forge_queue::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run the queue ...
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{ExhaustedEntity, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CHUNKS_IN_FLIGHT, CHUNKS_PROCESSED, EXHAUSTED_TOTAL, JOB_FAILURES, QUEUE_DEPTH, REGISTRY,
    STAGE_DURATION, TASKS_COMPLETED, TASKS_PUSHED,
};
