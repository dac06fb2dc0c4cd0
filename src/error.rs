//! Error types for forge-queue operations.
//!
//! Defines the error taxonomy shared by the store adapters and the engine:
//! - Store failures (Redis outages, malformed records)
//! - Caller misuse (unknown or duplicate workers, invalid definitions)
//! - Job failures raised by user-supplied `map`, `process` and `reduce` bodies

use serde_json::Value;
use thiserror::Error;

use crate::scheduler::TaskState;

/// Errors that can occur while talking to the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Malformed record '{key}': {reason}")]
    MalformedRecord { key: String, reason: String },
}

/// Errors surfaced by the queue engine.
///
/// Misuse errors (`UnknownWorker`, `DuplicateWorker`, `InvalidDefinition`,
/// `AlreadyRunning`, `ShutDown`) are returned synchronously. Everything that happens in
/// the background is delivered through [`crate::Queue::subscribe`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Worker '{0}' is not registered")]
    UnknownWorker(String),

    #[error("Worker '{0}' is already registered")]
    DuplicateWorker(String),

    #[error("Invalid definition for worker '{worker}': {reason}")]
    InvalidDefinition { worker: String, reason: String },

    #[error("Queue is already running")]
    AlreadyRunning,

    #[error("Queue has been shut down")]
    ShutDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Job(Box<JobFailure>),
}

impl QueueError {
    /// Returns the job failure details if this error wraps one.
    pub fn as_job_failure(&self) -> Option<&JobFailure> {
        match self {
            QueueError::Job(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<JobFailure> for QueueError {
    fn from(failure: JobFailure) -> Self {
        QueueError::Job(Box::new(failure))
    }
}

/// A failure returned by worker code, with enough context to group and
/// replay it without consulting the store.
#[derive(Debug, Error)]
#[error("{error} (worker: {worker}, state: {state}, task ID: {task_id})")]
pub struct JobFailure {
    /// The error returned by the job body.
    pub error: anyhow::Error,
    /// Name of the worker that owns the task.
    pub worker: String,
    /// Task state at the time of failure.
    pub state: TaskState,
    /// The task id.
    pub task_id: String,
    /// The chunk id, `None` for `map` and `reduce` failures.
    pub chunk_id: Option<String>,
    /// Data passed to the failing callback.
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_error_display() {
        let err = QueueError::UnknownWorker("resize".to_string());
        assert!(err.to_string().contains("resize"));
        assert!(err.to_string().contains("not registered"));

        let err = QueueError::DuplicateWorker("resize".to_string());
        assert!(err.to_string().contains("already registered"));

        let err = QueueError::InvalidDefinition {
            worker: "resize".to_string(),
            reason: "timeout must be greater than 0".to_string(),
        };
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_job_failure_display_and_conversion() {
        let failure = JobFailure {
            error: anyhow::anyhow!("disk full"),
            worker: "thumbnails".to_string(),
            state: TaskState::Mapping,
            task_id: "queue:thumbnails:42".to_string(),
            chunk_id: None,
            data: serde_json::json!({"n": 1}),
        };

        let err: QueueError = failure.into();
        let message = err.to_string();
        assert!(message.contains("disk full"));
        assert!(message.contains("worker: thumbnails"));
        assert!(message.contains("state: mapping"));
        assert!(message.contains("queue:thumbnails:42"));

        let failure = err.as_job_failure().expect("should wrap a job failure");
        assert_eq!(failure.state, TaskState::Mapping);
        assert!(failure.chunk_id.is_none());
    }

    #[test]
    fn test_store_error_converts_into_queue_error() {
        let err: QueueError = StoreError::Backend("lock poisoned".to_string()).into();
        assert!(matches!(err, QueueError::Store(_)));
        assert!(err.as_job_failure().is_none());
        assert!(err.to_string().contains("lock poisoned"));
    }
}
