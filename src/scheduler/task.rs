//! Task and chunk views handed to job callbacks.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::worker::Worker;
use crate::error::StoreError;
use crate::store::{QueueSet, Store, Transition};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Postponed,
    Pending,
    Mapping,
    Aggregating,
    Reducing,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        self.queue_set().as_str()
    }

    /// Queue set holding tasks in this state.
    pub fn queue_set(&self) -> QueueSet {
        match self {
            TaskState::Postponed => QueueSet::Postponed,
            TaskState::Pending => QueueSet::Pending,
            TaskState::Mapping => QueueSet::Mapping,
            TaskState::Aggregating => QueueSet::Aggregating,
            TaskState::Reducing => QueueSet::Reducing,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task as seen by `map` and `reduce`.
pub struct Task {
    id: String,
    data: Value,
    retries: u32,
    worker: Arc<Worker>,
    store: Arc<dyn Store>,
    lease: AtomicI64,
}

impl Task {
    pub(crate) fn new(
        id: String,
        data: Value,
        retries: u32,
        worker: Arc<Worker>,
        store: Arc<dyn Store>,
        lease: i64,
    ) -> Self {
        Self {
            id,
            data,
            retries,
            worker,
            store,
            lease: AtomicI64::new(lease),
        }
    }

    /// Full task id, including prefix and worker name.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Retry counter of the current stage.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn worker_name(&self) -> &str {
        &self.worker.name
    }

    /// Lease deadline (ms) this process currently holds.
    pub fn deadline(&self) -> i64 {
        self.lease.load(Ordering::SeqCst)
    }

    /// Runs the worker's `map` callback on this task.
    pub async fn map(&self) -> anyhow::Result<Vec<Value>> {
        self.worker.job.map(self).await
    }

    /// Runs the worker's `reduce` callback on this task.
    pub async fn reduce(&self, results: Vec<Value>) -> anyhow::Result<()> {
        self.worker.job.reduce(self, results).await
    }

    /// Moves the lease of the running stage to `now + time_left`.
    ///
    /// Returns `false` if the task is no longer leased (finished, deleted
    /// or between stages), in which case nothing changes.
    pub async fn set_deadline(&self, time_left: Duration) -> Result<bool, StoreError> {
        let deadline = self.store.now().await? + time_left.as_millis() as i64;
        let outcome = self
            .store
            .apply(Transition::ExtendTaskLease {
                task_id: self.id.clone(),
                deadline,
            })
            .await?;

        if outcome.is_applied() {
            self.lease.store(deadline, Ordering::SeqCst);
        }
        Ok(outcome.is_applied())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("worker", &self.worker.name)
            .field("retries", &self.retries)
            .field("deadline", &self.deadline())
            .finish_non_exhaustive()
    }
}

/// A chunk as seen by `process`.
pub struct Chunk {
    id: String,
    task_id: String,
    data: Value,
    retries: u32,
    worker: Arc<Worker>,
    store: Arc<dyn Store>,
    lease: AtomicI64,
}

impl Chunk {
    pub(crate) fn new(
        id: String,
        task_id: String,
        data: Value,
        retries: u32,
        worker: Arc<Worker>,
        store: Arc<dyn Store>,
        lease: i64,
    ) -> Self {
        Self {
            id,
            task_id,
            data,
            retries,
            worker,
            store,
            lease: AtomicI64::new(lease),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Position of the chunk in the list returned by `map`.
    pub fn index(&self) -> Option<usize> {
        self.id
            .strip_prefix(self.task_id.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|index| index.parse().ok())
    }

    pub fn worker_name(&self) -> &str {
        &self.worker.name
    }

    pub fn deadline(&self) -> i64 {
        self.lease.load(Ordering::SeqCst)
    }

    /// Runs the worker's `process` callback on this chunk.
    pub async fn process(&self) -> anyhow::Result<Value> {
        self.worker.job.process(self).await
    }

    /// Moves the chunk lease to `now + time_left`. Returns `false` if the
    /// chunk is no longer active.
    pub async fn set_deadline(&self, time_left: Duration) -> Result<bool, StoreError> {
        let deadline = self.store.now().await? + time_left.as_millis() as i64;
        let outcome = self
            .store
            .apply(Transition::ExtendChunkLease {
                task_id: self.task_id.clone(),
                chunk_id: self.id.clone(),
                deadline,
            })
            .await?;

        if outcome.is_applied() {
            self.lease.store(deadline, Ordering::SeqCst);
        }
        Ok(outcome.is_applied())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("retries", &self.retries)
            .field("deadline", &self.deadline())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::worker::{WorkerDefinition, WorkerRegistry};
    use crate::store::{MemoryStore, Outcome};

    fn worker() -> Arc<Worker> {
        let mut registry = WorkerRegistry::new();
        registry
            .register(WorkerDefinition::from_fn("double", |data| async move {
                Ok(serde_json::json!(data.as_i64().unwrap_or(0) * 2))
            }))
            .unwrap();
        registry.get("double").unwrap()
    }

    #[test]
    fn test_task_state_display_and_serde() {
        assert_eq!(TaskState::Aggregating.to_string(), "aggregating");
        assert_eq!(
            serde_json::to_string(&TaskState::Reducing).unwrap(),
            "\"reducing\""
        );
        let state: TaskState = serde_json::from_str("\"postponed\"").unwrap();
        assert_eq!(state, TaskState::Postponed);
    }

    #[tokio::test]
    async fn test_default_map_and_process() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::with_manual_clock("queue:", 0));
        let task = Task::new(
            "queue:double:1".to_string(),
            serde_json::json!(21),
            0,
            worker(),
            Arc::clone(&store),
            0,
        );

        let chunks = task.map().await.unwrap();
        assert_eq!(chunks, vec![serde_json::json!(21)]);
        task.reduce(vec![]).await.unwrap();

        let chunk = Chunk::new(
            "queue:double:1:0".to_string(),
            task.id().to_string(),
            chunks[0].clone(),
            0,
            worker(),
            store,
            0,
        );
        assert_eq!(chunk.index(), Some(0));
        assert_eq!(chunk.process().await.unwrap(), serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_set_deadline_requires_live_lease() {
        let memory = MemoryStore::with_manual_clock("queue:", 1_000);
        let store: Arc<dyn Store> = Arc::new(memory.clone());
        let task = Task::new(
            "queue:double:1".to_string(),
            Value::Null,
            0,
            worker(),
            Arc::clone(&store),
            0,
        );

        assert!(!task.set_deadline(Duration::from_secs(5)).await.unwrap());

        store
            .apply(Transition::AddTask {
                task_id: task.id().to_string(),
                worker: "double".to_string(),
                data: "null".to_string(),
            })
            .await
            .unwrap();
        let claimed = store
            .apply(Transition::PendingToMapping {
                task_id: task.id().to_string(),
                deadline: 2_000,
            })
            .await
            .unwrap();
        assert_eq!(claimed, Outcome::Applied);

        assert!(task.set_deadline(Duration::from_secs(5)).await.unwrap());
        assert_eq!(task.deadline(), 6_000);
        assert_eq!(
            memory.due(QueueSet::Mapping, i64::MAX).await.unwrap(),
            vec![(task.id().to_string(), 6_000)]
        );
    }
}
