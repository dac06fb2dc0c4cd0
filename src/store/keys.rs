//! Store key schema.
//!
//! All keys start with a configurable prefix (`"queue:"` by default):
//!
//! - `postponed`               (zset) - postponed task ids, score = due time
//! - `pending`                 (set)  - incoming task ids
//! - `mapping`                 (zset) - tasks in `mapping`, score = deadline
//! - `aggregating`             (set)  - tasks in `aggregating`
//! - `reducing`                (zset) - tasks in `reducing`, score = deadline
//! - `<taskID>`                (hash) - task fields (type, data, retries, state)
//! - `<taskID>:postponed`      (hash) - fields of a postponed copy of the task
//! - `<taskID>:chunks:pending` (set)  - pending chunk ids
//! - `<taskID>:chunks:active`  (zset) - active chunk ids, score = deadline
//! - `<taskID>:chunks:errored` (zset) - errored chunk ids, score = retry time
//! - `<taskID>:chunks:done`    (set)  - finished chunk ids
//! - `<chunkID>`               (hash) - chunk fields (data, retries, result)
//! - `cron:<worker>:<secs>`    (str)  - cron mutex for one scheduled fire
//!
//! Task ids already carry the prefix, so per-task keys are derived from the
//! id alone.

use std::fmt;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "queue:";

/// Queue-level collections holding task ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueSet {
    Postponed,
    Pending,
    Mapping,
    Aggregating,
    Reducing,
}

impl QueueSet {
    /// All queue sets in lifecycle order.
    pub const ALL: [QueueSet; 5] = [
        QueueSet::Postponed,
        QueueSet::Pending,
        QueueSet::Mapping,
        QueueSet::Aggregating,
        QueueSet::Reducing,
    ];

    /// Key suffix of the collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueSet::Postponed => "postponed",
            QueueSet::Pending => "pending",
            QueueSet::Mapping => "mapping",
            QueueSet::Aggregating => "aggregating",
            QueueSet::Reducing => "reducing",
        }
    }

    /// Whether the collection is a sorted set.
    pub fn is_sorted(&self) -> bool {
        matches!(
            self,
            QueueSet::Postponed | QueueSet::Mapping | QueueSet::Reducing
        )
    }
}

impl fmt::Display for QueueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task collections holding chunk ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkSet {
    Pending,
    Active,
    Errored,
    Done,
}

impl ChunkSet {
    pub const ALL: [ChunkSet; 4] = [
        ChunkSet::Pending,
        ChunkSet::Active,
        ChunkSet::Errored,
        ChunkSet::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSet::Pending => "pending",
            ChunkSet::Active => "active",
            ChunkSet::Errored => "errored",
            ChunkSet::Done => "done",
        }
    }

    pub fn is_sorted(&self) -> bool {
        matches!(self, ChunkSet::Active | ChunkSet::Errored)
    }
}

/// Builds store keys for one queue prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of a queue-level collection.
    pub fn set(&self, set: QueueSet) -> String {
        format!("{}{}", self.prefix, set.as_str())
    }

    /// Full task id for a worker-local id.
    pub fn task_id(&self, worker: &str, local_id: &str) -> String {
        format!("{}{}:{}", self.prefix, worker, local_id)
    }

    /// Extracts the worker name from a task id, if the id belongs to this
    /// prefix.
    pub fn worker_of<'a>(&self, task_id: &'a str) -> Option<&'a str> {
        task_id
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.split_once(':'))
            .map(|(worker, _)| worker)
    }

    /// Mutex key for one scheduled cron fire.
    pub fn cron_lock(&self, worker: &str, fire_at_secs: i64) -> String {
        format!("{}cron:{}:{}", self.prefix, worker, fire_at_secs)
    }

    /// Hash holding the postponed copy of a task.
    pub fn postponed_hash(task_id: &str) -> String {
        format!("{}:postponed", task_id)
    }

    /// Key of a per-task chunk collection.
    pub fn chunk_set(task_id: &str, set: ChunkSet) -> String {
        format!("{}:chunks:{}", task_id, set.as_str())
    }

    /// Chunk id for the chunk produced at `index` by `map`.
    pub fn chunk_id(task_id: &str, index: usize) -> String {
        format!("{}:{}", task_id, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_set_keys() {
        let keys = Keys::default();
        assert_eq!(keys.set(QueueSet::Pending), "queue:pending");
        assert_eq!(keys.set(QueueSet::Reducing), "queue:reducing");
        assert!(QueueSet::Mapping.is_sorted());
        assert!(!QueueSet::Aggregating.is_sorted());
    }

    #[test]
    fn test_task_and_chunk_keys() {
        let keys = Keys::new("jobs:");
        let task_id = keys.task_id("resize", "abc");

        assert_eq!(task_id, "jobs:resize:abc");
        assert_eq!(Keys::postponed_hash(&task_id), "jobs:resize:abc:postponed");
        assert_eq!(
            Keys::chunk_set(&task_id, ChunkSet::Errored),
            "jobs:resize:abc:chunks:errored"
        );
        assert_eq!(Keys::chunk_id(&task_id, 3), "jobs:resize:abc:3");
        assert_eq!(keys.cron_lock("resize", 1700000000), "jobs:cron:resize:1700000000");
    }

    #[test]
    fn test_worker_of() {
        let keys = Keys::default();

        assert_eq!(keys.worker_of("queue:resize:abc"), Some("resize"));
        assert_eq!(keys.worker_of("queue:resize:abc:0"), Some("resize"));
        assert_eq!(keys.worker_of("other:resize:abc"), None);
        assert_eq!(keys.worker_of("queue:resize"), None);
    }
}
