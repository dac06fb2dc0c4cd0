//! Shared store adapters.
//!
//! The engine talks to the shared store only through the [`Store`] trait:
//! reads are plain queries, and every mutation is an atomic [`Transition`].
//!
//! - [`RedisStore`]: production backend, transitions run as Lua scripts
//! - [`MemoryStore`]: in-process backend with the same transition semantics
//!   and an optional manual clock; several engines sharing one instance
//!   behave like a fleet of processes sharing one Redis

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod scripts;
pub mod transition;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use keys::{ChunkSet, Keys, QueueSet, DEFAULT_PREFIX};
pub use transition::{LeasedStage, Outcome, Transition};

/// Fields of a task hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// Worker name (`type` field).
    pub worker: String,
    /// Serialized JSON input.
    pub data: String,
    /// Retry counter of the current stage.
    pub retries: u32,
    /// Last recorded state name.
    pub state: Option<String>,
}

/// Fields of a chunk hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Serialized JSON chunk data.
    pub data: String,
    pub retries: u32,
    /// Serialized JSON result, set once processed.
    pub result: Option<String>,
}

/// Number of chunks in each per-task collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounts {
    pub pending: usize,
    pub active: usize,
    pub errored: usize,
    pub done: usize,
}

impl ChunkCounts {
    /// Whether every chunk has reached `done`.
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.active == 0 && self.errored == 0
    }

    pub fn total(&self) -> usize {
        self.pending + self.active + self.errored + self.done
    }
}

/// A shared store holding queue state.
///
/// Implementations must execute each [`Transition`] atomically with respect
/// to every other client of the same store, and must answer [`Store::now`]
/// from a clock shared by all clients.
#[async_trait]
pub trait Store: Send + Sync {
    /// Key schema used by this store.
    fn keys(&self) -> &Keys;

    /// Shared clock in milliseconds.
    async fn now(&self) -> Result<i64, StoreError>;

    /// Apply one atomic transition.
    async fn apply(&self, transition: Transition) -> Result<Outcome, StoreError>;

    async fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    async fn chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, StoreError>;

    /// Ids and scores of a sorted queue set with score ≤ `until`.
    async fn due(&self, set: QueueSet, until: i64) -> Result<Vec<(String, i64)>, StoreError>;

    /// All ids of a queue set.
    async fn members(&self, set: QueueSet) -> Result<Vec<String>, StoreError>;

    /// Cardinality of a queue set.
    async fn count(&self, set: QueueSet) -> Result<usize, StoreError>;

    async fn chunk_counts(&self, task_id: &str) -> Result<ChunkCounts, StoreError>;

    /// Up to `limit` pending chunk ids picked at random, or all of them
    /// when `limit` is `None`.
    async fn pending_chunks(
        &self,
        task_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Serialized results of the task's done chunks, in no particular order.
    async fn chunk_results(&self, task_id: &str) -> Result<Vec<String>, StoreError>;

    /// Set `key` if absent, expiring after `ttl`. Returns whether this call
    /// acquired it.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_counts() {
        let counts = ChunkCounts {
            pending: 0,
            active: 0,
            errored: 0,
            done: 4,
        };
        assert!(counts.is_finished());
        assert_eq!(counts.total(), 4);

        let counts = ChunkCounts {
            errored: 1,
            ..counts
        };
        assert!(!counts.is_finished());
    }
}
