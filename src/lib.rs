//! forge-queue: distributed map-reduce task queue over a shared store.
//!
//! Worker processes register named job types, push or schedule tasks, split
//! each task into chunks that are processed in parallel across the fleet,
//! and reduce the results, surviving the crash of any single process.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

pub use config::{ConfigError, QueueConfig};
pub use error::{JobFailure, QueueError, StoreError};
pub use scheduler::{
    Chunk, ErrorEvent, Job, Queue, QueueBuilder, QueueStats, Task, TaskState, WorkerDefinition,
};
pub use store::{MemoryStore, RedisStore, Store};
