//! Distributed map-reduce scheduling.
//!
//! Every process registers the same workers and runs its own tick loop
//! against a shared store. Tasks move through
//!
//! ```text
//!  postponed ──► pending ──► mapping ──► aggregating ──► reducing ──► (deleted)
//!                              │  ▲          │  chunks:                 │  ▲
//!                              └──┘          │  pending ─► active ─► done
//!                            retry/          │     ▲          │         └──┘
//!                            watchdog        │     └─ errored ◄┘       retry/
//!                                                                       watchdog
//! ```
//!
//! and every move is one atomic store transition, so exactly one process
//! performs any given step. Running stages hold a lease (the deadline score
//! of the task or chunk); a process that crashes mid-stage simply lets the
//! lease expire and another process picks the work up.
//!
//! # Example
//!
//! ```rust,ignore
//! use forge_queue::{QueueBuilder, RedisStore, WorkerDefinition};
//! use std::sync::Arc;
//!
//! let store = RedisStore::connect("redis://localhost:6379", "queue:").await?;
//! let queue = QueueBuilder::new(Arc::new(store))
//!     .register_worker(WorkerDefinition::from_fn("resize", |image| async move {
//!         Ok(resize(image).await?)
//!     }))?
//!     .build();
//!
//! queue.start()?;
//! queue.push("resize", &serde_json::json!({"path": "a.png"})).await?;
//!
//! // Graceful shutdown
//! queue.shutdown().await;
//! ```

pub mod cron;
pub(crate) mod engine;
pub mod queue;
pub mod task;
pub mod worker;

pub use engine::ErrorEvent;
pub use queue::{Queue, QueueBuilder, QueueStats};
pub use task::{Chunk, Task, TaskState};
pub use worker::{FnJob, Job, TaskIdFn, Worker, WorkerDefinition, WorkerRegistry};
