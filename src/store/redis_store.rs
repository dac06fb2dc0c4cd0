//! Redis-backed store.
//!
//! Transitions run as Lua scripts (`EVALSHA` with automatic `SCRIPT LOAD`
//! fallback), so each one is atomic across every process sharing the
//! server. The clock is Redis `TIME`, which keeps lease deadlines
//! consistent across hosts whose local clocks drift.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::keys::{ChunkSet, Keys, QueueSet};
use super::scripts;
use super::transition::{Outcome, Transition};
use super::{ChunkCounts, ChunkRecord, Store, TaskRecord};
use crate::error::StoreError;

/// Compiled transition scripts.
struct Scripts {
    task_add: Script,
    task_add_postponed: Script,
    task_postponed_to_pending: Script,
    task_pending_to_mapping: Script,
    task_retry_stage: Script,
    task_mapping_to_aggregating: Script,
    task_aggregating_to_reducing: Script,
    task_delete: Script,
    task_extend_lease: Script,
    chunk_pending_to_active: Script,
    chunk_active_to_done: Script,
    chunk_active_to_errored: Script,
    chunk_requeue: Script,
    chunk_extend_lease: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            task_add: Script::new(scripts::TASK_ADD),
            task_add_postponed: Script::new(scripts::TASK_ADD_POSTPONED),
            task_postponed_to_pending: Script::new(scripts::TASK_POSTPONED_TO_PENDING),
            task_pending_to_mapping: Script::new(scripts::TASK_PENDING_TO_MAPPING),
            task_retry_stage: Script::new(&scripts::with_delete_task(scripts::TASK_RETRY_STAGE)),
            task_mapping_to_aggregating: Script::new(scripts::TASK_MAPPING_TO_AGGREGATING),
            task_aggregating_to_reducing: Script::new(scripts::TASK_AGGREGATING_TO_REDUCING),
            task_delete: Script::new(&scripts::with_delete_task(scripts::TASK_DELETE)),
            task_extend_lease: Script::new(scripts::TASK_EXTEND_LEASE),
            chunk_pending_to_active: Script::new(scripts::CHUNK_PENDING_TO_ACTIVE),
            chunk_active_to_done: Script::new(scripts::CHUNK_ACTIVE_TO_DONE),
            chunk_active_to_errored: Script::new(scripts::CHUNK_ACTIVE_TO_ERRORED),
            chunk_requeue: Script::new(scripts::CHUNK_REQUEUE),
            chunk_extend_lease: Script::new(scripts::CHUNK_EXTEND_LEASE),
        }
    }
}

/// Store backed by a Redis server.
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Prefix for every key written by the queue
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            keys: Keys::new(prefix),
            scripts: Scripts::load(),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn now(&self) -> Result<i64, StoreError> {
        let mut conn = self.redis.clone();
        // Reply is unix seconds and microseconds
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + (micros + 500) / 1000)
    }

    async fn apply(&self, transition: Transition) -> Result<Outcome, StoreError> {
        let prefix = self.keys.prefix();
        let s = &self.scripts;

        let invocation = match &transition {
            Transition::AddTask {
                task_id,
                worker,
                data,
            } => {
                let mut inv = s.task_add.prepare_invoke();
                inv.key(prefix).key(task_id).arg(worker).arg(data);
                inv
            }
            Transition::AddPostponed {
                task_id,
                worker,
                data,
                due_at,
            } => {
                let mut inv = s.task_add_postponed.prepare_invoke();
                inv.key(prefix)
                    .key(task_id)
                    .arg(worker)
                    .arg(data)
                    .arg(*due_at);
                inv
            }
            Transition::PostponedToPending { task_id, now } => {
                let mut inv = s.task_postponed_to_pending.prepare_invoke();
                inv.key(prefix).key(task_id).arg(*now);
                inv
            }
            Transition::PendingToMapping { task_id, deadline } => {
                let mut inv = s.task_pending_to_mapping.prepare_invoke();
                inv.key(prefix).key(task_id).arg(*deadline);
                inv
            }
            Transition::RetryStage {
                stage,
                task_id,
                deadline,
                expected,
                max_retries,
            } => {
                let max_retries = max_retries.map(|m| m.to_string()).unwrap_or_default();
                let mut inv = s.task_retry_stage.prepare_invoke();
                inv.key(prefix)
                    .key(task_id)
                    .arg(stage.as_str())
                    .arg(*deadline)
                    .arg(*expected)
                    .arg(max_retries);
                inv
            }
            Transition::MappingToAggregating { task_id, chunks } => {
                let mut inv = s.task_mapping_to_aggregating.prepare_invoke();
                inv.key(prefix).key(task_id);
                for (chunk_id, data) in chunks {
                    inv.arg(chunk_id).arg(data);
                }
                inv
            }
            Transition::AggregatingToReducing { task_id, deadline } => {
                let mut inv = s.task_aggregating_to_reducing.prepare_invoke();
                inv.key(prefix).key(task_id).arg(*deadline);
                inv
            }
            Transition::ChunkPendingToActive {
                task_id,
                chunk_id,
                deadline,
                max_retries,
            } => {
                let mut inv = s.chunk_pending_to_active.prepare_invoke();
                inv.key(task_id)
                    .key(chunk_id)
                    .arg(*deadline)
                    .arg(*max_retries);
                inv
            }
            Transition::ChunkActiveToDone {
                task_id,
                chunk_id,
                result,
            } => {
                let mut inv = s.chunk_active_to_done.prepare_invoke();
                inv.key(task_id).key(chunk_id).arg(result);
                inv
            }
            Transition::ChunkActiveToErrored {
                task_id,
                chunk_id,
                retry_at,
                expected,
            } => {
                let mut inv = s.chunk_active_to_errored.prepare_invoke();
                inv.key(task_id)
                    .key(chunk_id)
                    .arg(*retry_at)
                    .arg(*expected);
                inv
            }
            Transition::RequeueChunks { task_id, now } => {
                let mut inv = s.chunk_requeue.prepare_invoke();
                inv.key(task_id).arg(*now);
                inv
            }
            Transition::DeleteTask { task_id } => {
                let mut inv = s.task_delete.prepare_invoke();
                inv.key(prefix).key(task_id);
                inv
            }
            Transition::ExtendTaskLease { task_id, deadline } => {
                let mut inv = s.task_extend_lease.prepare_invoke();
                inv.key(prefix).key(task_id).arg(*deadline);
                inv
            }
            Transition::ExtendChunkLease {
                task_id,
                chunk_id,
                deadline,
            } => {
                let mut inv = s.chunk_extend_lease.prepare_invoke();
                inv.key(task_id).key(chunk_id).arg(*deadline);
                inv
            }
        };

        let mut conn = self.redis.clone();
        let code: i64 = invocation.invoke_async(&mut conn).await?;

        tracing::trace!(script = transition.name(), code, "Applied transition script");

        Ok(Outcome::from_code(code))
    }

    async fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let (worker, data, retries, state): (
            Option<String>,
            Option<String>,
            Option<u32>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(task_id)
            .arg("type")
            .arg("data")
            .arg("retries")
            .arg("state")
            .query_async(&mut conn)
            .await?;

        Ok(worker.map(|worker| TaskRecord {
            worker,
            data: data.unwrap_or_else(|| "null".to_string()),
            retries: retries.unwrap_or(0),
            state,
        }))
    }

    async fn chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let (data, retries, result): (Option<String>, Option<u32>, Option<String>) =
            redis::cmd("HMGET")
                .arg(chunk_id)
                .arg("data")
                .arg("retries")
                .arg("result")
                .query_async(&mut conn)
                .await?;

        Ok(data.map(|data| ChunkRecord {
            data,
            retries: retries.unwrap_or(0),
            result,
        }))
    }

    async fn due(&self, set: QueueSet, until: i64) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.redis.clone();
        let rows: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(self.keys.set(set), "-inf", until)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, score)| (id, score as i64))
            .collect())
    }

    async fn members(&self, set: QueueSet) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let key = self.keys.set(set);
        let members: Vec<String> = if set.is_sorted() {
            conn.zrange(key, 0, -1).await?
        } else {
            conn.smembers(key).await?
        };
        Ok(members)
    }

    async fn count(&self, set: QueueSet) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let key = self.keys.set(set);
        let count: usize = if set.is_sorted() {
            conn.zcard(key).await?
        } else {
            conn.scard(key).await?
        };
        Ok(count)
    }

    async fn chunk_counts(&self, task_id: &str) -> Result<ChunkCounts, StoreError> {
        let mut conn = self.redis.clone();
        let (pending, active, errored, done): (usize, usize, usize, usize) = redis::pipe()
            .scard(Keys::chunk_set(task_id, ChunkSet::Pending))
            .zcard(Keys::chunk_set(task_id, ChunkSet::Active))
            .zcard(Keys::chunk_set(task_id, ChunkSet::Errored))
            .scard(Keys::chunk_set(task_id, ChunkSet::Done))
            .query_async(&mut conn)
            .await?;

        Ok(ChunkCounts {
            pending,
            active,
            errored,
            done,
        })
    }

    async fn pending_chunks(
        &self,
        task_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let key = Keys::chunk_set(task_id, ChunkSet::Pending);
        let chunk_ids: Vec<String> = match limit {
            Some(0) => Vec::new(),
            Some(limit) => conn.srandmember_multiple(key, limit).await?,
            None => conn.smembers(key).await?,
        };
        Ok(chunk_ids)
    }

    async fn chunk_results(&self, task_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let chunk_ids: Vec<String> = conn
            .smembers(Keys::chunk_set(task_id, ChunkSet::Done))
            .await?;

        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for chunk_id in &chunk_ids {
            pipe.hget(chunk_id, "result");
        }
        let results: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        Ok(results.into_iter().flatten().collect())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(key)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }
}
