//! In-process store.
//!
//! Mirrors the Redis data model (hashes, sets, sorted sets, expiring locks)
//! behind one mutex, so every [`Transition`] is atomic exactly like its Lua
//! counterpart. Cloning a `MemoryStore` shares the underlying state, which
//! lets several engines in one process act as independent queue processes.
//!
//! A manual clock makes lease expiry and postponement deterministic in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::keys::{ChunkSet, Keys, QueueSet};
use super::transition::{Outcome, Transition};
use super::{ChunkCounts, ChunkRecord, Store, TaskRecord};
use crate::error::StoreError;

enum Clock {
    System,
    Manual(AtomicI64),
}

impl Clock {
    fn now(&self) -> i64 {
        match self {
            Clock::System => chrono::Utc::now().timestamp_millis(),
            Clock::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    /// Lock key → expiry time in ms.
    locks: HashMap<String, i64>,
}

impl State {
    fn exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key) || self.sets.contains_key(key) || self.zsets.contains_key(key)
    }

    fn del(&mut self, key: &str) {
        self.hashes.remove(key);
        self.sets.remove(key);
        self.zsets.remove(key);
    }

    fn hset(&mut self, key: &str, fields: &[(&str, String)]) {
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
    }

    fn hget(&self, key: &str, field: &str) -> Option<&String> {
        self.hashes.get(key).and_then(|hash| hash.get(field))
    }

    fn hincrby(&mut self, key: &str, field: &str, by: i64) -> i64 {
        let hash = self.hashes.entry(key.to_string()).or_default();
        let value = hash
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + by;
        hash.insert(field.to_string(), value.to_string());
        value
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    fn sismember(&self, key: &str, member: &str) -> bool {
        self.sets.get(key).is_some_and(|set| set.contains(member))
    }

    fn smembers(&self, key: &str) -> Vec<String> {
        self.sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn scard(&self, key: &str) -> usize {
        self.sets.get(key).map_or(0, HashSet::len)
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.zsets.get(key).and_then(|zset| zset.get(member).copied())
    }

    fn zcard(&self, key: &str) -> usize {
        self.zsets.get(key).map_or(0, HashMap::len)
    }

    /// Members with score ≤ `until`, ordered by score.
    fn zrangebyscore(&self, key: &str, until: i64) -> Vec<(String, i64)> {
        let mut rows: Vec<(String, i64)> = self
            .zsets
            .get(key)
            .map(|zset| {
                zset.iter()
                    .filter(|(_, score)| **score <= until)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }

    fn zmembers(&self, key: &str) -> Vec<String> {
        let mut rows: Vec<(String, i64)> = self
            .zsets
            .get(key)
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        rows.into_iter().map(|(member, _)| member).collect()
    }

    fn delete_task(&mut self, keys: &Keys, task_id: &str) {
        for set in ChunkSet::ALL {
            let set_key = Keys::chunk_set(task_id, set);
            let members = if set.is_sorted() {
                self.zmembers(&set_key)
            } else {
                self.smembers(&set_key)
            };
            for chunk_id in members {
                self.del(&chunk_id);
            }
            self.del(&set_key);
        }
        self.srem(&keys.set(QueueSet::Pending), task_id);
        self.zrem(&keys.set(QueueSet::Mapping), task_id);
        self.srem(&keys.set(QueueSet::Aggregating), task_id);
        self.zrem(&keys.set(QueueSet::Reducing), task_id);
        self.del(task_id);
    }

    fn apply(&mut self, keys: &Keys, transition: Transition) -> i64 {
        match transition {
            Transition::AddTask {
                task_id,
                worker,
                data,
            } => {
                if self.exists(&task_id) {
                    return 0;
                }
                self.hset(
                    &task_id,
                    &[
                        ("type", worker),
                        ("data", data),
                        ("retries", "0".to_string()),
                        ("state", "pending".to_string()),
                    ],
                );
                self.sadd(&keys.set(QueueSet::Pending), &task_id);
                1
            }

            Transition::AddPostponed {
                task_id,
                worker,
                data,
                due_at,
            } => {
                let postponed = keys.set(QueueSet::Postponed);
                if self.zscore(&postponed, &task_id).is_some() {
                    return 0;
                }
                self.hset(
                    &Keys::postponed_hash(&task_id),
                    &[("type", worker), ("data", data)],
                );
                self.zadd(&postponed, due_at, &task_id);
                1
            }

            Transition::PostponedToPending { task_id, now } => {
                let postponed = keys.set(QueueSet::Postponed);
                match self.zscore(&postponed, &task_id) {
                    Some(due_at) if due_at <= now => {}
                    _ => return 0,
                }
                if self.exists(&task_id) {
                    return 0;
                }
                let hash_key = Keys::postponed_hash(&task_id);
                let worker = self.hget(&hash_key, "type").cloned();
                let data = self.hget(&hash_key, "data").cloned();
                self.zrem(&postponed, &task_id);
                self.del(&hash_key);
                let Some(worker) = worker else {
                    return 0;
                };
                self.hset(
                    &task_id,
                    &[
                        ("type", worker),
                        ("data", data.unwrap_or_else(|| "null".to_string())),
                        ("retries", "0".to_string()),
                        ("state", "pending".to_string()),
                    ],
                );
                self.sadd(&keys.set(QueueSet::Pending), &task_id);
                1
            }

            Transition::PendingToMapping { task_id, deadline } => {
                if !self.srem(&keys.set(QueueSet::Pending), &task_id) {
                    return 0;
                }
                self.zadd(&keys.set(QueueSet::Mapping), deadline, &task_id);
                self.hset(&task_id, &[("state", "mapping".to_string())]);
                1
            }

            Transition::RetryStage {
                stage,
                task_id,
                deadline,
                expected,
                max_retries,
            } => {
                let set_key = keys.set(stage.set());
                if self.zscore(&set_key, &task_id) != Some(expected) {
                    return 0;
                }
                if let Some(max_retries) = max_retries {
                    let retries = self.hincrby(&task_id, "retries", 1);
                    if retries > i64::from(max_retries) {
                        self.delete_task(keys, &task_id);
                        return -1;
                    }
                }
                self.zadd(&set_key, deadline, &task_id);
                1
            }

            Transition::MappingToAggregating { task_id, chunks } => {
                if !self.zrem(&keys.set(QueueSet::Mapping), &task_id) {
                    return 0;
                }
                let pending = Keys::chunk_set(&task_id, ChunkSet::Pending);
                for (chunk_id, data) in chunks {
                    self.hset(&chunk_id, &[("data", data), ("retries", "0".to_string())]);
                    self.sadd(&pending, &chunk_id);
                }
                self.sadd(&keys.set(QueueSet::Aggregating), &task_id);
                self.hset(&task_id, &[("state", "aggregating".to_string())]);
                1
            }

            Transition::AggregatingToReducing { task_id, deadline } => {
                let aggregating = keys.set(QueueSet::Aggregating);
                if !self.sismember(&aggregating, &task_id) {
                    return 0;
                }
                let unfinished = self.scard(&Keys::chunk_set(&task_id, ChunkSet::Pending))
                    + self.zcard(&Keys::chunk_set(&task_id, ChunkSet::Active))
                    + self.zcard(&Keys::chunk_set(&task_id, ChunkSet::Errored));
                if unfinished > 0 {
                    return 0;
                }
                self.srem(&aggregating, &task_id);
                self.zadd(&keys.set(QueueSet::Reducing), deadline, &task_id);
                self.hset(
                    &task_id,
                    &[
                        ("state", "reducing".to_string()),
                        ("retries", "0".to_string()),
                    ],
                );
                1
            }

            Transition::ChunkPendingToActive {
                task_id,
                chunk_id,
                deadline,
                max_retries,
            } => {
                let pending = Keys::chunk_set(&task_id, ChunkSet::Pending);
                if !self.srem(&pending, &chunk_id) {
                    return 0;
                }
                let retries = self
                    .hget(&chunk_id, "retries")
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                if retries > i64::from(max_retries) {
                    self.del(&chunk_id);
                    return -1;
                }
                self.zadd(
                    &Keys::chunk_set(&task_id, ChunkSet::Active),
                    deadline,
                    &chunk_id,
                );
                1
            }

            Transition::ChunkActiveToDone {
                task_id,
                chunk_id,
                result,
            } => {
                if !self.zrem(&Keys::chunk_set(&task_id, ChunkSet::Active), &chunk_id) {
                    return 0;
                }
                self.sadd(&Keys::chunk_set(&task_id, ChunkSet::Done), &chunk_id);
                self.hset(&chunk_id, &[("result", result)]);
                1
            }

            Transition::ChunkActiveToErrored {
                task_id,
                chunk_id,
                retry_at,
                expected,
            } => {
                let active = Keys::chunk_set(&task_id, ChunkSet::Active);
                if self.zscore(&active, &chunk_id) != Some(expected) {
                    return 0;
                }
                self.zrem(&active, &chunk_id);
                self.zadd(
                    &Keys::chunk_set(&task_id, ChunkSet::Errored),
                    retry_at,
                    &chunk_id,
                );
                1
            }

            Transition::RequeueChunks { task_id, now } => {
                let pending = Keys::chunk_set(&task_id, ChunkSet::Pending);
                let mut moved = 0;
                for set in [ChunkSet::Errored, ChunkSet::Active] {
                    let set_key = Keys::chunk_set(&task_id, set);
                    for (chunk_id, _) in self.zrangebyscore(&set_key, now) {
                        self.zrem(&set_key, &chunk_id);
                        self.hincrby(&chunk_id, "retries", 1);
                        self.sadd(&pending, &chunk_id);
                        moved += 1;
                    }
                }
                moved
            }

            Transition::DeleteTask { task_id } => {
                self.delete_task(keys, &task_id);
                1
            }

            Transition::ExtendTaskLease { task_id, deadline } => {
                let mut updated = 0;
                for set in [QueueSet::Mapping, QueueSet::Reducing] {
                    let set_key = keys.set(set);
                    if self.zscore(&set_key, &task_id).is_some() {
                        self.zadd(&set_key, deadline, &task_id);
                        updated = 1;
                    }
                }
                updated
            }

            Transition::ExtendChunkLease {
                task_id,
                chunk_id,
                deadline,
            } => {
                let active = Keys::chunk_set(&task_id, ChunkSet::Active);
                if self.zscore(&active, &chunk_id).is_none() {
                    return 0;
                }
                self.zadd(&active, deadline, &chunk_id);
                1
            }
        }
    }
}

struct Inner {
    keys: Keys,
    clock: Clock,
    state: Mutex<State>,
}

/// Store kept in process memory.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates an empty store driven by the system clock.
    pub fn new(prefix: &str) -> Self {
        Self::with_clock(prefix, Clock::System)
    }

    /// Creates an empty store whose clock only moves when told to.
    pub fn with_manual_clock(prefix: &str, start_ms: i64) -> Self {
        Self::with_clock(prefix, Clock::Manual(AtomicI64::new(start_ms)))
    }

    fn with_clock(prefix: &str, clock: Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                keys: Keys::new(prefix),
                clock,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Moves a manual clock forward. No-op on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(ms) = &self.inner.clock {
            ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
        }
    }

    /// Sets a manual clock. No-op on the system clock.
    pub fn set_time(&self, now_ms: i64) {
        if let Clock::Manual(ms) = &self.inner.clock {
            ms.store(now_ms, Ordering::SeqCst);
        }
    }

    /// Whether any key exists for `key`. Used to check that deleted tasks
    /// leave nothing behind.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state().map(|state| state.exists(key)).unwrap_or(false)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.inner
            .state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(super::DEFAULT_PREFIX)
    }
}

fn parse_retries(key: &str, value: Option<&String>) -> Result<u32, StoreError> {
    match value {
        None => Ok(0),
        Some(v) => v.parse().map_err(|_| StoreError::MalformedRecord {
            key: key.to_string(),
            reason: format!("retries is not a counter: {}", v),
        }),
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn keys(&self) -> &Keys {
        &self.inner.keys
    }

    async fn now(&self) -> Result<i64, StoreError> {
        Ok(self.inner.clock.now())
    }

    async fn apply(&self, transition: Transition) -> Result<Outcome, StoreError> {
        let name = transition.name();
        let code = self.state()?.apply(&self.inner.keys, transition);
        tracing::trace!(script = name, code, "Applied transition");
        Ok(Outcome::from_code(code))
    }

    async fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state()?;
        let Some(hash) = state.hashes.get(task_id) else {
            return Ok(None);
        };
        let Some(worker) = hash.get("type") else {
            return Ok(None);
        };
        Ok(Some(TaskRecord {
            worker: worker.clone(),
            data: hash
                .get("data")
                .cloned()
                .unwrap_or_else(|| "null".to_string()),
            retries: parse_retries(task_id, hash.get("retries"))?,
            state: hash.get("state").cloned(),
        }))
    }

    async fn chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, StoreError> {
        let state = self.state()?;
        let Some(hash) = state.hashes.get(chunk_id) else {
            return Ok(None);
        };
        let Some(data) = hash.get("data") else {
            return Ok(None);
        };
        Ok(Some(ChunkRecord {
            data: data.clone(),
            retries: parse_retries(chunk_id, hash.get("retries"))?,
            result: hash.get("result").cloned(),
        }))
    }

    async fn due(&self, set: QueueSet, until: i64) -> Result<Vec<(String, i64)>, StoreError> {
        Ok(self.state()?.zrangebyscore(&self.inner.keys.set(set), until))
    }

    async fn members(&self, set: QueueSet) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        let key = self.inner.keys.set(set);
        Ok(if set.is_sorted() {
            state.zmembers(&key)
        } else {
            state.smembers(&key)
        })
    }

    async fn count(&self, set: QueueSet) -> Result<usize, StoreError> {
        let state = self.state()?;
        let key = self.inner.keys.set(set);
        Ok(if set.is_sorted() {
            state.zcard(&key)
        } else {
            state.scard(&key)
        })
    }

    async fn chunk_counts(&self, task_id: &str) -> Result<ChunkCounts, StoreError> {
        let state = self.state()?;
        Ok(ChunkCounts {
            pending: state.scard(&Keys::chunk_set(task_id, ChunkSet::Pending)),
            active: state.zcard(&Keys::chunk_set(task_id, ChunkSet::Active)),
            errored: state.zcard(&Keys::chunk_set(task_id, ChunkSet::Errored)),
            done: state.scard(&Keys::chunk_set(task_id, ChunkSet::Done)),
        })
    }

    async fn pending_chunks(
        &self,
        task_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut chunk_ids = self
            .state()?
            .smembers(&Keys::chunk_set(task_id, ChunkSet::Pending));
        if let Some(limit) = limit {
            chunk_ids.shuffle(&mut rand::rng());
            chunk_ids.truncate(limit);
        }
        Ok(chunk_ids)
    }

    async fn chunk_results(&self, task_id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .smembers(&Keys::chunk_set(task_id, ChunkSet::Done))
            .iter()
            .filter_map(|chunk_id| state.hget(chunk_id, "result").cloned())
            .collect())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.inner.clock.now();
        let mut state = self.state()?;
        if state.locks.get(key).is_some_and(|expires| *expires > now) {
            return Ok(false);
        }
        let ttl_ms = ttl.as_secs().max(1) as i64 * 1000;
        state.locks.insert(key.to_string(), now + ttl_ms);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LeasedStage;

    fn add(task_id: &str) -> Transition {
        Transition::AddTask {
            task_id: task_id.to_string(),
            worker: "w".to_string(),
            data: "{\"n\":1}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_task_is_idempotent() {
        let store = MemoryStore::with_manual_clock("queue:", 0);

        let first = store.apply(add("queue:w:1")).await.unwrap();
        let second = store.apply(add("queue:w:1")).await.unwrap();

        assert_eq!(first, Outcome::Applied);
        assert_eq!(second, Outcome::Skipped);
        assert_eq!(store.count(QueueSet::Pending).await.unwrap(), 1);

        let task = store.task("queue:w:1").await.unwrap().unwrap();
        assert_eq!(task.worker, "w");
        assert_eq!(task.retries, 0);
        assert_eq!(task.state.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn test_pending_claim_is_exclusive() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        store.apply(add("queue:w:1")).await.unwrap();

        let claim = || Transition::PendingToMapping {
            task_id: "queue:w:1".to_string(),
            deadline: 100,
        };
        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(a.apply(claim()), b.apply(claim()));

        let applied = [ra.unwrap(), rb.unwrap()]
            .iter()
            .filter(|o| o.is_applied())
            .count();
        assert_eq!(applied, 1);
        assert_eq!(store.due(QueueSet::Mapping, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_stage_rejects_stale_deadline() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        store.apply(add("queue:w:1")).await.unwrap();
        store
            .apply(Transition::PendingToMapping {
                task_id: "queue:w:1".to_string(),
                deadline: 100,
            })
            .await
            .unwrap();

        let stale = store
            .apply(Transition::RetryStage {
                stage: LeasedStage::Mapping,
                task_id: "queue:w:1".to_string(),
                deadline: 500,
                expected: 99,
                max_retries: None,
            })
            .await
            .unwrap();
        assert_eq!(stale, Outcome::Skipped);

        let fresh = store
            .apply(Transition::RetryStage {
                stage: LeasedStage::Mapping,
                task_id: "queue:w:1".to_string(),
                deadline: 500,
                expected: 100,
                max_retries: None,
            })
            .await
            .unwrap();
        assert_eq!(fresh, Outcome::Applied);
        assert_eq!(
            store.due(QueueSet::Mapping, 1000).await.unwrap(),
            vec![("queue:w:1".to_string(), 500)]
        );
    }

    #[tokio::test]
    async fn test_watchdog_rearm_deletes_after_budget() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        store.apply(add("queue:w:1")).await.unwrap();
        store
            .apply(Transition::PendingToMapping {
                task_id: "queue:w:1".to_string(),
                deadline: 0,
            })
            .await
            .unwrap();

        let rearm = |expected, deadline| Transition::RetryStage {
            stage: LeasedStage::Mapping,
            task_id: "queue:w:1".to_string(),
            deadline,
            expected,
            max_retries: Some(1),
        };

        assert_eq!(store.apply(rearm(0, 10)).await.unwrap(), Outcome::Applied);
        assert_eq!(
            store.apply(rearm(10, 20)).await.unwrap(),
            Outcome::Exhausted
        );
        assert!(!store.contains_key("queue:w:1"));
        assert_eq!(store.count(QueueSet::Mapping).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chunk_lifecycle_and_exhaustion() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        let task_id = "queue:w:1";
        store.apply(add(task_id)).await.unwrap();
        store
            .apply(Transition::PendingToMapping {
                task_id: task_id.to_string(),
                deadline: 100,
            })
            .await
            .unwrap();
        store
            .apply(Transition::MappingToAggregating {
                task_id: task_id.to_string(),
                chunks: vec![
                    (Keys::chunk_id(task_id, 0), "1".to_string()),
                    (Keys::chunk_id(task_id, 1), "2".to_string()),
                ],
            })
            .await
            .unwrap();

        let chunk0 = Keys::chunk_id(task_id, 0);
        let chunk1 = Keys::chunk_id(task_id, 1);
        let claim = |chunk_id: &str| Transition::ChunkPendingToActive {
            task_id: task_id.to_string(),
            chunk_id: chunk_id.to_string(),
            deadline: 50,
            max_retries: 0,
        };

        assert!(store.apply(claim(&chunk0)).await.unwrap().is_applied());
        store
            .apply(Transition::ChunkActiveToDone {
                task_id: task_id.to_string(),
                chunk_id: chunk0.clone(),
                result: "10".to_string(),
            })
            .await
            .unwrap();

        // Chunk 1 expires once, then exceeds a zero retry budget on claim
        assert!(store.apply(claim(&chunk1)).await.unwrap().is_applied());
        let moved = store
            .apply(Transition::RequeueChunks {
                task_id: task_id.to_string(),
                now: 60,
            })
            .await
            .unwrap();
        assert_eq!(moved, Outcome::Applied);
        assert_eq!(store.chunk(&chunk1).await.unwrap().unwrap().retries, 1);
        assert_eq!(
            store.apply(claim(&chunk1)).await.unwrap(),
            Outcome::Exhausted
        );

        let counts = store.chunk_counts(task_id).await.unwrap();
        assert!(counts.is_finished());
        assert_eq!(counts.done, 1);
        assert_eq!(
            store.chunk_results(task_id).await.unwrap(),
            vec!["10".to_string()]
        );

        let reduced = store
            .apply(Transition::AggregatingToReducing {
                task_id: task_id.to_string(),
                deadline: 200,
            })
            .await
            .unwrap();
        assert!(reduced.is_applied());
        assert_eq!(
            store.task(task_id).await.unwrap().unwrap().state.as_deref(),
            Some("reducing")
        );
    }

    #[tokio::test]
    async fn test_postponed_promotion() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        store
            .apply(Transition::AddPostponed {
                task_id: "queue:w:p".to_string(),
                worker: "w".to_string(),
                data: "null".to_string(),
                due_at: 1000,
            })
            .await
            .unwrap();

        let early = store
            .apply(Transition::PostponedToPending {
                task_id: "queue:w:p".to_string(),
                now: 999,
            })
            .await
            .unwrap();
        assert_eq!(early, Outcome::Skipped);

        let due = store
            .apply(Transition::PostponedToPending {
                task_id: "queue:w:p".to_string(),
                now: 1000,
            })
            .await
            .unwrap();
        assert_eq!(due, Outcome::Applied);
        assert_eq!(store.count(QueueSet::Postponed).await.unwrap(), 0);
        assert_eq!(store.members(QueueSet::Pending).await.unwrap(), vec!["queue:w:p"]);
        assert!(!store.contains_key("queue:w:p:postponed"));
    }

    #[tokio::test]
    async fn test_try_lock_expires() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        let ttl = Duration::from_secs(10);

        assert!(store.try_lock("queue:cron:w:1", ttl).await.unwrap());
        assert!(!store.try_lock("queue:cron:w:1", ttl).await.unwrap());

        store.advance(Duration::from_secs(11));
        assert!(store.try_lock("queue:cron:w:1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_chunks_limit() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        let task_id = "queue:w:1";
        store.apply(add(task_id)).await.unwrap();
        store
            .apply(Transition::PendingToMapping {
                task_id: task_id.to_string(),
                deadline: 100,
            })
            .await
            .unwrap();
        store
            .apply(Transition::MappingToAggregating {
                task_id: task_id.to_string(),
                chunks: (0..5)
                    .map(|i| (Keys::chunk_id(task_id, i), i.to_string()))
                    .collect(),
            })
            .await
            .unwrap();

        assert_eq!(store.pending_chunks(task_id, Some(2)).await.unwrap().len(), 2);
        assert_eq!(store.pending_chunks(task_id, Some(0)).await.unwrap().len(), 0);
        assert_eq!(store.pending_chunks(task_id, None).await.unwrap().len(), 5);
    }
}
