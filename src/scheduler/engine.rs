//! Queue engine.
//!
//! Drives tasks and chunks through their state machines. Each stage step is
//! a sequence of awaited store calls ending in one atomic [`Transition`];
//! user callbacks run in spawned tokio tasks so a slow `map`, `process` or
//! `reduce` never stalls the tick loop.
//!
//! Lease recovery works the same way for crashes and failures: a failed
//! attempt pushes its own deadline out by `retry_delay`, and the watchdog
//! re-arms any expired lease, consuming one retry. Whichever process wins
//! the re-arm runs the stage again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use super::task::{Chunk, Task, TaskState};
use super::worker::{Worker, WorkerRegistry};
use crate::error::{JobFailure, QueueError};
use crate::metrics::{ExhaustedEntity, MetricsCollector};
use crate::store::{Keys, LeasedStage, Outcome, QueueSet, Store, Transition};

/// Capacity of the error broadcast channel.
const ERROR_CHANNEL_CAPACITY: usize = 1024;

/// Error event delivered to subscribers.
pub type ErrorEvent = Arc<QueueError>;

/// Chunks this process is running, per worker.
#[derive(Default)]
struct InFlight {
    counts: Mutex<HashMap<String, usize>>,
    metrics: MetricsCollector,
}

impl InFlight {
    fn current(&self, worker: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(worker).copied().unwrap_or(0)
    }

    /// Takes one slot unless `cap` slots are already taken.
    fn acquire(self: &Arc<Self>, worker: &str, cap: Option<usize>) -> Option<SlotGuard> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(worker.to_string()).or_insert(0);
        if cap.is_some_and(|cap| *count >= cap) {
            return None;
        }
        *count += 1;
        self.metrics.add_in_flight(worker, 1.0);

        Some(SlotGuard {
            in_flight: Arc::clone(self),
            worker: worker.to_string(),
        })
    }

    fn release(&self, worker: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(worker) {
            *count = count.saturating_sub(1);
        }
        self.metrics.add_in_flight(worker, -1.0);
    }
}

/// One reserved chunk slot, released on drop.
struct SlotGuard {
    in_flight: Arc<InFlight>,
    worker: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_flight.release(&self.worker);
    }
}

pub(crate) struct Engine {
    store: Arc<dyn Store>,
    registry: WorkerRegistry,
    errors: broadcast::Sender<ErrorEvent>,
    in_flight: Arc<InFlight>,
    metrics: MetricsCollector,
    cron_lock_ttl: Duration,
    stopped: AtomicBool,
    /// Spawned stage runs that have not finished yet.
    active: AtomicUsize,
    idle: Notify,
}

/// Counts one spawned stage run as active until dropped.
struct ActiveRun<'a> {
    engine: &'a Engine,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if self.engine.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.engine.idle.notify_waiters();
        }
    }
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        registry: WorkerRegistry,
        cron_lock_ttl: Duration,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            store,
            registry,
            errors,
            in_flight: Arc::new(InFlight::default()),
            metrics: MetricsCollector::new(),
            cron_lock_ttl,
            stopped: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn keys(&self) -> &Keys {
        self.store.keys()
    }

    pub(crate) fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub(crate) fn cron_lock_ttl(&self) -> Duration {
        self.cron_lock_ttl
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    /// Marks the engine stopped. Returns `false` if it already was.
    pub(crate) fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Waits until every stage run spawned by this process has finished.
    pub(crate) async fn drain(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Number of stage runs (map, process or reduce) still in progress.
    pub(crate) fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of chunks of `worker` this process is running.
    pub(crate) fn in_flight(&self, worker: &str) -> usize {
        self.in_flight.current(worker)
    }

    /// Logs an error and broadcasts it to subscribers.
    pub(crate) fn emit(&self, err: QueueError) {
        match err.as_job_failure() {
            Some(failure) => warn!(
                worker = %failure.worker,
                task_id = %failure.task_id,
                chunk_id = ?failure.chunk_id,
                state = %failure.state,
                error = %failure.error,
                "Job failed"
            ),
            None => error!(error = %err, "Queue operation failed"),
        }

        // No receivers is fine
        let _ = self.errors.send(Arc::new(err));
    }

    /// Reports a job failure, then any error hit while rescheduling the
    /// failed step. The failure is delivered even if rescheduling failed.
    fn report_failure(&self, failure: JobFailure, rescheduled: Result<(), QueueError>) {
        self.emit(failure.into());
        if let Err(e) = rescheduled {
            self.emit(e);
        }
    }

    /// Runs `job` in a tokio task, reporting its error if it fails.
    fn spawn<F, Fut>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(Arc<Engine>) -> Fut,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        let engine = Arc::clone(self);
        let fut = job(Arc::clone(self));
        self.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _active = ActiveRun { engine: &engine };
            if let Err(e) = fut.await {
                engine.emit(e);
            }
        });
    }

    /// Inserts a task into `pending` unless it already exists.
    pub(crate) async fn push(&self, worker_name: &str, data: Value) -> Result<String, QueueError> {
        let worker = self.registry.get(worker_name)?;
        let task_id = self.keys().task_id(&worker.name, &worker.task_id(&data));

        let outcome = self
            .store
            .apply(Transition::AddTask {
                task_id: task_id.clone(),
                worker: worker.name.clone(),
                data: serde_json::to_string(&data)?,
            })
            .await?;

        if outcome.is_applied() {
            self.metrics.record_pushed(&worker.name);
            debug!(task_id = %task_id, worker = %worker.name, "Task pushed");
        } else {
            debug!(task_id = %task_id, "Task already exists, push ignored");
        }

        Ok(task_id)
    }

    /// Inserts a task into `postponed`, due after `delay` (or the worker's
    /// `postpone_delay`).
    pub(crate) async fn postpone(
        &self,
        worker_name: &str,
        data: Value,
        delay: Option<Duration>,
    ) -> Result<String, QueueError> {
        let worker = self.registry.get(worker_name)?;
        let task_id = self.keys().task_id(&worker.name, &worker.task_id(&data));
        let delay = delay.unwrap_or(worker.postpone_delay);
        let due_at = self.store.now().await? + delay.as_millis() as i64;

        let outcome = self
            .store
            .apply(Transition::AddPostponed {
                task_id: task_id.clone(),
                worker: worker.name.clone(),
                data: serde_json::to_string(&data)?,
                due_at,
            })
            .await?;

        if outcome.is_applied() {
            debug!(task_id = %task_id, due_at, "Task postponed");
        } else {
            debug!(task_id = %task_id, "Task already postponed, ignored");
        }

        Ok(task_id)
    }

    /// One scheduling pass. A stopped engine starts nothing new.
    ///
    /// Every phase runs even if an earlier one failed; phase errors are
    /// emitted to subscribers. Only a failure to read the clock, which
    /// prevents the whole pass, is returned.
    pub(crate) async fn tick(self: &Arc<Self>) -> Result<(), QueueError> {
        if self.is_stopped() {
            return Ok(());
        }

        let now = self.store.now().await?;

        let phases = [
            ("promote", self.promote_postponed(now).await),
            ("claim", self.claim_pending(now).await),
            ("aggregate", self.aggregate_all().await),
            ("watchdog", self.watchdog(now).await),
        ];
        for (phase, result) in phases {
            if let Err(e) = result {
                debug!(phase, "Tick phase failed");
                self.emit(e);
            }
        }

        Ok(())
    }

    async fn promote_postponed(&self, now: i64) -> Result<(), QueueError> {
        for (task_id, _) in self.store.due(QueueSet::Postponed, now).await? {
            let Some(worker) = self.registry.owner_of(self.keys(), &task_id) else {
                continue;
            };

            let outcome = self
                .store
                .apply(Transition::PostponedToPending {
                    task_id: task_id.clone(),
                    now,
                })
                .await?;

            if outcome.is_applied() {
                self.metrics.record_pushed(&worker.name);
                debug!(task_id = %task_id, "Postponed task is due");
            }
        }
        Ok(())
    }

    async fn claim_pending(self: &Arc<Self>, now: i64) -> Result<(), QueueError> {
        for task_id in self.store.members(QueueSet::Pending).await? {
            let Some(worker) = self.registry.owner_of(self.keys(), &task_id) else {
                continue;
            };

            let deadline = now + worker.timeout_ms();
            let outcome = self
                .store
                .apply(Transition::PendingToMapping {
                    task_id: task_id.clone(),
                    deadline,
                })
                .await?;

            if outcome.is_applied() {
                debug!(task_id = %task_id, worker = %worker.name, "Claimed task for mapping");
                self.spawn(move |engine| engine.run_map(task_id, worker, deadline));
            }
        }
        Ok(())
    }

    async fn aggregate_all(self: &Arc<Self>) -> Result<(), QueueError> {
        for task_id in self.store.members(QueueSet::Aggregating).await? {
            let Some(worker) = self.registry.owner_of(self.keys(), &task_id) else {
                continue;
            };
            self.aggregate(task_id, worker).await?;
        }
        Ok(())
    }

    /// Re-arms expired mapping and reducing leases.
    async fn watchdog(self: &Arc<Self>, now: i64) -> Result<(), QueueError> {
        for stage in [LeasedStage::Mapping, LeasedStage::Reducing] {
            for (task_id, expired) in self.store.due(stage.set(), now).await? {
                let Some(worker) = self.registry.owner_of(self.keys(), &task_id) else {
                    continue;
                };

                let deadline = now + worker.timeout_ms();
                let outcome = self
                    .store
                    .apply(Transition::RetryStage {
                        stage,
                        task_id: task_id.clone(),
                        deadline,
                        expected: expired,
                        max_retries: Some(worker.retry),
                    })
                    .await?;

                match outcome {
                    Outcome::Applied => {
                        info!(
                            task_id = %task_id,
                            stage = stage.as_str(),
                            "Lease expired, retrying stage"
                        );
                        match stage {
                            LeasedStage::Mapping => {
                                self.spawn(move |engine| engine.run_map(task_id, worker, deadline))
                            }
                            LeasedStage::Reducing => self
                                .spawn(move |engine| engine.run_reduce(task_id, worker, deadline)),
                        }
                    }
                    Outcome::Exhausted => {
                        warn!(
                            task_id = %task_id,
                            stage = stage.as_str(),
                            retry = worker.retry,
                            "Task exceeded its retry budget and was deleted"
                        );
                        self.metrics
                            .record_exhausted(&worker.name, ExhaustedEntity::Task);
                    }
                    Outcome::Skipped => {}
                }
            }
        }
        Ok(())
    }

    /// Pushes the running stage's lease out by `retry_delay` after a failed
    /// attempt.
    async fn backoff(
        &self,
        stage: LeasedStage,
        task: &Task,
        worker: &Worker,
    ) -> Result<(), QueueError> {
        let deadline = self.store.now().await? + worker.retry_delay_ms();
        let outcome = self
            .store
            .apply(Transition::RetryStage {
                stage,
                task_id: task.id().to_string(),
                deadline,
                expected: task.deadline(),
                max_retries: None,
            })
            .await?;

        if !outcome.is_applied() {
            debug!(
                task_id = %task.id(),
                stage = stage.as_str(),
                "Lease changed during the attempt, backoff skipped"
            );
        }
        Ok(())
    }

    /// Moves a failed chunk to `errored`, due again after `retry_delay`.
    async fn mark_errored(&self, chunk: &Chunk, worker: &Worker) -> Result<(), QueueError> {
        let retry_at = self.store.now().await? + worker.retry_delay_ms();
        self.store
            .apply(Transition::ChunkActiveToErrored {
                task_id: chunk.task_id().to_string(),
                chunk_id: chunk.id().to_string(),
                retry_at,
                expected: chunk.deadline(),
            })
            .await?;
        Ok(())
    }

    async fn load_task(
        &self,
        task_id: &str,
        worker: &Arc<Worker>,
        lease: i64,
    ) -> Result<Option<Task>, QueueError> {
        let Some(record) = self.store.task(task_id).await? else {
            debug!(task_id = %task_id, "Task no longer exists");
            return Ok(None);
        };
        let data: Value = serde_json::from_str(&record.data)?;

        Ok(Some(Task::new(
            task_id.to_string(),
            data,
            record.retries,
            Arc::clone(worker),
            Arc::clone(&self.store),
            lease,
        )))
    }

    async fn run_map(
        self: Arc<Self>,
        task_id: String,
        worker: Arc<Worker>,
        lease: i64,
    ) -> Result<(), QueueError> {
        let Some(task) = self.load_task(&task_id, &worker, lease).await? else {
            return Ok(());
        };

        let started = Instant::now();
        let result = task.map().await;
        self.metrics.record_stage(
            &worker.name,
            "map",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        let chunks = match result {
            Ok(chunks) => chunks,
            Err(error) => {
                let rescheduled = self.backoff(LeasedStage::Mapping, &task, &worker).await;
                self.report_failure(
                    JobFailure {
                        error,
                        worker: worker.name.clone(),
                        state: TaskState::Mapping,
                        task_id,
                        chunk_id: None,
                        data: task.data().clone(),
                    },
                    rescheduled,
                );
                return Ok(());
            }
        };

        let chunks = chunks
            .iter()
            .enumerate()
            .map(|(index, data)| {
                serde_json::to_string(data).map(|data| (Keys::chunk_id(&task_id, index), data))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let count = chunks.len();

        let outcome = self
            .store
            .apply(Transition::MappingToAggregating {
                task_id: task_id.clone(),
                chunks,
            })
            .await?;

        if !outcome.is_applied() {
            debug!(task_id = %task_id, "Task left mapping before map finished, chunks dropped");
            return Ok(());
        }

        debug!(task_id = %task_id, chunks = count, "Task mapped");
        self.aggregate(task_id, worker).await
    }

    /// Advances an aggregating task: requeues due chunks, moves the task to
    /// reducing once every chunk is done, or claims pending chunks up to
    /// this process's free capacity.
    ///
    /// Boxed because chunk completion calls back into it from a spawned task.
    pub(crate) fn aggregate(
        self: &Arc<Self>,
        task_id: String,
        worker: Arc<Worker>,
    ) -> BoxFuture<'static, Result<(), QueueError>> {
        let engine = Arc::clone(self);
        async move { engine.try_aggregate(&task_id, &worker).await }.boxed()
    }

    async fn try_aggregate(
        self: &Arc<Self>,
        task_id: &str,
        worker: &Arc<Worker>,
    ) -> Result<(), QueueError> {
        let now = self.store.now().await?;

        let requeued = self
            .store
            .apply(Transition::RequeueChunks {
                task_id: task_id.to_string(),
                now,
            })
            .await?;
        if requeued.is_applied() {
            debug!(task_id = %task_id, "Requeued errored and expired chunks");
        }

        if self.try_reduce(task_id, worker, now).await? {
            return Ok(());
        }

        let cap = worker.chunks_per_instance;
        let limit = match cap {
            Some(cap) => {
                let free = cap.saturating_sub(self.in_flight.current(&worker.name));
                if free == 0 {
                    return Ok(());
                }
                Some(free)
            }
            None => None,
        };

        let mut exhausted = false;
        for chunk_id in self.store.pending_chunks(task_id, limit).await? {
            let Some(slot) = self.in_flight.acquire(&worker.name, cap) else {
                break;
            };

            let deadline = now + worker.timeout_ms();
            let outcome = self
                .store
                .apply(Transition::ChunkPendingToActive {
                    task_id: task_id.to_string(),
                    chunk_id: chunk_id.clone(),
                    deadline,
                    max_retries: worker.retry,
                })
                .await?;

            match outcome {
                Outcome::Applied => {
                    let task_id = task_id.to_string();
                    let worker = Arc::clone(worker);
                    self.spawn(move |engine| {
                        engine.run_process(task_id, chunk_id, worker, deadline, slot)
                    });
                }
                Outcome::Exhausted => {
                    warn!(
                        task_id = %task_id,
                        chunk_id = %chunk_id,
                        retry = worker.retry,
                        "Chunk exceeded its retry budget and was dropped"
                    );
                    self.metrics
                        .record_exhausted(&worker.name, ExhaustedEntity::Chunk);
                    exhausted = true;
                }
                Outcome::Skipped => {}
            }
        }

        // A dropped chunk may have been the last unfinished one
        if exhausted {
            self.try_reduce(task_id, worker, now).await?;
        }

        Ok(())
    }

    /// Moves the task to reducing if no chunk is left unfinished, and starts
    /// the reduce.
    async fn try_reduce(
        self: &Arc<Self>,
        task_id: &str,
        worker: &Arc<Worker>,
        now: i64,
    ) -> Result<bool, QueueError> {
        let deadline = now + worker.timeout_ms();
        let outcome = self
            .store
            .apply(Transition::AggregatingToReducing {
                task_id: task_id.to_string(),
                deadline,
            })
            .await?;

        if !outcome.is_applied() {
            return Ok(false);
        }

        debug!(task_id = %task_id, "All chunks done, reducing");
        let task_id = task_id.to_string();
        let worker = Arc::clone(worker);
        self.spawn(move |engine| engine.run_reduce(task_id, worker, deadline));
        Ok(true)
    }

    async fn run_process(
        self: Arc<Self>,
        task_id: String,
        chunk_id: String,
        worker: Arc<Worker>,
        lease: i64,
        slot: SlotGuard,
    ) -> Result<(), QueueError> {
        let Some(record) = self.store.chunk(&chunk_id).await? else {
            debug!(chunk_id = %chunk_id, "Chunk no longer exists");
            return Ok(());
        };
        let data: Value = serde_json::from_str(&record.data)?;
        let chunk = Chunk::new(
            chunk_id.clone(),
            task_id.clone(),
            data,
            record.retries,
            Arc::clone(&worker),
            Arc::clone(&self.store),
            lease,
        );

        let started = Instant::now();
        let result = chunk.process().await;
        self.metrics.record_stage(
            &worker.name,
            "process",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        match result {
            Ok(value) => {
                let outcome = self
                    .store
                    .apply(Transition::ChunkActiveToDone {
                        task_id: task_id.clone(),
                        chunk_id: chunk_id.clone(),
                        result: serde_json::to_string(&value)?,
                    })
                    .await?;
                if !outcome.is_applied() {
                    debug!(chunk_id = %chunk_id, "Chunk no longer active, result dropped");
                }
            }
            Err(error) => {
                let rescheduled = self.mark_errored(&chunk, &worker).await;
                self.report_failure(
                    JobFailure {
                        error,
                        worker: worker.name.clone(),
                        state: TaskState::Aggregating,
                        task_id: task_id.clone(),
                        chunk_id: Some(chunk_id),
                        data: chunk.data().clone(),
                    },
                    rescheduled,
                );
            }
        }

        drop(slot);
        self.aggregate(task_id, worker).await
    }

    async fn run_reduce(
        self: Arc<Self>,
        task_id: String,
        worker: Arc<Worker>,
        lease: i64,
    ) -> Result<(), QueueError> {
        let Some(task) = self.load_task(&task_id, &worker, lease).await? else {
            return Ok(());
        };

        let results = self
            .store
            .chunk_results(&task_id)
            .await?
            .iter()
            .map(|result| serde_json::from_str(result))
            .collect::<Result<Vec<Value>, _>>()?;

        let started = Instant::now();
        let result = task.reduce(results).await;
        self.metrics.record_stage(
            &worker.name,
            "reduce",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        match result {
            Ok(()) => {
                self.store
                    .apply(Transition::DeleteTask {
                        task_id: task_id.clone(),
                    })
                    .await?;
                self.metrics.record_completed(&worker.name);
                info!(task_id = %task_id, worker = %worker.name, "Task completed");
            }
            Err(error) => {
                let rescheduled = self.backoff(LeasedStage::Reducing, &task, &worker).await;
                self.report_failure(
                    JobFailure {
                        error,
                        worker: worker.name.clone(),
                        state: TaskState::Reducing,
                        task_id,
                        chunk_id: None,
                        data: task.data().clone(),
                    },
                    rescheduled,
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_respects_cap() {
        let in_flight = Arc::new(InFlight::default());

        let a = in_flight.acquire("w", Some(2));
        let b = in_flight.acquire("w", Some(2));
        assert!(a.is_some() && b.is_some());
        assert!(in_flight.acquire("w", Some(2)).is_none());
        assert_eq!(in_flight.current("w"), 2);

        drop(a);
        assert_eq!(in_flight.current("w"), 1);
        assert!(in_flight.acquire("w", Some(2)).is_some());
    }

    #[test]
    fn test_in_flight_unbounded_and_per_worker() {
        let in_flight = Arc::new(InFlight::default());

        let slots: Vec<_> = (0..10)
            .filter_map(|_| in_flight.acquire("a", None))
            .collect();
        assert_eq!(slots.len(), 10);
        assert_eq!(in_flight.current("b"), 0);

        drop(slots);
        assert_eq!(in_flight.current("a"), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::default());
        let engine = Engine::new(store, WorkerRegistry::new(), Duration::from_secs(1));

        assert!(engine.stop());
        assert!(!engine.stop());
        assert!(engine.is_stopped());
    }
}
