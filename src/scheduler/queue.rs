//! Public queue API.
//!
//! A [`QueueBuilder`] collects worker definitions and freezes them into a
//! [`Queue`]. Every process in the fleet builds its own `Queue` against the
//! same store; `start` spawns the tick loop and one cron driver per
//! scheduled worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::cron::run_schedule;
use super::engine::{Engine, ErrorEvent};
use super::worker::{WorkerDefinition, WorkerRegistry};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::store::{QueueSet, RedisStore, Store};

/// Number of tasks in each queue set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub postponed: usize,
    pub pending: usize,
    pub mapping: usize,
    pub aggregating: usize,
    pub reducing: usize,
}

impl QueueStats {
    /// Returns the total number of tasks in all sets.
    pub fn total(&self) -> usize {
        self.postponed + self.pending + self.mapping + self.aggregating + self.reducing
    }
}

/// Builds a [`Queue`].
pub struct QueueBuilder {
    store: Arc<dyn Store>,
    registry: WorkerRegistry,
    tick_interval: Duration,
    cron_lock_ttl: Duration,
    shutdown_timeout: Duration,
}

impl QueueBuilder {
    /// Creates a builder over `store` with default pacing.
    pub fn new(store: Arc<dyn Store>) -> Self {
        let defaults = QueueConfig::default();
        Self {
            store,
            registry: WorkerRegistry::new(),
            tick_interval: defaults.tick_interval,
            cron_lock_ttl: defaults.cron_lock_ttl,
            shutdown_timeout: defaults.shutdown_timeout,
        }
    }

    /// Connects to the Redis server named in `config` and applies its
    /// pacing settings.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Store` if the connection fails.
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let store = RedisStore::connect(&config.redis_url, &config.prefix).await?;
        Ok(Self::new(Arc::new(store)).with_config(config))
    }

    /// Applies the pacing settings of `config`. The prefix is a property of
    /// the store and is not changed here.
    pub fn with_config(self, config: &QueueConfig) -> Self {
        self.with_tick_interval(config.tick_interval)
            .with_cron_lock_ttl(config.cron_lock_ttl)
            .with_shutdown_timeout(config.shutdown_timeout)
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_cron_lock_ttl(mut self, ttl: Duration) -> Self {
        self.cron_lock_ttl = ttl;
        self
    }

    /// Sets how long `shutdown` waits for running callbacks.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Registers a job type.
    ///
    /// # Errors
    ///
    /// `DuplicateWorker` if the name is taken, `InvalidDefinition` if the
    /// definition is malformed.
    pub fn register_worker(mut self, def: WorkerDefinition) -> Result<Self, QueueError> {
        self.registry.register(def)?;
        Ok(self)
    }

    pub fn build(self) -> Queue {
        let (shutdown_tx, _) = broadcast::channel(1);
        Queue {
            engine: Arc::new(Engine::new(self.store, self.registry, self.cron_lock_ttl)),
            tick_interval: self.tick_interval,
            shutdown_timeout: self.shutdown_timeout,
            metrics: MetricsCollector::new(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }
}

/// A queue process.
pub struct Queue {
    engine: Arc<Engine>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    metrics: MetricsCollector,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl Queue {
    /// Spawns the tick loop and the cron drivers.
    ///
    /// The first tick waits a random fraction of the tick interval so that
    /// processes started together do not poll in lockstep.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if started twice, `ShutDown` after `shutdown`.
    pub fn start(&self) -> Result<(), QueueError> {
        if self.engine.is_stopped() {
            return Err(QueueError::ShutDown);
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning);
        }

        let interval_ms = (self.tick_interval.as_millis() as u64).max(1);
        let jitter = Duration::from_millis(rand::rng().random_range(0..interval_ms));

        let mut handles = Vec::new();

        let engine = Arc::clone(&self.engine);
        let interval = self.tick_interval;
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = shutdown.recv() => return,
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.tick().await {
                            engine.emit(e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }

            debug!("Tick loop stopped");
        }));

        let mut scheduled = 0;
        for worker in self.engine.registry().scheduled() {
            handles.push(tokio::spawn(run_schedule(
                Arc::clone(&self.engine),
                Arc::clone(worker),
                self.shutdown_tx.subscribe(),
            )));
            scheduled += 1;
        }

        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        info!(
            workers = self.engine.registry().len(),
            scheduled,
            tick_interval_ms = interval_ms,
            "Queue started"
        );

        Ok(())
    }

    /// Stops the tick loop and the cron drivers, then waits up to the
    /// shutdown timeout for work this process already claimed. That work
    /// runs to completion, including the chunks and reduce of a task whose
    /// map finishes during shutdown. Calling it again does nothing.
    pub async fn shutdown(&self) {
        if !self.engine.stop() {
            return;
        }

        info!("Initiating queue shutdown");

        // No receivers if the queue was never started
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue loop panicked during shutdown");
            }
        }

        match tokio::time::timeout(self.shutdown_timeout, self.engine.drain()).await {
            Ok(()) => debug!("Claimed work finished"),
            Err(_) => warn!(
                active = self.engine.active_runs(),
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Shutdown timed out with callbacks still running"
            ),
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Queue shutdown complete");
    }

    /// Pushes a task for `worker` and returns its id. Pushing a task whose
    /// id already exists is a no-op returning the same id.
    ///
    /// # Errors
    ///
    /// `UnknownWorker` if no such worker is registered; the store is not
    /// touched in that case.
    pub async fn push<T>(&self, worker: &str, data: &T) -> Result<String, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        self.engine.push(worker, data).await
    }

    /// Schedules a task for `worker` to become pending after `delay`, or
    /// after the worker's `postpone_delay` when `None`.
    pub async fn postpone<T>(
        &self,
        worker: &str,
        data: &T,
        delay: Option<Duration>,
    ) -> Result<String, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        self.engine.postpone(worker, data, delay).await
    }

    /// Receives every error raised by background work in this process.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.engine.subscribe()
    }

    /// Runs one scheduling pass. Callbacks it starts run in the background.
    pub async fn tick(&self) -> Result<(), QueueError> {
        self.engine.tick().await
    }

    /// Fires the cron task of `worker` for the fire time `at`. Returns the
    /// pushed task id, or `None` if another process already fired it.
    pub async fn fire_cron(
        &self,
        worker: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, QueueError> {
        let worker = self.engine.registry().get(worker)?;
        self.engine.fire_cron(&worker, at).await
    }

    /// Counts the tasks in every queue set.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let store = self.engine.store();

        let mut stats = QueueStats::default();
        for set in QueueSet::ALL {
            let count = store.count(set).await?;
            self.metrics.set_queue_depth(set.as_str(), count);
            match set {
                QueueSet::Postponed => stats.postponed = count,
                QueueSet::Pending => stats.pending = count,
                QueueSet::Mapping => stats.mapping = count,
                QueueSet::Aggregating => stats.aggregating = count,
                QueueSet::Reducing => stats.reducing = count,
            }
        }

        Ok(stats)
    }

    /// Number of chunks of `worker` this process is running.
    pub fn in_flight(&self, worker: &str) -> usize {
        self.engine.in_flight(worker)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.engine.store()
    }

    /// Returns whether the tick loop is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.engine.stop();
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue() -> Queue {
        QueueBuilder::new(Arc::new(MemoryStore::with_manual_clock("queue:", 0)))
            .with_tick_interval(Duration::from_millis(10))
            .register_worker(WorkerDefinition::from_fn("echo", |data| async move {
                Ok(data)
            }))
            .unwrap()
            .build()
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            postponed: 1,
            pending: 2,
            mapping: 3,
            aggregating: 4,
            reducing: 5,
        };
        assert_eq!(stats.total(), 15);
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown() {
        let queue = queue();

        queue.start().unwrap();
        assert!(queue.is_running());
        assert!(matches!(queue.start(), Err(QueueError::AlreadyRunning)));

        queue.shutdown().await;
        assert!(!queue.is_running());
        queue.shutdown().await;

        assert!(matches!(queue.start(), Err(QueueError::ShutDown)));
    }

    #[tokio::test]
    async fn test_push_counts_in_stats() {
        let queue = queue();

        queue.push("echo", &serde_json::json!({"n": 1})).await.unwrap();
        queue
            .postpone("echo", &serde_json::json!({"n": 2}), None)
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.postponed, 1);
        assert_eq!(stats.total(), 2);
    }

    #[tokio::test]
    async fn test_stats_reports_queue_depth_metric() {
        crate::metrics::init_metrics().unwrap();
        let queue = queue();

        queue.push("echo", &serde_json::json!({"n": 1})).await.unwrap();
        queue.stats().await.unwrap();
        queue.stats().await.unwrap();

        let exported = crate::metrics::export_metrics();
        assert!(exported.contains("forge_queue_depth"));
        assert!(exported.contains(r#"set="pending""#));
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_callback() {
        let store = MemoryStore::with_manual_clock("queue:", 0);
        let queue = QueueBuilder::new(Arc::new(store))
            .with_shutdown_timeout(Duration::from_millis(50))
            .register_worker(WorkerDefinition::from_fn("stuck", |_| async move {
                std::future::pending::<()>().await;
                Ok(serde_json::Value::Null)
            }))
            .unwrap()
            .build();

        queue.push("stuck", &()).await.unwrap();
        while queue.in_flight("stuck") == 0 {
            queue.tick().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), queue.shutdown())
            .await
            .expect("shutdown should give up after its timeout");
        assert_eq!(queue.in_flight("stuck"), 1);
    }

    #[tokio::test]
    async fn test_unknown_worker_does_not_touch_store() {
        let queue = queue();

        let err = queue.push("missing", &()).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownWorker(_)));

        let err = queue.postpone("missing", &(), None).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownWorker(_)));

        let err = queue.fire_cron("missing", Utc::now()).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownWorker(_)));

        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }
}
