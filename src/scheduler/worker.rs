//! Worker definitions and the registry.
//!
//! A worker is a named job type: the [`Job`] callbacks plus the retry,
//! timeout, concurrency and cron policy that the engine applies to every
//! task of that type. Definitions are validated once, when they are
//! registered, and are immutable afterwards.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::task::{Chunk, Task};
use crate::error::QueueError;
use crate::store::Keys;

/// Default number of retries per stage.
pub const DEFAULT_RETRY: u32 = 2;
/// Default delay before a failed attempt is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Default lease length of a running stage.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default delay used by `postpone` when none is given.
pub const DEFAULT_POSTPONE_DELAY: Duration = Duration::from_secs(60);

/// Computes the worker-local task id from the task data.
pub type TaskIdFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Callbacks of a job type.
///
/// `map` splits a task into chunk inputs, `process` turns one chunk input
/// into a result and `reduce` receives every chunk result once all chunks
/// are done. Any `Err` is reported as a [`crate::JobFailure`] and the step
/// is retried after the worker's `retry_delay`.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Splits the task. The default yields the task data as a single chunk.
    async fn map(&self, task: &Task) -> anyhow::Result<Vec<Value>> {
        Ok(vec![task.data().clone()])
    }

    async fn process(&self, chunk: &Chunk) -> anyhow::Result<Value>;

    /// Combines chunk results, which arrive in no particular order. The
    /// default does nothing.
    async fn reduce(&self, _task: &Task, _results: Vec<Value>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Job built from a single `process` closure, with default `map` and
/// `reduce`.
pub struct FnJob<F> {
    process: F,
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn process(&self, chunk: &Chunk) -> anyhow::Result<Value> {
        (self.process)(chunk.data().clone()).await
    }
}

/// A job type as supplied by the caller.
pub struct WorkerDefinition {
    name: String,
    job: Arc<dyn Job>,
    cron: Option<String>,
    chunks_per_instance: Option<usize>,
    retry: u32,
    retry_delay: Duration,
    timeout: Duration,
    postpone_delay: Duration,
    task_id: Option<TaskIdFn>,
}

impl WorkerDefinition {
    /// Creates a definition with default policy.
    pub fn new(name: impl Into<String>, job: impl Job) -> Self {
        Self {
            name: name.into(),
            job: Arc::new(job),
            cron: None,
            chunks_per_instance: None,
            retry: DEFAULT_RETRY,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
            postpone_delay: DEFAULT_POSTPONE_DELAY,
            task_id: None,
        }
    }

    /// Creates a definition whose job only has a `process` step.
    pub fn from_fn<F, Fut>(name: impl Into<String>, process: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(name, FnJob { process })
    }

    /// Sets a cron schedule (5 fields, or 6/7 with seconds).
    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron = Some(expression.into());
        self
    }

    /// Caps how many chunks of this job type one process runs at a time.
    pub fn with_chunks_per_instance(mut self, limit: usize) -> Self {
        self.chunks_per_instance = Some(limit);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the lease length of each stage.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_postpone_delay(mut self, delay: Duration) -> Self {
        self.postpone_delay = delay;
        self
    }

    /// Sets the task id function. A deterministic function makes pushes of
    /// equal data idempotent while the task exists.
    pub fn with_task_id<F>(mut self, task_id: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.task_id = Some(Arc::new(task_id));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Validated, registered worker.
pub struct Worker {
    pub(crate) name: String,
    pub(crate) job: Arc<dyn Job>,
    pub(crate) schedule: Option<cron::Schedule>,
    pub(crate) chunks_per_instance: Option<usize>,
    pub(crate) retry: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) timeout: Duration,
    pub(crate) postpone_delay: Duration,
    task_id: TaskIdFn,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("scheduled", &self.schedule.is_some())
            .field("chunks_per_instance", &self.chunks_per_instance)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("postpone_delay", &self.postpone_delay)
            .finish_non_exhaustive()
    }
}

impl Worker {
    fn from_definition(def: WorkerDefinition) -> Result<Self, QueueError> {
        let invalid = |reason: &str| QueueError::InvalidDefinition {
            worker: def.name.clone(),
            reason: reason.to_string(),
        };

        if def.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if def.name.contains(':') {
            return Err(invalid("name must not contain ':'"));
        }
        if def.timeout.is_zero() {
            return Err(invalid("timeout must be greater than 0"));
        }
        if def.chunks_per_instance == Some(0) {
            return Err(invalid("chunks_per_instance must be greater than 0"));
        }

        let schedule = match &def.cron {
            Some(expression) => Some(parse_cron(expression).map_err(|e| {
                invalid(&format!("invalid cron expression '{}': {}", expression, e))
            })?),
            None => None,
        };

        Ok(Self {
            name: def.name,
            job: def.job,
            schedule,
            chunks_per_instance: def.chunks_per_instance,
            retry: def.retry,
            retry_delay: def.retry_delay,
            timeout: def.timeout,
            postpone_delay: def.postpone_delay,
            task_id: def.task_id.unwrap_or_else(|| Arc::new(random_task_id)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn chunks_per_instance(&self) -> Option<usize> {
        self.chunks_per_instance
    }

    /// Worker-local id for a task carrying `data`.
    pub fn task_id(&self, data: &Value) -> String {
        (self.task_id)(data)
    }

    pub(crate) fn timeout_ms(&self) -> i64 {
        self.timeout.as_millis() as i64
    }

    pub(crate) fn retry_delay_ms(&self) -> i64 {
        self.retry_delay.as_millis() as i64
    }
}

fn random_task_id(_data: &Value) -> String {
    Uuid::new_v4().to_string()
}

/// Parses a cron expression.
///
/// The classic 5-field form numbers days of the week 0-7 with both 0 and 7
/// meaning Sunday; it is converted by pinning seconds to 0 and shifting
/// day numbers to the 1-7 (Sunday = 1) numbering of the 6/7-field form.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, cron::error::Error> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => cron::Schedule::from_str(&format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day,
            month,
            classic_day_of_week(weekday)
        )),
        _ => cron::Schedule::from_str(expression),
    }
}

/// Rewrites a classic day-of-week field. Items that are not numeric (names
/// such as `Mon-Fri`) or that are malformed are left for the parser.
fn classic_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| expand_day_item(item).unwrap_or_else(|| item.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

fn expand_day_item(item: &str) -> Option<String> {
    if item == "*" {
        return Some(item.to_string());
    }

    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };

    let (start, end) = match (range, range.split_once('-')) {
        ("*", _) => (0, 6),
        (_, Some((a, b))) => (a.parse::<u32>().ok()?, b.parse::<u32>().ok()?),
        (_, None) => {
            let a = range.parse::<u32>().ok()?;
            (a, if step.is_some() { 6 } else { a })
        }
    };
    if start > end || end > 7 {
        return None;
    }

    let mut days: Vec<u32> = (start..=end)
        .step_by(step.unwrap_or(1))
        .map(|day| day % 7 + 1)
        .collect();
    days.sort_unstable();
    days.dedup();

    Some(
        days.iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Write-once table of registered workers.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and adds a definition.
    ///
    /// # Errors
    ///
    /// `DuplicateWorker` if the name is taken, `InvalidDefinition` if the
    /// definition is malformed.
    pub fn register(&mut self, def: WorkerDefinition) -> Result<(), QueueError> {
        if self.workers.contains_key(def.name()) {
            return Err(QueueError::DuplicateWorker(def.name().to_string()));
        }

        let worker = Worker::from_definition(def)?;

        tracing::debug!(
            worker = %worker.name,
            cron = worker.schedule.is_some(),
            retry = worker.retry,
            "Registered worker"
        );

        self.workers.insert(worker.name.clone(), Arc::new(worker));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Worker>, QueueError> {
        self.workers
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownWorker(name.to_string()))
    }

    /// Worker owning `task_id`, if it belongs to this prefix and a
    /// registered worker.
    pub fn owner_of(&self, keys: &Keys, task_id: &str) -> Option<Arc<Worker>> {
        keys.worker_of(task_id)
            .and_then(|name| self.workers.get(name))
            .cloned()
    }

    /// Workers that have a cron schedule.
    pub fn scheduled(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.values().filter(|w| w.schedule.is_some())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
