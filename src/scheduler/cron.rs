//! Distributed cron trigger.
//!
//! Every process runs a driver per scheduled worker. At each fire time the
//! drivers race for a store lock named after the worker and the fire
//! second; only the winner pushes the task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::engine::Engine;
use super::worker::Worker;
use crate::error::QueueError;

impl Engine {
    /// Pushes the cron task of `worker` for the fire at `at`, unless another
    /// process already did. Returns the pushed task id.
    pub(crate) async fn fire_cron(
        &self,
        worker: &Worker,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, QueueError> {
        let lock = self.keys().cron_lock(&worker.name, at.timestamp());

        if !self.store().try_lock(&lock, self.cron_lock_ttl()).await? {
            debug!(worker = %worker.name, fire_at = %at, "Cron fire already taken");
            return Ok(None);
        }

        let task_id = self.push(&worker.name, Value::Null).await?;
        info!(worker = %worker.name, fire_at = %at, task_id = %task_id, "Cron fired");
        Ok(Some(task_id))
    }
}

/// Fires `worker` on its schedule until shutdown.
pub(crate) async fn run_schedule(
    engine: Arc<Engine>,
    worker: Arc<Worker>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let Some(schedule) = worker.schedule.as_ref() else {
        return;
    };

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            debug!(worker = %worker.name, "Cron schedule has no upcoming fire");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if engine.is_stopped() {
                    return;
                }
                if let Err(e) = engine.fire_cron(&worker, next).await {
                    engine.emit(e);
                }
            }
            _ = shutdown.recv() => {
                debug!(worker = %worker.name, "Cron driver stopped");
                return;
            }
        }
    }
}
