//! Atomic state transitions.
//!
//! Every mutation of cross-process-visible state is one [`Transition`]. A
//! store backend executes each variant as a single indivisible
//! compare-and-move: it checks membership (and, where present, the expected
//! lease deadline) and then moves the id between collections, updating
//! scores and hash fields in the same step.

use super::keys::QueueSet;

/// Stages whose membership is a lease scored by deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasedStage {
    Mapping,
    Reducing,
}

impl LeasedStage {
    pub fn set(&self) -> QueueSet {
        match self {
            LeasedStage::Mapping => QueueSet::Mapping,
            LeasedStage::Reducing => QueueSet::Reducing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.set().as_str()
    }
}

/// One atomic transition. Timestamps are milliseconds of the store clock.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// absent → pending. Skipped if the task hash exists.
    AddTask {
        task_id: String,
        worker: String,
        data: String,
    },
    /// absent → postponed, scored by `due_at`. Skipped if already postponed.
    AddPostponed {
        task_id: String,
        worker: String,
        data: String,
        due_at: i64,
    },
    /// postponed → pending when due and no live copy of the task exists.
    PostponedToPending { task_id: String, now: i64 },
    /// pending → mapping with a fresh lease.
    PendingToMapping { task_id: String, deadline: i64 },
    /// mapping → mapping or reducing → reducing.
    ///
    /// Accepted only while the stored deadline equals `expected`. With
    /// `max_retries` set this is a watchdog re-arm: the retry counter is
    /// incremented and the task is deleted once it exceeds the budget.
    /// Without it this is the backoff after a failed attempt.
    RetryStage {
        stage: LeasedStage,
        task_id: String,
        deadline: i64,
        expected: i64,
        max_retries: Option<u32>,
    },
    /// mapping → aggregating, inserting `(chunk_id, data)` pairs as pending.
    MappingToAggregating {
        task_id: String,
        chunks: Vec<(String, String)>,
    },
    /// aggregating → reducing once no chunk is pending, active or errored.
    /// Resets the retry counter for the new stage.
    AggregatingToReducing { task_id: String, deadline: i64 },
    /// Chunk pending → active. Deletes the chunk instead when its retry
    /// counter exceeds `max_retries`.
    ChunkPendingToActive {
        task_id: String,
        chunk_id: String,
        deadline: i64,
        max_retries: u32,
    },
    /// Chunk active → done, storing the serialized result.
    ChunkActiveToDone {
        task_id: String,
        chunk_id: String,
        result: String,
    },
    /// Chunk active → errored, scored by `retry_at`. Requires the lease
    /// deadline to equal `expected`.
    ChunkActiveToErrored {
        task_id: String,
        chunk_id: String,
        retry_at: i64,
        expected: i64,
    },
    /// Due errored chunks and expired active chunks → pending, bumping each
    /// chunk's retry counter.
    RequeueChunks { task_id: String, now: i64 },
    /// Remove the task from every queue set and delete all of its keys.
    DeleteTask { task_id: String },
    /// Move a live mapping/reducing lease to `deadline`.
    ExtendTaskLease { task_id: String, deadline: i64 },
    /// Move a live chunk lease to `deadline`.
    ExtendChunkLease {
        task_id: String,
        chunk_id: String,
        deadline: i64,
    },
}

impl Transition {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Transition::AddTask { .. } => "task_add",
            Transition::AddPostponed { .. } => "task_add_postponed",
            Transition::PostponedToPending { .. } => "task_postponed_to_pending",
            Transition::PendingToMapping { .. } => "task_pending_to_mapping",
            Transition::RetryStage {
                stage: LeasedStage::Mapping,
                ..
            } => "task_mapping_to_mapping",
            Transition::RetryStage {
                stage: LeasedStage::Reducing,
                ..
            } => "task_reducing_to_reducing",
            Transition::MappingToAggregating { .. } => "task_mapping_to_aggregating",
            Transition::AggregatingToReducing { .. } => "task_aggregating_to_reducing",
            Transition::ChunkPendingToActive { .. } => "chunk_pending_to_active",
            Transition::ChunkActiveToDone { .. } => "chunk_active_to_done",
            Transition::ChunkActiveToErrored { .. } => "chunk_active_to_errored",
            Transition::RequeueChunks { .. } => "chunk_active_and_errored_to_pending",
            Transition::DeleteTask { .. } => "task_delete",
            Transition::ExtendTaskLease { .. } => "task_extend_lease",
            Transition::ExtendChunkLease { .. } => "chunk_extend_lease",
        }
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The move happened.
    Applied,
    /// A precondition failed (another process won, or the entity is gone).
    Skipped,
    /// The retry budget was exceeded and the entity was deleted.
    Exhausted,
}

impl Outcome {
    /// Decodes the integer reply shared by all transition scripts:
    /// positive means applied, `0` skipped, negative exhausted.
    pub fn from_code(code: i64) -> Self {
        match code {
            c if c > 0 => Outcome::Applied,
            0 => Outcome::Skipped,
            _ => Outcome::Exhausted,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_code() {
        assert_eq!(Outcome::from_code(1), Outcome::Applied);
        assert_eq!(Outcome::from_code(7), Outcome::Applied);
        assert_eq!(Outcome::from_code(0), Outcome::Skipped);
        assert_eq!(Outcome::from_code(-1), Outcome::Exhausted);
        assert!(Outcome::Applied.is_applied());
        assert!(!Outcome::Exhausted.is_applied());
    }

    #[test]
    fn test_retry_stage_names() {
        let retry = |stage| Transition::RetryStage {
            stage,
            task_id: "queue:w:1".to_string(),
            deadline: 10,
            expected: 5,
            max_retries: None,
        };

        assert_eq!(retry(LeasedStage::Mapping).name(), "task_mapping_to_mapping");
        assert_eq!(
            retry(LeasedStage::Reducing).name(),
            "task_reducing_to_reducing"
        );
        assert_eq!(LeasedStage::Reducing.set(), QueueSet::Reducing);
    }
}
