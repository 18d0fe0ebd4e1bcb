//! Batch aggregate: a fixed set of child jobs tracked by a completion counter.
//!
//! The counting rule lives here as a pure function ([`BatchJob::record_child`]);
//! the store-facing aggregator applies it under a conditional write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pixelflow_core::{
    AggregateRoot, AssetRef, BatchJobId, DomainError, DomainResult, ErrorKind, IdGenerator,
    JobError, JobId, JobStatus, TimeSource, UserId,
};

use crate::job::{Job, NewJob, create_job};

/// Largest batch accepted at creation.
pub const MAX_BATCH_SIZE: usize = 100;

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchStatus::Processing)
    }

    /// The job-status vocabulary used by status snapshots.
    pub fn as_job_status(self) -> JobStatus {
        match self {
            BatchStatus::Processing => JobStatus::Processing,
            BatchStatus::Completed => JobStatus::Completed,
            BatchStatus::Failed => JobStatus::Failed,
        }
    }
}

/// What a batch becomes when every child has finished but some failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// The batch completes; failed children are reported individually.
    #[default]
    CompleteWithFailures,
    /// Any failed child fails the whole batch.
    FailBatch,
}

/// Final outcome of a child job as reported to its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChildOutcome {
    Succeeded,
    Failed { error: JobError },
}

impl ChildOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ChildOutcome::Failed { .. })
    }

    /// Outcome of a terminal job. `None` while the job is still running.
    pub fn of(job: &Job) -> Option<Self> {
        match job.status() {
            JobStatus::Completed => Some(ChildOutcome::Succeeded),
            JobStatus::Failed => Some(ChildOutcome::Failed {
                error: job
                    .error()
                    .cloned()
                    .unwrap_or_else(|| JobError::provider("job failed without error detail")),
            }),
            _ => None,
        }
    }
}

/// Batch-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch not found: {0}")]
    NotFound(BatchJobId),
    #[error("job {child} is not a child of batch {batch}")]
    UnknownChild { batch: BatchJobId, child: JobId },
    #[error("job {child} was already counted for batch {batch}")]
    AlreadyCounted { batch: BatchJobId, child: JobId },
    #[error("batch {0} is already terminal")]
    AlreadyTerminal(BatchJobId),
    #[error("batch {batch}: gave up after {attempts} conflicting writes")]
    Conflict { batch: BatchJobId, attempts: u32 },
    #[error("batch store error: {0}")]
    Store(String),
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BatchError::NotFound(_)
            | BatchError::UnknownChild { .. }
            | BatchError::AlreadyCounted { .. } => ErrorKind::Validation,
            BatchError::AlreadyTerminal(_) => ErrorKind::InvalidTransition,
            BatchError::Conflict { .. } => ErrorKind::ConcurrencyConflict,
            BatchError::Store(_) => ErrorKind::Network,
        }
    }

    /// Structured form. An exhausted conflict is fatal.
    pub fn to_job_error(&self) -> JobError {
        let error = JobError::new(self.kind(), self.to_string());
        match self {
            BatchError::Conflict { .. } => error.fatal(),
            _ => error,
        }
    }
}

/// A batch as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    id: BatchJobId,
    user_id: UserId,
    total_count: u32,
    completed_count: u32,
    status: BatchStatus,
    child_job_ids: Vec<JobId>,
    child_outcomes: BTreeMap<JobId, ChildOutcome>,
    policy: PartialFailurePolicy,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

/// Result of counting one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch: BatchJob,
    /// Set only on the single write that made the batch terminal.
    pub became_terminal: Option<BatchStatus>,
}

impl BatchJob {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    pub fn completed_count(&self) -> u32 {
        self.completed_count
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn child_job_ids(&self) -> &[JobId] {
        &self.child_job_ids
    }

    pub fn policy(&self) -> PartialFailurePolicy {
        self.policy
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn outcome_of(&self, child: JobId) -> Option<&ChildOutcome> {
        self.child_outcomes.get(&child)
    }

    pub fn failed_children(&self) -> impl Iterator<Item = (JobId, &JobError)> + '_ {
        self.child_outcomes.iter().filter_map(|(id, outcome)| match outcome {
            ChildOutcome::Failed { error } => Some((*id, error)),
            ChildOutcome::Succeeded => None,
        })
    }

    pub fn progress_percent(&self) -> u8 {
        if self.total_count == 0 {
            return 100;
        }
        let pct = u64::from(self.completed_count) * 100 / u64::from(self.total_count);
        pct.min(100) as u8
    }

    /// Count `child`'s final outcome.
    ///
    /// Returns the next version of the batch; `self` is left untouched. The
    /// terminal status is decided here, on the increment that reaches
    /// `total_count`, and reported through `became_terminal`.
    pub fn record_child(
        &self,
        child: JobId,
        outcome: ChildOutcome,
        now: DateTime<Utc>,
    ) -> Result<BatchProgress, BatchError> {
        if !self.child_job_ids.contains(&child) {
            return Err(BatchError::UnknownChild {
                batch: self.id,
                child,
            });
        }
        if self.child_outcomes.contains_key(&child) {
            return Err(BatchError::AlreadyCounted {
                batch: self.id,
                child,
            });
        }
        if self.status.is_terminal() || self.completed_count >= self.total_count {
            return Err(BatchError::AlreadyTerminal(self.id));
        }

        let mut next = self.clone();
        next.child_outcomes.insert(child, outcome);
        next.completed_count += 1;
        next.updated_at = now;
        next.version += 1;

        let became_terminal = if next.completed_count == next.total_count {
            let any_failed = next.child_outcomes.values().any(ChildOutcome::is_failure);
            next.status = match (any_failed, next.policy) {
                (true, PartialFailurePolicy::FailBatch) => BatchStatus::Failed,
                _ => BatchStatus::Completed,
            };
            Some(next.status)
        } else {
            None
        };

        Ok(BatchProgress {
            batch: next,
            became_terminal,
        })
    }
}

impl AggregateRoot for BatchJob {
    type Id = BatchJobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// One photo in a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub prompt: Option<String>,
    pub temp_asset_ref: AssetRef,
}

/// Command: create a batch with all of its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    pub user_id: UserId,
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub policy: PartialFailurePolicy,
}

/// Build a batch and its queued children. Persist them together.
pub fn create_batch(
    cmd: NewBatch,
    clock: &dyn TimeSource,
    ids: &dyn IdGenerator,
) -> DomainResult<(BatchJob, Vec<Job>)> {
    if cmd.items.is_empty() {
        return Err(DomainError::validation("batch must contain at least one item"));
    }
    if cmd.items.len() > MAX_BATCH_SIZE {
        return Err(DomainError::validation(format!(
            "batch exceeds {MAX_BATCH_SIZE} items"
        )));
    }

    let batch_id = ids.batch_job_id();
    let children = cmd
        .items
        .into_iter()
        .map(|item| {
            create_job(
                NewJob {
                    user_id: cmd.user_id,
                    prompt: item.prompt,
                    temp_asset_ref: item.temp_asset_ref,
                    batch_job_id: Some(batch_id),
                },
                clock,
                ids,
            )
        })
        .collect::<DomainResult<Vec<_>>>()?;

    let now = clock.now();
    let batch = BatchJob {
        id: batch_id,
        user_id: cmd.user_id,
        total_count: children.len() as u32,
        completed_count: 0,
        status: BatchStatus::Processing,
        child_job_ids: children.iter().map(|j| *j.id()).collect(),
        child_outcomes: BTreeMap::new(),
        policy: cmd.policy,
        created_at: now,
        updated_at: now,
        version: 1,
    };

    Ok((batch, children))
}
