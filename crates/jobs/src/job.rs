//! Single-job lifecycle: `Queued → Processing → Editing → {Completed | Failed}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pixelflow_core::{
    AggregateRoot, AssetRef, BatchJobId, DomainError, DomainResult, IdGenerator, JobError, JobId,
    JobStatus, TimeSource, UserId,
};

/// Longest prompt accepted at creation time (characters).
pub const MAX_PROMPT_CHARS: usize = 2_000;

/// A photo job as persisted by the store.
///
/// Fields are private: the only way to obtain a job in a later state is
/// [`transition`], which enforces the lifecycle graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    user_id: UserId,
    status: JobStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    batch_job_id: Option<BatchJobId>,
    prompt: Option<String>,
    temp_asset_ref: AssetRef,
    final_asset_ref: Option<AssetRef>,
    error: Option<JobError>,
    retry_count: u32,
    /// False when the delivered asset is the unedited original.
    edit_applied: bool,
    version: u64,
}

impl Job {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn batch_job_id(&self) -> Option<BatchJobId> {
        self.batch_job_id
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn temp_asset_ref(&self) -> &AssetRef {
        &self.temp_asset_ref
    }

    pub fn final_asset_ref(&self) -> Option<&AssetRef> {
        self.final_asset_ref.as_ref()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn edit_applied(&self) -> bool {
        self.edit_applied
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl AggregateRoot for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: create a job in `Queued`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: UserId,
    pub prompt: Option<String>,
    pub temp_asset_ref: AssetRef,
    #[serde(default)]
    pub batch_job_id: Option<BatchJobId>,
}

/// Lifecycle events a job reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A worker picked the job up.
    Start,
    /// Analysis finished (or fell back); editing starts.
    AnalysisFinished {
        /// Prompt derived by the analysis. `None` keeps the current prompt.
        prompt: Option<String>,
        retries: u32,
    },
    /// The final asset exists.
    EditCompleted {
        final_asset: AssetRef,
        /// False when the original asset is delivered unedited.
        edited: bool,
        retries: u32,
    },
    /// Unrecoverable error.
    Fail { error: JobError },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Start => "start",
            JobEvent::AnalysisFinished { .. } => "analysis_finished",
            JobEvent::EditCompleted { .. } => "edit_completed",
            JobEvent::Fail { .. } => "fail",
        }
    }
}

pub fn is_terminal(status: JobStatus) -> bool {
    status.is_terminal()
}

pub fn is_in_progress(status: JobStatus) -> bool {
    status.is_in_progress()
}

/// The transition table. Pure: knows nothing about the job's fields.
pub fn next_status(current: JobStatus, event: &JobEvent) -> DomainResult<JobStatus> {
    match (current, event) {
        (JobStatus::Queued, JobEvent::Start) => Ok(JobStatus::Processing),
        (JobStatus::Processing, JobEvent::AnalysisFinished { .. }) => Ok(JobStatus::Editing),
        (JobStatus::Editing, JobEvent::EditCompleted { .. }) => Ok(JobStatus::Completed),
        (from, JobEvent::Fail { .. }) if !from.is_terminal() => Ok(JobStatus::Failed),
        (from, event) => Err(DomainError::invalid_transition(from, event.name())),
    }
}

/// Create a new job in `Queued`.
pub fn create_job(cmd: NewJob, clock: &dyn TimeSource, ids: &dyn IdGenerator) -> DomainResult<Job> {
    if cmd.temp_asset_ref.is_empty() {
        return Err(DomainError::validation("temp_asset_ref must not be empty"));
    }
    let prompt = normalize_prompt(cmd.prompt)?;

    let now = clock.now();
    Ok(Job {
        id: ids.job_id(),
        user_id: cmd.user_id,
        status: JobStatus::Queued,
        created_at: now,
        updated_at: now,
        batch_job_id: cmd.batch_job_id,
        prompt,
        temp_asset_ref: cmd.temp_asset_ref,
        final_asset_ref: None,
        error: None,
        retry_count: 0,
        edit_applied: false,
        version: 1,
    })
}

/// Apply `event` to `job`, returning the next version of the job.
///
/// The input is never modified; on error nothing changes.
pub fn transition(job: &Job, event: JobEvent, clock: &dyn TimeSource) -> DomainResult<Job> {
    let status = next_status(job.status, &event)?;

    let mut next = job.clone();
    match event {
        JobEvent::Start => {}
        JobEvent::AnalysisFinished { prompt, retries } => {
            if let Some(prompt) = normalize_prompt(prompt)? {
                next.prompt = Some(prompt);
            }
            next.retry_count = next.retry_count.saturating_add(retries);
        }
        JobEvent::EditCompleted {
            final_asset,
            edited,
            retries,
        } => {
            if final_asset.is_empty() {
                return Err(DomainError::validation("final_asset must not be empty"));
            }
            next.final_asset_ref = Some(final_asset);
            next.edit_applied = edited;
            next.retry_count = next.retry_count.saturating_add(retries);
        }
        JobEvent::Fail { error } => {
            next.error = Some(error);
        }
    }

    next.status = status;
    next.updated_at = clock.now();
    next.version += 1;
    Ok(next)
}

fn normalize_prompt(prompt: Option<String>) -> DomainResult<Option<String>> {
    let Some(prompt) = prompt else {
        return Ok(None);
    };
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_PROMPT_CHARS {
        return Err(DomainError::validation(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pixelflow_core::{ErrorKind, ManualClock, SequentialIds};
    use proptest::prelude::*;
    use std::time::Duration;

    pub(crate) fn new_job(clock: &ManualClock, ids: &SequentialIds) -> Job {
        create_job(
            NewJob {
                user_id: UserId::new(),
                prompt: Some("  warm sunset  ".to_string()),
                temp_asset_ref: AssetRef::new("uploads/tmp/1.jpg"),
                batch_job_id: None,
            },
            clock,
            ids,
        )
        .unwrap()
    }

    fn job_in(status: JobStatus, clock: &ManualClock) -> Job {
        let ids = SequentialIds::new();
        let job = new_job(clock, &ids);
        let path: Vec<JobEvent> = match status {
            JobStatus::Queued => vec![],
            JobStatus::Processing => vec![JobEvent::Start],
            JobStatus::Editing => vec![JobEvent::Start, analysis(0)],
            JobStatus::Completed => vec![JobEvent::Start, analysis(0), edit(0)],
            JobStatus::Failed => vec![JobEvent::Fail {
                error: JobError::validation("corrupt image"),
            }],
        };
        path.into_iter()
            .fold(job, |job, event| transition(&job, event, clock).unwrap())
    }

    fn analysis(retries: u32) -> JobEvent {
        JobEvent::AnalysisFinished {
            prompt: Some("brighten shadows".to_string()),
            retries,
        }
    }

    fn edit(retries: u32) -> JobEvent {
        JobEvent::EditCompleted {
            final_asset: AssetRef::new("uploads/final/1.jpg"),
            edited: true,
            retries,
        }
    }

    fn event_for(index: usize) -> JobEvent {
        match index % 4 {
            0 => JobEvent::Start,
            1 => analysis(0),
            2 => edit(0),
            _ => JobEvent::Fail {
                error: JobError::provider("boom"),
            },
        }
    }

    fn expected(status: JobStatus, event: &JobEvent) -> Option<JobStatus> {
        match (status, event) {
            (JobStatus::Queued, JobEvent::Start) => Some(JobStatus::Processing),
            (JobStatus::Processing, JobEvent::AnalysisFinished { .. }) => Some(JobStatus::Editing),
            (JobStatus::Editing, JobEvent::EditCompleted { .. }) => Some(JobStatus::Completed),
            (JobStatus::Queued | JobStatus::Processing | JobStatus::Editing, JobEvent::Fail { .. }) => {
                Some(JobStatus::Failed)
            }
            _ => None,
        }
    }

    #[test]
    fn create_queues_with_normalized_prompt() {
        let clock = ManualClock::epoch();
        let ids = SequentialIds::new();
        let job = new_job(&clock, &ids);

        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.prompt(), Some("warm sunset"));
        assert_eq!(job.retry_count(), 0);
        assert_eq!(job.version(), 1);
        assert_eq!(job.created_at(), clock.now());
    }

    #[test]
    fn create_rejects_empty_asset() {
        let clock = ManualClock::epoch();
        let err = create_job(
            NewJob {
                user_id: UserId::new(),
                prompt: None,
                temp_asset_ref: AssetRef::new("  "),
                batch_job_id: None,
            },
            &clock,
            &SequentialIds::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn create_rejects_oversized_prompt() {
        let clock = ManualClock::epoch();
        let err = create_job(
            NewJob {
                user_id: UserId::new(),
                prompt: Some("x".repeat(MAX_PROMPT_CHARS + 1)),
                temp_asset_ref: AssetRef::new("a.jpg"),
                batch_job_id: None,
            },
            &clock,
            &SequentialIds::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn happy_path_accumulates_retries_and_timestamps() {
        let clock = ManualClock::epoch();
        let ids = SequentialIds::new();
        let job = new_job(&clock, &ids);

        clock.advance(Duration::from_secs(1));
        let job = transition(&job, JobEvent::Start, &clock).unwrap();
        let job = transition(&job, analysis(2), &clock).unwrap();
        assert_eq!(job.prompt(), Some("brighten shadows"));

        clock.advance(Duration::from_secs(1));
        let job = transition(&job, edit(1), &clock).unwrap();

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.retry_count(), 3);
        assert_eq!(job.version(), 4);
        assert!(job.edit_applied());
        assert_eq!(job.final_asset_ref().map(AssetRef::as_str), Some("uploads/final/1.jpg"));
        assert_eq!((job.updated_at() - job.created_at()).num_seconds(), 2);
    }

    #[test]
    fn analysis_without_prompt_keeps_existing_prompt() {
        let clock = ManualClock::epoch();
        let job = job_in(JobStatus::Processing, &clock);
        let job = transition(
            &job,
            JobEvent::AnalysisFinished {
                prompt: None,
                retries: 0,
            },
            &clock,
        )
        .unwrap();
        assert_eq!(job.prompt(), Some("warm sunset"));
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let clock = ManualClock::epoch();
        for status in [JobStatus::Completed, JobStatus::Failed] {
            let job = job_in(status, &clock);
            for i in 0..4 {
                let err = transition(&job, event_for(i), &clock).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidTransition);
            }
        }
    }

    #[test]
    fn failure_records_structured_error() {
        let clock = ManualClock::epoch();
        let job = job_in(JobStatus::Editing, &clock);
        let job = transition(
            &job,
            JobEvent::Fail {
                error: JobError::provider("model unavailable").fatal(),
            },
            &clock,
        )
        .unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().map(|e| e.kind), Some(ErrorKind::Provider));
    }

    proptest! {
        /// Property: every (status, event) pair either lands on the tabled
        /// next state or fails with `InvalidTransition` leaving the job as is.
        #[test]
        fn transition_table_is_exact(status_idx in 0usize..5, event_idx in 0usize..4) {
            let clock = ManualClock::epoch();
            let status = JobStatus::ALL[status_idx];
            let job = job_in(status, &clock);
            let before = job.clone();
            let event = event_for(event_idx);
            let want = expected(status, &event);

            match transition(&job, event, &clock) {
                Ok(next) => {
                    prop_assert_eq!(Some(next.status()), want);
                    prop_assert_eq!(next.version(), before.version() + 1);
                }
                Err(err) => {
                    prop_assert!(want.is_none());
                    prop_assert_eq!(err.kind(), ErrorKind::InvalidTransition);
                }
            }
            prop_assert_eq!(job, before);
        }
    }
}
