//! Job orchestration: create, advance, process and report on photo jobs.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use pixelflow_core::{
    AggregateRoot, AssetRef, BatchJobId, DomainError, ErrorKind, ExpectedVersion, IdGenerator,
    JobError, JobId, JobStatus, StatusSnapshot, StatusTarget, SystemClock, TimeSource, UserId,
    UuidV7Ids,
};
use pixelflow_jobs::{
    BatchError, BatchItem, BatchJob, ChildOutcome, Job, JobEvent, NewBatch, NewJob, create_batch,
    create_job, transition,
};
use pixelflow_resilience::{CircuitState, ResiliencePolicy};

use crate::aggregator::BatchAggregator;
use crate::config::{AnalysisFallback, EditFallback, OrchestratorConfig};
use crate::notifier::{CompletionNotifier, Notification};
use crate::provider::{AnalysisRequest, EditRequest, PhotoEditProvider};
use crate::status::{batch_snapshot, job_snapshot};
use crate::store::{JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job {job_id}: gave up after {attempts} conflicting writes")]
    Conflict { job_id: JobId, attempts: u32 },
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Domain(e) => e.kind(),
            OrchestratorError::Batch(e) => e.kind(),
            OrchestratorError::Store(JobStoreError::NotFound(_) | JobStoreError::AlreadyExists(_)) => {
                ErrorKind::Validation
            }
            OrchestratorError::Store(JobStoreError::Conflict { .. })
            | OrchestratorError::Conflict { .. } => ErrorKind::ConcurrencyConflict,
            OrchestratorError::Store(JobStoreError::Storage(_)) => ErrorKind::Network,
        }
    }

    /// Structured form. Conflicts that outlasted their retry bound are fatal.
    pub fn to_job_error(&self) -> JobError {
        match self {
            OrchestratorError::Batch(e) => e.to_job_error(),
            OrchestratorError::Conflict { .. } => JobError::new(self.kind(), self.to_string()).fatal(),
            _ => JobError::new(self.kind(), self.to_string()),
        }
    }
}

/// Outcome of one `process_job` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job reached a terminal state in this call.
    Finished(Job),
    /// Someone else already moved the job out of `Queued`.
    Skipped { job_id: JobId, status: JobStatus },
}

/// Drives jobs through analysis and editing.
///
/// Every state change is a conditional write: the job is read, the transition
/// is computed from that version, and the write only lands if the version is
/// unchanged. A conflicting write is re-read and re-applied up to
/// `job_conflict_retries` times. Only the caller whose write made a job
/// terminal reports it to its batch and notifies.
pub struct JobOrchestrator<S> {
    store: S,
    aggregator: BatchAggregator<S>,
    provider: Arc<dyn PhotoEditProvider>,
    policy: ResiliencePolicy,
    notifier: Arc<dyn CompletionNotifier>,
    clock: Arc<dyn TimeSource>,
    ids: Arc<dyn IdGenerator>,
    config: OrchestratorConfig,
}

impl<S: JobStore + Clone> JobOrchestrator<S> {
    pub fn new(
        store: S,
        provider: Arc<dyn PhotoEditProvider>,
        notifier: Arc<dyn CompletionNotifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_providers(
            store,
            provider,
            notifier,
            config,
            Arc::new(SystemClock),
            Arc::new(UuidV7Ids),
        )
    }

    /// Construct with explicit time and id sources.
    pub fn with_providers(
        store: S,
        provider: Arc<dyn PhotoEditProvider>,
        notifier: Arc<dyn CompletionNotifier>,
        config: OrchestratorConfig,
        clock: Arc<dyn TimeSource>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let policy = ResiliencePolicy::new(
            format!("provider:{}", provider.name()),
            config.resilience.clone(),
            clock.clone(),
        );
        Self {
            aggregator: BatchAggregator::new(store.clone(), clock.clone(), config.batch_conflict_retries),
            store,
            provider,
            policy,
            notifier,
            clock,
            ids,
            config,
        }
    }

    /// Replace the provider call policy (e.g. to inject a sleeper).
    pub fn with_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn provider_circuit(&self) -> CircuitState {
        self.policy.circuit_state()
    }

    /// Create and persist a standalone queued job.
    pub fn create_job(
        &self,
        user_id: UserId,
        temp_asset_ref: AssetRef,
        prompt: Option<String>,
    ) -> Result<Job, OrchestratorError> {
        let job = create_job(
            NewJob {
                user_id,
                prompt,
                temp_asset_ref,
                batch_job_id: None,
            },
            self.clock.as_ref(),
            self.ids.as_ref(),
        )?;
        self.store.insert_job(job.clone())?;
        info!(job_id = %job.id(), user_id = %user_id, "job created");
        Ok(job)
    }

    /// Create a batch and all of its children in one store write.
    pub fn create_batch(
        &self,
        user_id: UserId,
        items: Vec<BatchItem>,
    ) -> Result<(BatchJob, Vec<Job>), OrchestratorError> {
        let (batch, children) = create_batch(
            NewBatch {
                user_id,
                items,
                policy: self.config.partial_failure_policy,
            },
            self.clock.as_ref(),
            self.ids.as_ref(),
        )?;
        self.store.insert_batch(batch.clone(), children.clone())?;
        info!(
            batch_id = %batch.id(),
            user_id = %user_id,
            total = batch.total_count(),
            "batch created"
        );
        Ok((batch, children))
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| DomainError::not_found(format!("job {job_id}")).into())
    }

    pub fn get_batch(&self, batch_id: BatchJobId) -> Result<BatchJob, OrchestratorError> {
        self.store
            .get_batch(batch_id)?
            .ok_or_else(|| BatchError::NotFound(batch_id).into())
    }

    /// Apply `event` to a job with a conditional write.
    ///
    /// If this write made the job terminal, the job's batch is updated and
    /// completion notifications are sent before returning.
    pub async fn advance(&self, job_id: JobId, event: JobEvent) -> Result<Job, OrchestratorError> {
        let job = self.apply(job_id, event)?;
        if job.is_terminal() {
            self.on_terminal(&job).await?;
        }
        Ok(job)
    }

    /// Fail a job from any non-terminal state.
    pub async fn fail_job(&self, job_id: JobId, error: JobError) -> Result<Job, OrchestratorError> {
        self.advance(job_id, JobEvent::Fail { error }).await
    }

    /// Run one queued job through analysis and editing.
    ///
    /// Provider calls go through the resilience policy. Exhausted or rejected
    /// calls fall back according to configuration; a job is failed only when
    /// the configured fallback says so.
    pub async fn process_job(&self, job_id: JobId) -> Result<ProcessOutcome, OrchestratorError> {
        let job = match self.apply(job_id, JobEvent::Start) {
            Ok(job) => job,
            Err(OrchestratorError::Domain(DomainError::InvalidTransition { .. })) => {
                let status = self.get_job(job_id)?.status();
                debug!(job_id = %job_id, status = ?status, "job already claimed");
                return Ok(ProcessOutcome::Skipped { job_id, status });
            }
            Err(e) => return Err(e),
        };
        info!(job_id = %job_id, provider = %self.provider.name(), "processing job");

        let analysis_request = AnalysisRequest {
            job_id,
            asset: job.temp_asset_ref().clone(),
            user_prompt: job.prompt().map(str::to_string),
        };
        let analysis = self
            .policy
            .execute_job(|| self.provider.analyze(&analysis_request))
            .await;

        let analysis_event = match analysis {
            Ok(out) => JobEvent::AnalysisFinished {
                retries: out.retries(),
                prompt: Some(out.value.prompt),
            },
            Err(err) => match self.config.analysis_fallback {
                AnalysisFallback::DefaultPrompt => {
                    warn!(job_id = %job_id, error = %err, "analysis unavailable; using fallback prompt");
                    JobEvent::AnalysisFinished {
                        retries: err.attempts().saturating_sub(1),
                        prompt: match job.prompt() {
                            Some(_) => None,
                            None => Some(self.config.default_prompt.clone()),
                        },
                    }
                }
                AnalysisFallback::FailJob => {
                    return self.finish_failed(job_id, err.to_job_error()).await;
                }
            },
        };
        let job = self.advance(job_id, analysis_event).await?;

        let edit_request = EditRequest {
            job_id,
            asset: job.temp_asset_ref().clone(),
            prompt: job.prompt().map(str::to_string),
        };
        let edit = self.policy.execute_job(|| self.provider.edit(&edit_request)).await;

        let edit_event = match edit {
            Ok(out) if out.value.is_empty() => {
                warn!(job_id = %job_id, "provider returned an empty asset");
                self.edit_fallback_event(&job, 0, JobError::provider("provider returned an empty asset"))
            }
            Ok(out) => JobEvent::EditCompleted {
                retries: out.retries(),
                final_asset: out.value,
                edited: true,
            },
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "edit unavailable");
                self.edit_fallback_event(&job, err.attempts().saturating_sub(1), err.to_job_error())
            }
        };
        let job = self.advance(job_id, edit_event).await?;
        Ok(ProcessOutcome::Finished(job))
    }

    /// Current status of a job or batch. Never mutates.
    pub fn status(&self, target: StatusTarget) -> Result<StatusSnapshot, OrchestratorError> {
        match target {
            StatusTarget::Job(job_id) => Ok(job_snapshot(&self.get_job(job_id)?)),
            StatusTarget::Batch(batch_id) => {
                let batch = self.get_batch(batch_id)?;
                let children = self.store.batch_children(batch_id)?;
                Ok(batch_snapshot(&batch, &children))
            }
        }
    }

    /// Count terminal children that their batch has not recorded yet.
    ///
    /// A child's terminal write lands before its batch increment, so a lost
    /// increment leaves the batch short. Children already counted are
    /// skipped, which makes this safe to run at any time. Returns how many
    /// children were counted.
    pub async fn reconcile_batch(&self, batch_id: BatchJobId) -> Result<usize, OrchestratorError> {
        let batch = self.get_batch(batch_id)?;
        if batch.status().is_terminal() {
            return Ok(0);
        }

        let mut counted = 0;
        for child in self.store.batch_children(batch_id)? {
            let Some(outcome) = ChildOutcome::of(&child) else {
                continue;
            };
            if batch.outcome_of(*child.id()).is_some() {
                continue;
            }

            match self
                .aggregator
                .increment_batch_progress(batch_id, *child.id(), outcome)
            {
                Ok(progress) => {
                    counted += 1;
                    if progress.became_terminal.is_some() {
                        self.send(Notification::for_batch(&progress.batch)).await;
                    }
                }
                Err(BatchError::AlreadyCounted { .. } | BatchError::AlreadyTerminal(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if counted > 0 {
            info!(batch_id = %batch_id, counted, "batch reconciled");
        }
        Ok(counted)
    }

    /// Reconcile up to `limit` open batches, oldest first.
    pub async fn reconcile_open_batches(&self, limit: usize) -> Result<usize, OrchestratorError> {
        let mut counted = 0;
        for batch in self.store.open_batches(limit)? {
            match self.reconcile_batch(*batch.id()).await {
                Ok(n) => counted += n,
                Err(e) => warn!(batch_id = %batch.id(), error = %e, "batch reconciliation failed"),
            }
        }
        Ok(counted)
    }

    fn edit_fallback_event(&self, job: &Job, retries: u32, error: JobError) -> JobEvent {
        match self.config.edit_fallback {
            EditFallback::OriginalAsset => JobEvent::EditCompleted {
                final_asset: job.temp_asset_ref().clone(),
                edited: false,
                retries,
            },
            EditFallback::FailJob => JobEvent::Fail { error },
        }
    }

    async fn finish_failed(&self, job_id: JobId, error: JobError) -> Result<ProcessOutcome, OrchestratorError> {
        let job = self.fail_job(job_id, error).await?;
        Ok(ProcessOutcome::Finished(job))
    }

    fn apply(&self, job_id: JobId, event: JobEvent) -> Result<Job, OrchestratorError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = self.get_job(job_id)?;
            let next = transition(&current, event.clone(), self.clock.as_ref())?;

            match self
                .store
                .update_job(&next, ExpectedVersion::Exact(current.version()))
            {
                Ok(()) => {
                    debug!(
                        job_id = %job_id,
                        event = event.name(),
                        from = ?current.status(),
                        to = ?next.status(),
                        "job transitioned"
                    );
                    return Ok(next);
                }
                Err(JobStoreError::Conflict { .. }) if attempts <= self.config.job_conflict_retries => {
                    debug!(job_id = %job_id, event = event.name(), "job write conflict; re-reading");
                }
                Err(JobStoreError::Conflict { .. }) => {
                    return Err(OrchestratorError::Conflict { job_id, attempts });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn on_terminal(&self, job: &Job) -> Result<(), OrchestratorError> {
        match job.status() {
            JobStatus::Completed => info!(
                job_id = %job.id(),
                edited = job.edit_applied(),
                retries = job.retry_count(),
                "job completed"
            ),
            _ => warn!(job_id = %job.id(), error = ?job.error(), "job failed"),
        }
        self.send(Notification::for_job(job)).await;

        let (Some(batch_id), Some(outcome)) = (job.batch_job_id(), ChildOutcome::of(job)) else {
            return Ok(());
        };

        match self
            .aggregator
            .increment_batch_progress(batch_id, *job.id(), outcome)
        {
            Ok(progress) => {
                if progress.became_terminal.is_some() {
                    self.send(Notification::for_batch(&progress.batch)).await;
                }
                Ok(())
            }
            Err(BatchError::AlreadyCounted { .. }) => {
                debug!(job_id = %job.id(), batch_id = %batch_id, "child already counted");
                Ok(())
            }
            Err(e @ (BatchError::Conflict { .. } | BatchError::Store(_))) => {
                warn!(job_id = %job.id(), batch_id = %batch_id, error = %e, "batch aggregation failed; reconciling");
                if let Err(e) = self.reconcile_batch(batch_id).await {
                    warn!(batch_id = %batch_id, error = %e, "batch left for later reconciliation");
                }
                Ok(())
            }
            Err(e) => {
                error!(job_id = %job.id(), batch_id = %batch_id, error = %e, "batch aggregation failed");
                Err(e.into())
            }
        }
    }

    async fn send(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(subject = %notification.subject, error = %e, "notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MemoryNotifier;
    use crate::provider::PassthroughProvider;
    use crate::store::{InMemoryJobStore, JobStats};
    use pixelflow_core::{ManualClock, SequentialIds};
    use pixelflow_jobs::BatchStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Refuses the first `conflicts` batch writes as if another writer won.
    struct ContendedBatches {
        inner: InMemoryJobStore,
        conflicts: AtomicU32,
    }

    impl JobStore for ContendedBatches {
        fn insert_job(&self, job: Job) -> Result<(), JobStoreError> {
            self.inner.insert_job(job)
        }

        fn insert_batch(&self, batch: BatchJob, children: Vec<Job>) -> Result<(), JobStoreError> {
            self.inner.insert_batch(batch, children)
        }

        fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get_job(job_id)
        }

        fn get_batch(&self, batch_id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
            self.inner.get_batch(batch_id)
        }

        fn update_job(&self, job: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError> {
            self.inner.update_job(job, expected)
        }

        fn update_batch(&self, batch: &BatchJob, expected: ExpectedVersion) -> Result<(), JobStoreError> {
            let contended = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if contended {
                return Err(JobStoreError::Conflict {
                    id: batch.id().to_string(),
                    expected,
                    actual: batch.version(),
                });
            }
            self.inner.update_batch(batch, expected)
        }

        fn next_queued(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.next_queued(limit)
        }

        fn list_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_user(user_id, limit)
        }

        fn batch_children(&self, batch_id: BatchJobId) -> Result<Vec<Job>, JobStoreError> {
            self.inner.batch_children(batch_id)
        }

        fn open_batches(&self, limit: usize) -> Result<Vec<BatchJob>, JobStoreError> {
            self.inner.open_batches(limit)
        }

        fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats()
        }
    }

    fn orchestrator() -> (JobOrchestrator<Arc<InMemoryJobStore>>, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let orchestrator = JobOrchestrator::with_providers(
            InMemoryJobStore::arc(),
            Arc::new(PassthroughProvider::new("enhance")),
            notifier.clone(),
            OrchestratorConfig::default(),
            Arc::new(ManualClock::epoch()),
            Arc::new(SequentialIds::new()),
        );
        (orchestrator, notifier)
    }

    #[tokio::test]
    async fn second_start_is_skipped() {
        let (orchestrator, notifier) = orchestrator();
        let job = orchestrator
            .create_job(UserId::new(), AssetRef::new("tmp/a.jpg"), None)
            .unwrap();

        let first = orchestrator.process_job(*job.id()).await.unwrap();
        let ProcessOutcome::Finished(done) = first else {
            panic!("expected the job to finish");
        };
        assert_eq!(done.status(), JobStatus::Completed);
        assert_eq!(done.prompt(), Some("enhance"));

        let again = orchestrator.process_job(*job.id()).await.unwrap();
        assert_eq!(
            again,
            ProcessOutcome::Skipped {
                job_id: *job.id(),
                status: JobStatus::Completed
            }
        );
        assert_eq!(notifier.count_for(&StatusTarget::Job(*job.id())), 1);
    }

    #[tokio::test]
    async fn fail_job_is_rejected_once_terminal() {
        let (orchestrator, notifier) = orchestrator();
        let job = orchestrator
            .create_job(UserId::new(), AssetRef::new("tmp/a.jpg"), None)
            .unwrap();

        let failed = orchestrator
            .fail_job(*job.id(), JobError::validation("corrupt upload"))
            .await
            .unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);

        let err = orchestrator
            .fail_job(*job.id(), JobError::validation("again"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[test]
    fn status_of_unknown_job_is_validation() {
        let (orchestrator, _) = orchestrator();
        let err = orchestrator.status(StatusTarget::Job(JobId::new())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn empty_asset_is_rejected_at_creation() {
        let (orchestrator, _) = orchestrator();
        let err = orchestrator
            .create_job(UserId::new(), AssetRef::new("  "), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(orchestrator.store().stats().unwrap().queued, 0);
    }

    #[tokio::test]
    async fn lost_batch_increment_is_recovered_by_reconciliation() {
        // Default bound is 8 re-reads, so each increment makes 9 writes.
        // 20 refusals sink the first child's increment and its immediate
        // reconciliation; the second child lands after 2 more.
        let store = Arc::new(ContendedBatches {
            inner: InMemoryJobStore::new(),
            conflicts: AtomicU32::new(20),
        });
        let notifier = Arc::new(MemoryNotifier::new());
        let orchestrator = JobOrchestrator::with_providers(
            store.clone(),
            Arc::new(PassthroughProvider::new("enhance")),
            notifier.clone(),
            OrchestratorConfig::default(),
            Arc::new(ManualClock::epoch()),
            Arc::new(SequentialIds::new()),
        );
        let items = (0..2)
            .map(|i| BatchItem {
                prompt: None,
                temp_asset_ref: AssetRef::new(format!("tmp/{i}.jpg")),
            })
            .collect();
        let (batch, children) = orchestrator.create_batch(UserId::new(), items).unwrap();
        let batch_id = *batch.id();
        let target = StatusTarget::Batch(batch_id);

        for child in &children {
            let outcome = orchestrator.process_job(*child.id()).await.unwrap();
            let ProcessOutcome::Finished(done) = outcome else {
                panic!("expected the child to finish");
            };
            assert_eq!(done.status(), JobStatus::Completed);
        }

        let stuck = orchestrator.get_batch(batch_id).unwrap();
        assert_eq!(stuck.completed_count(), 1);
        assert_eq!(stuck.status(), BatchStatus::Processing);
        assert_eq!(notifier.count_for(&target), 0);

        assert_eq!(orchestrator.reconcile_open_batches(10).await.unwrap(), 1);

        let done = orchestrator.get_batch(batch_id).unwrap();
        assert_eq!(done.completed_count(), 2);
        assert_eq!(done.status(), BatchStatus::Completed);
        assert_eq!(notifier.count_for(&target), 1);

        assert_eq!(orchestrator.reconcile_batch(batch_id).await.unwrap(), 0);
        assert_eq!(notifier.count_for(&target), 1);
    }

    #[test]
    fn exhausted_conflicts_are_fatal() {
        let job = OrchestratorError::Conflict {
            job_id: JobId::new(),
            attempts: 2,
        };
        assert_eq!(job.kind(), ErrorKind::ConcurrencyConflict);
        assert!(!job.to_job_error().is_retryable());

        let batch = OrchestratorError::from(BatchError::Conflict {
            batch: BatchJobId::new(),
            attempts: 9,
        });
        assert_eq!(batch.kind(), ErrorKind::ConcurrencyConflict);
        assert!(!batch.to_job_error().is_retryable());

        let store = OrchestratorError::from(JobStoreError::Storage("disk".into()));
        assert!(store.to_job_error().is_retryable());
    }
}
