//! End-to-end job lifecycle against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use pixelflow_core::{
    AggregateRoot, AssetRef, ErrorKind, JobError, JobStatus, ManualClock, SequentialIds,
    StatusTarget, UserId,
};
use pixelflow_infra::{
    Analysis, AnalysisRequest, EditFallback, EditRequest, InMemoryJobStore, JobOrchestrator,
    MemoryNotifier, OrchestratorConfig, PhotoEditProvider, ProcessOutcome,
};
use pixelflow_jobs::{BatchItem, PartialFailurePolicy};
use pixelflow_resilience::{
    CircuitBreakerConfig, CircuitState, FixedJitter, RecordingSleeper, ResilienceConfig,
    ResiliencePolicy, RetryPolicy,
};

/// Fails the first `fail_times` edit calls, every call for assets in
/// `broken`, and every call of any kind during an outage.
struct ScriptedProvider {
    fail_times: u32,
    outage: AtomicBool,
    calls: AtomicU32,
    edit_calls: AtomicU32,
    broken: HashSet<String>,
    error: JobError,
}

impl ScriptedProvider {
    fn healthy() -> Self {
        Self::failing_first(0)
    }

    fn failing_first(fail_times: u32) -> Self {
        Self {
            fail_times,
            outage: AtomicBool::new(false),
            calls: AtomicU32::new(0),
            edit_calls: AtomicU32::new(0),
            broken: HashSet::new(),
            error: JobError::provider("upstream 503"),
        }
    }

    fn with_broken(mut self, asset: &str, error: JobError) -> Self {
        self.broken.insert(asset.to_string());
        self.error = error;
        self
    }

    fn edit_calls(&self) -> u32 {
        self.edit_calls.load(Ordering::SeqCst)
    }

    fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhotoEditProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.outage.load(Ordering::SeqCst) {
            return Err(JobError::network("connection refused"));
        }
        Ok(Analysis {
            prompt: request.user_prompt.clone().unwrap_or_else(|| "brighten".into()),
        })
    }

    async fn edit(&self, request: &EditRequest) -> Result<AssetRef, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = self.edit_calls.fetch_add(1, Ordering::SeqCst);
        if self.outage.load(Ordering::SeqCst) {
            return Err(JobError::network("connection refused"));
        }
        if self.broken.contains(request.asset.as_str()) || n < self.fail_times {
            return Err(self.error.clone());
        }
        Ok(AssetRef::new(format!("final/{}", request.job_id)))
    }
}

struct Harness {
    orchestrator: JobOrchestrator<Arc<InMemoryJobStore>>,
    notifier: Arc<MemoryNotifier>,
    sleeper: Arc<RecordingSleeper>,
    clock: Arc<ManualClock>,
}

fn harness(provider: Arc<ScriptedProvider>, config: OrchestratorConfig) -> Harness {
    let clock = Arc::new(ManualClock::epoch());
    let notifier = Arc::new(MemoryNotifier::new());
    let sleeper = Arc::new(RecordingSleeper::new());
    let policy = ResiliencePolicy::new("provider:scripted", config.resilience.clone(), clock.clone())
        .with_sleeper(sleeper.clone())
        .with_jitter(Arc::new(FixedJitter(0.5)));

    let orchestrator = JobOrchestrator::with_providers(
        InMemoryJobStore::arc(),
        provider,
        notifier.clone(),
        config,
        clock.clone(),
        Arc::new(SequentialIds::new()),
    )
    .with_policy(policy);

    Harness {
        orchestrator,
        notifier,
        sleeper,
        clock,
    }
}

fn fast_retry(max_attempts: u32, threshold: u32) -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryPolicy::exponential(max_attempts, Duration::from_millis(100), Duration::from_secs(2))
            .with_jitter(0.0),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: threshold,
            cool_down: Duration::from_secs(60),
        },
    }
}

fn finished(outcome: ProcessOutcome) -> pixelflow_jobs::Job {
    match outcome {
        ProcessOutcome::Finished(job) => job,
        other => panic!("expected a finished job, got {other:?}"),
    }
}

#[tokio::test]
async fn single_job_completes_without_retries() {
    let provider = Arc::new(ScriptedProvider::healthy());
    let h = harness(provider, OrchestratorConfig::default().with_resilience(fast_retry(3, 5)));

    let job = h
        .orchestrator
        .create_job(UserId::new(), AssetRef::new("tmp/one.jpg"), None)
        .unwrap();
    let done = finished(h.orchestrator.process_job(*job.id()).await.unwrap());

    assert_eq!(done.status(), JobStatus::Completed);
    assert_eq!(done.retry_count(), 0);
    assert!(done.edit_applied());
    assert_eq!(done.prompt(), Some("brighten"));

    let snapshot = h.orchestrator.status(StatusTarget::Job(*job.id())).unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.final_asset, done.final_asset_ref().cloned());
    assert_eq!(h.notifier.count_for(&StatusTarget::Job(*job.id())), 1);
    assert!(h.sleeper.delays().is_empty());
}

#[tokio::test]
async fn transient_provider_failures_are_retried_and_counted() {
    let provider = Arc::new(ScriptedProvider::failing_first(2));
    let h = harness(
        provider.clone(),
        OrchestratorConfig::default().with_resilience(fast_retry(3, 5)),
    );

    let job = h
        .orchestrator
        .create_job(UserId::new(), AssetRef::new("tmp/two.jpg"), Some("warmer".into()))
        .unwrap();
    let done = finished(h.orchestrator.process_job(*job.id()).await.unwrap());

    assert_eq!(done.status(), JobStatus::Completed);
    assert_eq!(done.retry_count(), 2);
    assert_eq!(provider.edit_calls(), 3);
    assert_eq!(
        h.sleeper.delays(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
    assert_eq!(h.orchestrator.provider_circuit(), CircuitState::Closed);
}

async fn run_batch(policy: PartialFailurePolicy) -> (Harness, pixelflow_jobs::BatchJob) {
    let provider = Arc::new(
        ScriptedProvider::healthy().with_broken("tmp/b1.jpg", JobError::validation("unsupported format")),
    );
    let h = harness(
        provider,
        OrchestratorConfig::default()
            .with_resilience(fast_retry(2, 5))
            .with_edit_fallback(EditFallback::FailJob)
            .with_partial_failure_policy(policy),
    );

    let items = (0..3)
        .map(|i| BatchItem {
            prompt: None,
            temp_asset_ref: AssetRef::new(format!("tmp/b{i}.jpg")),
        })
        .collect();
    let (batch, children) = h.orchestrator.create_batch(UserId::new(), items).unwrap();

    for child in &children {
        h.orchestrator.process_job(*child.id()).await.unwrap();
    }
    let stored = h.orchestrator.get_batch(*batch.id()).unwrap();
    (h, stored)
}

#[tokio::test]
async fn batch_with_one_failure_completes_by_default() {
    let (h, batch) = run_batch(PartialFailurePolicy::CompleteWithFailures).await;

    assert_eq!(batch.completed_count(), 3);
    assert_eq!(batch.status().as_job_status(), JobStatus::Completed);
    assert_eq!(batch.failed_children().count(), 1);
    assert_eq!(h.notifier.count_for(&StatusTarget::Batch(*batch.id())), 1);

    let snapshot = h.orchestrator.status(StatusTarget::Batch(*batch.id())).unwrap();
    assert_eq!(snapshot.progress, Some(100));
    assert_eq!(snapshot.error, None);
    let failed: Vec<_> = snapshot
        .children
        .iter()
        .filter(|c| c.status == JobStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_ref().map(|e| e.kind), Some(ErrorKind::Validation));
}

#[tokio::test]
async fn batch_with_one_failure_fails_under_strict_policy() {
    let (h, batch) = run_batch(PartialFailurePolicy::FailBatch).await;

    assert_eq!(batch.completed_count(), 3);
    assert_eq!(batch.status().as_job_status(), JobStatus::Failed);
    assert_eq!(h.notifier.count_for(&StatusTarget::Batch(*batch.id())), 1);

    let snapshot = h.orchestrator.status(StatusTarget::Batch(*batch.id())).unwrap();
    assert!(snapshot.error.is_some());
}

#[tokio::test]
async fn edit_outage_delivers_original_asset() {
    let provider = Arc::new(ScriptedProvider::failing_first(u32::MAX));
    let h = harness(provider, OrchestratorConfig::default().with_resilience(fast_retry(2, 10)));

    let job = h
        .orchestrator
        .create_job(UserId::new(), AssetRef::new("tmp/orig.jpg"), None)
        .unwrap();
    let done = finished(h.orchestrator.process_job(*job.id()).await.unwrap());

    assert_eq!(done.status(), JobStatus::Completed);
    assert!(!done.edit_applied());
    assert_eq!(done.final_asset_ref(), Some(&AssetRef::new("tmp/orig.jpg")));
    assert_eq!(done.retry_count(), 1);
}

#[tokio::test]
async fn open_circuit_fails_fast_then_recovers_after_cool_down() {
    let provider = Arc::new(ScriptedProvider::healthy());
    let h = harness(
        provider.clone(),
        OrchestratorConfig::default()
            .with_resilience(fast_retry(1, 2))
            .with_edit_fallback(EditFallback::FailJob),
    );
    let user = UserId::new();

    // Analysis and edit both fail: two consecutive failures open the circuit.
    provider.set_outage(true);
    let first = h
        .orchestrator
        .create_job(user, AssetRef::new("tmp/0.jpg"), None)
        .unwrap();
    let done = finished(h.orchestrator.process_job(*first.id()).await.unwrap());
    assert_eq!(done.status(), JobStatus::Failed);
    assert_eq!(done.error().map(|e| e.kind), Some(ErrorKind::Network));
    assert_eq!(h.orchestrator.provider_circuit(), CircuitState::Open);
    assert_eq!(provider.calls(), 2);

    let rejected = h
        .orchestrator
        .create_job(user, AssetRef::new("tmp/1.jpg"), None)
        .unwrap();
    let done = finished(h.orchestrator.process_job(*rejected.id()).await.unwrap());
    assert_eq!(done.error().map(|e| e.kind), Some(ErrorKind::CircuitOpen));
    assert_eq!(provider.calls(), 2, "open circuit must not reach the provider");

    provider.set_outage(false);
    h.clock.advance(Duration::from_secs(60));
    let probe = h
        .orchestrator
        .create_job(user, AssetRef::new("tmp/2.jpg"), None)
        .unwrap();
    let done = finished(h.orchestrator.process_job(*probe.id()).await.unwrap());
    assert_eq!(done.status(), JobStatus::Completed);
    assert_eq!(h.orchestrator.provider_circuit(), CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_finish_a_batch_exactly_once() {
    let provider = Arc::new(ScriptedProvider::healthy());
    let h = harness(
        provider,
        OrchestratorConfig::default().with_resilience(fast_retry(2, 5)),
    );
    let orchestrator = Arc::new(h.orchestrator);

    let items = (0..24)
        .map(|i| BatchItem {
            prompt: None,
            temp_asset_ref: AssetRef::new(format!("tmp/c{i}.jpg")),
        })
        .collect();
    let (batch, children) = orchestrator.create_batch(UserId::new(), items).unwrap();

    // Two tasks per child: one finishes it, the other observes it claimed.
    let mut tasks = Vec::new();
    for child in children.iter().chain(children.iter()) {
        let orchestrator = orchestrator.clone();
        let job_id = *child.id();
        tasks.push(tokio::spawn(async move { orchestrator.process_job(job_id).await }));
    }

    let mut finished_count = 0;
    for task in tasks {
        if let ProcessOutcome::Finished(_) = task.await.unwrap().unwrap() {
            finished_count += 1;
        }
    }

    assert_eq!(finished_count, children.len());

    // The sweep a worker runs each pass; it counts any increment lost to contention.
    orchestrator.reconcile_batch(*batch.id()).await.unwrap();
    let stored = orchestrator.get_batch(*batch.id()).unwrap();
    assert_eq!(stored.completed_count(), 24);
    assert_eq!(h.notifier.count_for(&StatusTarget::Batch(*batch.id())), 1);
    for child in &children {
        assert_eq!(h.notifier.count_for(&StatusTarget::Job(*child.id())), 1);
    }
}
