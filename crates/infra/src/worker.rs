//! Background worker draining queued jobs.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pixelflow_core::{AggregateRoot, JobStatus};

use crate::config::WorkerConfig;
use crate::orchestrator::{JobOrchestrator, OrchestratorError, ProcessOutcome};
use crate::store::JobStore;

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Jobs another worker claimed first.
    pub jobs_skipped: u64,
    /// Children counted late by batch reconciliation.
    pub batch_children_reconciled: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown. The job in flight finishes first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }
}

/// Polls the store for queued jobs and processes them one at a time.
pub struct Worker<S> {
    orchestrator: Arc<JobOrchestrator<S>>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S> Worker<S>
where
    S: JobStore + Clone + Send + Sync + 'static,
{
    pub fn new(orchestrator: Arc<JobOrchestrator<S>>, config: WorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    /// Process up to `batch_size` queued jobs, oldest first, then reconcile
    /// up to `batch_size` open batches. Returns how many jobs were picked up.
    /// Per-job failures are logged and counted, not returned.
    pub async fn run_once(&self) -> Result<usize, OrchestratorError> {
        let queued = self.orchestrator.store().next_queued(self.config.batch_size)?;
        let picked = queued.len();

        for job in queued {
            let job_id = *job.id();
            let result = self.orchestrator.process_job(job_id).await;

            {
                let mut stats = self.stats.lock();
                match &result {
                    Ok(ProcessOutcome::Finished(job)) => {
                        stats.jobs_processed += 1;
                        match job.status() {
                            JobStatus::Failed => stats.jobs_failed += 1,
                            _ => stats.jobs_completed += 1,
                        }
                    }
                    Ok(ProcessOutcome::Skipped { .. }) => stats.jobs_skipped += 1,
                    Err(_) => stats.errors += 1,
                }
            }

            if let Err(e) = result {
                warn!(worker = %self.config.name, job_id = %job_id, error = %e, "job processing failed");
            }
        }

        let reconciled = self
            .orchestrator
            .reconcile_open_batches(self.config.batch_size)
            .await?;
        if reconciled > 0 {
            self.stats.lock().batch_children_reconciled += reconciled as u64;
        }

        Ok(picked)
    }

    /// Run on the current tokio runtime until the handle shuts it down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "worker started");
        let started = Instant::now();

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            self.stats.lock().uptime_secs = started.elapsed().as_secs();

            let idle = match self.run_once().await {
                Ok(0) => true,
                Ok(picked) => {
                    debug!(worker = %self.config.name, picked, "processed queued jobs");
                    false
                }
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "failed to fetch queued jobs");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(worker = %self.config.name, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::notifier::MemoryNotifier;
    use crate::provider::PassthroughProvider;
    use crate::store::InMemoryJobStore;
    use pixelflow_core::{AssetRef, UserId};
    use std::time::Duration;

    fn worker() -> (Worker<Arc<InMemoryJobStore>>, Arc<JobOrchestrator<Arc<InMemoryJobStore>>>) {
        let orchestrator = Arc::new(JobOrchestrator::new(
            InMemoryJobStore::arc(),
            Arc::new(PassthroughProvider::default()),
            Arc::new(MemoryNotifier::new()),
            OrchestratorConfig::default(),
        ));
        let config = WorkerConfig::default()
            .with_name("test-worker")
            .with_poll_interval(Duration::from_millis(5))
            .with_batch_size(2);
        (Worker::new(orchestrator.clone(), config), orchestrator)
    }

    #[tokio::test]
    async fn run_once_drains_up_to_batch_size() {
        let (worker, orchestrator) = worker();
        let user = UserId::new();
        for i in 0..3 {
            orchestrator
                .create_job(user, AssetRef::new(format!("tmp/{i}.jpg")), None)
                .unwrap();
        }

        assert_eq!(worker.run_once().await.unwrap(), 2);
        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(worker.run_once().await.unwrap(), 0);

        let stats = worker.stats();
        assert_eq!((stats.jobs_processed, stats.jobs_completed), (3, 3));
        assert_eq!(orchestrator.store().stats().unwrap().completed, 3);
    }

    #[tokio::test]
    async fn spawned_worker_stops_on_shutdown() {
        let (worker, orchestrator) = worker();
        let job = orchestrator
            .create_job(UserId::new(), AssetRef::new("tmp/a.jpg"), None)
            .unwrap();

        let handle = worker.spawn();
        for _ in 0..200 {
            if handle.stats().jobs_processed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(handle.stats().jobs_completed, 1);
        handle.shutdown().await;
        assert_eq!(orchestrator.get_job(*job.id()).unwrap().status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn run_once_counts_children_their_batch_missed() {
        let (worker, orchestrator) = worker();
        let items = (0..2)
            .map(|i| pixelflow_jobs::BatchItem {
                prompt: None,
                temp_asset_ref: AssetRef::new(format!("tmp/b{i}.jpg")),
            })
            .collect();
        let (batch, children) = orchestrator.create_batch(UserId::new(), items).unwrap();

        // Both children finish without their batch hearing about it.
        let clock = pixelflow_core::ManualClock::epoch();
        for child in &children {
            let failed = pixelflow_jobs::transition(
                child,
                pixelflow_jobs::JobEvent::Fail {
                    error: pixelflow_core::JobError::validation("corrupt upload"),
                },
                &clock,
            )
            .unwrap();
            orchestrator
                .store()
                .update_job(&failed, pixelflow_core::ExpectedVersion::Exact(child.version()))
                .unwrap();
        }

        assert_eq!(worker.run_once().await.unwrap(), 0);

        let stored = orchestrator.get_batch(*batch.id()).unwrap();
        assert_eq!(stored.completed_count(), 2);
        assert!(stored.status().is_terminal());
        assert_eq!(worker.stats().batch_children_reconciled, 2);

        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert_eq!(worker.stats().batch_children_reconciled, 2);
    }
}
