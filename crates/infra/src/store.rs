//! Job and batch persistence.
//!
//! The store is an abstract key-value contract: jobs keyed by `JobId`, batches
//! keyed by `BatchJobId` (the batch's `child_job_ids` doubles as its index).
//! Every update is a conditional write against the record's version.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pixelflow_core::{AggregateRoot, BatchJobId, ExpectedVersion, JobId, JobStatus, UserId};
use pixelflow_jobs::{BatchJob, Job};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert a standalone job.
    fn insert_job(&self, job: Job) -> Result<(), JobStoreError>;

    /// Insert a batch and all of its children in one atomic step.
    fn insert_batch(&self, batch: BatchJob, children: Vec<Job>) -> Result<(), JobStoreError>;

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn get_batch(&self, batch_id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError>;

    /// Replace a job if the stored version still matches `expected`.
    fn update_job(&self, job: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError>;

    /// Replace a batch if the stored version still matches `expected`.
    fn update_batch(&self, batch: &BatchJob, expected: ExpectedVersion) -> Result<(), JobStoreError>;

    /// Oldest queued jobs first.
    fn next_queued(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// A user's jobs, newest first.
    fn list_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Child jobs of a batch in submission order.
    fn batch_children(&self, batch_id: BatchJobId) -> Result<Vec<Job>, JobStoreError>;

    /// Batches not yet terminal, oldest first.
    fn open_batches(&self, limit: usize) -> Result<Vec<BatchJob>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("version conflict on {id}: expected {expected:?}, found {actual}")]
    Conflict {
        id: String,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub editing: usize,
    pub completed: usize,
    pub failed: usize,
    pub batches: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    batches: RwLock<HashMap<BatchJobId, BatchJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn jobs_read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn jobs_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn batches_read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<BatchJobId, BatchJob>>, JobStoreError> {
        self.batches
            .read()
            .map_err(|_| JobStoreError::Storage("batch map lock poisoned".to_string()))
    }

    fn batches_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<BatchJobId, BatchJob>>, JobStoreError> {
        self.batches
            .write()
            .map_err(|_| JobStoreError::Storage("batch map lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_job(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let id = *job.id();
        if jobs.contains_key(&id) {
            return Err(JobStoreError::AlreadyExists(id.to_string()));
        }
        jobs.insert(id, job);
        Ok(())
    }

    fn insert_batch(&self, batch: BatchJob, children: Vec<Job>) -> Result<(), JobStoreError> {
        // Lock order: batches, then jobs.
        let mut batches = self.batches_write()?;
        let mut jobs = self.jobs_write()?;

        let batch_id = *batch.id();
        if batches.contains_key(&batch_id) {
            return Err(JobStoreError::AlreadyExists(batch_id.to_string()));
        }
        if let Some(dup) = children.iter().find(|c| jobs.contains_key(c.id())) {
            return Err(JobStoreError::AlreadyExists(dup.id().to_string()));
        }

        for child in children {
            jobs.insert(*child.id(), child);
        }
        batches.insert(batch_id, batch);
        Ok(())
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs_read()?.get(&job_id).cloned())
    }

    fn get_batch(&self, batch_id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
        Ok(self.batches_read()?.get(&batch_id).cloned())
    }

    fn update_job(&self, job: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let id = *job.id();
        let stored = jobs
            .get_mut(&id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;

        if !expected.matches(stored.version()) {
            return Err(JobStoreError::Conflict {
                id: id.to_string(),
                expected,
                actual: stored.version(),
            });
        }
        *stored = job.clone();
        Ok(())
    }

    fn update_batch(&self, batch: &BatchJob, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        let mut batches = self.batches_write()?;
        let id = *batch.id();
        let stored = batches
            .get_mut(&id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;

        if !expected.matches(stored.version()) {
            return Err(JobStoreError::Conflict {
                id: id.to_string(),
                expected,
                actual: stored.version(),
            });
        }
        *stored = batch.clone();
        Ok(())
    }

    fn next_queued(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs_read()?;
        let mut queued: Vec<_> = jobs
            .values()
            .filter(|j| j.status() == JobStatus::Queued)
            .cloned()
            .collect();

        // FIFO; ids break ties between jobs created in the same instant.
        queued.sort_by_key(|j| (j.created_at(), *j.id()));
        queued.truncate(limit);
        Ok(queued)
    }

    fn list_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs_read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.user_id() == user_id)
            .cloned()
            .collect();

        result.sort_by_key(|j| std::cmp::Reverse((j.created_at(), *j.id())));
        result.truncate(limit);
        Ok(result)
    }

    fn batch_children(&self, batch_id: BatchJobId) -> Result<Vec<Job>, JobStoreError> {
        let child_ids = {
            let batches = self.batches_read()?;
            let batch = batches
                .get(&batch_id)
                .ok_or_else(|| JobStoreError::NotFound(batch_id.to_string()))?;
            batch.child_job_ids().to_vec()
        };

        let jobs = self.jobs_read()?;
        Ok(child_ids.iter().filter_map(|id| jobs.get(id).cloned()).collect())
    }

    fn open_batches(&self, limit: usize) -> Result<Vec<BatchJob>, JobStoreError> {
        let batches = self.batches_read()?;
        let mut open: Vec<_> = batches
            .values()
            .filter(|b| !b.status().is_terminal())
            .cloned()
            .collect();

        open.sort_by_key(|b| (b.created_at(), *b.id()));
        open.truncate(limit);
        Ok(open)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs_read()?;
        let mut stats = JobStats {
            batches: self.batches_read()?.len(),
            ..Default::default()
        };

        for job in jobs.values() {
            match job.status() {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Editing => stats.editing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert_job(&self, job: Job) -> Result<(), JobStoreError> {
        (**self).insert_job(job)
    }

    fn insert_batch(&self, batch: BatchJob, children: Vec<Job>) -> Result<(), JobStoreError> {
        (**self).insert_batch(batch, children)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get_job(job_id)
    }

    fn get_batch(&self, batch_id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
        (**self).get_batch(batch_id)
    }

    fn update_job(&self, job: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        (**self).update_job(job, expected)
    }

    fn update_batch(&self, batch: &BatchJob, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        (**self).update_batch(batch, expected)
    }

    fn next_queued(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).next_queued(limit)
    }

    fn list_by_user(&self, user_id: UserId, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_user(user_id, limit)
    }

    fn batch_children(&self, batch_id: BatchJobId) -> Result<Vec<Job>, JobStoreError> {
        (**self).batch_children(batch_id)
    }

    fn open_batches(&self, limit: usize) -> Result<Vec<BatchJob>, JobStoreError> {
        (**self).open_batches(limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
