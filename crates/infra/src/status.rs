//! Read-only status snapshots for polling clients.

use pixelflow_core::{AggregateRoot, ChildStatus, ErrorKind, JobError, StatusSnapshot, StatusTarget};
use pixelflow_jobs::{BatchJob, BatchStatus, Job};

pub fn job_snapshot(job: &Job) -> StatusSnapshot {
    StatusSnapshot {
        target: StatusTarget::Job(*job.id()),
        status: job.status(),
        progress: Some(job.status().progress()),
        error: job.error().cloned(),
        final_asset: job.final_asset_ref().cloned(),
        children: Vec::new(),
    }
}

/// Batch snapshot. `children` are the batch's jobs as currently stored.
pub fn batch_snapshot(batch: &BatchJob, children: &[Job]) -> StatusSnapshot {
    let error = match batch.status() {
        BatchStatus::Failed => {
            let failed = batch.failed_children().count();
            let kind = batch
                .failed_children()
                .map(|(_, e)| e.kind)
                .next()
                .unwrap_or(ErrorKind::Provider);
            Some(JobError::new(
                kind,
                format!("{failed} of {} photos failed", batch.total_count()),
            ))
        }
        _ => None,
    };

    StatusSnapshot {
        target: StatusTarget::Batch(*batch.id()),
        status: batch.status().as_job_status(),
        progress: Some(batch.progress_percent()),
        error,
        final_asset: None,
        children: children
            .iter()
            .map(|job| ChildStatus {
                job_id: *job.id(),
                status: job.status(),
                error: job.error().cloned(),
            })
            .collect(),
    }
}
