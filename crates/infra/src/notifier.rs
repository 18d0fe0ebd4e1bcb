//! Completion notifications.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use pixelflow_core::{AggregateRoot, JobError, JobStatus, StatusTarget};
use pixelflow_jobs::{BatchJob, Job};

/// A job or batch reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: StatusTarget,
    pub status: JobStatus,
    pub summary: String,
}

impl Notification {
    pub fn for_job(job: &Job) -> Self {
        let summary = match (job.status(), job.error()) {
            (JobStatus::Failed, Some(error)) => format!("photo failed: {}", error.message),
            (JobStatus::Completed, _) if !job.edit_applied() => {
                "photo ready (original kept, editing unavailable)".to_string()
            }
            (JobStatus::Completed, _) => "photo ready".to_string(),
            (status, _) => format!("photo {}", status.as_str()),
        };

        Self {
            subject: StatusTarget::Job(*job.id()),
            status: job.status(),
            summary,
        }
    }

    pub fn for_batch(batch: &BatchJob) -> Self {
        let failed = batch.failed_children().count();
        let total = batch.total_count();
        let summary = if failed == 0 {
            format!("{total} photos ready")
        } else {
            format!("{} of {total} photos ready, {failed} failed", total as usize - failed)
        };

        Self {
            subject: StatusTarget::Batch(*batch.id()),
            status: batch.status().as_job_status(),
            summary,
        }
    }
}

/// Delivers terminal-state notifications to the user.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), JobError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), JobError> {
        let payload = serde_json::to_string(notification)
            .map_err(|e| JobError::validation(format!("unserializable notification: {e}")))?;
        info!(subject = %notification.subject, status = ?notification.status, %payload, "notification sent");
        Ok(())
    }
}

/// Keeps every notification in memory for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Notifications delivered for `subject`.
    pub fn count_for(&self, subject: &StatusTarget) -> usize {
        self.sent.lock().iter().filter(|n| &n.subject == subject).count()
    }
}

#[async_trait]
impl CompletionNotifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), JobError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}
