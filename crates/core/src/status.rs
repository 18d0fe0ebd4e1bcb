//! Lifecycle status and the read-only snapshot returned by status polling.

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::id::{AssetRef, BatchJobId, JobId};

/// Server-side lifecycle status of a job.
///
/// `Queued → Processing → Editing → {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Editing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Editing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Editing)
    }

    /// Coarse progress percentage reported for a single job.
    pub fn progress(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 33,
            JobStatus::Editing => 66,
            JobStatus::Completed | JobStatus::Failed => 100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Editing => "editing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a status poll is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum StatusTarget {
    Job(JobId),
    Batch(BatchJobId),
}

impl core::fmt::Display for StatusTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StatusTarget::Job(id) => write!(f, "job:{id}"),
            StatusTarget::Batch(id) => write!(f, "batch:{id}"),
        }
    }
}

/// Per-child status inside a batch snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildStatus {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Side-effect-free view of a job or batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub target: StatusTarget,
    /// Batches report `Processing`, `Completed` or `Failed`.
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_asset: Option<AssetRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildStatus>,
}

impl StatusSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
