//! `pixelflow-jobs`: The photo-job domain.
//!
//! **Responsibility:** pure lifecycle rules for single jobs and for batches.
//! Nothing here performs I/O or reads the clock; callers inject a
//! `TimeSource` and an `IdGenerator` and persist the returned values.

pub mod batch;
pub mod job;

pub use batch::{
    BatchError, BatchItem, BatchJob, BatchProgress, BatchStatus, ChildOutcome, NewBatch,
    PartialFailurePolicy, create_batch,
};
pub use job::{Job, JobEvent, NewJob, create_job, is_in_progress, is_terminal, next_status, transition};
