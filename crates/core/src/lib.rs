//! `pixelflow-core`: Shared building blocks for the photo-job lifecycle.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed
//! identifiers, the injected time/id providers, the error taxonomy and the
//! status snapshot shape shared by the server and the client.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod providers;
pub mod status;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult, ErrorKind, JobError};
pub use id::{AssetRef, BatchJobId, JobId, UserId};
pub use providers::{IdGenerator, ManualClock, SequentialIds, SystemClock, TimeSource, UuidV7Ids};
pub use status::{ChildStatus, JobStatus, StatusSnapshot, StatusTarget};
