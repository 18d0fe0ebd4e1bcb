//! `pixelflow-client`: The device side of a photo job.
//!
//! **Responsibility:** the upload state machine, the coordinator that runs
//! its effects (presign, upload, status polling) and local notifications.
//! Network endpoints are traits so hosts plug in their own transport.

pub mod machine;
pub mod poll;
pub mod upload;

pub use machine::{
    Effect, LocalAsset, MachineConfig, NetworkStatus, PresignedUpload, RetryState, Transition, UploadContext,
    UploadEvent, UploadMachine, UploadState,
};
pub use poll::{
    LocalNotification, LocalNotifier, LogLocalNotifier, MemoryLocalNotifier, PollConfig, PollError,
    PollingCoordinator, StatusApi,
};
pub use upload::{UploadApi, UploadCoordinator, UploadError, UploadOutcome};
