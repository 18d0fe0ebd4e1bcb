//! Client upload state machine.
//!
//! ```text
//! idle → preprocessing → requesting_presign → uploading ⇄ paused
//!                                               ↓
//!                                          processing → completed | failed
//! ```
//!
//! The machine is a plain value: [`UploadMachine::send`] applies one event and
//! returns the effects the host should run (network calls, notifications).
//! Results of those calls come back as events. An event the current state
//! does not accept is a no-op, which is how late results of cancelled work
//! are discarded.

use serde::{Deserialize, Serialize};
use tracing::debug;

use pixelflow_core::{AssetRef, ErrorKind, JobError, JobId, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    Preprocessing,
    RequestingPresign,
    Uploading,
    Paused,
    Processing,
    Completed,
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Idle => "idle",
            UploadState::Preprocessing => "preprocessing",
            UploadState::RequestingPresign => "requesting_presign",
            UploadState::Uploading => "uploading",
            UploadState::Paused => "paused",
            UploadState::Processing => "processing",
            UploadState::Completed => "completed",
            UploadState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    #[default]
    Online,
    Offline,
}

/// A photo prepared on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAsset {
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Upload authorization returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUpload {
    pub upload_url: String,
    /// Where the server will find the uploaded asset.
    pub temp_asset_ref: AssetRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Attempts per network step (presign, upload) before failing.
    pub max_attempts: u32,
    pub max_upload_bytes: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_upload_bytes: 25 * 1024 * 1024,
        }
    }
}

impl MachineConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }
}

/// Attempt bookkeeping for the current network step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadContext {
    pub asset: Option<LocalAsset>,
    pub prompt: Option<String>,
    pub upload: Option<PresignedUpload>,
    /// Upload progress, 0-100.
    pub progress: u8,
    /// Server-side progress once the job exists, 0-100.
    pub processing_progress: u8,
    pub retry: RetryState,
    pub network: NetworkStatus,
    pub job_id: Option<JobId>,
    pub server_status: Option<JobStatus>,
    pub final_asset: Option<AssetRef>,
    pub error: Option<JobError>,
}

impl UploadContext {
    /// A blank context that keeps what is known about the network.
    fn fresh(network: NetworkStatus) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadEvent {
    StartUpload {
        asset: LocalAsset,
        prompt: Option<String>,
    },
    PresignReceived {
        upload: PresignedUpload,
    },
    PresignFailed {
        error: JobError,
    },
    UploadProgress {
        percent: u8,
    },
    UploadSucceeded {
        job_id: JobId,
    },
    UploadFailed {
        error: JobError,
    },
    /// Network lost.
    Pause,
    /// Network back.
    Resume,
    StatusProgress {
        status: JobStatus,
        progress: Option<u8>,
    },
    ProcessingCompleted {
        final_asset: AssetRef,
    },
    ProcessingFailed {
        error: JobError,
    },
    /// User asked to try again after a failure.
    Retry,
    Reset,
    Cancel,
}

impl UploadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UploadEvent::StartUpload { .. } => "START_UPLOAD",
            UploadEvent::PresignReceived { .. } => "PRESIGN_RECEIVED",
            UploadEvent::PresignFailed { .. } => "PRESIGN_FAILED",
            UploadEvent::UploadProgress { .. } => "UPLOAD_PROGRESS",
            UploadEvent::UploadSucceeded { .. } => "UPLOAD_SUCCEEDED",
            UploadEvent::UploadFailed { .. } => "UPLOAD_FAILED",
            UploadEvent::Pause => "PAUSE",
            UploadEvent::Resume => "RESUME",
            UploadEvent::StatusProgress { .. } => "STATUS_PROGRESS",
            UploadEvent::ProcessingCompleted { .. } => "PROCESSING_COMPLETED",
            UploadEvent::ProcessingFailed { .. } => "PROCESSING_FAILED",
            UploadEvent::Retry => "RETRY",
            UploadEvent::Reset => "RESET",
            UploadEvent::Cancel => "CANCEL",
        }
    }
}

/// Work the host performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    RequestPresign { attempt: u32 },
    Upload { upload: PresignedUpload, resume_from: u8, attempt: u32 },
    AbortUpload,
    StartPolling { job_id: JobId },
    StopPolling,
    NotifyCompleted { job_id: Option<JobId>, final_asset: AssetRef },
    ShowError { error: JobError, user_retryable: bool },
}

/// Result of one `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: UploadState,
    pub to: UploadState,
    pub event: &'static str,
    /// False when the current state ignored the event.
    pub handled: bool,
    pub effects: Vec<Effect>,
}

/// Pure predicates over the machine context.
pub mod guards {
    use super::{LocalAsset, MachineConfig, UploadContext};
    use pixelflow_core::{JobError, JobId, JobStatus};

    /// The current step used its whole attempt budget.
    pub fn max_retries_exceeded(ctx: &UploadContext) -> bool {
        ctx.retry.attempts >= ctx.retry.max_attempts
    }

    /// Another attempt of the current step may help.
    pub fn can_retry_step(ctx: &UploadContext, error: &JobError) -> bool {
        error.is_retryable() && !max_retries_exceeded(ctx)
    }

    /// The user may restart a failed upload.
    pub fn can_user_retry(ctx: &UploadContext) -> bool {
        ctx.asset.is_some() && ctx.error.as_ref().is_some_and(JobError::is_user_retryable)
    }

    /// The server accepted the job and never reported it failed, so a retry
    /// should wait on it again rather than upload a second copy.
    pub fn job_still_running(ctx: &UploadContext) -> Option<JobId> {
        ctx.job_id.filter(|_| ctx.server_status != Some(JobStatus::Failed))
    }

    pub fn check_asset(asset: &LocalAsset, config: &MachineConfig) -> Result<(), JobError> {
        if asset.size_bytes == 0 {
            return Err(JobError::validation(format!("{} is empty", asset.name)));
        }
        if asset.size_bytes > config.max_upload_bytes {
            return Err(JobError::validation(format!(
                "{} exceeds the {} byte upload limit",
                asset.name, config.max_upload_bytes
            )));
        }
        if !asset.content_type.starts_with("image/") {
            return Err(JobError::validation(format!(
                "{} is not an image ({})",
                asset.name, asset.content_type
            )));
        }
        Ok(())
    }
}

/// One machine per in-flight upload.
#[derive(Debug, Clone)]
pub struct UploadMachine {
    state: UploadState,
    context: UploadContext,
    config: MachineConfig,
}

impl Default for UploadMachine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl UploadMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            state: UploadState::Idle,
            context: UploadContext::default(),
            config,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn context(&self) -> &UploadContext {
        &self.context
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Apply one event.
    pub fn send(&mut self, event: UploadEvent) -> Transition {
        let from = self.state;
        let name = event.name();

        match self.accept(event) {
            Some(effects) => {
                debug!(event = name, from = %from, to = %self.state, "upload transition");
                Transition {
                    from,
                    to: self.state,
                    event: name,
                    handled: true,
                    effects,
                }
            }
            None => {
                debug!(event = name, state = %from, "event ignored");
                Transition {
                    from,
                    to: from,
                    event: name,
                    handled: false,
                    effects: Vec::new(),
                }
            }
        }
    }

    fn accept(&mut self, event: UploadEvent) -> Option<Vec<Effect>> {
        use UploadEvent as E;
        use UploadState as S;

        let effects = match (self.state, event) {
            (S::Idle, E::StartUpload { asset, prompt }) => {
                self.context = UploadContext::fresh(self.context.network);
                self.context.asset = Some(asset);
                self.context.prompt = prompt;
                self.state = S::Preprocessing;
                self.after_preprocessing()
            }

            (S::RequestingPresign, E::PresignReceived { upload }) => {
                self.context.upload = Some(upload.clone());
                self.context.progress = 0;
                self.begin_step();
                self.state = S::Uploading;
                vec![Effect::Upload {
                    upload,
                    resume_from: 0,
                    attempt: 1,
                }]
            }
            (S::RequestingPresign, E::PresignFailed { error }) => {
                if guards::can_retry_step(&self.context, &error) {
                    let attempt = self.next_attempt(&error);
                    vec![Effect::RequestPresign { attempt }]
                } else {
                    self.fail(error)
                }
            }

            (S::Uploading, E::UploadProgress { percent }) => {
                self.context.progress = self.context.progress.max(percent.min(100));
                Vec::new()
            }
            // A transfer that landed just as the network dropped still made the job.
            (S::Uploading | S::Paused, E::UploadSucceeded { job_id }) => {
                self.context.job_id = Some(job_id);
                self.context.progress = 100;
                self.context.server_status = Some(JobStatus::Queued);
                self.enter_processing(job_id)
            }
            (S::Uploading, E::UploadFailed { error }) => match self.context.upload.clone() {
                Some(upload) if guards::can_retry_step(&self.context, &error) => {
                    let attempt = self.next_attempt(&error);
                    vec![Effect::Upload {
                        upload,
                        resume_from: self.context.progress,
                        attempt,
                    }]
                }
                _ => self.fail(error),
            },
            (S::Uploading, E::Pause) => {
                self.context.network = NetworkStatus::Offline;
                self.state = S::Paused;
                vec![Effect::AbortUpload]
            }

            (S::Paused, E::Resume) => {
                self.context.network = NetworkStatus::Online;
                match self.context.upload.clone() {
                    Some(upload) => {
                        self.state = S::Uploading;
                        vec![Effect::Upload {
                            upload,
                            resume_from: self.context.progress,
                            attempt: self.context.retry.attempts.max(1),
                        }]
                    }
                    None => self.fail(JobError::validation("no upload authorization to resume")),
                }
            }

            (S::Processing, E::StatusProgress { status, progress }) => {
                self.context.server_status = Some(status);
                let reported = progress.unwrap_or_else(|| status.progress()).min(100);
                self.context.processing_progress = self.context.processing_progress.max(reported);
                Vec::new()
            }
            (S::Processing, E::ProcessingCompleted { final_asset }) => {
                self.context.server_status = Some(JobStatus::Completed);
                self.context.processing_progress = 100;
                self.context.final_asset = Some(final_asset.clone());
                self.state = S::Completed;
                vec![Effect::NotifyCompleted {
                    job_id: self.context.job_id,
                    final_asset,
                }]
            }
            (S::Processing, E::ProcessingFailed { error }) => {
                if error.kind != ErrorKind::Timeout {
                    self.context.server_status = Some(JobStatus::Failed);
                }
                self.fail(error)
            }

            (S::Failed, E::Retry) if guards::can_user_retry(&self.context) => {
                match guards::job_still_running(&self.context) {
                    Some(job_id) => {
                        self.context.error = None;
                        self.enter_processing(job_id)
                    }
                    None => {
                        let network = self.context.network;
                        let asset = self.context.asset.take();
                        let prompt = self.context.prompt.take();
                        self.context = UploadContext::fresh(network);
                        self.context.asset = asset;
                        self.context.prompt = prompt;
                        self.enter_presign()
                    }
                }
            }

            (S::Completed | S::Failed | S::Paused, E::Reset) => {
                let abort = self.state == S::Paused;
                self.reset();
                if abort { vec![Effect::AbortUpload] } else { Vec::new() }
            }
            (S::Uploading | S::Paused | S::RequestingPresign | S::Processing, E::Cancel) => {
                let effects = match self.state {
                    S::Uploading => vec![Effect::AbortUpload],
                    S::Processing => vec![Effect::StopPolling],
                    _ => Vec::new(),
                };
                self.reset();
                effects
            }

            _ => return None,
        };

        Some(effects)
    }

    /// Preparation is local and synchronous, so preprocessing always moves on.
    fn after_preprocessing(&mut self) -> Vec<Effect> {
        let checked = match &self.context.asset {
            Some(asset) => guards::check_asset(asset, &self.config),
            None => Err(JobError::validation("no asset selected")),
        };
        match checked {
            Ok(()) => self.enter_presign(),
            Err(error) => self.fail(error),
        }
    }

    fn enter_presign(&mut self) -> Vec<Effect> {
        self.begin_step();
        self.state = UploadState::RequestingPresign;
        vec![Effect::RequestPresign { attempt: 1 }]
    }

    fn enter_processing(&mut self, job_id: JobId) -> Vec<Effect> {
        self.context.retry = RetryState::default();
        self.state = UploadState::Processing;
        vec![Effect::StartPolling { job_id }]
    }

    fn begin_step(&mut self) {
        self.context.retry = RetryState {
            attempts: 1,
            max_attempts: self.config.max_attempts,
            last_error: None,
        };
    }

    fn next_attempt(&mut self, error: &JobError) -> u32 {
        self.context.retry.attempts += 1;
        self.context.retry.last_error = Some(error.kind);
        self.context.retry.attempts
    }

    fn fail(&mut self, error: JobError) -> Vec<Effect> {
        let user_retryable = error.is_user_retryable();
        self.context.retry.last_error = Some(error.kind);
        self.context.error = Some(error.clone());
        self.state = UploadState::Failed;
        vec![Effect::ShowError {
            error,
            user_retryable,
        }]
    }

    fn reset(&mut self) {
        self.context = UploadContext::fresh(self.context.network);
        self.state = UploadState::Idle;
    }
}
