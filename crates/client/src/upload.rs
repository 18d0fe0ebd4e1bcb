//! Drives an [`UploadMachine`] against the server.
//!
//! The machine decides; this module performs the effects it asks for and
//! feeds the results back as events until nothing is left to do.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use pixelflow_core::{AssetRef, JobError, JobId, StatusSnapshot, StatusTarget};
use pixelflow_resilience::ResiliencePolicy;

use crate::machine::{
    Effect, LocalAsset, PresignedUpload, Transition, UploadContext, UploadEvent, UploadMachine, UploadState,
};
use crate::poll::{LocalNotification, PollingCoordinator};

/// Upload endpoints.
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// Ask for a short-lived upload URL.
    async fn presign(&self, asset: &LocalAsset, prompt: Option<&str>) -> Result<PresignedUpload, JobError>;

    /// Send the bytes from `resume_from` percent onwards. The server queues
    /// the job once the upload lands.
    async fn upload(
        &self,
        upload: &PresignedUpload,
        asset: &LocalAsset,
        resume_from: u8,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<JobId, JobError>;
}

/// Where a drive left the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    Completed {
        job_id: Option<JobId>,
        final_asset: AssetRef,
    },
    Failed {
        error: JobError,
        user_retryable: bool,
    },
    /// Waiting for the network; call [`UploadCoordinator::resume`].
    Paused { progress: u8 },
    Cancelled,
    /// Another drive owns the upload now.
    InProgress { state: UploadState },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("{event} not accepted while {state}")]
    NotAccepted { event: &'static str, state: UploadState },
}

impl UploadError {
    pub fn to_job_error(&self) -> JobError {
        JobError::validation(self.to_string()).fatal()
    }
}

/// One coordinator per upload.
pub struct UploadCoordinator {
    machine: Arc<Mutex<UploadMachine>>,
    api: Arc<dyn UploadApi>,
    policy: ResiliencePolicy,
    poller: Arc<PollingCoordinator>,
    abort: Notify,
}

impl UploadCoordinator {
    pub fn new(
        machine: UploadMachine,
        api: Arc<dyn UploadApi>,
        policy: ResiliencePolicy,
        poller: Arc<PollingCoordinator>,
    ) -> Self {
        Self {
            machine: Arc::new(Mutex::new(machine)),
            api,
            policy,
            poller,
            abort: Notify::new(),
        }
    }

    pub fn state(&self) -> UploadState {
        self.machine.lock().state()
    }

    pub fn context(&self) -> UploadContext {
        self.machine.lock().context().clone()
    }

    /// Validate the asset and run the upload through to a terminal state.
    pub async fn start(&self, asset: LocalAsset, prompt: Option<String>) -> Result<UploadOutcome, UploadError> {
        let transition = self.accepted(UploadEvent::StartUpload { asset, prompt })?;
        Ok(self.drive(transition.effects).await)
    }

    /// Network lost: stop the transfer and keep its progress.
    pub fn pause(&self) -> Result<Transition, UploadError> {
        let transition = self.accepted(UploadEvent::Pause)?;
        self.run_local(&transition.effects);
        Ok(transition)
    }

    /// Network back: continue the transfer where it stopped.
    pub async fn resume(&self) -> Result<UploadOutcome, UploadError> {
        let transition = self.accepted(UploadEvent::Resume)?;
        Ok(self.drive(transition.effects).await)
    }

    /// User-initiated retry after a failure.
    pub async fn retry(&self) -> Result<UploadOutcome, UploadError> {
        let transition = self.accepted(UploadEvent::Retry)?;
        Ok(self.drive(transition.effects).await)
    }

    pub fn cancel(&self) -> Result<Transition, UploadError> {
        let transition = self.accepted(UploadEvent::Cancel)?;
        self.run_local(&transition.effects);
        Ok(transition)
    }

    pub fn reset(&self) -> Result<Transition, UploadError> {
        let transition = self.accepted(UploadEvent::Reset)?;
        self.run_local(&transition.effects);
        Ok(transition)
    }

    fn send(&self, event: UploadEvent) -> Transition {
        self.machine.lock().send(event)
    }

    fn accepted(&self, event: UploadEvent) -> Result<Transition, UploadError> {
        let transition = self.send(event);
        if transition.handled {
            Ok(transition)
        } else {
            Err(UploadError::NotAccepted {
                event: transition.event,
                state: transition.from,
            })
        }
    }

    /// Effects that need no I/O.
    fn run_local(&self, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::AbortUpload | Effect::StopPolling => self.abort.notify_waiters(),
                other => debug!(effect = ?other, "effect left to the active drive"),
            }
        }
    }

    async fn drive(&self, effects: Vec<Effect>) -> UploadOutcome {
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            for event in self.perform(effect).await {
                let transition = self.send(event);
                queue.extend(transition.effects);
            }
        }

        self.outcome()
    }

    async fn perform(&self, effect: Effect) -> Vec<UploadEvent> {
        match effect {
            Effect::RequestPresign { attempt } => self.request_presign(attempt).await,
            Effect::Upload {
                upload,
                resume_from,
                attempt,
            } => self.upload(upload, resume_from, attempt).await,
            Effect::StartPolling { job_id } => self.poll(job_id).await,
            Effect::AbortUpload | Effect::StopPolling => {
                self.abort.notify_waiters();
                Vec::new()
            }
            Effect::NotifyCompleted { job_id, final_asset } => {
                if let Some(job_id) = job_id {
                    self.poller.notify(&LocalNotification::job_ready(job_id, final_asset));
                }
                Vec::new()
            }
            Effect::ShowError { error, user_retryable } => {
                warn!(error = %error, user_retryable, "upload failed");
                Vec::new()
            }
        }
    }

    async fn request_presign(&self, attempt: u32) -> Vec<UploadEvent> {
        let (asset, prompt) = {
            let machine = self.machine.lock();
            (machine.context().asset.clone(), machine.context().prompt.clone())
        };
        let Some(asset) = asset else {
            return vec![UploadEvent::PresignFailed {
                error: JobError::validation("no asset selected"),
            }];
        };

        debug!(asset = %asset.name, attempt, "requesting upload URL");
        let api = &self.api;
        let (asset, prompt) = (&asset, prompt.as_deref());
        match self.policy.execute_job(move || api.presign(asset, prompt)).await {
            Ok(executed) => vec![UploadEvent::PresignReceived {
                upload: executed.value,
            }],
            Err(e) => vec![UploadEvent::PresignFailed { error: e.to_job_error() }],
        }
    }

    async fn upload(&self, upload: PresignedUpload, resume_from: u8, attempt: u32) -> Vec<UploadEvent> {
        let asset = self.machine.lock().context().asset.clone();
        let Some(asset) = asset else {
            return vec![UploadEvent::UploadFailed {
                error: JobError::validation("no asset selected").fatal(),
            }];
        };

        info!(asset = %asset.name, resume_from, attempt, "uploading");
        let machine = self.machine.clone();
        let on_progress = move |percent: u8| {
            machine.lock().send(UploadEvent::UploadProgress { percent });
        };

        let api = &self.api;
        let state = &self.machine;
        let (upload, asset, on_progress) = (&upload, &asset, &on_progress);
        let transfer = self.policy.execute_job(move || async move {
            if state.lock().state() != UploadState::Uploading {
                return Err(JobError::network("upload interrupted").fatal());
            }
            let progress = state.lock().context().progress.max(resume_from);
            api.upload(upload, asset, progress, on_progress).await
        });

        // A finished transfer wins over a pause that raced it.
        tokio::select! {
            biased;
            result = transfer => match result {
                Ok(executed) => vec![UploadEvent::UploadSucceeded { job_id: executed.value }],
                Err(e) => vec![UploadEvent::UploadFailed { error: e.to_job_error() }],
            },
            _ = self.abort.notified() => {
                debug!("upload aborted");
                Vec::new()
            }
        }
    }

    async fn poll(&self, job_id: JobId) -> Vec<UploadEvent> {
        let machine = self.machine.clone();
        let on_update = move |snapshot: &StatusSnapshot| {
            let transition = machine.lock().send(UploadEvent::StatusProgress {
                status: snapshot.status,
                progress: snapshot.progress,
            });
            if transition.to == UploadState::Processing {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        };

        let watch = self.poller.watch(StatusTarget::Job(job_id), on_update);
        let result = tokio::select! {
            biased;
            result = watch => result,
            _ = self.abort.notified() => {
                debug!(job_id = %job_id, "polling stopped");
                return Vec::new();
            }
        };

        match result {
            Ok(snapshot) => match snapshot.final_asset {
                Some(final_asset) => vec![UploadEvent::ProcessingCompleted { final_asset }],
                None => vec![UploadEvent::ProcessingFailed {
                    error: JobError::provider("completed without an edited photo"),
                }],
            },
            Err(e) => vec![UploadEvent::ProcessingFailed { error: e.to_job_error() }],
        }
    }

    fn outcome(&self) -> UploadOutcome {
        let machine = self.machine.lock();
        let ctx = machine.context();
        match machine.state() {
            UploadState::Completed => match &ctx.final_asset {
                Some(final_asset) => UploadOutcome::Completed {
                    job_id: ctx.job_id,
                    final_asset: final_asset.clone(),
                },
                None => UploadOutcome::InProgress {
                    state: UploadState::Completed,
                },
            },
            UploadState::Failed => {
                let error = ctx
                    .error
                    .clone()
                    .unwrap_or_else(|| JobError::validation("upload failed"));
                UploadOutcome::Failed {
                    user_retryable: error.is_user_retryable(),
                    error,
                }
            }
            UploadState::Paused => UploadOutcome::Paused { progress: ctx.progress },
            UploadState::Idle => UploadOutcome::Cancelled,
            state => UploadOutcome::InProgress { state },
        }
    }
}
