//! Status polling and local completion notifications.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pixelflow_core::{AssetRef, JobError, JobId, JobStatus, StatusSnapshot, StatusTarget, TimeSource};
use pixelflow_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, JitterSource, RandomJitter, ResilienceConfig,
    RetryPolicy, Sleeper, TokioSleeper,
};

/// Server status endpoint.
#[async_trait]
pub trait StatusApi: Send + Sync {
    async fn fetch_status(&self, target: StatusTarget) -> Result<StatusSnapshot, JobError>;
}

/// A notification shown on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNotification {
    pub target: StatusTarget,
    pub title: String,
    pub body: String,
    pub final_asset: Option<AssetRef>,
}

impl LocalNotification {
    pub fn job_ready(job_id: JobId, final_asset: AssetRef) -> Self {
        Self {
            target: StatusTarget::Job(job_id),
            title: "Photo ready".to_string(),
            body: "Your edited photo is ready to view.".to_string(),
            final_asset: Some(final_asset),
        }
    }

    pub fn from_snapshot(snapshot: &StatusSnapshot) -> Self {
        match snapshot.target {
            StatusTarget::Job(_) => Self {
                target: snapshot.target,
                title: "Photo ready".to_string(),
                body: "Your edited photo is ready to view.".to_string(),
                final_asset: snapshot.final_asset.clone(),
            },
            StatusTarget::Batch(_) => {
                let total = snapshot.children.len();
                let failed = snapshot
                    .children
                    .iter()
                    .filter(|c| c.status == JobStatus::Failed)
                    .count();
                let body = if failed == 0 {
                    format!("All {total} photos are ready.")
                } else {
                    format!("{} of {total} photos are ready; {failed} could not be edited.", total - failed)
                };
                Self {
                    target: snapshot.target,
                    title: "Photos ready".to_string(),
                    body,
                    final_asset: None,
                }
            }
        }
    }
}

/// Presents notifications on the device.
pub trait LocalNotifier: Send + Sync {
    fn notify(&self, notification: &LocalNotification);
}

/// Logs instead of showing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLocalNotifier;

impl LocalNotifier for LogLocalNotifier {
    fn notify(&self, notification: &LocalNotification) {
        info!(target_id = %notification.target, title = %notification.title, "local notification");
    }
}

/// Keeps notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryLocalNotifier {
    shown: Mutex<Vec<LocalNotification>>,
}

impl MemoryLocalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<LocalNotification> {
        self.shown.lock().clone()
    }
}

impl LocalNotifier for MemoryLocalNotifier {
    fn notify(&self, notification: &LocalNotification) {
        self.shown.lock().push(notification.clone());
    }
}

/// Poll schedule and ceilings.
///
/// The interval grows by `multiplier` after each poll up to `max_interval`,
/// spread by `jitter` either way. The per-target attempt ceilings are the
/// only bound on how long polling runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub job_max_attempts: u32,
    pub batch_max_attempts: u32,
    /// Breaker guarding the status endpoint.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            multiplier: 1.5,
            jitter: 0.1,
            job_max_attempts: 120,
            batch_max_attempts: 240,
            circuit_breaker: ResilienceConfig::status_fetch().circuit_breaker,
        }
    }
}

impl PollConfig {
    pub fn with_interval(mut self, interval: Duration, max_interval: Duration) -> Self {
        self.interval = interval;
        self.max_interval = max_interval.max(interval);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, job: u32, batch: u32) -> Self {
        self.job_max_attempts = job.max(1);
        self.batch_max_attempts = batch.max(1);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn max_attempts_for(&self, target: &StatusTarget) -> u32 {
        match target {
            StatusTarget::Job(_) => self.job_max_attempts,
            StatusTarget::Batch(_) => self.batch_max_attempts,
        }
    }

    /// Wait after poll number `attempt` given a jitter sample in `[0, 1)`.
    pub fn delay_after(&self, attempt: u32, sample: f64) -> Duration {
        let schedule = RetryPolicy {
            multiplier: self.multiplier,
            ..RetryPolicy::exponential(attempt.saturating_add(1), self.interval, self.max_interval)
        }
        .with_jitter(self.jitter);
        schedule.delay_for(attempt, sample)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// No terminal status within the attempt ceiling.
    #[error("{target}: no terminal status after {attempts} polls")]
    Timeout { target: StatusTarget, attempts: u32 },
    /// The job or batch reached `FAILED`.
    #[error("{target} failed: {error}")]
    Failed { target: StatusTarget, error: JobError },
    /// The status endpoint refused the request.
    #[error("{target}: status request rejected: {error}")]
    Rejected { target: StatusTarget, error: JobError },
    #[error("{target}: polling cancelled")]
    Cancelled { target: StatusTarget },
}

impl PollError {
    pub fn to_job_error(&self) -> JobError {
        match self {
            PollError::Timeout { .. } => JobError::timeout(self.to_string()),
            PollError::Failed { error, .. } | PollError::Rejected { error, .. } => error.clone(),
            PollError::Cancelled { .. } => JobError::validation(self.to_string()),
        }
    }
}

/// Polls a job or batch until it is terminal, with bounded attempts.
pub struct PollingCoordinator {
    api: Arc<dyn StatusApi>,
    notifier: Arc<dyn LocalNotifier>,
    breaker: CircuitBreaker,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
    config: PollConfig,
}

impl PollingCoordinator {
    pub fn new(
        api: Arc<dyn StatusApi>,
        notifier: Arc<dyn LocalNotifier>,
        config: PollConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new("status", config.circuit_breaker.clone(), clock),
            api,
            notifier,
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandomJitter),
            config,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn notify(&self, notification: &LocalNotification) {
        self.notifier.notify(notification);
    }

    /// Poll until terminal, then notify on success.
    pub async fn poll<F>(&self, target: StatusTarget, on_update: F) -> Result<StatusSnapshot, PollError>
    where
        F: FnMut(&StatusSnapshot) -> ControlFlow<()> + Send,
    {
        let snapshot = self.watch(target, on_update).await?;
        self.notify(&LocalNotification::from_snapshot(&snapshot));
        Ok(snapshot)
    }

    /// Poll until `COMPLETED` (returned) or `FAILED` (an error).
    ///
    /// `on_update` sees every snapshot fetched and may stop polling early.
    /// Network errors and an open breaker use up an attempt and polling
    /// continues; other fetch errors stop it. Nothing is fetched after the
    /// last attempt.
    pub async fn watch<F>(&self, target: StatusTarget, mut on_update: F) -> Result<StatusSnapshot, PollError>
    where
        F: FnMut(&StatusSnapshot) -> ControlFlow<()> + Send,
    {
        let max_attempts = self.config.max_attempts_for(&target);

        for attempt in 1..=max_attempts {
            match self.breaker.call(|| self.api.fetch_status(target)).await {
                Ok(snapshot) => {
                    if on_update(&snapshot).is_break() {
                        debug!(target_id = %target, attempt, "polling cancelled");
                        return Err(PollError::Cancelled { target });
                    }
                    match snapshot.status {
                        JobStatus::Completed => {
                            info!(target_id = %target, attempts = attempt, "processing completed");
                            return Ok(snapshot);
                        }
                        JobStatus::Failed => {
                            let error = snapshot
                                .error
                                .clone()
                                .unwrap_or_else(|| JobError::provider("processing failed"));
                            warn!(target_id = %target, error = %error, "processing failed");
                            return Err(PollError::Failed { target, error });
                        }
                        status => debug!(target_id = %target, attempt, status = ?status, "still processing"),
                    }
                }
                Err(CircuitBreakerError::Open(open)) => {
                    debug!(target_id = %target, attempt, breaker = %open.0, "status endpoint circuit open");
                }
                Err(CircuitBreakerError::Failed(error)) if error.is_retryable() || error.is_user_retryable() => {
                    warn!(target_id = %target, attempt, error = %error, "status poll failed; will retry");
                }
                Err(CircuitBreakerError::Failed(error)) => {
                    return Err(PollError::Rejected { target, error });
                }
            }

            if attempt < max_attempts {
                let delay = self.config.delay_after(attempt, self.jitter.sample());
                self.sleeper.sleep(delay).await;
            }
        }

        warn!(target_id = %target, attempts = max_attempts, "polling timed out");
        Err(PollError::Timeout {
            target,
            attempts: max_attempts,
        })
    }
}
