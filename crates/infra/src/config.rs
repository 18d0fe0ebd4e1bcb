//! Orchestrator and worker configuration.
//!
//! Everything has a working default; `from_env` overrides individual fields
//! from `PIXELFLOW_*` variables and logs (then ignores) values that fail to
//! parse.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use pixelflow_jobs::PartialFailurePolicy;
use pixelflow_resilience::ResilienceConfig;

use crate::provider::PASSTHROUGH;

/// Prompt used when analysis is unavailable and the user gave none.
pub const DEFAULT_PROMPT: &str = "auto enhance: balance exposure, color and sharpness";

/// What to do when analysis fails after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisFallback {
    /// Continue editing with the user's prompt, or the default prompt.
    #[default]
    DefaultPrompt,
    FailJob,
}

/// What to do when editing fails after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditFallback {
    /// Complete the job with the uploaded asset, marked as unedited.
    #[default]
    OriginalAsset,
    FailJob,
}

impl FromStr for AnalysisFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default_prompt" | "default" => Ok(Self::DefaultPrompt),
            "fail_job" | "fail" => Ok(Self::FailJob),
            other => Err(format!("unknown analysis fallback: {other}")),
        }
    }
}

impl FromStr for EditFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original_asset" | "original" => Ok(Self::OriginalAsset),
            "fail_job" | "fail" => Ok(Self::FailJob),
            other => Err(format!("unknown edit fallback: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Registered provider name.
    pub provider: String,
    /// Retry and breaker settings for provider calls.
    pub resilience: ResilienceConfig,
    pub analysis_fallback: AnalysisFallback,
    pub edit_fallback: EditFallback,
    pub default_prompt: String,
    /// Applied to batches created through the orchestrator.
    pub partial_failure_policy: PartialFailurePolicy,
    /// Re-reads allowed after a conflicting job write.
    pub job_conflict_retries: u32,
    /// Re-reads allowed after a conflicting batch counter write.
    pub batch_conflict_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider: PASSTHROUGH.to_string(),
            resilience: ResilienceConfig::ai_provider(),
            analysis_fallback: AnalysisFallback::default(),
            edit_fallback: EditFallback::default(),
            default_prompt: DEFAULT_PROMPT.to_string(),
            partial_failure_policy: PartialFailurePolicy::default(),
            job_conflict_retries: 1,
            batch_conflict_retries: 8,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_provider(mut self, name: impl Into<String>) -> Self {
        self.provider = name.into();
        self
    }

    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_analysis_fallback(mut self, fallback: AnalysisFallback) -> Self {
        self.analysis_fallback = fallback;
        self
    }

    pub fn with_edit_fallback(mut self, fallback: EditFallback) -> Self {
        self.edit_fallback = fallback;
        self
    }

    pub fn with_partial_failure_policy(mut self, policy: PartialFailurePolicy) -> Self {
        self.partial_failure_policy = policy;
        self
    }

    pub fn with_batch_conflict_retries(mut self, retries: u32) -> Self {
        self.batch_conflict_retries = retries;
        self
    }

    /// Defaults overridden by `PIXELFLOW_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(provider) = std::env::var("PIXELFLOW_PROVIDER") {
            config.provider = provider;
        }
        if let Ok(prompt) = std::env::var("PIXELFLOW_DEFAULT_PROMPT") {
            config.default_prompt = prompt;
        }
        config.analysis_fallback = env_or("PIXELFLOW_ANALYSIS_FALLBACK", config.analysis_fallback);
        config.edit_fallback = env_or("PIXELFLOW_EDIT_FALLBACK", config.edit_fallback);
        if let Some(fail) = env_parse::<bool>("PIXELFLOW_BATCH_FAIL_ON_ANY") {
            config.partial_failure_policy = if fail {
                PartialFailurePolicy::FailBatch
            } else {
                PartialFailurePolicy::CompleteWithFailures
            };
        }

        let retry = &mut config.resilience.retry;
        retry.max_attempts = env_or("PIXELFLOW_PROVIDER_MAX_ATTEMPTS", retry.max_attempts).max(1);
        if let Some(ms) = env_parse::<u64>("PIXELFLOW_PROVIDER_BASE_DELAY_MS") {
            retry.base_delay = Duration::from_millis(ms);
        }

        let breaker = &mut config.resilience.circuit_breaker;
        breaker.failure_threshold =
            env_or("PIXELFLOW_BREAKER_THRESHOLD", breaker.failure_threshold).max(1);
        if let Some(secs) = env_parse::<u64>("PIXELFLOW_BREAKER_COOLDOWN_SECS") {
            breaker.cool_down = Duration::from_secs(secs);
        }

        config.job_conflict_retries = env_or("PIXELFLOW_JOB_CONFLICT_RETRIES", config.job_conflict_retries);
        config.batch_conflict_retries =
            env_or("PIXELFLOW_BATCH_CONFLICT_RETRIES", config.batch_conflict_retries);

        config
    }
}

/// Background worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// How long to wait when the queue is empty
    pub poll_interval: Duration,
    /// Queued jobs fetched per poll
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "pixelflow-worker".to_string(),
            poll_interval: Duration::from_millis(250),
            batch_size: 8,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("PIXELFLOW_WORKER_NAME") {
            config.name = name;
        }
        if let Some(ms) = env_parse::<u64>("PIXELFLOW_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        config.batch_size = env_or("PIXELFLOW_WORKER_BATCH_SIZE", config.batch_size).max(1);
        config
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid configuration value");
            None
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_parse(key).unwrap_or(default)
}
