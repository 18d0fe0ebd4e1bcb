//! AI photo provider seam.
//!
//! Providers are registered by name and chosen by configuration, the same way
//! worker handlers are looked up by job kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pixelflow_core::{AssetRef, JobError, JobId};

/// Name of the built-in provider that edits nothing.
pub const PASSTHROUGH: &str = "passthrough";

/// Input to image analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub asset: AssetRef,
    /// Prompt supplied at submission, if any.
    pub user_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    /// Editing instructions derived from the image.
    pub prompt: String,
}

/// Input to image editing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub job_id: JobId,
    pub asset: AssetRef,
    pub prompt: Option<String>,
}

/// An external analysis/editing service.
///
/// Errors must be classified: `Provider`/`Network` for transient failures,
/// `Validation` (or any error marked fatal) for answers that will not change
/// on retry.
#[async_trait]
pub trait PhotoEditProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, JobError>;

    /// Returns a reference to the edited asset.
    async fn edit(&self, request: &EditRequest) -> Result<AssetRef, JobError>;
}

/// Echoes the user's prompt and returns the input asset. For local runs.
#[derive(Debug, Clone)]
pub struct PassthroughProvider {
    default_prompt: String,
}

impl PassthroughProvider {
    pub fn new(default_prompt: impl Into<String>) -> Self {
        Self {
            default_prompt: default_prompt.into(),
        }
    }
}

impl Default for PassthroughProvider {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROMPT)
    }
}

#[async_trait]
impl PhotoEditProvider for PassthroughProvider {
    fn name(&self) -> &str {
        PASSTHROUGH
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, JobError> {
        Ok(Analysis {
            prompt: request
                .user_prompt
                .clone()
                .unwrap_or_else(|| self.default_prompt.clone()),
        })
    }

    async fn edit(&self, request: &EditRequest) -> Result<AssetRef, JobError> {
        Ok(request.asset.clone())
    }
}

/// Providers by name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PhotoEditProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.providers.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry").field("providers", &names).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the passthrough provider already registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(PASSTHROUGH, Arc::new(PassthroughProvider::default()));
        registry
    }

    /// Register (or replace) a provider under `name`.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn PhotoEditProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PhotoEditProvider>> {
        self.providers.get(name).cloned()
    }

    /// Look up the configured provider, failing with the known names.
    pub fn select(&self, name: &str) -> Result<Arc<dyn PhotoEditProvider>, JobError> {
        self.get(name).ok_or_else(|| {
            let mut known: Vec<_> = self.providers.keys().map(String::as_str).collect();
            known.sort_unstable();
            JobError::validation(format!(
                "unknown provider '{name}' (registered: {})",
                known.join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
