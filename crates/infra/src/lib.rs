//! `pixelflow-infra`: Server-side job processing.
//!
//! **Responsibility:** persistence contract and in-memory store, batch
//! aggregation, the AI provider seam, completion notifications, the job
//! orchestrator and the background worker that drives it.

pub mod aggregator;
pub mod config;
pub mod notifier;
pub mod orchestrator;
pub mod provider;
pub mod status;
pub mod store;
pub mod worker;

pub use aggregator::BatchAggregator;
pub use config::{AnalysisFallback, DEFAULT_PROMPT, EditFallback, OrchestratorConfig, WorkerConfig};
pub use notifier::{CompletionNotifier, LogNotifier, MemoryNotifier, Notification};
pub use orchestrator::{JobOrchestrator, OrchestratorError, ProcessOutcome};
pub use provider::{
    Analysis, AnalysisRequest, EditRequest, PASSTHROUGH, PassthroughProvider, PhotoEditProvider,
    ProviderRegistry,
};
pub use status::{batch_snapshot, job_snapshot};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use worker::{Worker, WorkerHandle, WorkerStats};
