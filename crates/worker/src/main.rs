use std::sync::Arc;

use anyhow::Context;
use pixelflow_infra::{
    InMemoryJobStore, JobOrchestrator, LogNotifier, OrchestratorConfig, ProviderRegistry, Worker, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pixelflow_observability::init();

    let config = OrchestratorConfig::from_env();
    let worker_config = WorkerConfig::from_env();

    let provider = ProviderRegistry::with_builtin()
        .select(&config.provider)
        .context("selecting photo edit provider")?;

    tracing::info!(
        provider = %config.provider,
        worker = %worker_config.name,
        poll_interval_ms = worker_config.poll_interval.as_millis() as u64,
        "starting worker"
    );

    let orchestrator = Arc::new(JobOrchestrator::new(
        InMemoryJobStore::arc(),
        provider,
        Arc::new(LogNotifier),
        config,
    ));
    let handle = Worker::new(orchestrator, worker_config).spawn();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        "worker exited"
    );
    Ok(())
}
