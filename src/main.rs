use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use scan_worker::config::{ToolsConfigStore, WorkerConfig};
use scan_worker::connection::{SessionConfig, SessionEnd, WorkerSession};
use scan_worker::orchestrator::{ApiClient, Orchestrator};
use scan_worker::worker::{ExecutorDeps, TaskExecutor, TaskRegistry, WorkerIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "scan-worker.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr.and(file))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    };

    let tools = Arc::new(
        ToolsConfigStore::load(&config.tools_config)
            .await
            .context("loading tools configuration")?,
    );
    let identity = Arc::new(WorkerIdentity::new(
        config.name.clone(),
        tools.commands().await,
    ));
    tracing::info!(worker = %identity.name, "Starting scan worker");

    let orchestrator: Arc<dyn Orchestrator> = Arc::new(ApiClient::new(&config.api_url)?);
    let executor = TaskExecutor::new(ExecutorDeps {
        orchestrator: Arc::clone(&orchestrator),
        registry: Arc::new(TaskRegistry::new(config.max_tasks)),
        tools: Arc::clone(&tools),
        identity: Arc::clone(&identity),
        results_dir: config.results_dir.clone(),
    });

    let mut session = WorkerSession::new(
        SessionConfig {
            api_url: config.api_url.clone(),
            events_url: config.events_url.clone(),
            heartbeat_interval: config.heartbeat_interval,
        },
        orchestrator,
        executor,
        tools,
        identity,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match session.connect_and_run(shutdown).await? {
        SessionEnd::Deleted => tracing::info!("Worker deleted, exiting"),
        SessionEnd::Shutdown => tracing::info!("Worker stopped"),
    }
    Ok(())
}
