//! runwarden -- retrying, time-bounded execution engine for headless browser tests.
//!
//! Submitted tests are recorded in a SQLite ledger, run against a fresh
//! browser context per attempt, retried on transient failures, and exposed to
//! callers through a polling status API.

pub mod api;
pub mod artifacts;
pub mod config;
pub mod execution;
pub mod gateway;
pub mod ledger;
pub mod orchestrator;
pub mod policy;
pub mod runner;
pub mod storage;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::artifacts::{ArtifactSink, FsArtifactSink, MemoryArtifactSink};
use crate::config::{ArtifactBackend, RunnerBackend, RunwardenConfig};
use crate::ledger::Ledger;
use crate::orchestrator::Orchestrator;
use crate::runner::{BrowserRunner, NodeRunner, ScriptedRunner, Step};

/// Build the browser runner selected by `[runner] backend`.
pub fn build_runner(config: &RunwardenConfig) -> Arc<dyn BrowserRunner> {
    match config.runner.backend {
        RunnerBackend::Node => Arc::new(NodeRunner::new(config.node_runner())),
        RunnerBackend::Scripted => Arc::new(ScriptedRunner::always(Step::pass())),
    }
}

/// Build the artifact sink selected by `[artifacts] backend`.
pub fn build_sink(config: &RunwardenConfig) -> Arc<dyn ArtifactSink> {
    match config.artifacts.backend {
        ArtifactBackend::Filesystem => Arc::new(FsArtifactSink::new(
            config.artifacts.dir.clone(),
            config.artifact_base_url(),
        )),
        ArtifactBackend::Memory => Arc::new(MemoryArtifactSink::new()),
    }
}

/// Start the runwarden daemon: ledger, orchestrator, watchdog, and API server.
///
/// Returns after a shutdown signal once in-flight work has been released.
pub async fn serve(config: RunwardenConfig) -> Result<()> {
    // 1. Storage
    let db_path = config.storage.db_path.as_path();
    tracing::info!(db_path = %db_path.display(), "initializing ledger");
    let pool = storage::open_pool(db_path)?;
    let ledger = Ledger::new(pool);

    // 2. Orchestrator
    let runner = build_runner(&config);
    tracing::info!(runner = runner.name(), "browser runner ready");
    let orchestrator = Orchestrator::new(
        ledger,
        runner,
        build_sink(&config),
        config.retry_policy(),
        config.submit_limits(),
        config.orchestrator_settings(),
    );

    // 3. Pick up work left by a previous process, then keep an eye on it
    orchestrator
        .recover()
        .await
        .context("startup recovery failed")?;
    let watchdog = orchestrator.spawn_watchdog();

    // 4. API server
    let artifacts_dir: Option<&Path> = match config.artifacts.backend {
        ArtifactBackend::Filesystem => {
            std::fs::create_dir_all(&config.artifacts.dir).with_context(|| {
                format!(
                    "failed to create artifact directory {}",
                    config.artifacts.dir.display()
                )
            })?;
            Some(config.artifacts.dir.as_path())
        }
        ArtifactBackend::Memory => None,
    };
    let app = api::router(api::state::AppState::new(orchestrator.clone()), artifacts_dir);

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "runwarden listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 5. Stop scheduling; unfinished executions resume on next start
    orchestrator.shutdown().await;
    let _ = watchdog.await;
    tracing::info!("runwarden stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
