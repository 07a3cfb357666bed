//! speedchecker -- scheduled internet speed measurements with durable history.
//!
//! This crate provides the core library: provider probes, the single
//! scheduling loop with its run token, the dual-representation history
//! store, and the HTTP API that fronts them.

pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod provider;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::scheduler::{ConfigStore, ProbeRunner, Scheduler};
use crate::storage::HistoryStore;

/// Open storage and wire the scheduler for `config`. The loop is not started.
pub async fn build_scheduler(config: &AppConfig, shutdown: CancellationToken) -> Result<Scheduler> {
    let data_dir = &config.storage.data_dir;
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    tracing::info!(data_dir = %data_dir.display(), "opening history store");
    let history = HistoryStore::open(data_dir).await?;
    let store = Arc::new(ConfigStore::load(data_dir, config.schedule_defaults()).await?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let runner = Arc::new(ProbeRunner::new(
        config.probes.probe_set(),
        history,
        clock.clone(),
        config.probes.runner_settings(),
    ));

    let scheduler = Scheduler::new(
        store,
        runner,
        clock,
        config.scheduler.poll_interval(),
        shutdown,
    )
    .await?;
    Ok(scheduler)
}

/// Start the speedchecker daemon: API server plus the scheduling loop.
pub async fn serve(config: AppConfig) -> Result<()> {
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;

    let shutdown = CancellationToken::new();
    let scheduler = build_scheduler(&config, shutdown.clone()).await?;

    let loop_handle = tokio::spawn(scheduler.clone().run());

    let app = api::router(api::state::AppState::new(scheduler));

    tracing::info!(%addr, "speedchecker listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    // Covers the server exiting on its own as well.
    shutdown.cancel();
    if let Err(e) = loop_handle.await {
        tracing::error!(error = %e, "scheduler loop task failed");
    }
    tracing::info!("speedchecker stopped");
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
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
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
}
