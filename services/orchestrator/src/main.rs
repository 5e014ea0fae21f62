//! Sparkling orchestrator
//!
//! Registers cluster nodes, converges their coordinator/worker containers,
//! provisions per-user notebook sessions and enforces session quotas.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sparkling_events::ProgressBroadcaster;
use sparkling_orchestrator::{
    api,
    broker::{ConnectionBroker, DockerConnector, SshTunnelClient},
    clock::SystemClock,
    config,
    db::Database,
    jobs::JobRunner,
    nodes::SshKeygen,
    quota::{QuotaWorker, QuotaWorkerConfig},
    state::{AppState, Components, Settings},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to SPARKLING_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sparkling orchestrator");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };
    if let Err(e) = db.run_migrations().await {
        error!(error = %e, "Failed to run migrations");
        return Err(e.into());
    }

    let progress = ProgressBroadcaster::new();
    let jobs = JobRunner::new(progress.clone());
    let broker = ConnectionBroker::new(
        Arc::new(DockerConnector),
        Arc::new(SshTunnelClient::default()),
        config.broker.clone(),
    );

    let state = AppState::new(
        Components {
            store: Arc::new(db.store()),
            broker,
            keys: Arc::new(SshKeygen::new()),
            clock: Arc::new(SystemClock),
            progress,
            jobs: jobs.clone(),
        },
        Settings::from_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let quota_worker = QuotaWorker::new(
        state.sweeper().clone(),
        QuotaWorkerConfig {
            interval: config.quota_interval,
        },
    );
    let quota_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            quota_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers and background jobs to shut down...");
    if let Err(e) = tokio::time::timeout(SHUTDOWN_TIMEOUT, quota_handle).await {
        warn!(error = %e, "Quota worker did not shut down in time");
    }
    if !jobs.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!(remaining = jobs.active(), "Background jobs did not finish in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
