mod config;
mod metrics;

use crate::config::Config;
use crate::metrics::Metrics;
use anyhow::Context;
use clap::Parser;
use dispatch_core::{DispatchSystem, FleetRegistry, Grid, TaskRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();
    tracing::info!(config = ?config, "Loaded configuration");

    let metrics = Arc::new(Metrics::new().context("Failed to create metrics registry")?);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind drone listener on {}", config.listen_addr))?;
    let system = DispatchSystem::start(config.dispatch_config(), listener, metrics.clone())
        .context("Failed to start dispatch system")?;

    register_local_drones(system.fleet(), &config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Spawn the metrics server
    let metrics_handle = {
        let router = metrics.router(Arc::clone(system.fleet()), Arc::clone(system.tasks()));
        let addr = config.metrics_listen_addr;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind metrics listener on {addr}"))?;
            tracing::info!(addr = %addr, "Metrics server started");
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        })
    };

    let status_handle = spawn_status_log(
        Arc::clone(system.fleet()),
        Arc::clone(system.tasks()),
        metrics.clone(),
        config.status_interval(),
        shutdown_rx,
    );

    tracing::info!("All services started. Awaiting shutdown signal...");
    shutdown_signal().await;

    tracing::info!("Shutdown signal received. Terminating services...");
    drop(shutdown_tx);
    system.shutdown().await;

    let (metrics_res, status_res) = tokio::join!(metrics_handle, status_handle);
    match metrics_res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Metrics server failed."),
        Err(e) => tracing::error!(error = %e, "Metrics server task failed."),
    }
    if let Err(e) = status_res {
        tracing::error!(error = %e, "Status task failed.");
    }

    tracing::info!("Dispatch server shut down gracefully.");
    Ok(())
}

/// Demo mode: drones simulated in-process, spread at random over the grid.
fn register_local_drones(fleet: &FleetRegistry, config: &Config) -> anyhow::Result<()> {
    let grid: Grid = config.grid();
    let mut rng = rand::thread_rng();
    for offset in 0..config.local_drones {
        let id = config.local_drone_id_base + offset;
        let position = grid.random_coord(&mut rng);
        fleet
            .register_local(id, position)
            .with_context(|| format!("Failed to register local drone {id}"))?;
        tracing::info!(drone_id = id, x = position.x, y = position.y, "Local drone registered");
    }
    Ok(())
}

/// Periodic presentation line: fleet and task counts, and the gauges.
fn spawn_status_log(
    fleet: Arc<FleetRegistry>,
    tasks: Arc<TaskRegistry>,
    metrics: Arc<Metrics>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let stats = tasks.stats();
                    let connected = fleet.connected();
                    metrics.update_gauges(connected, &stats);
                    tracing::info!(
                        drones = fleet.len(),
                        connected,
                        waiting = stats.waiting,
                        assigned = stats.assigned,
                        completed = stats.completed,
                        mean_response_ms = ?stats.mean_response_ms,
                        "Status"
                    );
                }
            }
        }
    })
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
