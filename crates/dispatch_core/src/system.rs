//! Wires the registries and long-running loops into one running system.

use crate::config::DispatchConfig;
use crate::connection::ConnectionManager;
use crate::error::CollectionError;
use crate::fleet::FleetRegistry;
use crate::generator::TaskGenerator;
use crate::metrics::MetricsHook;
use crate::reaper::Reaper;
use crate::scheduler::Dispatcher;
use crate::tasks::TaskRegistry;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running dispatch system. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the loops running until the runtime stops.
pub struct DispatchSystem {
    fleet: Arc<FleetRegistry>,
    tasks: Arc<TaskRegistry>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl DispatchSystem {
    /// Allocates both registries and starts the scheduler, generator, reaper
    /// and connection manager on the current runtime.
    pub fn start(
        config: DispatchConfig,
        listener: TcpListener,
        metrics: Arc<dyn MetricsHook>,
    ) -> Result<Self, StartError> {
        let local_addr = listener.local_addr().map_err(StartError::Listener)?;
        let fleet = Arc::new(FleetRegistry::with_capacity(config.fleet_capacity)?);
        let tasks = Arc::new(TaskRegistry::with_capacity(config.task_capacity)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let mut handles = Vec::new();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&fleet),
            Arc::clone(&tasks),
            config.strategy,
            config.mission,
            Arc::clone(&metrics),
        ));
        handles.push((
            "dispatcher",
            dispatcher.spawn(config.dispatch_interval, shutdown_rx.clone()),
        ));

        if config.generator.enabled {
            let generator = TaskGenerator::new(
                Arc::clone(&tasks),
                config.grid,
                config.generator.clone(),
                Arc::clone(&metrics),
            );
            handles.push(("generator", generator.spawn(shutdown_rx.clone())));
        }

        let reaper = Reaper::new(
            Arc::clone(&fleet),
            Arc::clone(&tasks),
            config.reaper.clone(),
            Arc::clone(&metrics),
        );
        handles.push(("reaper", reaper.spawn(shutdown_rx.clone())));

        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&fleet),
            Arc::clone(&tasks),
            config.grid,
            config.link.clone(),
            config.mission,
            metrics,
        ));
        handles.push(("connections", manager.spawn(listener, shutdown_rx)));

        tracing::info!(
            addr = %local_addr,
            strategy = ?config.strategy,
            fleet_capacity = config.fleet_capacity,
            task_capacity = config.task_capacity,
            "Dispatch system started."
        );
        Ok(Self {
            fleet,
            tasks,
            local_addr,
            shutdown_tx,
            handles,
        })
    }

    pub fn fleet(&self) -> &Arc<FleetRegistry> {
        &self.fleet
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Address the connection manager is accepting on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals every loop to stop and waits for them, connections included.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down dispatch system...");
        drop(self.shutdown_tx);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Task failed during shutdown.");
            }
        }
        let stats = self.tasks.stats();
        tracing::info!(
            drones = self.fleet.len(),
            waiting = stats.waiting,
            assigned = stats.assigned,
            completed = stats.completed,
            "Dispatch system stopped."
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Allocation(#[from] CollectionError),
    #[error("listener has no local address: {0}")]
    Listener(#[source] io::Error),
}
