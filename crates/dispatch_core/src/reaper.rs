//! Periodic eviction of drones that stayed disconnected past their grace period.

use crate::config::ReaperConfig;
use crate::fleet::{Evicted, FleetRegistry};
use crate::metrics::MetricsHook;
use crate::tasks::TaskRegistry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

pub struct Reaper {
    fleet: Arc<FleetRegistry>,
    tasks: Arc<TaskRegistry>,
    config: ReaperConfig,
    metrics: Arc<dyn MetricsHook>,
}

impl Reaper {
    pub fn new(
        fleet: Arc<FleetRegistry>,
        tasks: Arc<TaskRegistry>,
        config: ReaperConfig,
        metrics: Arc<dyn MetricsHook>,
    ) -> Self {
        Self {
            fleet,
            tasks,
            config,
            metrics,
        }
    }

    /// Evicts expired drones and puts their in-flight tasks back in the queue.
    pub fn reap_once(&self, now: Instant) -> Vec<Evicted> {
        let evicted = self.fleet.reap(now, self.config.eviction_timeout);
        for drone in &evicted {
            self.metrics.drone_evicted();
            let released = drone.mission.is_some_and(|task| self.tasks.release(task));
            tracing::info!(
                drone_id = drone.id,
                released_task = ?drone.mission.filter(|_| released),
                "Evicted disconnected drone"
            );
        }
        evicted
    }

    pub fn spawn(self, mut shutdown_rx: watch::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = self.config.interval.as_millis() as u64,
                timeout_ms = self.config.eviction_timeout.as_millis() as u64,
                "Reaper started."
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(self.config.interval) => {
                        tracing::debug!("Running disconnect reaper...");
                        self.reap_once(Instant::now());
                    }
                }
            }
            tracing::info!("Reaper stopped.");
        })
    }
}
