//! Survivor discovery: new tasks at random cells with exponential gaps.

use crate::config::GeneratorConfig;
use crate::grid::{Coord, Grid};
use crate::metrics::MetricsHook;
use crate::tasks::{TaskId, TaskRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// What a generator tick did to the task registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generated {
    Enqueued(TaskId),
    /// The registry was full; these completed tasks were turned into new
    /// WAITING ones. Empty when nothing had completed yet.
    Recycled(Vec<TaskId>),
}

pub struct TaskGenerator {
    tasks: Arc<TaskRegistry>,
    grid: Grid,
    config: GeneratorConfig,
    metrics: Arc<dyn MetricsHook>,
    rng: StdRng,
    discovered: u64,
}

impl TaskGenerator {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        grid: Grid,
        config: GeneratorConfig,
        metrics: Arc<dyn MetricsHook>,
    ) -> Self {
        Self {
            tasks,
            grid,
            config,
            metrics,
            rng: StdRng::from_entropy(),
            discovered: 0,
        }
    }

    /// Replaces the entropy-seeded generator, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Draws the wait before the next discovery: `-mean * ln(1 - u)`.
    pub fn next_interval(&mut self) -> Duration {
        let u: f64 = self.rng.gen();
        let factor = -(1.0 - u).ln();
        // u == 0 yields -0.0, which mul_f64 rejects.
        if factor > 0.0 {
            self.config.mean_interval.mul_f64(factor)
        } else {
            Duration::ZERO
        }
    }

    /// Discovers one survivor, recycling completed tasks when the registry is full.
    pub fn generate_once(&mut self, now: Instant) -> Generated {
        let (position, label) = next_arrival(&self.grid, &mut self.rng, &mut self.discovered);
        match self.tasks.enqueue(position, label.as_str(), now) {
            Ok(id) => {
                self.metrics.task_generated();
                tracing::info!(task_id = id, label = %label, x = position.x, y = position.y, "Survivor discovered");
                Generated::Enqueued(id)
            }
            Err(err) => {
                tracing::debug!(error = %err, "Enqueue rejected; recycling");
                let Self {
                    tasks,
                    grid,
                    config,
                    rng,
                    discovered,
                    ..
                } = self;
                let recycled = tasks.recycle_completed(config.recycle_batch, now, || {
                    next_arrival(grid, rng, discovered)
                });
                if recycled.is_empty() {
                    tracing::debug!("Task registry full and nothing to recycle");
                } else {
                    self.metrics.tasks_recycled(recycled.len());
                    tracing::info!(count = recycled.len(), "Recycled completed tasks");
                }
                Generated::Recycled(recycled)
            }
        }
    }

    pub fn spawn(mut self, mut shutdown_rx: watch::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                mean_interval_ms = self.config.mean_interval.as_millis() as u64,
                capacity = self.tasks.capacity(),
                "Task generator started."
            );
            loop {
                let wait = self.next_interval();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(wait) => {
                        self.generate_once(Instant::now());
                    }
                }
            }
            tracing::info!("Task generator stopped.");
        })
    }
}

fn next_arrival(grid: &Grid, rng: &mut StdRng, discovered: &mut u64) -> (Coord, String) {
    *discovered += 1;
    (grid.random_coord(rng), format!("Survivor-{discovered}"))
}
