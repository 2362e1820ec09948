//! Dispatch scheduler: pairs idle drones with waiting tasks.
//!
//! A pairing is committed while holding the drone's lock and then the task
//! registry lock, after re-checking that both sides are still available. If
//! the drone is networked the ASSIGN_MISSION is queued inside that same
//! critical section; a failed queue undoes both sides before either lock is
//! released, so no observer ever sees a half-assigned pair.

use crate::collection::ListGuard;
use crate::config::{MissionParams, Strategy};
use crate::error::LinkError;
use crate::fleet::{Drone, DroneId, DroneState, DroneStatus, FleetRegistry};
use crate::grid::Coord;
use crate::metrics::MetricsHook;
use crate::protocol::{unix_millis, ServerMessage};
use crate::tasks::{Task, TaskId, TaskRegistry, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// What one dispatch cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub assigned: usize,
    /// Pairings abandoned because a side changed between selection and commit.
    pub contended: usize,
    pub rolled_back: usize,
    /// Steps taken by in-process drones.
    pub moved: usize,
    pub completed: usize,
}

/// Effect of closing out a drone's mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionOutcome {
    Completed {
        task: TaskId,
        response_time: Duration,
    },
    /// The mission failed and the task went back to WAITING.
    Released { task: TaskId },
    /// The drone held a mission whose task is no longer ASSIGNED.
    Stale { task: TaskId },
    /// Nothing to do: the drone had no mission.
    NoMission,
}

/// Closes the mission held by `drone` and returns it to IDLE.
///
/// The caller holds the drone's lock; the task registry lock is taken here,
/// which keeps the fleet → drone → tasks order. Calling this for a drone that
/// is already idle is a no-op.
pub fn finish_mission(
    drone: &mut DroneState,
    tasks: &TaskRegistry,
    success: bool,
    now: Instant,
) -> MissionOutcome {
    let Some(task_id) = drone.mission else {
        return MissionOutcome::NoMission;
    };

    let outcome = {
        let mut guard = tasks.lock();
        match guard.find_mut(task_id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                if success {
                    MissionOutcome::Completed {
                        task: task_id,
                        response_time: task.complete(now),
                    }
                } else {
                    task.release();
                    MissionOutcome::Released { task: task_id }
                }
            }
            _ => MissionOutcome::Stale { task: task_id },
        }
    };

    drone.become_idle();
    drone.touch(now);
    outcome
}

pub struct Dispatcher {
    fleet: Arc<FleetRegistry>,
    tasks: Arc<TaskRegistry>,
    strategy: Strategy,
    mission: MissionParams,
    metrics: Arc<dyn MetricsHook>,
}

impl Dispatcher {
    pub fn new(
        fleet: Arc<FleetRegistry>,
        tasks: Arc<TaskRegistry>,
        strategy: Strategy,
        mission: MissionParams,
        metrics: Arc<dyn MetricsHook>,
    ) -> Self {
        Self {
            fleet,
            tasks,
            strategy,
            mission,
            metrics,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Runs one dispatch cycle with the configured strategy.
    pub fn run_cycle(&self) -> CycleReport {
        let now = Instant::now();
        let mut report = CycleReport::default();
        match self.strategy {
            Strategy::TaskCentric => {
                self.match_tasks_to_drones(now, &mut report);
                self.advance_local(&mut report);
                self.complete_arrivals(now, false, &mut report);
            }
            Strategy::AgentCentric => {
                self.match_drones_to_tasks(now, &mut report);
                self.advance_local(&mut report);
                // Networked drones report their own arrival.
                self.complete_arrivals(now, true, &mut report);
            }
        }
        report
    }

    /// Drives [`run_cycle`](Self::run_cycle) every `period` until shutdown.
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(strategy = ?self.strategy, period_ms = period.as_millis() as u64, "Dispatch loop started.");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let report = self.run_cycle();
                        if report != CycleReport::default() {
                            tracing::debug!(
                                assigned = report.assigned,
                                contended = report.contended,
                                rolled_back = report.rolled_back,
                                moved = report.moved,
                                completed = report.completed,
                                "Dispatch cycle"
                            );
                        }
                    }
                }
            }
            tracing::info!("Dispatch loop stopped.");
        })
    }

    /// Each WAITING task, oldest first, takes the nearest IDLE drone.
    fn match_tasks_to_drones(&self, now: Instant, report: &mut CycleReport) {
        for (task_id, position) in self.tasks.waiting() {
            let fleet = self.fleet.lock();
            let Some(drone) = nearest_idle(&fleet, position) else {
                // No idle drone left; the remaining tasks wait for the next cycle.
                break;
            };

            let mut state = drone.lock();
            if state.status != DroneStatus::Idle {
                report.contended += 1;
                continue;
            }
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.find_mut(task_id) else {
                report.contended += 1;
                continue;
            };
            if task.status != TaskStatus::Waiting {
                report.contended += 1;
                continue;
            }
            match self.commit(drone.id(), &mut state, task, now) {
                Ok(()) => report.assigned += 1,
                Err(_) => report.rolled_back += 1,
            }
        }
    }

    /// Each IDLE drone, lowest id first, takes the nearest WAITING task.
    fn match_drones_to_tasks(&self, now: Instant, report: &mut CycleReport) {
        let fleet = self.fleet.lock();
        let mut drones: Vec<Arc<Drone>> = fleet.iter().map(|(_, d)| Arc::clone(d)).collect();
        drones.sort_by_key(|d| d.id());

        for drone in drones {
            let mut state = drone.lock();
            if state.status != DroneStatus::Idle {
                continue;
            }
            let mut tasks = self.tasks.lock();
            let Some((task_id, _)) = tasks.nearest_waiting(state.position) else {
                break;
            };
            let Some(task) = tasks.find_mut(task_id) else {
                report.contended += 1;
                continue;
            };
            match self.commit(drone.id(), &mut state, task, now) {
                Ok(()) => report.assigned += 1,
                Err(_) => report.rolled_back += 1,
            }
        }
    }

    /// Applies a verified pairing. Both locks are held by the caller.
    fn commit(
        &self,
        drone_id: DroneId,
        state: &mut DroneState,
        task: &mut Task,
        now: Instant,
    ) -> Result<(), LinkError> {
        let prior = state.assignment_state();
        state.assign(task.id, task.position, now);
        task.assign(drone_id);

        let msg = ServerMessage::AssignMission {
            mission_id: task.id,
            priority: self.mission.priority,
            target: task.position,
            expiry: unix_millis() + self.mission.expiry.as_millis() as i64,
        };
        let sent = state.link().map(|link| link.send(msg));
        if let Some(Err(err)) = sent {
            state.restore(prior);
            task.release();
            self.metrics.assignment_rolled_back();
            tracing::warn!(drone_id, task_id = task.id, error = %err, "Mission transmission failed; assignment rolled back");
            return Err(err);
        }

        self.metrics.assignment_committed();
        tracing::info!(
            drone_id,
            task_id = task.id,
            label = %task.label,
            distance = state.position.manhattan(task.position),
            "Mission assigned"
        );
        Ok(())
    }

    /// Moves every in-process drone one cell toward its target.
    fn advance_local(&self, report: &mut CycleReport) {
        let fleet = self.fleet.lock();
        for (_, drone) in fleet.iter() {
            let mut state = drone.lock();
            if state.is_local() && state.status == DroneStatus::Assigned && state.position != state.target {
                state.position = state.position.step_toward(state.target);
                report.moved += 1;
            }
        }
    }

    /// Completes missions of ASSIGNED drones standing on their target.
    fn complete_arrivals(&self, now: Instant, local_only: bool, report: &mut CycleReport) {
        let fleet = self.fleet.lock();
        for (_, drone) in fleet.iter() {
            let mut state = drone.lock();
            if state.status != DroneStatus::Assigned || state.position != state.target {
                continue;
            }
            if local_only && !state.is_local() {
                continue;
            }
            if let MissionOutcome::Completed { task, response_time } =
                finish_mission(&mut state, &self.tasks, true, now)
            {
                report.completed += 1;
                self.metrics.mission_completed(response_time);
                tracing::info!(
                    drone_id = drone.id(),
                    task_id = task,
                    response_ms = response_time.as_millis() as u64,
                    "Mission completed"
                );
            }
        }
    }
}

/// Nearest IDLE drone to `position`, ties to the lowest id. Drone locks are
/// taken one at a time under the fleet lock.
fn nearest_idle(fleet: &ListGuard<'_, Arc<Drone>>, position: Coord) -> Option<Arc<Drone>> {
    fleet
        .iter()
        .filter_map(|(_, drone)| {
            let state = drone.lock();
            if state.status != DroneStatus::Idle {
                return None;
            }
            let distance = state.position.manhattan(position);
            Some((distance, drone.id(), drone))
        })
        .min_by_key(|&(distance, id, _)| (distance, id))
        .map(|(_, _, drone)| Arc::clone(drone))
}
