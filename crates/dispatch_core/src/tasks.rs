//! Task registry: every survivor ever discovered, in discovery order.
//!
//! Tasks are never removed. Completed tasks stay linked until the registry
//! fills up, at which point the oldest-completed ones are recycled as new
//! arrivals.

use crate::collection::{ListGuard, SyncList};
use crate::error::{CollectionError, RegistryError};
use crate::fleet::DroneId;
use crate::grid::Coord;
use crate::lock_order::LockLevel;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Assigned,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub position: Coord,
    pub status: TaskStatus,
    pub label: String,
    pub discovered_at: Instant,
    pub completed_at: Option<Instant>,
    pub assigned_to: Option<DroneId>,
}

impl Task {
    fn new(id: TaskId, position: Coord, label: String, discovered_at: Instant) -> Self {
        Self {
            id,
            position,
            status: TaskStatus::Waiting,
            label,
            discovered_at,
            completed_at: None,
            assigned_to: None,
        }
    }

    pub(crate) fn assign(&mut self, drone: DroneId) {
        self.status = TaskStatus::Assigned;
        self.assigned_to = Some(drone);
    }

    /// Back to the queue, e.g. after a rollback or a lost drone.
    pub(crate) fn release(&mut self) {
        self.status = TaskStatus::Waiting;
        self.assigned_to = None;
    }

    /// Marks the task done and returns its response time.
    pub(crate) fn complete(&mut self, now: Instant) -> Duration {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.assigned_to = None;
        now.saturating_duration_since(self.discovered_at)
    }
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub label: String,
    pub position: Coord,
    pub status: TaskStatus,
    pub assigned_to: Option<DroneId>,
    pub waiting_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub waiting: usize,
    pub assigned: usize,
    pub completed: usize,
    pub mean_response_ms: Option<u64>,
}

pub struct TaskRegistry {
    tasks: SyncList<Task>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn with_capacity(capacity: usize) -> Result<Self, CollectionError> {
        Ok(Self {
            tasks: SyncList::with_capacity(capacity, LockLevel::Tasks)?,
            next_id: AtomicU64::new(1),
        })
    }

    /// Takes the registry lock. Must be the innermost lock a thread takes.
    pub fn lock(&self) -> TaskGuard<'_> {
        TaskGuard {
            inner: self.tasks.lock(),
        }
    }

    /// Records a newly discovered task in WAITING state.
    pub fn enqueue(
        &self,
        position: Coord,
        label: impl Into<String>,
        discovered_at: Instant,
    ) -> Result<TaskId, RegistryError> {
        let mut guard = self.tasks.lock();
        if guard.is_full() {
            return Err(RegistryError::TasksFull);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        guard
            .add(Task::new(id, position, label.into(), discovered_at))
            .map_err(|_| RegistryError::TasksFull)?;
        Ok(id)
    }

    /// Turns up to `max` completed tasks, oldest completion first, back into
    /// WAITING tasks. `next_arrival` supplies the new position and label.
    pub fn recycle_completed(
        &self,
        max: usize,
        now: Instant,
        mut next_arrival: impl FnMut() -> (Coord, String),
    ) -> Vec<TaskId> {
        let mut guard = self.tasks.lock();
        let mut completed: Vec<_> = guard
            .iter()
            .filter_map(|(slot, task)| task.completed_at.map(|at| (at, task.id, slot)))
            .collect();
        completed.sort_by_key(|&(at, id, _)| (at, id));

        let mut recycled = Vec::new();
        for (_, _, slot) in completed.into_iter().take(max) {
            let Some(task) = guard.get_mut(slot) else {
                continue;
            };
            let (position, label) = next_arrival();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            *task = Task::new(id, position, label, now);
            recycled.push(id);
        }
        recycled
    }

    /// Returns an ASSIGNED task to WAITING. Used when its drone is lost.
    pub fn release(&self, id: TaskId) -> bool {
        let mut guard = self.lock();
        match guard.find_mut(id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                task.release();
                true
            }
            _ => false,
        }
    }

    /// WAITING tasks, oldest discovery first.
    ///
    /// Recycled tasks keep the slot of the task they replace, so list order
    /// is not discovery order; ids are.
    pub fn waiting(&self) -> Vec<(TaskId, Coord)> {
        let guard = self.tasks.lock();
        let mut waiting: Vec<_> = guard
            .iter()
            .filter(|(_, task)| task.status == TaskStatus::Waiting)
            .map(|(_, task)| (task.id, task.position))
            .collect();
        waiting.sort_unstable_by_key(|&(id, _)| id);
        waiting
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().find(id).cloned()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<TaskSnapshot> {
        let guard = self.tasks.lock();
        guard
            .iter()
            .rev()
            .map(|(_, task)| TaskSnapshot {
                id: task.id,
                label: task.label.clone(),
                position: task.position,
                status: task.status,
                assigned_to: task.assigned_to,
                waiting_ms: clamp_millis(
                    task.completed_at
                        .unwrap_or(now)
                        .saturating_duration_since(task.discovered_at)
                        .as_millis(),
                ),
            })
            .collect()
    }

    pub fn stats(&self) -> TaskStats {
        let guard = self.tasks.lock();
        let mut stats = TaskStats::default();
        let mut total_response = Duration::ZERO;
        for (_, task) in guard.iter() {
            match task.status {
                TaskStatus::Waiting => stats.waiting += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if let Some(done) = task.completed_at {
                        total_response = total_response
                            .saturating_add(done.saturating_duration_since(task.discovered_at));
                    }
                }
            }
        }
        if stats.completed > 0 {
            stats.mean_response_ms = Some(clamp_millis(
                total_response.as_millis() / stats.completed as u128,
            ));
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tasks.capacity()
    }
}

fn clamp_millis(millis: u128) -> u64 {
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Locked view of the task registry.
pub struct TaskGuard<'a> {
    inner: ListGuard<'a, Task>,
}

impl TaskGuard<'_> {
    pub fn find(&self, id: TaskId) -> Option<&Task> {
        let slot = self.inner.find(|task| task.id == id)?;
        self.inner.get(slot)
    }

    pub fn find_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let slot = self.inner.find(|task| task.id == id)?;
        self.inner.get_mut(slot)
    }

    /// Nearest WAITING task to `from`; ties go to the lowest task id.
    pub fn nearest_waiting(&self, from: Coord) -> Option<(TaskId, Coord)> {
        self.inner
            .iter()
            .filter(|(_, task)| task.status == TaskStatus::Waiting)
            .min_by_key(|(_, task)| (from.manhattan(task.position), task.id))
            .map(|(_, task)| (task.id, task.position))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.inner.iter().map(|(_, task)| task)
    }
}
