//! Fleet registry: every connected (or recently disconnected) drone.
//!
//! The registry is a [`SyncList`] of `Arc<Drone>`. The list lock
//! ([`LockLevel::Fleet`]) guards membership; each drone's own
//! [`LockLevel::Drone`] lock guards its fields.

use crate::collection::{ListGuard, SyncList};
use crate::error::{CollectionError, LinkError, RegistryError};
use crate::grid::Coord;
use crate::lock_order::{LockLevel, OrderedGuard, OrderedMutex};
use crate::protocol::ServerMessage;
use crate::tasks::TaskId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use uuid::Uuid;

pub type DroneId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DroneStatus {
    Idle,
    Assigned,
    Disconnected,
}

/// Outbound half of a drone's connection.
#[derive(Debug, Clone)]
pub struct DroneLink {
    conn_id: Uuid,
    tx: mpsc::Sender<ServerMessage>,
}

impl DroneLink {
    pub fn new(conn_id: Uuid, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queues `msg` for the connection's writer without waiting.
    pub fn send(&self, msg: ServerMessage) -> Result<(), LinkError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::Backpressure,
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }
}

/// Assignment-related fields, captured so a failed dispatch can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AssignmentState {
    status: DroneStatus,
    target: Coord,
    mission: Option<TaskId>,
}

#[derive(Debug)]
pub struct DroneState {
    pub position: Coord,
    pub target: Coord,
    pub status: DroneStatus,
    pub mission: Option<TaskId>,
    pub battery: Option<u8>,
    pub last_activity: Instant,
    pub disconnected_at: Option<Instant>,
    link: Option<DroneLink>,
}

impl DroneState {
    fn new(position: Coord, link: Option<DroneLink>, now: Instant) -> Self {
        Self {
            position,
            target: position,
            status: DroneStatus::Idle,
            mission: None,
            battery: None,
            last_activity: now,
            disconnected_at: None,
            link,
        }
    }

    pub fn link(&self) -> Option<&DroneLink> {
        self.link.as_ref()
    }

    /// Drones registered without a connection move in-process.
    pub fn is_local(&self) -> bool {
        self.link.is_none() && self.status != DroneStatus::Disconnected
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Applies a reported position. Keeps `target == position` while idle.
    pub fn report_position(&mut self, position: Coord) {
        self.position = position;
        if self.status == DroneStatus::Idle {
            self.target = position;
        }
    }

    pub(crate) fn assignment_state(&self) -> AssignmentState {
        AssignmentState {
            status: self.status,
            target: self.target,
            mission: self.mission,
        }
    }

    pub(crate) fn restore(&mut self, prior: AssignmentState) {
        self.status = prior.status;
        self.target = prior.target;
        self.mission = prior.mission;
    }

    pub(crate) fn assign(&mut self, task: TaskId, target: Coord, now: Instant) {
        self.status = DroneStatus::Assigned;
        self.target = target;
        self.mission = Some(task);
        self.last_activity = now;
    }

    pub(crate) fn become_idle(&mut self) {
        self.status = DroneStatus::Idle;
        self.target = self.position;
        self.mission = None;
    }

    fn attach(&mut self, link: DroneLink, now: Instant) {
        self.link = Some(link);
        self.disconnected_at = None;
        self.last_activity = now;
        self.status = if self.mission.is_some() {
            DroneStatus::Assigned
        } else {
            DroneStatus::Idle
        };
    }

    /// Moves the drone to DISCONNECTED if `conn_id` still owns it. The mission,
    /// if any, is kept so a reconnect inside the grace period can resume it.
    pub fn mark_disconnected(&mut self, conn_id: Uuid, now: Instant) -> bool {
        if self.link.as_ref().map(DroneLink::conn_id) != Some(conn_id) {
            return false;
        }
        self.link = None;
        self.status = DroneStatus::Disconnected;
        self.disconnected_at = Some(now);
        true
    }

    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        self.status == DroneStatus::Disconnected
            && self
                .disconnected_at
                .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
    }
}

#[derive(Debug)]
pub struct Drone {
    id: DroneId,
    state: OrderedMutex<DroneState>,
}

impl Drone {
    fn new(id: DroneId, position: Coord, link: Option<DroneLink>, now: Instant) -> Self {
        Self {
            id,
            state: OrderedMutex::new(LockLevel::Drone, DroneState::new(position, link, now)),
        }
    }

    pub fn id(&self) -> DroneId {
        self.id
    }

    /// Takes this drone's lock. Must come after the fleet lock, if that is held,
    /// and before the task registry lock.
    pub fn lock(&self) -> OrderedGuard<'_, DroneState> {
        self.state.lock()
    }
}

/// Result of a successful handshake registration.
#[derive(Debug)]
pub enum Attached {
    Registered(Arc<Drone>),
    /// A disconnected drone came back inside its grace period. Carries the
    /// mission to re-send, if one was in flight.
    Resumed {
        drone: Arc<Drone>,
        mission: Option<(TaskId, Coord)>,
    },
}

impl Attached {
    pub fn drone(&self) -> &Arc<Drone> {
        match self {
            Attached::Registered(drone) | Attached::Resumed { drone, .. } => drone,
        }
    }
}

/// A drone removed by the reaper.
#[derive(Debug)]
pub struct Evicted {
    pub id: DroneId,
    pub mission: Option<TaskId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DroneSnapshot {
    pub id: DroneId,
    pub position: Coord,
    pub target: Coord,
    pub status: DroneStatus,
    pub mission: Option<TaskId>,
    pub battery: Option<u8>,
    pub networked: bool,
}

pub struct FleetRegistry {
    drones: SyncList<Arc<Drone>>,
}

impl FleetRegistry {
    pub fn with_capacity(capacity: usize) -> Result<Self, CollectionError> {
        Ok(Self {
            drones: SyncList::with_capacity(capacity, LockLevel::Fleet)?,
        })
    }

    /// Takes the fleet lock for a traversal. Must be the outermost lock.
    pub fn lock(&self) -> ListGuard<'_, Arc<Drone>> {
        self.drones.lock()
    }

    /// Registers a drone that is simulated in-process rather than connected.
    pub fn register_local(&self, id: DroneId, position: Coord) -> Result<Arc<Drone>, RegistryError> {
        let mut fleet = self.drones.lock();
        if fleet.find(|drone| drone.id == id).is_some() {
            return Err(RegistryError::DuplicateDrone(id));
        }
        let drone = Arc::new(Drone::new(id, position, None, Instant::now()));
        fleet
            .add(Arc::clone(&drone))
            .map_err(|_| RegistryError::FleetFull)?;
        Ok(drone)
    }

    /// Binds a freshly handshaken connection to drone `id`.
    ///
    /// A new id gets a new IDLE record at `position`. An id whose record is
    /// DISCONNECTED is resumed in place. An id that is still connected is
    /// rejected.
    pub fn attach(
        &self,
        id: DroneId,
        position: Coord,
        link: DroneLink,
        now: Instant,
    ) -> Result<Attached, RegistryError> {
        let mut fleet = self.drones.lock();
        if let Some(slot) = fleet.find(|drone| drone.id == id) {
            let drone = fleet
                .get(slot)
                .map(Arc::clone)
                .ok_or(RegistryError::DuplicateDrone(id))?;
            let mut state = drone.lock();
            if state.status != DroneStatus::Disconnected {
                return Err(RegistryError::DuplicateDrone(id));
            }
            state.attach(link, now);
            let mission = state.mission.map(|task| (task, state.target));
            drop(state);
            return Ok(Attached::Resumed { drone, mission });
        }

        let drone = Arc::new(Drone::new(id, position, Some(link), now));
        fleet
            .add(Arc::clone(&drone))
            .map_err(|_| RegistryError::FleetFull)?;
        Ok(Attached::Registered(drone))
    }

    /// Removes drones that have been DISCONNECTED for at least `timeout`.
    pub fn reap(&self, now: Instant, timeout: Duration) -> Vec<Evicted> {
        let mut fleet = self.drones.lock();
        let expired: Vec<_> = fleet
            .iter()
            .filter_map(|(slot, drone)| {
                let state = drone.lock();
                if !state.expired(now, timeout) {
                    return None;
                }
                let mission = state.mission;
                Some((
                    slot,
                    Evicted {
                        id: drone.id,
                        mission,
                    },
                ))
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|(slot, evicted)| fleet.remove_ref(slot).map(|_| evicted))
            .collect()
    }

    pub fn get(&self, id: DroneId) -> Option<Arc<Drone>> {
        let fleet = self.drones.lock();
        let slot = fleet.find(|drone| drone.id == id)?;
        fleet.get(slot).map(Arc::clone)
    }

    pub fn status_of(&self, id: DroneId) -> Option<DroneStatus> {
        let drone = self.get(id)?;
        let status = drone.lock().status;
        Some(status)
    }

    pub fn snapshot(&self) -> Vec<DroneSnapshot> {
        let fleet = self.drones.lock();
        let mut drones: Vec<_> = fleet
            .iter()
            .map(|(_, drone)| {
                let state = drone.lock();
                DroneSnapshot {
                    id: drone.id,
                    position: state.position,
                    target: state.target,
                    status: state.status,
                    mission: state.mission,
                    battery: state.battery,
                    networked: state.link.is_some(),
                }
            })
            .collect();
        drones.sort_by_key(|d| d.id);
        drones
    }

    /// Drones with a live connection.
    pub fn connected(&self) -> usize {
        let fleet = self.drones.lock();
        fleet
            .iter()
            .filter(|(_, drone)| drone.lock().link.is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.drones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> (DroneLink, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (DroneLink::new(Uuid::new_v4(), tx), rx)
    }

    #[test]
    fn attach_registers_idle_drone() {
        let fleet = FleetRegistry::with_capacity(2).expect("allocate");
        let (link, _rx) = link();
        let attached = fleet
            .attach(5, Coord::new(2, 3), link, Instant::now())
            .expect("attach");
        assert!(matches!(attached, Attached::Registered(_)));

        let state = attached.drone().lock();
        assert_eq!(state.status, DroneStatus::Idle);
        assert_eq!(state.target, state.position);
    }

    #[test]
    fn duplicate_live_drone_is_rejected() {
        let fleet = FleetRegistry::with_capacity(2).expect("allocate");
        let (first, _rx1) = link();
        let (second, _rx2) = link();
        fleet
            .attach(1, Coord::new(0, 0), first, Instant::now())
            .expect("attach");
        assert_eq!(
            fleet
                .attach(1, Coord::new(4, 4), second, Instant::now())
                .unwrap_err(),
            RegistryError::DuplicateDrone(1)
        );
        assert_eq!(fleet.len(), 1);
    }

    #[test]
    fn reconnect_resumes_in_flight_mission() {
        let fleet = FleetRegistry::with_capacity(2).expect("allocate");
        let (first, _rx1) = link();
        let conn = first.conn_id();
        let drone = fleet
            .attach(1, Coord::new(0, 0), first, Instant::now())
            .expect("attach")
            .drone()
            .clone();
        {
            let mut state = drone.lock();
            state.assign(42, Coord::new(3, 4), Instant::now());
            assert!(state.mark_disconnected(conn, Instant::now()));
            assert_eq!(state.status, DroneStatus::Disconnected);
        }

        let (second, _rx2) = link();
        match fleet
            .attach(1, Coord::new(9, 9), second, Instant::now())
            .expect("resume")
        {
            Attached::Resumed { mission, drone } => {
                assert_eq!(mission, Some((42, Coord::new(3, 4))));
                let state = drone.lock();
                assert_eq!(state.status, DroneStatus::Assigned);
                assert_eq!(state.disconnected_at, None);
                // Position comes from the record, not the new handshake.
                assert_eq!(state.position, Coord::new(0, 0));
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[test]
    fn stale_connection_cannot_disconnect_new_one() {
        let fleet = FleetRegistry::with_capacity(1).expect("allocate");
        let (link, _rx) = link();
        let drone = fleet
            .attach(1, Coord::new(0, 0), link, Instant::now())
            .expect("attach")
            .drone()
            .clone();
        let mut state = drone.lock();
        assert!(!state.mark_disconnected(Uuid::new_v4(), Instant::now()));
        assert_eq!(state.status, DroneStatus::Idle);
    }

    #[test]
    fn reap_honours_grace_period() {
        let fleet = FleetRegistry::with_capacity(2).expect("allocate");
        let (link, _rx) = link();
        let conn = link.conn_id();
        let t0 = Instant::now();
        let drone = fleet
            .attach(1, Coord::new(0, 0), link, t0)
            .expect("attach")
            .drone()
            .clone();
        drone.lock().mark_disconnected(conn, t0);

        let timeout = Duration::from_secs(10);
        assert!(fleet.reap(t0 + timeout / 2, timeout).is_empty());
        assert_eq!(fleet.len(), 1);

        let evicted = fleet.reap(t0 + timeout, timeout);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, 1);
        assert!(fleet.is_empty());
    }

    #[test]
    fn full_fleet_rejects_registration() {
        let fleet = FleetRegistry::with_capacity(1).expect("allocate");
        fleet.register_local(1, Coord::new(0, 0)).expect("first");
        assert_eq!(
            fleet.register_local(2, Coord::new(0, 0)).unwrap_err(),
            RegistryError::FleetFull
        );
    }
}
