use dispatch_core::fleet::DroneId;
use dispatch_core::protocol::{DroneMessage, ReportedStatus};
use dispatch_core::{Coord, TaskId};

/// Moves per percent of battery used.
const MOVES_PER_BATTERY_PERCENT: u32 = 10;

/// A mission the drone just finished flying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub mission_id: TaskId,
    pub target: Coord,
}

/// Flight state of one simulated drone.
#[derive(Debug)]
pub struct DroneMachine {
    pub id: DroneId,
    pub position: Coord,
    mission: Option<(TaskId, Coord)>,
    moves: u32,
}

impl DroneMachine {
    pub fn new(id: DroneId, position: Coord) -> Self {
        Self {
            id,
            position,
            mission: None,
            moves: 0,
        }
    }

    /// Takes a new mission, replacing any current one.
    pub fn assign(&mut self, mission_id: TaskId, target: Coord) {
        if let Some((previous, _)) = self.mission.replace((mission_id, target)) {
            if previous != mission_id {
                tracing::warn!(previous, mission_id, "Mission replaced before arrival");
            }
        }
    }

    pub fn mission(&self) -> Option<(TaskId, Coord)> {
        self.mission
    }

    pub fn battery(&self) -> u8 {
        100u32.saturating_sub(self.moves / MOVES_PER_BATTERY_PERCENT) as u8
    }

    pub fn status(&self) -> ReportedStatus {
        if self.mission.is_some() {
            ReportedStatus::Busy
        } else {
            ReportedStatus::Idle
        }
    }

    /// Advances one cell toward the target. Returns the mission on arrival.
    pub fn tick(&mut self) -> Option<Arrival> {
        let (mission_id, target) = self.mission?;
        if self.position != target {
            self.position = self.position.step_toward(target);
            self.moves += 1;
        }
        if self.position == target {
            self.mission = None;
            return Some(Arrival { mission_id, target });
        }
        None
    }

    pub fn handshake(&self) -> DroneMessage {
        DroneMessage::Handshake {
            drone_id: self.id,
            status: self.status(),
            coord: self.position,
        }
    }

    pub fn heartbeat_response(&self, timestamp: i64) -> DroneMessage {
        DroneMessage::HeartbeatResponse {
            drone_id: self.id,
            timestamp,
        }
    }

    pub fn status_update(&self, timestamp: i64) -> DroneMessage {
        DroneMessage::StatusUpdate {
            drone_id: self.id,
            timestamp,
            location: self.position,
            status: self.status(),
            battery: self.battery(),
        }
    }

    pub fn mission_complete(&self, arrival: Arrival, success: bool, timestamp: i64) -> DroneMessage {
        DroneMessage::MissionComplete {
            drone_id: self.id,
            timestamp,
            success,
            target_location: arrival.target,
        }
    }
}
