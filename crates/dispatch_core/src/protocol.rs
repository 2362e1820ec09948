//! Wire protocol between the dispatch server and field drones.
//!
//! One JSON object per line, UTF-8, discriminated by a `type` field.
//! Timestamps are unix epoch milliseconds.

use crate::error::ProtocolError;
use crate::fleet::DroneId;
use crate::grid::Coord;
use crate::tasks::TaskId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodecError;

/// Default upper bound on a single inbound line.
pub const MAX_FRAME_LEN: usize = 4 * 1024;

/// Status a drone declares about itself. Informational only: the server's
/// own record decides whether a drone is dispatchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    #[serde(alias = "IDLE")]
    Idle,
    #[serde(alias = "BUSY", alias = "on_mission", alias = "ON_MISSION")]
    Busy,
    #[serde(alias = "CHARGING")]
    Charging,
    #[serde(other)]
    Unknown,
}

/// Drone → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DroneMessage {
    Handshake {
        drone_id: DroneId,
        status: ReportedStatus,
        coord: Coord,
    },
    HeartbeatResponse {
        drone_id: DroneId,
        timestamp: i64,
    },
    StatusUpdate {
        drone_id: DroneId,
        timestamp: i64,
        location: Coord,
        status: ReportedStatus,
        battery: u8,
    },
    MissionComplete {
        drone_id: DroneId,
        timestamp: i64,
        success: bool,
        target_location: Coord,
    },
}

impl DroneMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DroneMessage::Handshake { .. } => "HANDSHAKE",
            DroneMessage::HeartbeatResponse { .. } => "HEARTBEAT_RESPONSE",
            DroneMessage::StatusUpdate { .. } => "STATUS_UPDATE",
            DroneMessage::MissionComplete { .. } => "MISSION_COMPLETE",
        }
    }

    pub fn drone_id(&self) -> DroneId {
        match self {
            DroneMessage::Handshake { drone_id, .. }
            | DroneMessage::HeartbeatResponse { drone_id, .. }
            | DroneMessage::StatusUpdate { drone_id, .. }
            | DroneMessage::MissionComplete { drone_id, .. } => *drone_id,
        }
    }
}

/// Server → drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    HandshakeAck,
    Heartbeat,
    AssignMission {
        mission_id: TaskId,
        priority: u8,
        target: Coord,
        /// Advisory deadline; the server never enforces it.
        expiry: i64,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::HandshakeAck => "HANDSHAKE_ACK",
            ServerMessage::Heartbeat => "HEARTBEAT",
            ServerMessage::AssignMission { .. } => "ASSIGN_MISSION",
        }
    }
}

pub fn encode<M: Serialize>(msg: &M) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode<M: DeserializeOwned>(line: &str) -> Result<M, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Maps a framing error, naming the limit that was configured for the codec.
pub fn frame_error(err: LinesCodecError, max: usize) -> ProtocolError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLong { max },
        LinesCodecError::Io(e) => ProtocolError::Io(e),
    }
}

pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_handshake() {
        let line = r#"{"type":"HANDSHAKE","drone_id":7,"status":"idle","coord":{"x":3,"y":4}}"#;
        let msg: DroneMessage = decode(line).expect("decode");
        assert_eq!(
            msg,
            DroneMessage::Handshake {
                drone_id: 7,
                status: ReportedStatus::Idle,
                coord: Coord::new(3, 4),
            }
        );
        assert_eq!(msg.kind(), "HANDSHAKE");
    }

    #[test]
    fn unknown_status_is_tolerated() {
        let line = json!({
            "type": "STATUS_UPDATE",
            "drone_id": 2,
            "timestamp": 1_700_000_000_000i64,
            "location": {"x": 1, "y": 2},
            "status": "hovering",
            "battery": 80
        })
        .to_string();
        match decode::<DroneMessage>(&line).expect("decode") {
            DroneMessage::StatusUpdate { status, battery, .. } => {
                assert_eq!(status, ReportedStatus::Unknown);
                assert_eq!(battery, 80);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_messages_carry_type_tag() {
        let ack = encode(&ServerMessage::HandshakeAck).expect("encode");
        assert_eq!(ack, r#"{"type":"HANDSHAKE_ACK"}"#);

        let assign = encode(&ServerMessage::AssignMission {
            mission_id: 11,
            priority: 1,
            target: Coord::new(3, 4),
            expiry: 99,
        })
        .expect("encode");
        let value: serde_json::Value = serde_json::from_str(&assign).expect("json");
        assert_eq!(value["type"], "ASSIGN_MISSION");
        assert_eq!(value["target"], json!({"x": 3, "y": 4}));
    }

    #[test]
    fn rejects_missing_fields_and_unknown_types() {
        assert!(decode::<DroneMessage>(r#"{"type":"HANDSHAKE","drone_id":1}"#).is_err());
        assert!(decode::<DroneMessage>(r#"{"type":"SELF_DESTRUCT"}"#).is_err());
        assert!(decode::<DroneMessage>("not json").is_err());
    }
}
