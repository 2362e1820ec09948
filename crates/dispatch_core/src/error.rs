use crate::fleet::DroneId;
use thiserror::Error;

/// Failures raised while building or growing a [`SyncList`](crate::collection::SyncList).
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The slot arena could not be reserved. The system cannot start without it.
    #[error("failed to preallocate {capacity} slots")]
    Allocation { capacity: usize },
}

/// A record rejected because the collection is at capacity.
///
/// The rejected value is handed back so the caller can treat the failure as
/// backpressure instead of losing data.
#[derive(Debug, Error)]
#[error("collection is at capacity")]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Rejections from the fleet and task registries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("fleet registry is full")]
    FleetFull,
    #[error("task registry is full")]
    TasksFull,
    #[error("drone {0} is already connected")]
    DuplicateDrone(DroneId),
}

/// Outbound transmission failures on a drone link.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection to drone is closed")]
    Closed,
    #[error("outbound queue to drone is full")]
    Backpressure,
}

/// Protocol violations and transport failures on a single connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame exceeds {max} bytes")]
    FrameTooLong { max: usize },
    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("message for drone {got} on connection bound to drone {bound}")]
    DroneMismatch { bound: DroneId, got: DroneId },
    #[error("coordinate ({x}, {y}) is outside the operating grid")]
    OffGrid { x: i32, y: i32 },
    #[error("peer closed the connection before the handshake")]
    ClosedBeforeHandshake,
    #[error("handshake not received in time")]
    HandshakeTimeout,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
