//! Core of the rescue dispatch service.
//!
//! Drones and survivor tasks live in two slab-backed registries
//! ([`FleetRegistry`], [`TaskRegistry`]) shared by a periodic scheduler, a
//! task generator, a disconnect reaper and one reader task per drone
//! connection. Locks are always taken in the order fleet → drone → tasks;
//! [`lock_order`] checks that at runtime.

pub mod collection;
pub mod config;
pub mod connection;
pub mod error;
pub mod fleet;
pub mod generator;
pub mod grid;
pub mod lock_order;
pub mod metrics;
pub mod protocol;
pub mod reaper;
pub mod scheduler;
pub mod system;
pub mod tasks;

pub use config::{DispatchConfig, Strategy};
pub use fleet::{DroneId, DroneStatus, FleetRegistry};
pub use grid::{Coord, Grid};
pub use metrics::{MetricsHook, NoopMetrics};
pub use system::{DispatchSystem, StartError};
pub use tasks::{TaskId, TaskRegistry, TaskStatus};
