use crate::grid::Grid;
use crate::protocol::MAX_FRAME_LEN;
use std::time::Duration;

/// How the scheduler pairs drones with tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Each waiting task, oldest first, takes the nearest idle drone. Arrival
    /// is detected by polling drone positions.
    #[default]
    TaskCentric,
    /// Each idle drone takes the nearest waiting task. Arrival is reported by
    /// the drone itself.
    AgentCentric,
}

/// Fields stamped onto every ASSIGN_MISSION.
#[derive(Debug, Clone, Copy)]
pub struct MissionParams {
    pub priority: u8,
    /// Added to the dispatch time to produce the advisory `expiry`.
    pub expiry: Duration,
}

impl Default for MissionParams {
    fn default() -> Self {
        Self {
            priority: 1,
            expiry: Duration::from_secs(300),
        }
    }
}

/// Per-connection timing and framing.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// No inbound message for this long moves the connection to TIMED_OUT.
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
    pub outbound_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(10),
            max_frame_len: MAX_FRAME_LEN,
            outbound_queue: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Grace period a DISCONNECTED drone is kept before eviction.
    pub eviction_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            eviction_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// When false no generator loop is started; tasks come only from callers.
    pub enabled: bool,
    /// Mean of the exponential inter-arrival time.
    pub mean_interval: Duration,
    /// Upper bound on completed tasks recycled per generator tick.
    pub recycle_batch: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mean_interval: Duration::from_secs(2),
            recycle_batch: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub grid: Grid,
    pub fleet_capacity: usize,
    pub task_capacity: usize,
    pub strategy: Strategy,
    pub dispatch_interval: Duration,
    pub mission: MissionParams,
    pub link: LinkConfig,
    pub reaper: ReaperConfig,
    pub generator: GeneratorConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            grid: Grid::new(40, 40),
            fleet_capacity: 64,
            task_capacity: 128,
            strategy: Strategy::default(),
            dispatch_interval: Duration::from_secs(1),
            mission: MissionParams::default(),
            link: LinkConfig::default(),
            reaper: ReaperConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}
