use clap::{Parser, ValueEnum};
use dispatch_core::config::{
    DispatchConfig, GeneratorConfig, LinkConfig, MissionParams, ReaperConfig, Strategy,
};
use dispatch_core::Grid;
use std::net::SocketAddr;
use std::time::Duration;

/// `dispatch_server` - Rescue drone dispatch service.
///
/// Accepts drone connections over line-delimited JSON, generates survivor
/// tasks and pairs idle drones with waiting survivors by Manhattan distance.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// TCP address drones connect to.
    #[arg(long, env = "DISPATCH_LISTEN_ADDR", default_value = "0.0.0.0:7000")]
    pub listen_addr: SocketAddr,

    /// Address of the Prometheus `/metrics` and `/snapshot` HTTP server.
    #[arg(long, env = "DISPATCH_METRICS_LISTEN_ADDR", default_value = "0.0.0.0:9091")]
    pub metrics_listen_addr: SocketAddr,

    /// How waiting tasks and idle drones are paired.
    #[arg(long, env = "DISPATCH_STRATEGY", value_enum, default_value_t = StrategyArg::TaskCentric)]
    pub strategy: StrategyArg,

    #[arg(long, env = "DISPATCH_GRID_WIDTH", default_value_t = 40)]
    pub grid_width: i32,

    #[arg(long, env = "DISPATCH_GRID_HEIGHT", default_value_t = 40)]
    pub grid_height: i32,

    #[arg(long, env = "DISPATCH_FLEET_CAPACITY", default_value_t = 64)]
    pub fleet_capacity: usize,

    #[arg(long, env = "DISPATCH_TASK_CAPACITY", default_value_t = 128)]
    pub task_capacity: usize,

    #[arg(long, env = "DISPATCH_INTERVAL_MS", default_value_t = 1000)]
    pub dispatch_interval_ms: u64,

    /// Mean time between survivor discoveries. Zero disables the generator.
    #[arg(long, env = "DISPATCH_TASK_MEAN_INTERVAL_MS", default_value_t = 2000)]
    pub task_mean_interval_ms: u64,

    /// Completed tasks recycled per generator tick once the registry is full.
    #[arg(long, env = "DISPATCH_RECYCLE_BATCH", default_value_t = 3)]
    pub recycle_batch: usize,

    #[arg(long, env = "DISPATCH_HANDSHAKE_TIMEOUT_MS", default_value_t = 5000)]
    pub handshake_timeout_ms: u64,

    #[arg(long, env = "DISPATCH_HEARTBEAT_INTERVAL_MS", default_value_t = 2000)]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a connection is considered timed out.
    #[arg(long, env = "DISPATCH_IDLE_TIMEOUT_MS", default_value_t = 10_000)]
    pub idle_timeout_ms: u64,

    /// Grace period a disconnected drone is kept before eviction.
    #[arg(long, env = "DISPATCH_EVICTION_TIMEOUT_MS", default_value_t = 15_000)]
    pub eviction_timeout_ms: u64,

    #[arg(long, env = "DISPATCH_REAPER_INTERVAL_MS", default_value_t = 10_000)]
    pub reaper_interval_ms: u64,

    #[arg(long, env = "DISPATCH_MAX_FRAME_LEN", default_value_t = dispatch_core::protocol::MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    #[arg(long, env = "DISPATCH_MISSION_PRIORITY", default_value_t = 1)]
    pub mission_priority: u8,

    /// Advisory mission expiry stamped on ASSIGN_MISSION.
    #[arg(long, env = "DISPATCH_MISSION_EXPIRY_SECS", default_value_t = 300)]
    pub mission_expiry_secs: u64,

    /// In-process simulated drones to register at startup (demo mode).
    #[arg(long, env = "DISPATCH_LOCAL_DRONES", default_value_t = 0)]
    pub local_drones: u32,

    /// First id given to in-process drones; keep it clear of field drone ids.
    #[arg(long, env = "DISPATCH_LOCAL_DRONE_ID_BASE", default_value_t = 1000)]
    pub local_drone_id_base: u32,

    /// Period of the fleet/task status log line.
    #[arg(long, env = "DISPATCH_STATUS_INTERVAL_MS", default_value_t = 5000)]
    pub status_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    TaskCentric,
    AgentCentric,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::TaskCentric => Strategy::TaskCentric,
            StrategyArg::AgentCentric => Strategy::AgentCentric,
        }
    }
}

impl Config {
    pub fn grid(&self) -> Grid {
        Grid::new(self.grid_width, self.grid_height)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            grid: self.grid(),
            fleet_capacity: self.fleet_capacity,
            task_capacity: self.task_capacity,
            strategy: self.strategy.into(),
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms.max(1)),
            mission: MissionParams {
                priority: self.mission_priority,
                expiry: Duration::from_secs(self.mission_expiry_secs),
            },
            link: LinkConfig {
                handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
                heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
                idle_timeout: Duration::from_millis(self.idle_timeout_ms),
                max_frame_len: self.max_frame_len,
                ..LinkConfig::default()
            },
            reaper: ReaperConfig {
                interval: Duration::from_millis(self.reaper_interval_ms.max(1)),
                eviction_timeout: Duration::from_millis(self.eviction_timeout_ms),
            },
            generator: GeneratorConfig {
                enabled: self.task_mean_interval_ms > 0,
                mean_interval: Duration::from_millis(self.task_mean_interval_ms),
                recycle_batch: self.recycle_batch,
            },
        }
    }
}
