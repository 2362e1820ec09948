use clap::Parser;

/// `drone_client` - A simulated rescue drone.
///
/// Connects to a `dispatch_server`, announces itself with a handshake and
/// then flies one grid cell per tick toward whatever survivor it is sent to,
/// reporting its position and each arrival.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The TCP address of the dispatch server.
    #[arg(long, env = "DRONE_SERVER_ADDR", default_value = "127.0.0.1:7000")]
    pub server_addr: String,

    /// This drone's id. Must be unique among connected drones.
    #[arg(long, env = "DRONE_ID")]
    pub drone_id: u32,

    #[arg(long, env = "DRONE_START_X", default_value_t = 0)]
    pub start_x: i32,

    #[arg(long, env = "DRONE_START_Y", default_value_t = 0)]
    pub start_y: i32,

    /// Time per one-cell move.
    #[arg(long, env = "DRONE_TICK_MS", default_value_t = 500)]
    pub tick_ms: u64,

    /// Period of STATUS_UPDATE reports.
    #[arg(long, env = "DRONE_REPORT_INTERVAL_MS", default_value_t = 1000)]
    pub report_interval_ms: u64,

    /// Probability in `[0, 1]` that an arrival is reported as a failed mission.
    #[arg(long, env = "DRONE_FAILURE_RATE", default_value_t = 0.0)]
    pub failure_rate: f64,
}
