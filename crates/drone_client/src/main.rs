mod config;
mod machine;

use crate::config::Config;
use crate::machine::DroneMachine;
use anyhow::{bail, Context};
use clap::Parser;
use dispatch_core::protocol::{
    decode, encode, unix_millis, DroneMessage, ServerMessage, MAX_FRAME_LEN,
};
use dispatch_core::Coord;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing_subscriber::{fmt, EnvFilter};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    tracing::info!(config = ?config, "Drone starting with configuration");
    if !(0.0..=1.0).contains(&config.failure_rate) {
        bail!("DRONE_FAILURE_RATE must be within [0, 1], got {}", config.failure_rate);
    }

    let mut drone = DroneMachine::new(config.drone_id, Coord::new(config.start_x, config.start_y));

    // --- 2. Connect and handshake ---
    let stream = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("Failed to connect to dispatch server at {}", config.server_addr))?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let mut sink = FramedWrite::new(write_half, LinesCodec::new());

    send(&mut sink, &drone.handshake()).await?;
    let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next())
        .await
        .context("Timed out waiting for HANDSHAKE_ACK")?
        .context("Server closed the connection during the handshake")??;
    match decode::<ServerMessage>(&ack)? {
        ServerMessage::HandshakeAck => tracing::info!(drone_id = drone.id, "Drone registered successfully"),
        other => bail!("Expected HANDSHAKE_ACK, got {}", other.kind()),
    }

    // --- 3. Main control loop ---
    let mut tick = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
    let mut report = tokio::time::interval(Duration::from_millis(config.report_interval_ms.max(1)));
    let mut rng = rand::thread_rng();

    tracing::info!("Starting main control loop...");
    loop {
        tokio::select! {
            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received.");
                break;
            },
            // Handle messages from the dispatch server
            frame = lines.next() => {
                let Some(line) = frame else {
                    tracing::warn!("Dispatch server closed the connection.");
                    break;
                };
                match decode::<ServerMessage>(&line.context("Failed to read from dispatch server")?)? {
                    ServerMessage::Heartbeat => {
                        send(&mut sink, &drone.heartbeat_response(unix_millis())).await?;
                    }
                    ServerMessage::AssignMission { mission_id, target, priority, expiry } => {
                        tracing::info!(mission_id, x = target.x, y = target.y, priority, expiry, "Received mission");
                        drone.assign(mission_id, target);
                    }
                    ServerMessage::HandshakeAck => {
                        tracing::warn!("Ignoring repeated HANDSHAKE_ACK");
                    }
                }
            },
            // Move one cell
            _ = tick.tick() => {
                if let Some(arrival) = drone.tick() {
                    let success = !rng.gen_bool(config.failure_rate);
                    tracing::info!(mission_id = arrival.mission_id, success, "Arrived at target");
                    send(&mut sink, &drone.mission_complete(arrival, success, unix_millis())).await?;
                }
            },
            // Periodic position report
            _ = report.tick() => {
                send(&mut sink, &drone.status_update(unix_millis())).await?;
            }
        }
    }

    tracing::info!(in_flight = ?drone.mission(), "Drone shutting down.");
    Ok(())
}

async fn send<W>(sink: &mut FramedWrite<W, LinesCodec>, msg: &DroneMessage) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.send(encode(msg)?)
        .await
        .with_context(|| format!("Failed to send {}", msg.kind()))
}
