//! Connection manager: one sequential reader per drone connection.
//!
//! Each accepted socket moves through `CONNECTING → HANDSHAKING → ACTIVE`
//! and ends in `DISCONNECTED` or `TIMED_OUT`. Either terminal phase leaves
//! the drone record in the fleet as DISCONNECTED; the [`Reaper`] removes it
//! once the grace period runs out.
//!
//! Outbound messages go through the drone's [`DroneLink`], a bounded queue
//! drained by the same task that reads the socket, so the scheduler can
//! queue an ASSIGN_MISSION without awaiting while it holds record locks.
//!
//! [`Reaper`]: crate::reaper::Reaper

use crate::config::{LinkConfig, MissionParams};
use crate::error::ProtocolError;
use crate::fleet::{Attached, Drone, DroneId, DroneLink, FleetRegistry};
use crate::grid::{Coord, Grid};
use crate::metrics::MetricsHook;
use crate::protocol::{decode, encode, frame_error, unix_millis, DroneMessage, ServerMessage};
use crate::scheduler::{finish_mission, MissionOutcome};
use crate::tasks::TaskRegistry;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Handshaking,
    Active,
    Disconnected,
    TimedOut,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Connecting => "CONNECTING",
            ConnectionPhase::Handshaking => "HANDSHAKING",
            ConnectionPhase::Active => "ACTIVE",
            ConnectionPhase::Disconnected => "DISCONNECTED",
            ConnectionPhase::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ConnectionManager {
    fleet: Arc<FleetRegistry>,
    tasks: Arc<TaskRegistry>,
    grid: Grid,
    config: LinkConfig,
    mission: MissionParams,
    metrics: Arc<dyn MetricsHook>,
}

impl ConnectionManager {
    pub fn new(
        fleet: Arc<FleetRegistry>,
        tasks: Arc<TaskRegistry>,
        grid: Grid,
        config: LinkConfig,
        mission: MissionParams,
        metrics: Arc<dyn MetricsHook>,
    ) -> Self {
        Self {
            fleet,
            tasks,
            grid,
            config,
            mission,
            metrics,
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown_rx: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.serve(listener, shutdown_rx))
    }

    /// Accepts drone connections until shutdown, then waits for every
    /// connection handler to close its socket.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Connection manager listening.");
        }
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let manager = Arc::clone(&self);
                        let rx = shutdown_rx.clone();
                        conns.spawn(async move { manager.handle(stream, peer.to_string(), rx).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
                Some(res) = conns.join_next(), if !conns.is_empty() => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "Connection handler failed.");
                    }
                }
            }
        }

        tracing::info!(open = conns.len(), "Connection manager closing connections...");
        while let Some(res) = conns.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "Connection handler failed.");
            }
        }
        tracing::info!("Connection manager stopped.");
    }

    /// Runs one connection to completion and returns its terminal phase.
    pub async fn handle<S>(&self, stream: S, peer: String, mut shutdown_rx: watch::Receiver<()>) -> ConnectionPhase
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = Uuid::new_v4();
        let mut phase = ConnectionPhase::Connecting;
        self.metrics.connection_opened();
        tracing::debug!(peer = %peer, conn_id = %conn_id, phase = %phase, "Connection accepted");

        let (read_half, write_half) = tokio::io::split(stream);
        let mut lines = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(self.config.max_frame_len),
        );
        let mut sink = FramedWrite::new(write_half, LinesCodec::new());

        phase = ConnectionPhase::Handshaking;
        let hello = match timeout(self.config.handshake_timeout, self.read_handshake(&mut lines)).await {
            Ok(res) => res,
            Err(_) => Err(ProtocolError::HandshakeTimeout),
        };
        let attached = hello.and_then(|(drone_id, coord)| self.attach(conn_id, drone_id, coord));
        let (drone, mut outbound) = match attached {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(peer = %peer, phase = %phase, error = %e, "Handshake rejected; closing connection");
                self.metrics.connection_closed("REJECTED");
                return ConnectionPhase::Disconnected;
            }
        };

        phase = ConnectionPhase::Active;
        let drone_id = drone.id();
        tracing::info!(drone_id, peer = %peer, conn_id = %conn_id, "Drone connected.");

        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_read = Instant::now();

        while phase == ConnectionPhase::Active {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    tracing::debug!(drone_id, "Server shutting down; closing connection");
                    phase = ConnectionPhase::Disconnected;
                }
                frame = lines.next() => match frame {
                    None => {
                        tracing::info!(drone_id, "Drone closed the connection.");
                        phase = ConnectionPhase::Disconnected;
                    }
                    Some(Err(e)) => {
                        let e = frame_error(e, self.config.max_frame_len);
                        tracing::warn!(drone_id, error = %e, "Read failed; closing connection");
                        phase = ConnectionPhase::Disconnected;
                    }
                    Some(Ok(line)) => {
                        last_read = Instant::now();
                        if let Err(e) = self.on_message(&drone, &line, last_read) {
                            tracing::warn!(drone_id, error = %e, "Protocol violation; closing connection");
                            phase = ConnectionPhase::Disconnected;
                        }
                    }
                },
                Some(msg) = outbound.recv() => {
                    if let Err(e) = self.write(&mut sink, &msg).await {
                        tracing::warn!(drone_id, error = %e, "Write failed; closing connection");
                        phase = ConnectionPhase::Disconnected;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.write(&mut sink, &ServerMessage::Heartbeat).await {
                        tracing::warn!(drone_id, error = %e, "Heartbeat failed; closing connection");
                        phase = ConnectionPhase::Disconnected;
                    }
                }
                _ = sleep_until(last_read + self.config.idle_timeout) => {
                    tracing::warn!(
                        drone_id,
                        idle_ms = self.config.idle_timeout.as_millis() as u64,
                        "No traffic from drone; connection timed out"
                    );
                    phase = ConnectionPhase::TimedOut;
                }
            }
        }

        if self.detach(&drone, conn_id) {
            tracing::info!(drone_id, phase = %phase, "Drone marked disconnected.");
        }
        self.metrics.connection_closed(phase.as_str());
        phase
    }

    async fn read_handshake<R>(
        &self,
        lines: &mut FramedRead<R, LinesCodec>,
    ) -> Result<(DroneId, Coord), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let line = lines
            .next()
            .await
            .ok_or(ProtocolError::ClosedBeforeHandshake)?
            .map_err(|e| frame_error(e, self.config.max_frame_len))?;
        let msg: DroneMessage = decode(&line)?;
        self.metrics.message_received(msg.kind(), line.len() + 1);
        match msg {
            DroneMessage::Handshake {
                drone_id,
                status,
                coord,
            } => {
                tracing::debug!(drone_id, ?status, x = coord.x, y = coord.y, "Handshake received");
                self.check_on_grid(coord)?;
                Ok((drone_id, coord))
            }
            other => Err(ProtocolError::Unexpected {
                expected: "HANDSHAKE",
                got: other.kind(),
            }),
        }
    }

    /// Binds the connection to its drone record. The ack, and on a resume
    /// the in-flight mission, are queued before the scheduler can see the link.
    fn attach(
        &self,
        conn_id: Uuid,
        drone_id: DroneId,
        coord: Coord,
    ) -> Result<(Arc<Drone>, mpsc::Receiver<ServerMessage>), ProtocolError> {
        // Room for the ack and a resent mission.
        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(2));
        let link = DroneLink::new(conn_id, tx);
        link.send(ServerMessage::HandshakeAck)
            .map_err(|_| ProtocolError::ClosedBeforeHandshake)?;

        let attached = self
            .fleet
            .attach(drone_id, coord, link.clone(), Instant::now())?;
        if let Attached::Resumed {
            mission: Some((mission_id, target)),
            ..
        } = attached
        {
            let resend = ServerMessage::AssignMission {
                mission_id,
                priority: self.mission.priority,
                target,
                expiry: unix_millis() + self.mission.expiry.as_millis() as i64,
            };
            match link.send(resend) {
                Ok(()) => tracing::info!(drone_id, task_id = mission_id, "Resending in-flight mission"),
                Err(e) => tracing::warn!(drone_id, task_id = mission_id, error = %e, "Failed to resend mission"),
            }
        }
        Ok((Arc::clone(attached.drone()), rx))
    }

    fn check_on_grid(&self, coord: Coord) -> Result<(), ProtocolError> {
        if self.grid.contains(coord) {
            Ok(())
        } else {
            Err(ProtocolError::OffGrid {
                x: coord.x,
                y: coord.y,
            })
        }
    }

    fn detach(&self, drone: &Drone, conn_id: Uuid) -> bool {
        let mut state = drone.lock();
        state.mark_disconnected(conn_id, Instant::now())
    }

    /// Applies one inbound message to the drone's record.
    fn on_message(&self, drone: &Drone, line: &str, now: Instant) -> Result<(), ProtocolError> {
        let msg: DroneMessage = decode(line)?;
        self.metrics.message_received(msg.kind(), line.len() + 1);
        if msg.drone_id() != drone.id() {
            return Err(ProtocolError::DroneMismatch {
                bound: drone.id(),
                got: msg.drone_id(),
            });
        }

        let mut state = drone.lock();
        state.touch(now);
        match msg {
            DroneMessage::Handshake { .. } => {
                return Err(ProtocolError::Unexpected {
                    expected: "STATUS_UPDATE, HEARTBEAT_RESPONSE or MISSION_COMPLETE",
                    got: "HANDSHAKE",
                });
            }
            DroneMessage::HeartbeatResponse { .. } => {}
            DroneMessage::StatusUpdate {
                location,
                battery,
                status,
                ..
            } => {
                self.check_on_grid(location)?;
                state.report_position(location);
                state.battery = Some(battery);
                tracing::trace!(drone_id = drone.id(), x = location.x, y = location.y, battery, ?status, "Status update");
            }
            DroneMessage::MissionComplete {
                success,
                target_location,
                ..
            } => {
                if state.mission.is_none() {
                    tracing::debug!(drone_id = drone.id(), "Completion for an idle drone ignored");
                    return Ok(());
                }
                if target_location != state.target {
                    tracing::debug!(
                        drone_id = drone.id(),
                        reported = ?target_location,
                        expected = ?state.target,
                        "Ignoring completion for a stale target"
                    );
                    return Ok(());
                }
                if success {
                    state.report_position(target_location);
                }
                match finish_mission(&mut state, &self.tasks, success, now) {
                    MissionOutcome::Completed { task, response_time } => {
                        self.metrics.mission_completed(response_time);
                        tracing::info!(
                            drone_id = drone.id(),
                            task_id = task,
                            response_ms = response_time.as_millis() as u64,
                            "Mission completed"
                        );
                    }
                    MissionOutcome::Released { task } => {
                        self.metrics.mission_failed();
                        tracing::warn!(drone_id = drone.id(), task_id = task, "Mission failed; task requeued");
                    }
                    MissionOutcome::Stale { task } => {
                        tracing::debug!(drone_id = drone.id(), task_id = task, "Completion for a task no longer assigned");
                    }
                    MissionOutcome::NoMission => {
                        tracing::debug!(drone_id = drone.id(), "Duplicate completion ignored");
                    }
                }
            }
        }
        Ok(())
    }

    async fn write<W>(
        &self,
        sink: &mut FramedWrite<W, LinesCodec>,
        msg: &ServerMessage,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let line = encode(msg)?;
        let bytes = line.len() + 1;
        sink.send(line)
            .await
            .map_err(|e| frame_error(e, self.config.max_frame_len))?;
        self.metrics.message_sent(msg.kind(), bytes);
        Ok(())
    }
}
