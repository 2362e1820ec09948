//! End-to-end runs against a dispatch system listening on loopback TCP.

use dispatch_core::config::{GeneratorConfig, LinkConfig, ReaperConfig};
use dispatch_core::protocol::ServerMessage;
use dispatch_core::{
    Coord, DispatchConfig, DispatchSystem, DroneStatus, NoopMetrics, TaskId, TaskStatus,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};

const STEP: Duration = Duration::from_secs(5);

struct Drone {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Drone {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("write");
    }

    async fn recv_raw(&mut self) -> Option<ServerMessage> {
        let line = timeout(STEP, self.lines.next_line())
            .await
            .expect("server answered in time")
            .ok()??;
        Some(serde_json::from_str(&line).expect("server message"))
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.recv_raw().await? {
                ServerMessage::Heartbeat => continue,
                other => return Some(other),
            }
        }
    }

    async fn handshake(&mut self, drone_id: u32, at: Coord) {
        self.send(json!({
            "type": "HANDSHAKE",
            "drone_id": drone_id,
            "status": "idle",
            "coord": {"x": at.x, "y": at.y}
        }))
        .await;
        assert_eq!(self.recv().await, Some(ServerMessage::HandshakeAck));
    }

    async fn expect_mission(&mut self) -> (TaskId, Coord) {
        match self.recv().await {
            Some(ServerMessage::AssignMission {
                mission_id, target, ..
            }) => (mission_id, target),
            other => panic!("expected ASSIGN_MISSION, got {other:?}"),
        }
    }

    async fn complete(&mut self, drone_id: u32, target: Coord, success: bool) {
        self.send(json!({
            "type": "MISSION_COMPLETE",
            "drone_id": drone_id,
            "timestamp": 0,
            "success": success,
            "target_location": {"x": target.x, "y": target.y}
        }))
        .await;
    }
}

async fn start(reaper: ReaperConfig) -> DispatchSystem {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let config = DispatchConfig {
        dispatch_interval: Duration::from_millis(20),
        generator: GeneratorConfig {
            enabled: false,
            ..GeneratorConfig::default()
        },
        link: LinkConfig {
            heartbeat_interval: Duration::from_millis(200),
            ..LinkConfig::default()
        },
        reaper,
        ..DispatchConfig::default()
    };
    DispatchSystem::start(config, listener, Arc::new(NoopMetrics)).expect("start")
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + STEP;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn drone_receives_mission_and_completes_it_once() {
    let system = start(ReaperConfig::default()).await;
    let mut drone = Drone::connect(system.local_addr()).await;
    drone.handshake(7, Coord::new(1, 1)).await;

    let task = system
        .tasks()
        .enqueue(Coord::new(4, 5), "Survivor-1", Instant::now())
        .expect("task");
    let (mission_id, target) = drone.expect_mission().await;
    assert_eq!(mission_id, task);
    assert_eq!(target, Coord::new(4, 5));
    assert_eq!(system.fleet().status_of(7), Some(DroneStatus::Assigned));

    drone.complete(7, target, true).await;
    drone.complete(7, target, true).await;

    let tasks = Arc::clone(system.tasks());
    wait_for("completion", || {
        tasks.get(task).map(|t| t.status) == Some(TaskStatus::Completed)
    })
    .await;
    let fleet = Arc::clone(system.fleet());
    wait_for("idle drone", || fleet.status_of(7) == Some(DroneStatus::Idle)).await;
    assert_eq!(system.tasks().stats().completed, 1);

    system.shutdown().await;
    assert_eq!(drone.recv().await, None, "shutdown closes the connection");
}

#[tokio::test]
async fn task_of_lost_drone_goes_to_another_drone() {
    let system = start(ReaperConfig {
        interval: Duration::from_millis(50),
        eviction_timeout: Duration::from_millis(300),
    })
    .await;

    let mut first = Drone::connect(system.local_addr()).await;
    first.handshake(1, Coord::new(0, 0)).await;
    let task = system
        .tasks()
        .enqueue(Coord::new(9, 9), "Survivor-1", Instant::now())
        .expect("task");
    let (mission_id, _) = first.expect_mission().await;
    assert_eq!(mission_id, task);
    drop(first);

    let fleet = Arc::clone(system.fleet());
    wait_for("disconnect", || {
        fleet.status_of(1) == Some(DroneStatus::Disconnected)
    })
    .await;
    wait_for("eviction", || fleet.get(1).is_none()).await;
    assert_eq!(
        system.tasks().get(task).map(|t| t.status),
        Some(TaskStatus::Waiting),
        "eviction puts the task back in the queue"
    );

    let mut second = Drone::connect(system.local_addr()).await;
    second.handshake(2, Coord::new(5, 5)).await;
    let (reassigned, target) = second.expect_mission().await;
    assert_eq!(reassigned, task);
    assert_eq!(target, Coord::new(9, 9));

    system.shutdown().await;
}

#[tokio::test]
async fn reconnect_inside_grace_period_keeps_mission() {
    let system = start(ReaperConfig {
        interval: Duration::from_millis(50),
        eviction_timeout: Duration::from_secs(30),
    })
    .await;

    let mut first = Drone::connect(system.local_addr()).await;
    first.handshake(3, Coord::new(2, 2)).await;
    let task = system
        .tasks()
        .enqueue(Coord::new(3, 3), "Survivor-1", Instant::now())
        .expect("task");
    first.expect_mission().await;
    drop(first);

    let fleet = Arc::clone(system.fleet());
    wait_for("disconnect", || {
        fleet.status_of(3) == Some(DroneStatus::Disconnected)
    })
    .await;

    let mut again = Drone::connect(system.local_addr()).await;
    again.handshake(3, Coord::new(2, 2)).await;
    let (mission_id, target) = again.expect_mission().await;
    assert_eq!(mission_id, task);

    again.complete(3, target, true).await;
    let tasks = Arc::clone(system.tasks());
    wait_for("completion", || {
        tasks.get(task).map(|t| t.status) == Some(TaskStatus::Completed)
    })
    .await;

    system.shutdown().await;
}

#[tokio::test]
async fn garbage_handshake_is_dropped_without_state() {
    let system = start(ReaperConfig::default()).await;
    let mut drone = Drone::connect(system.local_addr()).await;
    drone.writer.write_all(b"hello there\n").await.expect("write");

    assert_eq!(drone.recv().await, None);
    assert!(system.fleet().is_empty());

    system.shutdown().await;
}
