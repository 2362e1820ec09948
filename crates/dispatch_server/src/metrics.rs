use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use dispatch_core::fleet::DroneSnapshot;
use dispatch_core::tasks::{TaskSnapshot, TaskStats};
use dispatch_core::{FleetRegistry, MetricsHook, TaskRegistry};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Prometheus collectors for the dispatch service.
///
/// Shared behind an `Arc` and handed to the core as its [`MetricsHook`].
pub struct Metrics {
    pub registry: Registry,
    /// Inbound messages by `type`.
    pub messages_received_total: IntCounterVec,
    /// Outbound messages by `type`.
    pub messages_sent_total: IntCounterVec,
    pub bytes_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub connections_opened_total: IntCounter,
    /// Closed connections by terminal phase.
    pub connections_closed_total: IntCounterVec,
    pub assignments_total: IntCounter,
    pub assignment_rollbacks_total: IntCounter,
    pub missions_completed_total: IntCounter,
    pub missions_failed_total: IntCounter,
    pub drones_evicted_total: IntCounter,
    pub tasks_generated_total: IntCounter,
    pub tasks_recycled_total: IntCounter,
    pub drones_connected: IntGauge,
    pub tasks_waiting: IntGauge,
    /// Discovery to completion, in seconds.
    pub response_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("rescue_dispatch".into()), None)?;

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric?;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            messages_received_total: reg!(IntCounterVec::new(
                Opts::new("messages_received_total", "Messages received from drones"),
                &["type"]
            )),
            messages_sent_total: reg!(IntCounterVec::new(
                Opts::new("messages_sent_total", "Messages sent to drones"),
                &["type"]
            )),
            bytes_received_total: reg!(IntCounter::new(
                "bytes_received_total",
                "Bytes read from drone connections"
            )),
            bytes_sent_total: reg!(IntCounter::new(
                "bytes_sent_total",
                "Bytes written to drone connections"
            )),
            connections_opened_total: reg!(IntCounter::new(
                "connections_opened_total",
                "Drone connections accepted"
            )),
            connections_closed_total: reg!(IntCounterVec::new(
                Opts::new("connections_closed_total", "Drone connections closed"),
                &["reason"]
            )),
            assignments_total: reg!(IntCounter::new(
                "assignments_total",
                "Missions committed to a drone"
            )),
            assignment_rollbacks_total: reg!(IntCounter::new(
                "assignment_rollbacks_total",
                "Assignments undone because the mission could not be transmitted"
            )),
            missions_completed_total: reg!(IntCounter::new(
                "missions_completed_total",
                "Tasks completed"
            )),
            missions_failed_total: reg!(IntCounter::new(
                "missions_failed_total",
                "Missions reported as failed and requeued"
            )),
            drones_evicted_total: reg!(IntCounter::new(
                "drones_evicted_total",
                "Disconnected drones removed after the grace period"
            )),
            tasks_generated_total: reg!(IntCounter::new(
                "tasks_generated_total",
                "Survivor tasks discovered"
            )),
            tasks_recycled_total: reg!(IntCounter::new(
                "tasks_recycled_total",
                "Completed tasks recycled as new arrivals"
            )),
            drones_connected: reg!(IntGauge::new(
                "drones_connected",
                "Drones with a live connection"
            )),
            tasks_waiting: reg!(IntGauge::new("tasks_waiting", "Tasks awaiting a drone")),
            response_seconds: reg!(Histogram::with_opts(
                HistogramOpts::new(
                    "response_seconds",
                    "Time from survivor discovery to mission completion"
                )
                .buckets(vec![1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0])
            )),
            registry,
        })
    }

    /// Serves `/metrics` for Prometheus and `/snapshot` for dashboards.
    pub fn router(&self, fleet: Arc<FleetRegistry>, tasks: Arc<TaskRegistry>) -> Router {
        let registry = self.registry.clone();
        Router::new()
            .route(
                "/metrics",
                get(move || {
                    let registry = registry.clone();
                    async move {
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        match TextEncoder::new().encode(&metric_families, &mut buffer) {
                            Ok(()) => String::from_utf8_lossy(&buffer).into_owned().into_response(),
                            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                        }
                    }
                }),
            )
            .route(
                "/snapshot",
                get(move || {
                    let snapshot = Snapshot::capture(&fleet, &tasks);
                    async move { Json(snapshot) }
                }),
            )
    }

    /// Refreshes the gauges from the registries.
    pub fn update_gauges(&self, connected: usize, stats: &TaskStats) {
        self.drones_connected.set(connected as i64);
        self.tasks_waiting.set(stats.waiting as i64);
    }
}

impl MetricsHook for Metrics {
    fn message_received(&self, kind: &'static str, bytes: usize) {
        self.messages_received_total.with_label_values(&[kind]).inc();
        self.bytes_received_total.inc_by(bytes as u64);
    }

    fn message_sent(&self, kind: &'static str, bytes: usize) {
        self.messages_sent_total.with_label_values(&[kind]).inc();
        self.bytes_sent_total.inc_by(bytes as u64);
    }

    fn connection_opened(&self) {
        self.connections_opened_total.inc();
    }

    fn connection_closed(&self, reason: &'static str) {
        self.connections_closed_total.with_label_values(&[reason]).inc();
    }

    fn assignment_committed(&self) {
        self.assignments_total.inc();
    }

    fn assignment_rolled_back(&self) {
        self.assignment_rollbacks_total.inc();
    }

    fn mission_completed(&self, response_time: Duration) {
        self.missions_completed_total.inc();
        self.response_seconds.observe(response_time.as_secs_f64());
    }

    fn mission_failed(&self) {
        self.missions_failed_total.inc();
    }

    fn drone_evicted(&self) {
        self.drones_evicted_total.inc();
    }

    fn task_generated(&self) {
        self.tasks_generated_total.inc();
    }

    fn tasks_recycled(&self, count: usize) {
        self.tasks_recycled_total.inc_by(count as u64);
    }
}

/// Read-only view of both registries.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub drones: Vec<DroneSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
    pub stats: TaskStats,
}

impl Snapshot {
    pub fn capture(fleet: &FleetRegistry, tasks: &TaskRegistry) -> Self {
        Self {
            drones: fleet.snapshot(),
            tasks: tasks.snapshot(Instant::now()),
            stats: tasks.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::Coord;

    #[test]
    fn hooks_feed_the_registry() {
        let metrics = Metrics::new().expect("registry");
        metrics.message_received("HANDSHAKE", 64);
        metrics.message_sent("HANDSHAKE_ACK", 25);
        metrics.connection_closed("TIMED_OUT");
        metrics.mission_completed(Duration::from_secs(3));
        metrics.tasks_recycled(2);

        assert_eq!(
            metrics
                .messages_received_total
                .with_label_values(&["HANDSHAKE"])
                .get(),
            1
        );
        assert_eq!(metrics.bytes_received_total.get(), 64);
        assert_eq!(metrics.bytes_sent_total.get(), 25);
        assert_eq!(
            metrics
                .connections_closed_total
                .with_label_values(&["TIMED_OUT"])
                .get(),
            1
        );
        assert_eq!(metrics.response_seconds.get_sample_count(), 1);
        assert_eq!(metrics.tasks_recycled_total.get(), 2);

        let names: Vec<_> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"rescue_dispatch_missions_completed_total".to_string()));
    }

    #[test]
    fn snapshot_reports_both_registries() {
        let fleet = FleetRegistry::with_capacity(2).expect("fleet");
        let tasks = TaskRegistry::with_capacity(2).expect("tasks");
        fleet.register_local(1, Coord::new(0, 0)).expect("drone");
        tasks.enqueue(Coord::new(1, 1), "Survivor-1", Instant::now()).expect("task");

        let snapshot = Snapshot::capture(&fleet, &tasks);
        assert_eq!(snapshot.drones.len(), 1);
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.stats.waiting, 1);
    }
}
