use std::time::Duration;

/// Recording hooks the dispatch core calls as it works.
///
/// Every method is fire-and-forget with an empty default, so an exporter only
/// overrides what it cares about and a missing exporter changes nothing.
pub trait MetricsHook: Send + Sync {
    fn message_received(&self, _kind: &'static str, _bytes: usize) {}
    fn message_sent(&self, _kind: &'static str, _bytes: usize) {}
    fn connection_opened(&self) {}
    fn connection_closed(&self, _reason: &'static str) {}
    fn assignment_committed(&self) {}
    fn assignment_rolled_back(&self) {}
    fn mission_completed(&self, _response_time: Duration) {}
    fn mission_failed(&self) {}
    fn drone_evicted(&self) {}
    fn task_generated(&self) {}
    fn tasks_recycled(&self, _count: usize) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsHook for NoopMetrics {}
