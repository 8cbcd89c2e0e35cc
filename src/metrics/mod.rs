//! Per-session request statistics

mod collector;
mod types;

pub use collector::MetricsCollector;
pub use types::MetricsSnapshot;

/// Latency samples kept per session
pub(crate) const MAX_METRICS_HISTORY: usize = 1000;
