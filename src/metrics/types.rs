use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Snapshot of a session's metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Time since the collector was created
    pub uptime: Duration,

    /// Requests sent by `execute`
    pub total_requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Requests that ended with an aborted finish reason
    pub aborted: usize,

    pub prompt_tokens: u64,
    pub completion_tokens: u64,

    /// Stream chunks handed to sinks
    pub chunks_delivered: u64,

    pub average_latency: Duration,
    pub p95_latency: Duration,

    /// Failed requests over finished requests
    pub error_rate: f32,
}

impl MetricsSnapshot {
    pub(crate) fn latency_stats(latencies: &[Duration]) -> (Duration, Duration) {
        if latencies.is_empty() {
            return (Duration::default(), Duration::default());
        }
        let mut sorted = latencies.to_vec();
        sorted.sort();

        let total: Duration = sorted.iter().sum();
        let average = total / sorted.len() as u32;
        let p95_idx = ((sorted.len() as f32 * 0.95) as usize).min(sorted.len() - 1);
        (average, sorted[p95_idx])
    }
}
