use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::{MetricsSnapshot, MAX_METRICS_HISTORY};
use crate::types::Usage;

/// Collects request statistics for one session.
///
/// Shared behind an `Arc` so the streaming receive path and other threads can
/// record and read concurrently. A disabled collector ignores every record.
#[derive(Debug)]
pub struct MetricsCollector {
    enabled: bool,
    state: RwLock<MetricsState>,
    start_time: Instant,
}

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: usize,
    succeeded: usize,
    failed: usize,
    aborted: usize,
    prompt_tokens: u64,
    completion_tokens: u64,
    chunks_delivered: u64,
    latencies: VecDeque<Duration>,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: RwLock::new(MetricsState::default()),
            start_time: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a request sent to the engine
    pub fn record_request(&self) {
        if self.enabled {
            self.state.write().total_requests += 1;
        }
    }

    /// Record a request that produced a result
    pub fn record_success(&self, usage: Option<Usage>, latency: Duration, aborted: bool) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        state.succeeded += 1;
        if aborted {
            state.aborted += 1;
        }
        if let Some(usage) = usage {
            state.prompt_tokens += u64::from(usage.prompt_tokens);
            state.completion_tokens += u64::from(usage.completion_tokens);
        }
        state.latencies.push_back(latency);
        if state.latencies.len() > MAX_METRICS_HISTORY {
            state.latencies.pop_front();
        }
    }

    pub fn record_failure(&self) {
        if self.enabled {
            self.state.write().failed += 1;
        }
    }

    pub fn record_chunk(&self) {
        if self.enabled {
            self.state.write().chunks_delivered += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read();
        let latencies: Vec<Duration> = state.latencies.iter().copied().collect();
        let (average_latency, p95_latency) = MetricsSnapshot::latency_stats(&latencies);
        let finished = state.succeeded + state.failed;

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            total_requests: state.total_requests,
            succeeded: state.succeeded,
            failed: state.failed,
            aborted: state.aborted,
            prompt_tokens: state.prompt_tokens,
            completion_tokens: state.completion_tokens,
            chunks_delivered: state.chunks_delivered,
            average_latency,
            p95_latency,
            error_rate: if finished > 0 {
                state.failed as f32 / finished as f32
            } else {
                0.0
            },
        }
    }
}
