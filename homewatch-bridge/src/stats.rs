use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Connecting,
    Running,
    Stopped,
    FailedStartup,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub state: LifecycleState,
    pub uptime_seconds: u64,
    pub messages_received: u64,
    pub messages_stored: u64,
    pub decode_errors: u64,
    pub malformed_payloads: u64,
    pub processing_errors: u64,
    pub broker_reconnects: u64,
}

impl StatsSnapshot {
    pub fn messages_dropped(&self) -> u64 {
        self.decode_errors + self.malformed_payloads + self.processing_errors
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    stored: AtomicU64,
    decode_errors: AtomicU64,
    malformed_payloads: AtomicU64,
    processing_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Counters and lifecycle state shared between the pipeline, the stats timer
/// and the health endpoint. Cloning shares the same underlying counters.
#[derive(Clone)]
pub struct BridgeStats {
    start_time: Instant,
    counters: Arc<Counters>,
    state: Arc<Mutex<LifecycleState>>,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            state: Arc::new(Mutex::new(LifecycleState::Connecting)),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: LifecycleState) {
        *self.state.lock() = state;
    }

    pub fn record_received(&self) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.counters.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Decode => &self.counters.decode_errors,
            FailureKind::MalformedPayload => &self.counters.malformed_payloads,
            FailureKind::Processing => &self.counters.processing_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            state: self.state(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            messages_received: c.received.load(Ordering::Relaxed),
            messages_stored: c.stored.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            malformed_payloads: c.malformed_payloads.load(Ordering::Relaxed),
            processing_errors: c.processing_errors.load(Ordering::Relaxed),
            broker_reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            state = ?s.state,
            uptime_s = s.uptime_seconds,
            received = s.messages_received,
            stored = s.messages_stored,
            dropped = s.messages_dropped(),
            decode_errors = s.decode_errors,
            malformed = s.malformed_payloads,
            processing_errors = s.processing_errors,
            reconnects = s.broker_reconnects,
            "bridge stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let stats = BridgeStats::new();
        let handle = stats.clone();

        handle.record_received();
        handle.record_received();
        handle.record_stored();
        handle.record_dropped(FailureKind::Decode);
        handle.record_reconnect();
        handle.set_state(LifecycleState::Running);

        let s = stats.snapshot();
        assert_eq!(s.state, LifecycleState::Running);
        assert_eq!(s.messages_received, 2);
        assert_eq!(s.messages_stored, 1);
        assert_eq!(s.decode_errors, 1);
        assert_eq!(s.messages_dropped(), 1);
        assert_eq!(s.broker_reconnects, 1);
    }

    #[test]
    fn snapshot_serializes_state_in_snake_case() {
        let stats = BridgeStats::new();
        stats.set_state(LifecycleState::FailedStartup);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["state"], "failed_startup");
        assert_eq!(json["messages_received"], 0);
    }
}
