//! Deterministic telemetry counters
//!
//! Counters are incremented at fixed points in the executor and registries,
//! so two runs of the same certified graph under the same seed produce
//! identical numbers. That makes telemetry part of the determinism contract,
//! not just an observability nicety.

use parking_lot::Mutex;
use qmk_core::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counter block, kept per session and globally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub nodes_executed: u64,
    pub nodes_skipped: u64,
    pub vqs_allocated: u64,
    pub vqs_released: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub measurements: u64,
    pub cap_denials: u64,
    pub firewall_violations: u64,
    pub quota_rejections: u64,
    pub rate_limit_rejections: u64,
    pub checkpoints_taken: u64,
    pub checkpoints_restored: u64,
    pub uncompute_runs: u64,
}

/// Central sink for counters.
#[derive(Debug, Default)]
pub struct TelemetryHub {
    global: Mutex<Counters>,
    sessions: Mutex<HashMap<SessionId, Counters>>,
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one mutation to a session's counters and the global block.
    pub fn record<F: Fn(&mut Counters)>(&self, session: SessionId, f: F) {
        f(&mut self.global.lock());
        let mut sessions = self.sessions.lock();
        f(sessions.entry(session).or_default());
    }

    /// Mutation with no owning session (admission rejections, admin paths).
    pub fn record_global<F: FnOnce(&mut Counters)>(&self, f: F) {
        f(&mut self.global.lock());
    }

    pub fn session(&self, session: SessionId) -> Counters {
        self.sessions.lock().get(&session).copied().unwrap_or_default()
    }

    pub fn global(&self) -> Counters {
        *self.global.lock()
    }

    /// Drop a closed session's block.
    pub fn forget(&self, session: SessionId) {
        self.sessions.lock().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_and_global_move_together() {
        let hub = TelemetryHub::new();
        let s = SessionId::generate();
        hub.record(s, |c| c.nodes_executed += 1);
        hub.record(s, |c| c.nodes_executed += 1);
        assert_eq!(hub.session(s).nodes_executed, 2);
        assert_eq!(hub.global().nodes_executed, 2);
    }

    #[test]
    fn sessions_are_isolated() {
        let hub = TelemetryHub::new();
        let a = SessionId::generate();
        let b = SessionId::generate();
        hub.record(a, |c| c.measurements += 3);
        assert_eq!(hub.session(b).measurements, 0);
        assert_eq!(hub.global().measurements, 3);
    }
}
