use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Lifetime counters of one queue. Relaxed ordering: these are for
/// operators, not for synchronization.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub enqueued: AtomicU64,
    pub coalesced: AtomicU64,
    pub succeeded: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pub in_flight: AtomicU64,
    pub last_drain_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl QueueCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, message: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = message;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Point-in-time view of a queue for an operator health screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Records waiting to run.
    pub pending: u64,
    /// Records waiting out a retry delay.
    pub retry_scheduled: u64,
    /// Records with a reconciler call in progress.
    pub in_flight: u64,
    pub enqueued_total: u64,
    pub coalesced_total: u64,
    pub succeeded_total: u64,
    pub retried_total: u64,
    pub failed_total: u64,
    pub sink_write_failures: u64,
    /// Most recent reconcile error message; cleared by the next success.
    pub last_error: Option<String>,
    /// Milliseconds since UNIX_EPOCH when the last drain finished, 0 if never.
    pub last_drain_ms: u64,
    pub draining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_track_last_error() {
        let counters = QueueCounters::default();
        assert_eq!(counters.enqueued.load(Ordering::Relaxed), 0);

        QueueCounters::incr(&counters.enqueued);
        QueueCounters::incr(&counters.enqueued);
        assert_eq!(counters.enqueued.load(Ordering::Relaxed), 2);

        counters.set_last_error(Some("HTTP 503".into()));
        assert_eq!(counters.last_error().as_deref(), Some("HTTP 503"));
        counters.set_last_error(None);
        assert!(counters.last_error().is_none());
    }

    #[test]
    fn status_serializes_for_the_health_view() {
        let status = QueueStatus {
            pending: 2,
            last_error: Some("boom".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["pending"], 2);
        assert_eq!(json["last_error"], "boom");
        assert_eq!(json["draining"], false);
    }
}
