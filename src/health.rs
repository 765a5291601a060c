//! Liveness bookkeeping for RPC execution.
//!
//! A lifetick is a `(timestamp, completed)` pair. It is stamped when a method
//! call starts and flagged completed when it returns; the timestamp keeps the
//! start time, so an external health checker can spot a call that started long ago
//! and never finished.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lifetick {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub completed: bool,
}

impl Default for Lifetick {
    fn default() -> Self {
        Self {
            timestamp_ms: now_ms(),
            completed: true,
        }
    }
}

impl Lifetick {
    fn stalled_at(&self, now_ms: u64, max_age: Duration) -> bool {
        !self.completed && now_ms.saturating_sub(self.timestamp_ms) > max_age.as_millis() as u64
    }
}

/// Snapshot handed to external health checkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Calls arriving over client sockets.
    pub dispatch: Lifetick,
    /// Calls made through [`crate::RpcServer::call_method`].
    pub direct: Lifetick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Dispatch,
    Direct,
}

#[derive(Default)]
pub struct HealthMonitor {
    dispatch: Mutex<Lifetick>,
    direct: Mutex<Lifetick>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, source: TickSource) -> &Mutex<Lifetick> {
        match source {
            TickSource::Dispatch => &self.dispatch,
            TickSource::Direct => &self.direct,
        }
    }

    pub fn start(&self, source: TickSource) {
        *self.slot(source).lock() = Lifetick {
            timestamp_ms: now_ms(),
            completed: false,
        };
    }

    pub fn complete(&self, source: TickSource) {
        self.slot(source).lock().completed = true;
    }

    /// Stamp the start now and the completion when the guard drops.
    pub fn track(&self, source: TickSource) -> TickGuard<'_> {
        self.start(source);
        TickGuard {
            monitor: self,
            source,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            dispatch: *self.dispatch.lock(),
            direct: *self.direct.lock(),
        }
    }

    /// True when either lifetick has been pending for longer than `max_age`.
    pub fn is_stalled(&self, max_age: Duration) -> bool {
        let snapshot = self.snapshot();
        let now = now_ms();
        snapshot.dispatch.stalled_at(now, max_age) || snapshot.direct.stalled_at(now, max_age)
    }
}

pub struct TickGuard<'a> {
    monitor: &'a HealthMonitor,
    source: TickSource,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.monitor.complete(self.source);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_start_completed() {
        let monitor = HealthMonitor::new();
        let snap = monitor.snapshot();
        assert!(snap.dispatch.completed);
        assert!(snap.direct.completed);
        assert!(!monitor.is_stalled(Duration::ZERO));
    }

    #[test]
    fn guard_marks_completion() {
        let monitor = HealthMonitor::new();
        {
            let _guard = monitor.track(TickSource::Direct);
            assert!(!monitor.snapshot().direct.completed);
            assert!(monitor.snapshot().dispatch.completed);
        }
        assert!(monitor.snapshot().direct.completed);
    }

    #[test]
    fn pending_tick_goes_stale() {
        let monitor = HealthMonitor::new();
        monitor.start(TickSource::Dispatch);
        std::thread::sleep(Duration::from_millis(20));
        assert!(monitor.is_stalled(Duration::from_millis(5)));
        assert!(!monitor.is_stalled(Duration::from_secs(60)));
        monitor.complete(TickSource::Dispatch);
        assert!(!monitor.is_stalled(Duration::from_millis(5)));
    }

    #[test]
    fn completion_keeps_start_time() {
        let monitor = HealthMonitor::new();
        monitor.start(TickSource::Direct);
        let started = monitor.snapshot().direct.timestamp_ms;
        std::thread::sleep(Duration::from_millis(20));
        monitor.complete(TickSource::Direct);

        let tick = monitor.snapshot().direct;
        assert!(tick.completed);
        assert_eq!(tick.timestamp_ms, started);
    }
}
