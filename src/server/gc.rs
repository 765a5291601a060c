//! Reclaims closed connection records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::server::connection::ConnectionRecord;

/// Idle interval after which an accept timeout triggers a pass.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(60);

pub type ConnectionMap = Mutex<HashMap<u64, Arc<ConnectionRecord>>>;

pub struct GarbageCollector {
    running: tokio::sync::Mutex<()>,
    last_run: Mutex<Instant>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            running: tokio::sync::Mutex::new(()),
            last_run: Mutex::new(Instant::now()),
        }
    }

    /// Whether an opportunistic pass is worth it.
    ///
    /// `idle` is set when the caller just timed out waiting for a connection.
    pub fn due(&self, count: usize, max_connections: usize, idle: bool) -> bool {
        (idle && self.last_run.lock().elapsed() > IDLE_INTERVAL)
            || count > max_connections * 100 / 112
    }

    /// Join and remove every record flagged closed. Returns how many went.
    ///
    /// Reader tasks are awaited outside the map lock; the records stay in the
    /// map until their task has finished.
    pub async fn collect(&self, connections: &ConnectionMap) -> usize {
        let _running = self.running.lock().await;
        *self.last_run.lock() = Instant::now();

        let closed: Vec<Arc<ConnectionRecord>> = connections
            .lock()
            .values()
            .filter(|record| record.is_closed())
            .cloned()
            .collect();
        if closed.is_empty() {
            return 0;
        }

        for record in &closed {
            if let Some(task) = record.take_task() {
                if let Err(e) = task.await {
                    tracing::warn!(client_id = record.id, error = %e, "Reader task ended abnormally");
                }
            }
        }

        let mut map = connections.lock();
        for record in &closed {
            map.remove(&record.id);
        }
        tracing::debug!(removed = closed.len(), remaining = map.len(), "Garbage collected connections");
        closed.len()
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Handle;
    use crate::rpc::ClientInfo;

    #[tokio::test]
    async fn removes_only_closed_records_after_join() {
        let map: ConnectionMap = Mutex::new(HashMap::new());
        for id in 1..=3 {
            let record = Arc::new(ConnectionRecord::new(id, Handle::placeholder(), ClientInfo::default()));
            record.set_task(tokio::spawn(async {}));
            map.lock().insert(id, record);
        }
        map.lock()[&2].mark_closed();

        let gc = GarbageCollector::new();
        assert_eq!(gc.collect(&map).await, 1);

        let remaining = map.lock();
        assert!(remaining.contains_key(&1));
        assert!(!remaining.contains_key(&2));
        assert!(remaining.contains_key(&3));
    }

    #[test]
    fn due_near_ceiling() {
        let gc = GarbageCollector::new();
        assert!(!gc.due(10, 200, true));
        assert!(!gc.due(178, 200, false));
        assert!(gc.due(179, 200, false));
    }
}
