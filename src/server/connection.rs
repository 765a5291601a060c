use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::registry::Handle;
use crate::rpc::ClientInfo;

/// Server-side state of one accepted connection.
///
/// Lives in the server's connection map from admission until the garbage
/// collector has joined its reader task.
pub struct ConnectionRecord {
    pub id: u64,
    pub handle: Handle,
    info: Mutex<ClientInfo>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionRecord {
    pub fn new(id: u64, handle: Handle, info: ClientInfo) -> Self {
        Self {
            id,
            handle,
            info: Mutex::new(info),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn info(&self) -> ClientInfo {
        self.info.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ClientInfo)) {
        f(&mut self.info.lock());
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}
