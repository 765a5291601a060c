//! Descriptor lifecycle registry.
//!
//! The operating system recycles descriptor numbers as soon as they are closed,
//! so a bare descriptor number is not an identity. Every registration gets a
//! fresh generation and callers hold a [`Handle`] made of both. A handle is
//! live only while the registry's entry for its descriptor number carries the
//! same generation.
//!
//! ```text
//!   unregistered ──add──▶ registered ──close / shutdown──▶ invalidated
//!                              │
//!                              └──add (same number) / dispose──▶ invalidated
//! ```
//!
//! The registry owns the registered resources. Closing a descriptor means
//! dropping it, freeing a TLS context means dropping the session, so the order
//! of teardown is expressed by the order of the drops below.

use std::collections::HashMap;
use std::io;

use parking_lot::Mutex;

/// OS-level descriptor number. Negative values are never valid.
pub type RawDescriptor = i64;

/// A transport descriptor owned by the registry.
///
/// Dropping the value closes it.
pub trait Descriptor: Send + 'static {
    /// The descriptor number this entry is keyed by.
    fn raw(&self) -> RawDescriptor;

    /// Transport-level shutdown, issued before close on plain connections.
    fn shutdown(&self) -> io::Result<()>;
}

/// A TLS session attached to a registered descriptor.
///
/// Dropping the value frees the TLS context.
pub trait TlsSession: Send + 'static {
    /// Queue the TLS close-notify alert for the peer.
    fn close_notify(&mut self);
}

/// Generation-tagged reference to a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    raw: RawDescriptor,
    generation: u64,
}

impl Handle {
    /// A handle that is never valid.
    pub const fn placeholder() -> Self {
        Self {
            raw: -1,
            generation: 0,
        }
    }

    pub fn raw(&self) -> RawDescriptor {
        self.raw
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_placeholder(&self) -> bool {
        self.raw < 0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::placeholder()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd-{}#{}", self.raw, self.generation)
    }
}

struct Entry {
    generation: u64,
    descriptor: Box<dyn Descriptor>,
    tls: Option<Box<dyn TlsSession>>,
}

struct RegistryState {
    entries: HashMap<RawDescriptor, Entry>,
    next_generation: u64,
    disposed: bool,
}

impl RegistryState {
    /// Remove the entry `handle` points at, if it is still the current one.
    fn take(&mut self, handle: &Handle) -> Option<Entry> {
        if handle.is_placeholder() {
            return None;
        }
        match self.entries.get(&handle.raw) {
            Some(entry) if entry.generation == handle.generation => {
                self.entries.remove(&handle.raw)
            }
            _ => None,
        }
    }
}

/// The single source of truth for "is this handle still live".
pub struct DescriptorRegistry {
    state: Mutex<RegistryState>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                next_generation: 1,
                disposed: false,
            }),
        }
    }

    /// Register a descriptor and return its handle.
    ///
    /// An existing entry for the same descriptor number belongs to a handle
    /// whose owner never closed it. Its TLS session is freed first and the
    /// entry is replaced; the old descriptor is released without a shutdown,
    /// the number now belongs to the new registration.
    pub fn add<D: Descriptor>(&self, descriptor: D) -> Handle {
        let raw = descriptor.raw();
        let mut state = self.state.lock();
        if raw < 0 || state.disposed {
            return Handle::placeholder();
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        if let Some(mut stale) = state.entries.remove(&raw) {
            tracing::info!(
                descriptor = raw,
                generation = stale.generation,
                "Stale descriptor entry was invalidated"
            );
            if let Some(tls) = stale.tls.take() {
                tracing::warn!(descriptor = raw, "Freeing TLS session of a superseded descriptor");
                drop(tls);
            }
            drop(stale);
        }

        state.entries.insert(
            raw,
            Entry {
                generation,
                descriptor: Box::new(descriptor),
                tls: None,
            },
        );

        Handle { raw, generation }
    }

    /// Attach a TLS session to a live handle. Returns `false` if the handle is
    /// no longer valid, in which case the session is dropped.
    pub fn attach_tls<S: TlsSession>(&self, handle: &Handle, session: S) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(&handle.raw) {
            Some(entry) if entry.generation == handle.generation => {
                entry.tls = Some(Box::new(session));
                true
            }
            _ => false,
        }
    }

    pub fn is_valid(&self, handle: &Handle) -> bool {
        if handle.is_placeholder() {
            return false;
        }
        let state = self.state.lock();
        state
            .entries
            .get(&handle.raw)
            .is_some_and(|entry| entry.generation == handle.generation)
    }

    /// Close a descriptor: close-notify, close, then free the TLS context.
    ///
    /// A handle whose generation no longer matches is ignored, so a reused
    /// descriptor number that now belongs to someone else is never touched.
    pub fn close(&self, handle: &Handle) {
        let Some(entry) = self.state.lock().take(handle) else {
            return;
        };
        teardown(entry, false);
    }

    /// Like [`close`](Self::close), with a transport-level shutdown first.
    ///
    /// The shutdown is skipped when a TLS session exists: close-notify ends the
    /// session and an OS-level shutdown on a live TLS socket breaks the peer's
    /// pending read.
    pub fn shutdown(&self, handle: &Handle) {
        let Some(entry) = self.state.lock().take(handle) else {
            return;
        };
        teardown(entry, true);
    }

    /// Close every entry and refuse new registrations from now on.
    pub fn dispose(&self) {
        let entries: Vec<Entry> = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            teardown(entry, false);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn teardown(entry: Entry, shutdown_transport: bool) {
    let Entry {
        generation,
        descriptor,
        mut tls,
    } = entry;
    let raw = descriptor.raw();

    if let Some(session) = tls.as_mut() {
        session.close_notify();
    } else if shutdown_transport {
        if let Err(e) = descriptor.shutdown() {
            tracing::debug!(descriptor = raw, error = %e, "Transport shutdown failed");
        }
    }

    drop(descriptor);
    drop(tls);
    tracing::trace!(descriptor = raw, generation, "Descriptor closed");
}
