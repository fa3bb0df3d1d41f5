//! Session state shared between the broker I/O task and the publish loop.
//!
//! Both sides only ever hold the lock for a handful of field updates, so a
//! plain `std::sync::Mutex` is enough and keeps the command handlers (which run
//! synchronously inside the I/O task) free of `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Connection status as seen by the rest of the agent
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Mutable session bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub connection_status: ConnectionStatus,
    /// Next sweep publishes every entry unconditionally
    pub dirty: bool,
    /// Sweeps since the last forced full publish
    pub cycle_counter: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            dirty: true,
            cycle_counter: 0,
        }
    }
}

impl SessionState {
    /// Reset after the transport reported a disconnect
    pub fn mark_disconnected(&mut self) {
        self.connection_status = ConnectionStatus::Disconnected;
        self.dirty = true;
        self.cycle_counter = 0;
    }

    /// Take the dirty flag for the sweep that is about to start.
    ///
    /// The flag is cleared right away so that a refresh requested while the
    /// sweep is running survives into the next sweep.
    pub fn begin_sweep(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Count a finished sweep and arm the periodic full publish.
    pub fn finish_sweep(&mut self, full_publish_cycle: u32) {
        self.cycle_counter += 1;
        if self.cycle_counter > full_publish_cycle {
            self.cycle_counter = 0;
            self.dirty = true;
        }
    }
}

/// Cloneable handle to the one `SessionState` of a session
#[derive(Clone, Debug, Default)]
pub struct SharedState {
    inner: Arc<Mutex<SessionState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // Plain fields, never half-written; a poisoned value is still valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().connection_status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        debug!("Connection status -> {:?}", status);
        self.lock().connection_status = status;
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Force the next sweep to publish everything
    pub fn request_refresh(&self) {
        self.lock().dirty = true;
    }

    pub fn mark_disconnected(&self) {
        self.lock().mark_disconnected();
    }
}
