//! State-change notifications for the UI layer.

use std::sync::Mutex;

use conclave_core::Snapshot;

use crate::locator::DiscoveryState;
use crate::session::SessionState;

/// Receives discovery, session and reconciled-state updates.
///
/// Called synchronously from whichever task made the change. Notifications
/// of each kind arrive in the order the changes were made, and the next
/// change waits for the current callback, so implementations should return
/// quickly and must not mutate the session from inside a callback.
pub trait SessionObserver: Send + Sync {
    fn on_discovery_state(&self, _state: DiscoveryState) {}

    fn on_session_state(&self, _state: SessionState) {}

    fn on_state_change(&self, _snapshot: &Snapshot) {}
}

/// Ignores everything.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Records every notification. Handy in tests and for debugging.
#[derive(Default)]
pub struct RecordingObserver {
    discovery: Mutex<Vec<DiscoveryState>>,
    session: Mutex<Vec<SessionState>>,
    latest: Mutex<Option<Snapshot>>,
    changes: Mutex<usize>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovery_states(&self) -> Vec<DiscoveryState> {
        self.discovery.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn session_states(&self) -> Vec<SessionState> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn change_count(&self) -> usize {
        *self.changes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionObserver for RecordingObserver {
    fn on_discovery_state(&self, state: DiscoveryState) {
        self.discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(state);
    }

    fn on_session_state(&self, state: SessionState) {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(state);
    }

    fn on_state_change(&self, snapshot: &Snapshot) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        *self.changes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }
}
