use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Tracks which `visit_session_id`s currently hold an open socket.
///
/// A second spawn for an id that is already open must be a no-op; overlapping
/// lifecycle re-entry in the UI layer would otherwise race two sockets for
/// the same session. The host constructs one registry and passes it wherever
/// sessions are spawned.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    open: Arc<Mutex<HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, session_id: &str) -> Option<ConnectionGuard> {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if !open.insert(session_id.to_string()) {
            return None;
        }
        Some(ConnectionGuard {
            registry: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }
}

pub struct ConnectionGuard {
    registry: ConnectionRegistry,
    session_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
    }
}
