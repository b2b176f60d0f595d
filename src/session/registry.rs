//! Concurrent registry of live sessions.
//!
//! ```text
//! ┌──────────────── SessionRegistry ────────────────┐
//! │  "ABC123"    → Arc<Session>                     │
//! │  "00008030…" → Arc<Session>                     │
//! └─────────────────────────────────────────────────┘
//!   written by: DeviceWatcher     read by: HTTP handlers
//! ```
//!
//! Every operation is a single critical section and the lock is never held
//! across an await. Composite updates go through
//! [`SessionRegistry::replace_or_insert`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::identifiers::DeviceId;

use super::Session;

// ============================================================================
// SessionRegistry
// ============================================================================

/// Map of device id to live session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<DeviceId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the session, returning the displaced one.
    pub fn upsert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.id().clone();
        let previous = self.sessions.write().insert(id.clone(), session);
        debug!(device_id = %id, replaced = previous.is_some(), "Session upserted");
        previous
    }

    /// Inserts `session`, first passing any session it displaces to
    /// `retire`, all under one lock.
    ///
    /// Readers see either the previous session or the new one, and the new
    /// one only after `retire` has returned. `retire` must not touch the
    /// registry. Returns the displaced session.
    pub fn replace_or_insert(
        &self,
        session: Arc<Session>,
        retire: impl FnOnce(&Session),
    ) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let previous = sessions.remove(session.id());
        if let Some(previous) = &previous {
            retire(previous);
        }
        let id = session.id().clone();
        sessions.insert(id.clone(), session);
        debug!(device_id = %id, replaced = previous.is_some(), "Session inserted");
        previous
    }

    /// Removes and returns the session.
    pub fn remove(&self, id: &DeviceId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        debug!(device_id = %id, found = removed.is_some(), "Session removed");
        removed
    }

    /// Returns the session for `id`.
    #[inline]
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Returns `true` if a session exists for `id`.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Returns all sessions, ordered by device id.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Returns the number of sessions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` if there are no sessions.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Removes and returns every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
