//! Session table: maps SPICE session ids to compute hosts.
//!
//! The handshake only sees the [`SessionStore`] trait. The in-memory table
//! below is what the daemon plugs in; any other store (shared cache,
//! database) can stand in for it.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// What the handshake needs from session storage.
///
/// Implementations are shared across connection tasks and must synchronize
/// internally: an `add` from one task is visible to later calls from any
/// other.
pub trait SessionStore: Send + Sync {
    /// One-time password of a session. Empty if the session is unknown.
    fn otp(&self, session_id: u32) -> String;

    /// Whether a session is known.
    fn lookup(&self, session_id: u32) -> bool;

    /// Resolve the compute host a known session lives on.
    fn connect(&self, session_id: u32) -> Result<String, SessionError>;

    /// Record a session after a fully successful handshake.
    fn add(&self, session_id: u32, destination: &str, otp: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(u32),
    #[error("no destination")]
    NoDestination,
}

/// One row of the table.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub destination: String,
    /// Never leaves the process.
    pub otp: String,
    pub established_at: Instant,
}

/// The in-memory session table, shared across all tasks.
pub type SessionTable = Arc<DashMap<u32, SessionEntry>>;

/// Create a new empty session table.
pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

impl SessionStore for DashMap<u32, SessionEntry> {
    fn otp(&self, session_id: u32) -> String {
        self.get(&session_id)
            .map(|e| e.otp.clone())
            .unwrap_or_default()
    }

    fn lookup(&self, session_id: u32) -> bool {
        self.contains_key(&session_id)
    }

    fn connect(&self, session_id: u32) -> Result<String, SessionError> {
        let entry = self
            .get(&session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;
        if entry.destination.is_empty() {
            return Err(SessionError::NoDestination);
        }
        Ok(entry.destination.clone())
    }

    fn add(&self, session_id: u32, destination: &str, otp: &str) {
        let previous = self.insert(
            session_id,
            SessionEntry {
                destination: destination.to_string(),
                otp: otp.to_string(),
                established_at: Instant::now(),
            },
        );
        tracing::debug!(
            session_id,
            destination,
            replaced = previous.is_some(),
            "session recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_table_creates_empty() {
        let table = new_session_table();
        assert!(table.is_empty());
        assert!(!table.lookup(1));
        assert_eq!(table.otp(1), "");
    }

    #[test]
    fn add_then_resolve() {
        let table = new_session_table();
        table.add(42, "10.0.0.5:5900", "otp-42");

        assert!(table.lookup(42));
        assert_eq!(table.otp(42), "otp-42");
        assert_eq!(table.connect(42).unwrap(), "10.0.0.5:5900");
    }

    #[test]
    fn connect_unknown_session() {
        let table = new_session_table();
        assert_eq!(table.connect(7), Err(SessionError::UnknownSession(7)));
    }

    #[test]
    fn connect_without_destination() {
        let table = new_session_table();
        table.add(3, "", "otp");
        assert_eq!(table.connect(3), Err(SessionError::NoDestination));
    }

    #[test]
    fn add_replaces_existing_entry() {
        let table = new_session_table();
        table.add(9, "a:1", "one");
        table.add(9, "b:2", "two");
        assert_eq!(table.len(), 1);
        assert_eq!(table.connect(9).unwrap(), "b:2");
        assert_eq!(table.otp(9), "two");
    }

    #[test]
    fn usable_through_trait_object() {
        let table = new_session_table();
        let store: Arc<dyn SessionStore> = table.clone();
        store.add(5, "host:5900", "pw");
        assert!(table.contains_key(&5));
    }
}
