//! Session table: which user each connection represents and which document
//! it is attached to.
//!
//! A session is attached to at most one document. The table is shared by all
//! connection threads and serves presence queries without entering any
//! document's queue; the document worker's own session set stays the
//! authority for what is broadcast.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use cosheet_config::Role;

/// A session attached to a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Presence {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub document_id: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, user_id: &str, role: Role) {
        self.sessions.write().insert(
            session_id.to_string(),
            SessionInfo {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                role,
                document_id: None,
                last_seen: Utc::now(),
            },
        );
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Attach `session_id` to `document_id` and return the document's
    /// presence list, or `None` if the session was never registered. The
    /// session must already be detached from any other document (see
    /// `detach`); the prior attachment is overwritten otherwise.
    pub fn attach(&self, session_id: &str, document_id: &str) -> Option<Vec<Presence>> {
        {
            let mut sessions = self.sessions.write();
            let Some(info) = sessions.get_mut(session_id) else {
                log::warn!("attach of unknown session {} to {}", session_id, document_id);
                return None;
            };
            if let Some(prior) = info.document_id.as_deref() {
                if prior != document_id {
                    log::warn!(
                        "session {} attached to {} without leaving {}",
                        session_id,
                        document_id,
                        prior
                    );
                }
            }
            info.document_id = Some(document_id.to_string());
            info.last_seen = Utc::now();
        }
        Some(self.list_presence(document_id))
    }

    /// Detach from whatever document the session is attached to.
    /// Returns that document.
    pub fn detach(&self, session_id: &str) -> Option<String> {
        self.sessions
            .write()
            .get_mut(session_id)
            .and_then(|info| info.document_id.take())
    }

    /// Detach only if attached to `document_id`.
    pub fn detach_from(&self, session_id: &str, document_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(info) if info.document_id.as_deref() == Some(document_id) => {
                info.document_id = None;
                true
            }
            _ => false,
        }
    }

    pub fn current_document(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|info| info.document_id.clone())
    }

    /// Sessions attached to `document_id`, ordered by session id.
    pub fn list_presence(&self, document_id: &str) -> Vec<Presence> {
        let mut presence: Vec<Presence> = self
            .sessions
            .read()
            .values()
            .filter(|info| info.document_id.as_deref() == Some(document_id))
            .map(|info| Presence {
                session_id: info.session_id.clone(),
                user_id: info.user_id.clone(),
            })
            .collect();
        presence.sort();
        presence
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(info) = self.sessions.write().get_mut(session_id) {
            info.last_seen = Utc::now();
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.write().remove(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_lists_presence() {
        let sm = SessionManager::new();
        sm.register("s2", "bob", Role::Editor);
        sm.register("s1", "alice", Role::Viewer);

        sm.attach("s2", "doc");
        let presence = sm.attach("s1", "doc").unwrap();
        assert_eq!(
            presence,
            vec![
                Presence { session_id: "s1".into(), user_id: "alice".into() },
                Presence { session_id: "s2".into(), user_id: "bob".into() },
            ]
        );
        assert_eq!(sm.get("s1").unwrap().role, Role::Viewer);
    }

    #[test]
    fn test_single_document_per_session() {
        let sm = SessionManager::new();
        sm.register("s1", "alice", Role::Editor);
        sm.attach("s1", "a");

        assert_eq!(sm.detach("s1").as_deref(), Some("a"));
        sm.attach("s1", "b");

        assert!(sm.list_presence("a").is_empty());
        assert_eq!(sm.list_presence("b").len(), 1);
        assert_eq!(sm.current_document("s1").as_deref(), Some("b"));
    }

    #[test]
    fn test_detach_from_other_document_is_noop() {
        let sm = SessionManager::new();
        sm.register("s1", "alice", Role::Editor);
        sm.attach("s1", "a");
        assert!(!sm.detach_from("s1", "b"));
        assert!(sm.detach_from("s1", "a"));
        assert_eq!(sm.current_document("s1"), None);
    }

    #[test]
    fn test_attach_of_unregistered_session_is_refused() {
        let sm = SessionManager::new();
        assert_eq!(sm.attach("ghost", "doc"), None);
        assert_eq!(sm.session_count(), 0);
        assert!(sm.get("ghost").is_none());
        assert!(sm.list_presence("doc").is_empty());
    }

    #[test]
    fn test_remove() {
        let sm = SessionManager::new();
        sm.register("s1", "alice", Role::Editor);
        sm.attach("s1", "a");
        let info = sm.remove("s1").unwrap();
        assert_eq!(info.document_id.as_deref(), Some("a"));
        assert_eq!(sm.session_count(), 0);
        assert!(sm.list_presence("a").is_empty());
    }
}
