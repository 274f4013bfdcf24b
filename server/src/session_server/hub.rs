//! Session-level entry points used by the gateway.
//!
//! `SessionHub` ties the session table to the document registry: it enforces
//! one document per session and the viewer role, and turns a closed
//! connection into a leave.

use std::sync::Arc;

use cosheet_config::Role;
use cosheet_engine::{Coord, Extent};

use super::auth::Identity;
use super::coordinator::{CoordinatorError, JoinOutcome};
use super::registry::{DocumentRegistry, Lifecycle};
use super::sessions::{Presence, SessionInfo, SessionManager};

pub struct SessionHub {
    registry: DocumentRegistry,
    sessions: Arc<SessionManager>,
}

impl SessionHub {
    pub fn new(registry: DocumentRegistry) -> Self {
        Self {
            registry,
            sessions: Arc::new(SessionManager::new()),
        }
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Start a session for an authenticated identity. Returns the session id.
    pub fn open_session(&self, identity: &Identity) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.register(&session_id, &identity.user_id, identity.role);
        log::info!("session {} opened for {} ({:?})", session_id, identity.user_id, identity.role);
        session_id
    }

    /// Leave the attached document (if any) and forget the session.
    pub fn close_session(&self, session_id: &str) {
        if let Some(document_id) = self.sessions.detach(session_id) {
            if let Err(e) = self.registry.leave(&document_id, session_id) {
                log::debug!("session {}: leave on close: {}", session_id, e);
            }
        }
        if self.sessions.remove(session_id).is_some() {
            log::info!("session {} closed", session_id);
        }
    }

    fn session(&self, session_id: &str) -> Result<SessionInfo, CoordinatorError> {
        self.sessions.get(session_id).ok_or(CoordinatorError::NotAttached)
    }

    /// Attach to `document_id`, leaving any other document first.
    pub fn join(&self, session_id: &str, document_id: &str) -> Result<JoinOutcome, CoordinatorError> {
        let info = self.session(session_id)?;
        self.sessions.touch(session_id);
        if let Some(prior) = info.document_id.as_deref() {
            if prior != document_id {
                self.sessions.detach(session_id);
                if let Err(e) = self.registry.leave(prior, session_id) {
                    log::debug!("session {}: leaving {}: {}", session_id, prior, e);
                }
            }
        }

        let outcome = self.registry.join(document_id, session_id, &info.user_id)?;
        if self.sessions.attach(session_id, document_id).is_none() {
            // Closed while the join was in flight
            if let Err(e) = self.registry.leave(document_id, session_id) {
                log::debug!("session {}: leaving {}: {}", session_id, document_id, e);
            }
            return Err(CoordinatorError::NotAttached);
        }
        Ok(outcome)
    }

    pub fn leave(&self, session_id: &str, document_id: &str) -> Result<(), CoordinatorError> {
        if !self.sessions.detach_from(session_id, document_id) {
            return Err(CoordinatorError::NotAttached);
        }
        self.registry.leave(document_id, session_id)
    }

    /// Queue an edit. Returns once queued; the result arrives as an event.
    pub fn edit(
        &self,
        session_id: &str,
        document_id: &str,
        coord: Coord,
        raw_input: &str,
    ) -> Result<(), CoordinatorError> {
        self.require_writer(session_id, document_id)?;
        self.registry.edit(document_id, session_id, coord, raw_input)
    }

    pub fn resize(
        &self,
        session_id: &str,
        document_id: &str,
        extent: Extent,
    ) -> Result<(), CoordinatorError> {
        self.require_writer(session_id, document_id)?;
        self.registry.resize(document_id, session_id, extent)
    }

    pub fn snapshot(&self, session_id: &str, document_id: &str) -> Result<JoinOutcome, CoordinatorError> {
        self.sessions.touch(session_id);
        self.registry.snapshot(document_id, session_id)
    }

    /// Presence from the session table, without entering the document queue.
    pub fn presence(&self, document_id: &str) -> Vec<Presence> {
        self.sessions.list_presence(document_id)
    }

    pub fn lifecycle(&self, document_id: &str) -> Lifecycle {
        self.registry.lifecycle(document_id)
    }

    /// Persist every resident document and refuse further requests.
    pub fn shutdown(&self) -> usize {
        self.registry.shutdown()
    }

    fn require_writer(&self, session_id: &str, document_id: &str) -> Result<(), CoordinatorError> {
        let info = self.session(session_id)?;
        if info.document_id.as_deref() != Some(document_id) {
            return Err(CoordinatorError::NotAttached);
        }
        if info.role != Role::Editor {
            return Err(CoordinatorError::ReadOnly);
        }
        self.sessions.touch(session_id);
        Ok(())
    }
}
