//! Per-document synchronization: the single point where a document mutates.
//!
//! A `Coordinator` owns one `Document` and is driven by exactly one worker
//! thread, so every operation here runs to completion before the next one
//! starts. Conflicts between sessions are resolved by that order alone:
//! the last committed write to a cell wins, and every commit produces its
//! own version and change-set.
//!
//! Edit flow:
//! 1. Commit the raw input (cycle check happens inside the commit)
//! 2. Evaluate the edited cell, then its affected closure in topological order
//! 3. Change-set = edited cell + every dependent whose value changed
//! 4. Deliver the change-set to all attached sessions

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cosheet_engine::{
    CellUpdate, ChangeSet, Coord, Document, DocumentError, DocumentSnapshot, Extent,
    RecalcReport, RecalcTrigger,
};
use cosheet_protocol::codes;

use super::events::{EventSink, OutboundEvent};
use super::sessions::Presence;

/// System-level failure of a request, reported to the invoking session only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The document could not be loaded within the load timeout.
    LoadTimeout(Duration),
    /// The store failed while loading or saving.
    PersistenceUnavailable(String),
    OutOfBounds { coord: Coord, extent: Extent },
    InvalidResize {
        requested: Extent,
        current: Extent,
        limits: Extent,
    },
    /// The session is not attached to the document.
    NotAttached,
    /// The session's role does not allow mutations.
    ReadOnly,
    ShuttingDown,
}

impl CoordinatorError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::LoadTimeout(_) => codes::LOAD_TIMEOUT,
            CoordinatorError::PersistenceUnavailable(_) => codes::PERSISTENCE_UNAVAILABLE,
            CoordinatorError::OutOfBounds { .. } => codes::OUT_OF_BOUNDS,
            CoordinatorError::InvalidResize { .. } => codes::INVALID_RESIZE,
            CoordinatorError::NotAttached => codes::NOT_ATTACHED,
            CoordinatorError::ReadOnly => codes::READ_ONLY,
            CoordinatorError::ShuttingDown => codes::SHUTTING_DOWN,
        }
    }
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::LoadTimeout(after) => {
                write!(f, "document did not load within {}ms", after.as_millis())
            }
            CoordinatorError::PersistenceUnavailable(msg) => {
                write!(f, "persistence unavailable: {}", msg)
            }
            CoordinatorError::OutOfBounds { coord, extent } => {
                write!(f, "cell {} is outside the document extent {}", coord, extent)
            }
            CoordinatorError::InvalidResize { requested, current, limits } => write!(
                f,
                "cannot resize {} to {}: documents only grow, up to {}",
                current, requested, limits
            ),
            CoordinatorError::NotAttached => write!(f, "session is not attached to this document"),
            CoordinatorError::ReadOnly => write!(f, "session is read-only"),
            CoordinatorError::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<DocumentError> for CoordinatorError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::OutOfBounds { coord, extent } => {
                CoordinatorError::OutOfBounds { coord, extent }
            }
            DocumentError::InvalidResize { requested, current, limits } => {
                CoordinatorError::InvalidResize { requested, current, limits }
            }
        }
    }
}

/// Reply to a join or snapshot: the full table plus who is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub snapshot: DocumentSnapshot,
    pub presence: Vec<Presence>,
}

pub struct Coordinator {
    doc: Document,
    sink: Arc<dyn EventSink>,
    /// Committed changes not yet persisted.
    dirty: bool,
}

impl Coordinator {
    pub fn new(doc: Document, sink: Arc<dyn EventSink>) -> Self {
        Self {
            doc,
            sink,
            dirty: false,
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn document_id(&self) -> &str {
        self.doc.id()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn has_sessions(&self) -> bool {
        !self.doc.sessions().is_empty()
    }

    /// Attached sessions, ordered by session id.
    pub fn presence(&self) -> Vec<Presence> {
        self.doc
            .sessions()
            .iter()
            .map(|(session_id, user_id)| Presence {
                session_id: session_id.clone(),
                user_id: user_id.clone(),
            })
            .collect()
    }

    fn recipients(&self) -> Vec<String> {
        self.doc.sessions().keys().cloned().collect()
    }

    fn require_attached(&self, session_id: &str) -> Result<(), CoordinatorError> {
        if self.doc.has_session(session_id) {
            Ok(())
        } else {
            Err(CoordinatorError::NotAttached)
        }
    }

    /// Attach a session. Other sessions receive a presence update; the
    /// joiner gets presence in its reply. Joining twice is harmless.
    pub fn join(&mut self, session_id: &str, user_id: &str) -> JoinOutcome {
        if self.doc.attach_session(session_id, user_id) {
            log::info!("document {}: session {} ({}) joined", self.doc.id(), session_id, user_id);
            let others: Vec<String> = self
                .recipients()
                .into_iter()
                .filter(|s| s != session_id)
                .collect();
            self.broadcast_presence(&others);
        }
        JoinOutcome {
            snapshot: self.doc.snapshot(),
            presence: self.presence(),
        }
    }

    pub fn leave(&mut self, session_id: &str) -> Result<(), CoordinatorError> {
        if !self.doc.detach_session(session_id) {
            return Err(CoordinatorError::NotAttached);
        }
        log::info!("document {}: session {} left", self.doc.id(), session_id);
        let remaining = self.recipients();
        self.broadcast_presence(&remaining);
        Ok(())
    }

    pub fn snapshot(&self, session_id: &str) -> Result<JoinOutcome, CoordinatorError> {
        self.require_attached(session_id)?;
        Ok(JoinOutcome {
            snapshot: self.doc.snapshot(),
            presence: self.presence(),
        })
    }

    /// Apply one edit and broadcast its change-set.
    ///
    /// A formula that would close a cycle still commits (as `#CYCLE`, with no
    /// edges), and its change-set holds only that cell.
    pub fn apply_edit(
        &mut self,
        session_id: &str,
        coord: Coord,
        raw_input: &str,
    ) -> Result<Arc<ChangeSet>, CoordinatorError> {
        self.require_attached(session_id)?;
        let started = Instant::now();
        let mut report = RecalcReport::new(RecalcTrigger::Edit);

        let commit = self.doc.commit_cell(coord, raw_input)?;
        self.dirty = true;

        let mut cells = Vec::new();
        if let Some(cycle) = commit.cycle {
            log::info!("document {}: edit at {} rejected: {}", self.doc.id(), coord, cycle);
            report.had_cycles = true;
            cells.push(self.doc.cell_update(coord));
        } else {
            self.doc.recompute_cell(coord);
            report.cells_recomputed += 1;
            report.cells_changed += 1;
            cells.push(self.doc.cell_update(coord));

            for dependent in self.doc.graph().affected_closure(coord) {
                report.cells_recomputed += 1;
                if self.doc.recompute_cell(dependent) {
                    report.cells_changed += 1;
                    cells.push(self.doc.cell_update(dependent));
                }
            }
        }
        report.errors = cells.iter().filter(|c| c.value.is_error()).count();
        log::debug!(
            "document {} v{}: {}",
            self.doc.id(),
            commit.version,
            report.finish(started).log_line()
        );

        Ok(self.publish(cells))
    }

    /// Grow the document. Returns `None` when the extent is unchanged.
    ///
    /// Formulas reading coordinates the resize brings into range are
    /// re-evaluated (they held `#REF`), in dependency order.
    pub fn resize(
        &mut self,
        session_id: &str,
        extent: Extent,
    ) -> Result<Option<Arc<ChangeSet>>, CoordinatorError> {
        self.require_attached(session_id)?;
        let started = Instant::now();
        let Some(readers) = self.doc.resize(extent)? else {
            return Ok(None);
        };
        self.dirty = true;
        log::info!("document {}: resized to {}", self.doc.id(), extent);

        let mut report = RecalcReport::new(RecalcTrigger::Resize);
        let mut cells = Vec::new();
        for coord in self.doc.graph().recompute_order(&readers) {
            report.cells_recomputed += 1;
            if self.doc.recompute_cell(coord) {
                report.cells_changed += 1;
                cells.push(self.doc.cell_update(coord));
            }
        }
        report.errors = cells.iter().filter(|c| c.value.is_error()).count();
        log::debug!("document {}: {}", self.doc.id(), report.finish(started).log_line());

        Ok(Some(self.publish(cells)))
    }

    /// Report a failed fire-and-forget request to its submitter.
    pub fn reject(&self, session_id: &str, error: CoordinatorError) {
        log::debug!("document {}: rejected request from {}: {}", self.doc.id(), session_id, error);
        self.sink.deliver(
            &[session_id.to_string()],
            OutboundEvent::Rejected {
                document_id: self.doc.id().to_string(),
                error,
            },
        );
    }

    fn publish(&self, cells: Vec<CellUpdate>) -> Arc<ChangeSet> {
        let change = Arc::new(ChangeSet {
            document_id: self.doc.id().to_string(),
            version: self.doc.version(),
            extent: self.doc.extent(),
            cells,
        });
        self.sink
            .deliver(&self.recipients(), OutboundEvent::ChangeSet(Arc::clone(&change)));
        change
    }

    fn broadcast_presence(&self, recipients: &[String]) {
        if recipients.is_empty() {
            return;
        }
        self.sink.deliver(
            recipients,
            OutboundEvent::Presence {
                document_id: self.doc.id().to_string(),
                version: self.doc.version(),
                presence: self.presence(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_server::events::RecordingSink;
    use cosheet_engine::{ErrorKind, Value};

    fn a1(s: &str) -> Coord {
        Coord::parse_a1(s).unwrap()
    }

    fn setup() -> (Coordinator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let doc = Document::new("doc", Extent::new(50, 20), Extent::new(1000, 100));
        let mut coord = Coordinator::new(doc, sink.clone());
        coord.join("s1", "alice");
        (coord, sink)
    }

    #[test]
    fn test_chain_edit_change_set_order() {
        let (mut c, _) = setup();
        c.apply_edit("s1", a1("A1"), "5").unwrap();
        c.apply_edit("s1", a1("B1"), "=A1*2").unwrap();
        c.apply_edit("s1", a1("C1"), "=B1+1").unwrap();

        let cs = c.apply_edit("s1", a1("A1"), "10").unwrap();
        assert_eq!(cs.coords(), vec![a1("A1"), a1("B1"), a1("C1")]);
        let values: Vec<Value> = cs.cells.iter().map(|u| u.value.clone()).collect();
        assert_eq!(values, vec![Value::Number(10.0), Value::Number(20.0), Value::Number(21.0)]);
        assert_eq!(cs.version, 4);
        assert!(c.is_dirty());
    }

    #[test]
    fn test_unchanged_dependents_are_not_broadcast() {
        let (mut c, _) = setup();
        c.apply_edit("s1", a1("A1"), "5").unwrap();
        c.apply_edit("s1", a1("B1"), "=IF(A1>0,1,0)").unwrap();
        c.apply_edit("s1", a1("C1"), "=B1*100").unwrap();

        let cs = c.apply_edit("s1", a1("A1"), "7").unwrap();
        assert_eq!(cs.coords(), vec![a1("A1")]);
    }

    #[test]
    fn test_cycle_rejected_only_edited_cell() {
        let (mut c, _) = setup();
        c.apply_edit("s1", a1("A1"), "=B1").unwrap();
        c.apply_edit("s1", a1("B1"), "3").unwrap();
        assert_eq!(c.document().value(a1("A1")), Value::Number(3.0));

        let cs = c.apply_edit("s1", a1("B1"), "=A1").unwrap();
        assert_eq!(cs.coords(), vec![a1("B1")]);
        assert_eq!(cs.cells[0].value, Value::Error(ErrorKind::Cycle));
        assert_eq!(c.document().value(a1("A1")), Value::Number(3.0));
        assert_eq!(c.document().graph().precedents(a1("B1")).count(), 0);
    }

    #[test]
    fn test_out_of_bounds_leaves_document_unchanged() {
        let (mut c, sink) = setup();
        let err = c.apply_edit("s1", Coord::new(50, 0), "1").unwrap_err();
        assert_eq!(err.code(), "out_of_bounds");
        assert_eq!(c.document().version(), 0);
        assert!(sink.change_sets_for("s1").is_empty());
        assert!(!c.is_dirty());
    }

    #[test]
    fn test_not_attached() {
        let (mut c, _) = setup();
        assert_eq!(
            c.apply_edit("stranger", a1("A1"), "1").unwrap_err(),
            CoordinatorError::NotAttached
        );
        assert_eq!(c.snapshot("stranger").unwrap_err(), CoordinatorError::NotAttached);
        assert_eq!(c.leave("stranger").unwrap_err(), CoordinatorError::NotAttached);
    }

    #[test]
    fn test_resize_recomputes_newly_covered_refs() {
        let sink = Arc::new(RecordingSink::new());
        let doc = Document::new("doc", Extent::new(5, 5), Extent::new(20, 20));
        let mut c = Coordinator::new(doc, sink.clone());
        c.join("s1", "alice");

        c.apply_edit("s1", a1("A1"), "=J1+1").unwrap();
        assert_eq!(c.document().value(a1("A1")), Value::Error(ErrorKind::Ref));

        let cs = c.resize("s1", Extent::new(5, 10)).unwrap().unwrap();
        assert_eq!(cs.extent, Extent::new(5, 10));
        assert_eq!(cs.coords(), vec![a1("A1")]);
        assert_eq!(cs.cells[0].value, Value::Number(1.0));

        assert!(c.resize("s1", Extent::new(5, 10)).unwrap().is_none());
        assert!(matches!(
            c.resize("s1", Extent::new(4, 10)),
            Err(CoordinatorError::InvalidResize { .. })
        ));
        assert_eq!(sink.change_sets_for("s1").len(), 2);
    }

    #[test]
    fn test_presence_broadcast_to_others() {
        let (mut c, sink) = setup();
        let outcome = c.join("s2", "bob");
        assert_eq!(outcome.presence.len(), 2);

        let to_alice = sink.events_for("s1");
        assert!(matches!(
            to_alice.last(),
            Some(OutboundEvent::Presence { presence, .. }) if presence.len() == 2
        ));
        assert!(sink.events_for("s2").is_empty());

        c.leave("s2").unwrap();
        assert!(matches!(
            sink.events_for("s1").last(),
            Some(OutboundEvent::Presence { presence, .. }) if presence.len() == 1
        ));
        assert!(c.has_sessions());
        c.leave("s1").unwrap();
        assert!(!c.has_sessions());
    }

    #[test]
    fn test_both_sessions_see_same_change_sets() {
        let (mut c, sink) = setup();
        c.join("s2", "bob");
        c.apply_edit("s1", a1("A1"), "1").unwrap();
        c.apply_edit("s2", a1("A1"), "2").unwrap();

        let alice = sink.change_sets_for("s1");
        let bob = sink.change_sets_for("s2");
        assert_eq!(alice, bob);
        assert_eq!(alice.last().unwrap().cells[0].value, Value::Number(2.0));
        assert_eq!(c.document().value(a1("A1")), Value::Number(2.0));
    }

    #[test]
    fn test_reject_goes_to_submitter_only() {
        let (mut c, sink) = setup();
        c.join("s2", "bob");
        sink.clear();
        c.reject("s2", CoordinatorError::ReadOnly);
        assert!(sink.events_for("s1").is_empty());
        assert!(matches!(
            &sink.events_for("s2")[0],
            OutboundEvent::Rejected { error: CoordinatorError::ReadOnly, .. }
        ));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CoordinatorError::LoadTimeout(Duration::from_secs(1)).code(), "load_timeout");
        assert_eq!(CoordinatorError::ReadOnly.code(), "read_only");
        assert_eq!(
            CoordinatorError::PersistenceUnavailable("x".into()).code(),
            "persistence_unavailable"
        );
    }
}
