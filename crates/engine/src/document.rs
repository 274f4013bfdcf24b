//! Document state: the cell table, dependency graph, extent and version of
//! one collaborative spreadsheet.
//!
//! A `Document` is exclusively owned by its coordinator. Mutations here are
//! primitives; the edit algorithm that sequences them (commit, evaluate,
//! recompute dependents, build a change-set) lives with the coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::cell::{Cell, CellContent, CellKind};
use crate::cell_id::{Coord, Extent};
use crate::dep_graph::DepGraph;
use crate::events::{CellUpdate, DocumentSnapshot};
use crate::formula::{self, CellLookup, ErrorKind, Value};
use crate::recalc::{CycleReport, RecalcReport, RecalcTrigger};

/// Rejected document mutation. The document is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Edit addressed a coordinate outside the current extent.
    OutOfBounds { coord: Coord, extent: Extent },
    /// Resize would shrink the document or exceed its limits.
    InvalidResize {
        requested: Extent,
        current: Extent,
        limits: Extent,
    },
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::OutOfBounds { coord, extent } => {
                write!(f, "cell {} is outside the document extent {}", coord, extent)
            }
            DocumentError::InvalidResize { requested, current, limits } => write!(
                f,
                "cannot resize from {} to {} (documents only grow, up to {})",
                current, requested, limits
            ),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Result of committing raw input to a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Document version produced by the commit.
    pub version: u64,
    /// Set when the formula was rejected because it would close a cycle.
    pub cycle: Option<CycleReport>,
}

/// Persisted form of one non-empty cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub coord: Coord,
    pub raw_input: String,
    pub kind: CellKind,
    pub version: u64,
    pub cycle_rejected: bool,
    /// Computed value of a formula cell at save time. A rejected edit
    /// leaves its dependents untouched, so their last value is not always
    /// what re-evaluation would give. `None` for literals and for records
    /// written before values were stored.
    pub value: Option<Value>,
}

/// Persisted form of a document: raw inputs plus formula values.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub extent: Extent,
    pub version: u64,
    pub cells: Vec<CellRecord>,
}

#[derive(Debug, Clone)]
pub struct Document {
    id: String,
    extent: Extent,
    limits: Extent,
    cells: BTreeMap<Coord, Cell>,
    graph: DepGraph,
    version: u64,
    /// Attached sessions: session id -> user id.
    sessions: BTreeMap<String, String>,
}

impl Document {
    /// Create an empty document. `limits` is the largest extent a resize may reach.
    pub fn new(id: impl Into<String>, extent: Extent, limits: Extent) -> Self {
        Self {
            id: id.into(),
            extent,
            limits: Extent::new(limits.rows.max(extent.rows), limits.cols.max(extent.cols)),
            cells: BTreeMap::new(),
            graph: DepGraph::new(),
            version: 0,
            sessions: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn limits(&self) -> Extent {
        self.limits
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn graph(&self) -> &DepGraph {
        &self.graph
    }

    pub fn get_cell(&self, coord: Coord) -> Option<&Cell> {
        self.cells.get(&coord)
    }

    /// Computed value at `coord` (empty for cells never written).
    pub fn value(&self, coord: Coord) -> Value {
        self.cells
            .get(&coord)
            .map(|c| c.value.clone())
            .unwrap_or(Value::Empty)
    }

    /// Non-empty cells in ascending (row, col) order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> + '_ {
        self.cells.values().filter(|c| !c.is_empty())
    }

    /// Current state of a cell as a change-set entry.
    pub fn cell_update(&self, coord: Coord) -> CellUpdate {
        match self.cells.get(&coord) {
            Some(cell) => CellUpdate::from(cell),
            None => CellUpdate::from(&Cell::new(coord)),
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Returns false if the session was already attached.
    pub fn attach_session(&mut self, session_id: &str, user_id: &str) -> bool {
        self.sessions
            .insert(session_id.to_string(), user_id.to_string())
            .is_none()
    }

    /// Returns false if the session was not attached.
    pub fn detach_session(&mut self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Attached sessions (session id -> user id), ordered by session id.
    pub fn sessions(&self) -> &BTreeMap<String, String> {
        &self.sessions
    }

    // ------------------------------------------------------------------
    // Mutation primitives
    // ------------------------------------------------------------------

    /// Parse `raw` and commit it to `coord`, replacing the cell's edges, and
    /// bump the document version.
    ///
    /// A formula that would close a dependency cycle is committed with a
    /// `#CYCLE` value and no edges. Literal and empty cells take their value
    /// immediately; a formula cell's value is left for `recompute_cell`.
    pub fn commit_cell(&mut self, coord: Coord, raw: &str) -> Result<Commit, DocumentError> {
        if !self.extent.contains(coord) {
            return Err(DocumentError::OutOfBounds {
                coord,
                extent: self.extent,
            });
        }

        let parsed = formula::parse_input(raw, self.limits);
        let references: Vec<Coord> = parsed.references.iter().copied().collect();
        let cycle = if parsed.kind == CellKind::Formula {
            self.graph.detect_cycle(coord, &references)
        } else {
            None
        };

        self.version += 1;
        let version = self.version;

        if cycle.is_some() {
            self.graph.clear_cell(coord);
        } else {
            self.graph.replace_edges(coord, references.into_iter().collect::<FxHashSet<_>>());
        }

        let cell = self.cells.entry(coord).or_insert_with(|| Cell::new(coord));
        cell.raw_input = raw.to_string();
        cell.kind = parsed.kind;
        cell.version = version;
        cell.cycle_rejected = cycle.is_some();
        cell.value = match &parsed.content {
            _ if cycle.is_some() => Value::Error(ErrorKind::Cycle),
            CellContent::Empty => Value::Empty,
            CellContent::Literal(v) => v.clone(),
            CellContent::Invalid(_) => Value::Error(ErrorKind::Parse),
            CellContent::Formula(_) => cell.value.clone(),
        };
        cell.content = parsed.content;

        Ok(Commit { version, cycle })
    }

    /// Re-evaluate the formula at `coord` against current values.
    ///
    /// Returns true if the computed value changed; the cell's version is
    /// then stamped with the current document version. Non-formula and
    /// cycle-rejected cells are left alone.
    pub fn recompute_cell(&mut self, coord: Coord) -> bool {
        let value = match self.cells.get(&coord).and_then(|c| c.formula()) {
            Some(expr) => formula::evaluate(expr, self),
            None => return false,
        };
        let version = self.version;
        match self.cells.get_mut(&coord) {
            Some(cell) if cell.value != value => {
                cell.value = value;
                cell.version = version;
                true
            }
            _ => false,
        }
    }

    /// Grow the document to `requested`.
    ///
    /// Returns `Ok(None)` when the extent is unchanged (no version bump).
    /// Otherwise bumps the version and returns the formula cells that read
    /// a newly covered coordinate and must be re-evaluated.
    pub fn resize(&mut self, requested: Extent) -> Result<Option<Vec<Coord>>, DocumentError> {
        if requested == self.extent {
            return Ok(None);
        }
        if !requested.covers(self.extent) || !self.limits.covers(requested) {
            return Err(DocumentError::InvalidResize {
                requested,
                current: self.extent,
                limits: self.limits,
            });
        }

        let previous = self.extent;
        self.extent = requested;
        self.version += 1;

        let mut readers: Vec<Coord> = self
            .graph
            .referenced_cells()
            .filter(|c| !previous.contains(*c) && requested.contains(*c))
            .flat_map(|c| self.graph.dependents(c))
            .collect();
        readers.sort();
        readers.dedup();
        Ok(Some(readers))
    }

    /// Point-in-time copy for late joiners.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: self.id.clone(),
            version: self.version,
            extent: self.extent,
            cells: self.cells().map(CellUpdate::from).collect(),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn to_record(&self) -> DocumentRecord {
        DocumentRecord {
            extent: self.extent,
            version: self.version,
            cells: self
                .cells()
                .map(|c| CellRecord {
                    coord: c.coord,
                    raw_input: c.raw_input.clone(),
                    kind: c.kind,
                    version: c.version,
                    cycle_rejected: c.cycle_rejected,
                    value: c.is_formula().then(|| c.value.clone()),
                })
                .collect(),
        }
    }

    /// Rebuild a document from its persisted record.
    ///
    /// Cells are committed in ascending (row, col) order with the same cycle
    /// check as live edits (a cell persisted as cycle-rejected stays
    /// rejected). Formulas take their stored value; those without one are
    /// evaluated in topological order along with their dependents.
    /// Cell and document versions are restored from the record.
    pub fn from_record(
        id: impl Into<String>,
        record: &DocumentRecord,
        limits: Extent,
    ) -> (Self, RecalcReport) {
        let started = Instant::now();
        let mut report = RecalcReport::new(RecalcTrigger::Load);
        let mut doc = Document::new(id, record.extent, limits);

        let mut cells: Vec<&CellRecord> = record
            .cells
            .iter()
            .filter(|c| doc.extent.contains(c.coord))
            .collect();
        cells.sort_by_key(|c| c.coord);

        let mut unvalued = Vec::new();
        for stored in cells {
            let parsed = formula::parse_input(&stored.raw_input, doc.limits);
            if parsed.kind == CellKind::Empty {
                continue;
            }
            let references: Vec<Coord> = parsed.references.iter().copied().collect();
            let rejected = parsed.kind == CellKind::Formula
                && (stored.cycle_rejected || doc.graph.detect_cycle(stored.coord, &references).is_some());

            let mut cell = Cell::new(stored.coord);
            cell.raw_input = stored.raw_input.clone();
            cell.kind = parsed.kind;
            cell.version = stored.version;
            cell.cycle_rejected = rejected;
            cell.value = match &parsed.content {
                _ if rejected => Value::Error(ErrorKind::Cycle),
                CellContent::Literal(v) => v.clone(),
                CellContent::Invalid(_) => Value::Error(ErrorKind::Parse),
                CellContent::Formula(_) => stored.value.clone().unwrap_or(Value::Empty),
                CellContent::Empty => Value::Empty,
            };
            if rejected {
                report.had_cycles = true;
            } else if matches!(parsed.content, CellContent::Formula(_)) {
                doc.graph.replace_edges(stored.coord, references.into_iter().collect());
                if stored.value.is_none() {
                    unvalued.push(stored.coord);
                }
            }
            cell.content = parsed.content;
            doc.cells.insert(stored.coord, cell);
        }

        for coord in doc.graph.recompute_order(&unvalued) {
            let value = match doc.cells.get(&coord).and_then(|c| c.formula()) {
                Some(expr) => formula::evaluate(expr, &doc),
                None => continue,
            };
            report.cells_recomputed += 1;
            report.cells_changed += 1;
            if value.is_error() {
                report.errors += 1;
            }
            if let Some(cell) = doc.cells.get_mut(&coord) {
                cell.value = value;
            }
        }

        doc.version = record.version;
        (doc, report.finish(started))
    }
}

impl CellLookup for Document {
    fn value_at(&self, coord: Coord) -> Option<Value> {
        if self.extent.contains(coord) {
            Some(self.value(coord))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::new("doc", Extent::new(50, 20), Extent::new(1000, 100))
    }

    fn c(a1: &str) -> Coord {
        Coord::parse_a1(a1).unwrap()
    }

    /// Commit and settle a cell plus its dependents, like the coordinator does.
    fn edit(doc: &mut Document, a1: &str, raw: &str) {
        let coord = c(a1);
        let commit = doc.commit_cell(coord, raw).unwrap();
        if commit.cycle.is_none() {
            doc.recompute_cell(coord);
            for dep in doc.graph().affected_closure(coord) {
                doc.recompute_cell(dep);
            }
        }
    }

    #[test]
    fn test_literal_commit_sets_value_and_version() {
        let mut doc = doc();
        let commit = doc.commit_cell(c("A1"), "42").unwrap();
        assert_eq!(commit.version, 1);
        assert!(commit.cycle.is_none());

        let cell = doc.get_cell(c("A1")).unwrap();
        assert_eq!(cell.value, Value::Number(42.0));
        assert_eq!(cell.kind, CellKind::Number);
        assert_eq!(cell.version, 1);
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_out_of_bounds_commit_is_rejected_without_version_bump() {
        let mut doc = doc();
        let err = doc.commit_cell(Coord::new(50, 0), "1").unwrap_err();
        assert!(matches!(err, DocumentError::OutOfBounds { .. }));
        assert_eq!(doc.version(), 0);
        assert_eq!(err.to_string(), "cell A51 is outside the document extent 50x20");
    }

    #[test]
    fn test_formula_commit_then_recompute() {
        let mut doc = doc();
        edit(&mut doc, "A1", "5");
        edit(&mut doc, "B1", "=A1*2");
        assert_eq!(doc.value(c("B1")), Value::Number(10.0));
        assert_eq!(doc.get_cell(c("B1")).unwrap().version, 2);

        edit(&mut doc, "A1", "7");
        assert_eq!(doc.value(c("B1")), Value::Number(14.0));
        assert_eq!(doc.get_cell(c("B1")).unwrap().version, 3);
        doc.graph().assert_consistent();
    }

    #[test]
    fn test_cycle_commit_leaves_no_edges() {
        let mut doc = doc();
        edit(&mut doc, "A1", "=B1");
        let commit = doc.commit_cell(c("B1"), "=A1").unwrap();
        assert!(commit.cycle.is_some());

        let b1 = doc.get_cell(c("B1")).unwrap();
        assert_eq!(b1.value, Value::Error(ErrorKind::Cycle));
        assert!(b1.cycle_rejected);
        assert!(!doc.graph().is_formula_cell(c("B1")));
        assert_eq!(doc.value(c("A1")), Value::Number(0.0));
        doc.graph().assert_consistent();
    }

    #[test]
    fn test_parse_error_commits_as_error_value() {
        let mut doc = doc();
        doc.commit_cell(c("A1"), "=SUM(1,").unwrap();
        let cell = doc.get_cell(c("A1")).unwrap();
        assert_eq!(cell.kind, CellKind::Formula);
        assert_eq!(cell.value, Value::Error(ErrorKind::Parse));
    }

    #[test]
    fn test_clearing_a_cell_keeps_dependent_edges() {
        let mut doc = doc();
        edit(&mut doc, "A1", "3");
        edit(&mut doc, "B1", "=A1+1");
        edit(&mut doc, "A1", "");
        assert_eq!(doc.value(c("B1")), Value::Number(1.0));
        assert!(doc.graph().has_dependents(c("A1")));
        assert_eq!(doc.snapshot().cells.len(), 1);
    }

    #[test]
    fn test_reference_outside_extent_until_resize() {
        let mut doc = doc();
        edit(&mut doc, "A1", "=A60");
        assert_eq!(doc.value(c("A1")), Value::Error(ErrorKind::Ref));

        let readers = doc.resize(Extent::new(100, 20)).unwrap().unwrap();
        assert_eq!(readers, vec![c("A1")]);
        assert_eq!(doc.version(), 2);
        doc.recompute_cell(c("A1"));
        assert_eq!(doc.value(c("A1")), Value::Number(0.0));
    }

    #[test]
    fn test_resize_rules() {
        let mut doc = doc();
        assert_eq!(doc.resize(Extent::new(50, 20)).unwrap(), None);
        assert_eq!(doc.version(), 0);
        assert!(doc.resize(Extent::new(40, 20)).is_err());
        assert!(doc.resize(Extent::new(60, 10)).is_err());
        assert!(doc.resize(Extent::new(1001, 20)).is_err());
        assert_eq!(doc.resize(Extent::new(1000, 100)).unwrap(), Some(vec![]));
        assert_eq!(doc.extent(), Extent::new(1000, 100));
    }

    #[test]
    fn test_sessions() {
        let mut doc = doc();
        assert!(doc.attach_session("s1", "alice"));
        assert!(!doc.attach_session("s1", "alice"));
        assert!(doc.attach_session("s2", "bob"));
        assert!(doc.has_session("s2"));
        assert!(doc.detach_session("s1"));
        assert!(!doc.detach_session("s1"));
        assert_eq!(doc.sessions().len(), 1);
        assert_eq!(doc.version(), 0);
    }

    #[test]
    fn test_record_round_trip_restores_values_and_versions() {
        let mut doc = doc();
        edit(&mut doc, "C1", "=B1+1");
        edit(&mut doc, "B1", "=A1*2");
        edit(&mut doc, "A1", "5");
        edit(&mut doc, "D4", "hello");
        let record = doc.to_record();

        assert_eq!(record.cells[0].value, None);
        assert_eq!(record.cells[1].value, Some(Value::Number(10.0)));

        let (loaded, report) = Document::from_record("doc", &record, Extent::new(1000, 100));
        assert_eq!(loaded.version(), 4);
        assert_eq!(loaded.value(c("C1")), Value::Number(11.0));
        assert_eq!(loaded.snapshot().cells, doc.snapshot().cells);
        assert_eq!(report.cells_recomputed, 0);
        loaded.graph().assert_consistent();
    }

    #[test]
    fn test_record_without_values_is_recomputed() {
        let mut doc = doc();
        edit(&mut doc, "C1", "=B1+1");
        edit(&mut doc, "B1", "=A1*2");
        edit(&mut doc, "A1", "5");
        let mut record = doc.to_record();
        for cell in &mut record.cells {
            cell.value = None;
        }

        let (loaded, report) = Document::from_record("doc", &record, doc.limits());
        assert_eq!(loaded.value(c("C1")), Value::Number(11.0));
        assert_eq!(report.cells_recomputed, 2);
        assert_eq!(loaded.snapshot(), doc.snapshot());
    }

    #[test]
    fn test_record_keeps_values_downstream_of_a_rejected_edit() {
        let mut doc = doc();
        edit(&mut doc, "B1", "5");
        edit(&mut doc, "A1", "=B1");
        edit(&mut doc, "C1", "=A1+1");
        edit(&mut doc, "A1", "=C1");
        assert_eq!(doc.value(c("A1")), Value::Error(ErrorKind::Cycle));
        assert_eq!(doc.value(c("C1")), Value::Number(6.0));

        let (loaded, _) = Document::from_record("doc", &doc.to_record(), doc.limits());
        assert_eq!(loaded.value(c("C1")), Value::Number(6.0));
        assert_eq!(loaded.snapshot(), doc.snapshot());

        // The next edit upstream settles the dependent as it would live
        let mut live = doc;
        let mut reloaded = loaded;
        edit(&mut live, "B1", "7");
        edit(&mut reloaded, "B1", "7");
        assert_eq!(reloaded.snapshot(), live.snapshot());
    }

    #[test]
    fn test_deeply_nested_formula_commits_as_parse_error() {
        let mut doc = doc();
        let deep = format!("={}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let commit = doc.commit_cell(c("A1"), &deep).unwrap();
        assert!(commit.cycle.is_none());
        let cell = doc.get_cell(c("A1")).unwrap();
        assert_eq!(cell.kind, CellKind::Formula);
        assert_eq!(cell.value, Value::Error(ErrorKind::Parse));
        assert!(!doc.graph().is_formula_cell(c("A1")));
    }

    #[test]
    fn test_record_keeps_cycle_rejection_of_the_later_edit() {
        let mut doc = doc();
        edit(&mut doc, "B1", "=A1");
        edit(&mut doc, "A1", "=B1");
        assert_eq!(doc.value(c("A1")), Value::Error(ErrorKind::Cycle));
        // The rejected edit does not touch the other cell of the cycle
        assert_eq!(doc.value(c("B1")), Value::Number(0.0));

        let (loaded, report) = Document::from_record("doc", &doc.to_record(), doc.limits());
        assert!(report.had_cycles);
        assert!(loaded.get_cell(c("A1")).unwrap().cycle_rejected);
        assert!(!loaded.get_cell(c("B1")).unwrap().cycle_rejected);
        assert!(loaded.graph().is_formula_cell(c("B1")));
        assert_eq!(loaded.value(c("B1")), Value::Number(0.0));
        assert_eq!(loaded.snapshot(), doc.snapshot());
    }
}
