//! Change notifications produced by committed mutations.
//!
//! Every document version bump yields exactly one `ChangeSet`. The session
//! layer fans it out to attached sessions; the engine only builds it.

use crate::cell::{Cell, CellKind};
use crate::cell_id::{Coord, Extent};
use crate::formula::Value;

/// New state of one cell, as included in a change-set or snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub coord: Coord,
    pub raw_input: String,
    pub kind: CellKind,
    pub value: Value,
    pub version: u64,
}

impl From<&Cell> for CellUpdate {
    fn from(cell: &Cell) -> Self {
        Self {
            coord: cell.coord,
            raw_input: cell.raw_input.clone(),
            kind: cell.kind,
            value: cell.value.clone(),
            version: cell.version,
        }
    }
}

/// The full effect of one committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub document_id: String,
    /// Document version produced by the mutation.
    pub version: u64,
    /// Document extent after the mutation.
    pub extent: Extent,
    /// Edited cell first, then recomputed dependents in evaluation order.
    /// Empty for a pure resize with no recomputation.
    pub cells: Vec<CellUpdate>,
}

impl ChangeSet {
    pub fn cell(&self, coord: Coord) -> Option<&CellUpdate> {
        self.cells.iter().find(|c| c.coord == coord)
    }

    pub fn coords(&self) -> Vec<Coord> {
        self.cells.iter().map(|c| c.coord).collect()
    }
}

/// Point-in-time copy of a document's table.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub version: u64,
    pub extent: Extent,
    /// Non-empty cells in ascending (row, col) order.
    pub cells: Vec<CellUpdate>,
}

impl DocumentSnapshot {
    pub fn cell(&self, coord: Coord) -> Option<&CellUpdate> {
        self.cells
            .binary_search_by(|c| c.coord.cmp(&coord))
            .ok()
            .map(|idx| &self.cells[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(row: usize, col: usize, raw: &str) -> CellUpdate {
        CellUpdate {
            coord: Coord::new(row, col),
            raw_input: raw.to_string(),
            kind: CellKind::Number,
            value: Value::Number(1.0),
            version: 1,
        }
    }

    #[test]
    fn test_change_set_lookup() {
        let change_set = ChangeSet {
            document_id: "doc".into(),
            version: 4,
            extent: Extent::new(50, 20),
            cells: vec![update(2, 0, "1"), update(0, 1, "1")],
        };
        assert_eq!(change_set.coords(), vec![Coord::new(2, 0), Coord::new(0, 1)]);
        assert!(change_set.cell(Coord::new(0, 1)).is_some());
        assert!(change_set.cell(Coord::new(9, 9)).is_none());
    }

    #[test]
    fn test_snapshot_lookup_is_ordered() {
        let snapshot = DocumentSnapshot {
            document_id: "doc".into(),
            version: 2,
            extent: Extent::new(50, 20),
            cells: vec![update(0, 1, "a"), update(1, 0, "b"), update(3, 3, "c")],
        };
        assert_eq!(snapshot.cell(Coord::new(1, 0)).map(|c| c.raw_input.as_str()), Some("b"));
        assert!(snapshot.cell(Coord::new(2, 0)).is_none());
    }
}
