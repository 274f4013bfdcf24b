//! Reference extraction from formula AST.
//!
//! Extracts every coordinate a formula reads, for dependency graph
//! construction. Ranges are expanded to individual cells.

use std::collections::BTreeSet;

use crate::cell_id::{Coord, Extent};

use super::parser::Expr;

/// Extract all cell references from an expression, sorted and deduplicated.
///
/// Coordinates outside `limits` (the largest extent a document can ever
/// reach) are dropped: they can never hold a value, and the evaluator
/// reports them as `#REF` on its own. Ranges are clipped to `limits`
/// before expansion.
pub fn extract_refs(expr: &Expr, limits: Extent) -> BTreeSet<Coord> {
    let mut refs = BTreeSet::new();
    collect_refs(expr, limits, &mut refs);
    refs
}

/// Recursively collect cell references from an expression.
fn collect_refs(expr: &Expr, limits: Extent, refs: &mut BTreeSet<Coord>) {
    match expr {
        Expr::Number(_) | Expr::Text(_) | Expr::Boolean(_) | Expr::Name(_) | Expr::Empty => {
            // Literals have no dependencies
        }

        Expr::CellRef(coord) => {
            if limits.contains(*coord) {
                refs.insert(*coord);
            }
        }

        Expr::Range { start, end } => {
            if start.row >= limits.rows || start.col >= limits.cols {
                return;
            }
            let last_row = end.row.min(limits.rows - 1);
            let last_col = end.col.min(limits.cols - 1);
            for row in start.row..=last_row {
                for col in start.col..=last_col {
                    refs.insert(Coord::new(row, col));
                }
            }
        }

        Expr::Function { args, .. } => {
            for arg in args {
                collect_refs(arg, limits, refs);
            }
        }

        Expr::BinaryOp { left, right, .. } => {
            collect_refs(left, limits, refs);
            collect_refs(right, limits, refs);
        }
    }
}
