//! Dependency graph for formula cells.
//!
//! Tracks precedents (cells a formula reads) and dependents (cells that read
//! a given cell) keyed by coordinate, so clearing a cell or unloading a
//! document is a plain map removal.
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B depends on A"  (A is a precedent of B)
//! ```
//!
//! This makes "what breaks if I change X?" trivial: follow outgoing edges.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell_id::Coord;
use crate::recalc::CycleReport;

/// Persistent dependency graph for formula cells.
///
/// Maintains bidirectional adjacency for O(1) lookups:
/// - `preds[B]` = cells that B depends on (precedents)
/// - `succs[A]` = cells that depend on A (dependents)
///
/// # Invariants
///
/// 1. **Bidirectional consistency:** If A ∈ preds[B] then B ∈ succs[A], and vice versa.
/// 2. **No dangling entries:** Empty sets are removed, not stored.
/// 3. **Acyclic:** callers run `detect_cycle` before `replace_edges`.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    /// B -> {A1, A2, ...}
    preds: FxHashMap<Coord, FxHashSet<Coord>>,

    /// A -> {B1, B2, ...}
    succs: FxHashMap<Coord, FxHashSet<Coord>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cells this formula cell depends on (precedents).
    pub fn precedents(&self, cell: Coord) -> impl Iterator<Item = Coord> + '_ {
        self.preds
            .get(&cell)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// Returns the cells that depend on this cell (dependents).
    pub fn dependents(&self, cell: Coord) -> impl Iterator<Item = Coord> + '_ {
        self.succs
            .get(&cell)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    pub fn has_dependents(&self, cell: Coord) -> bool {
        self.succs.contains_key(&cell)
    }

    /// Returns true if this cell has formula dependencies tracked in the graph.
    pub fn is_formula_cell(&self, cell: Coord) -> bool {
        self.preds.contains_key(&cell)
    }

    /// Number of cells with at least one precedent.
    pub fn formula_cell_count(&self) -> usize {
        self.preds.len()
    }

    /// Cells read by at least one formula, in no particular order.
    pub fn referenced_cells(&self) -> impl Iterator<Item = Coord> + '_ {
        self.succs.keys().copied()
    }

    /// Number of cells referenced by at least one formula.
    pub fn referenced_cell_count(&self) -> usize {
        self.succs.len()
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.preds.values().map(|s| s.len()).sum()
    }

    /// Replace all edges for a formula cell atomically.
    ///
    /// Removes the cell from its old precedents' dependent sets, then links
    /// it to `new_preds`. Pass an empty set to clear all edges for this cell.
    pub fn replace_edges(&mut self, formula_cell: Coord, new_preds: FxHashSet<Coord>) {
        if let Some(old_preds) = self.preds.remove(&formula_cell) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(&formula_cell);
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }

        if new_preds.is_empty() {
            return;
        }

        for pred in &new_preds {
            self.succs.entry(*pred).or_default().insert(formula_cell);
        }
        self.preds.insert(formula_cell, new_preds);
    }

    /// Clear all outgoing read edges for a cell (formula removed or replaced
    /// by a literal). Edges from formulas that read this cell are kept.
    pub fn clear_cell(&mut self, cell: Coord) {
        self.replace_edges(cell, FxHashSet::default());
    }

    /// Check whether making `cell` read `candidates` would close a cycle.
    ///
    /// Does not modify the graph. A cycle exists if `cell` is itself a
    /// candidate, or if any candidate transitively reads `cell`. The walk is
    /// a depth-first search over precedent edges with a shared visited set.
    pub fn detect_cycle(&self, cell: Coord, candidates: &[Coord]) -> Option<CycleReport> {
        if candidates.contains(&cell) {
            return Some(CycleReport::self_reference(cell));
        }

        let mut visited = FxHashSet::default();
        for &candidate in candidates {
            let mut stack = vec![candidate];
            while let Some(current) = stack.pop() {
                if !visited.insert(current) {
                    continue;
                }
                if let Some(preds) = self.preds.get(&current) {
                    if preds.contains(&cell) {
                        // candidate -> ... -> current -> cell -> candidate
                        return Some(CycleReport::cycle(vec![cell, candidate]));
                    }
                    stack.extend(preds.iter().copied());
                }
            }
        }

        None
    }

    /// Transitive dependents of `changed`, in recomputation order.
    ///
    /// Every returned cell appears after all of its precedents that are also
    /// in the result; ties are broken by ascending (row, col). `changed`
    /// itself is not included.
    pub fn affected_closure(&self, changed: Coord) -> Vec<Coord> {
        self.ordered_closure(&[changed], false)
    }

    /// `seeds` plus all their transitive dependents, in recomputation order.
    ///
    /// Used when a batch of cells must be re-evaluated (extent growth,
    /// document load).
    pub fn recompute_order(&self, seeds: &[Coord]) -> Vec<Coord> {
        self.ordered_closure(seeds, true)
    }

    fn ordered_closure(&self, seeds: &[Coord], include_seeds: bool) -> Vec<Coord> {
        // Collect the affected set
        let mut affected: FxHashSet<Coord> = FxHashSet::default();
        let mut stack: Vec<Coord> = Vec::new();
        if include_seeds {
            stack.extend_from_slice(seeds);
        } else {
            for seed in seeds {
                stack.extend(self.dependents(*seed));
            }
        }
        while let Some(current) = stack.pop() {
            if affected.insert(current) {
                stack.extend(self.dependents(current));
            }
        }

        // Kahn's algorithm restricted to the affected subgraph
        let mut in_degree: FxHashMap<Coord, usize> = FxHashMap::default();
        let mut ready: BTreeSet<Coord> = BTreeSet::new();
        for &cell in &affected {
            let degree = self.precedents(cell).filter(|p| affected.contains(p)).count();
            if degree == 0 {
                ready.insert(cell);
            } else {
                in_degree.insert(cell, degree);
            }
        }

        let mut order = Vec::with_capacity(affected.len());
        while let Some(cell) = ready.pop_first() {
            order.push(cell);
            for dep in self.dependents(cell) {
                if let Some(degree) = in_degree.get_mut(&dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        in_degree.remove(&dep);
                        ready.insert(dep);
                    }
                }
            }
        }

        if order.len() < affected.len() {
            // Only reachable if a caller skipped `detect_cycle`
            log::warn!(
                "dependency cycle among {} cells; evaluation order truncated",
                affected.len() - order.len()
            );
        }

        order
    }

    /// Compute topological order of all formula cells with precedents.
    ///
    /// Returns `Err(CycleReport)` if the graph contains a cycle.
    pub fn topo_order_all_formulas(&self) -> Result<Vec<Coord>, CycleReport> {
        let seeds: Vec<Coord> = self.preds.keys().copied().collect();
        // Every dependent has precedents, so the closure of `seeds` is `seeds`
        let order = self.recompute_order(&seeds);
        if order.len() < seeds.len() {
            let placed: FxHashSet<Coord> = order.iter().copied().collect();
            let mut stuck: Vec<Coord> = seeds.into_iter().filter(|c| !placed.contains(c)).collect();
            stuck.sort();
            return Err(CycleReport::cycle(stuck));
        }
        Ok(order)
    }

    /// Verify all invariants, returning a description of the first violation.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (formula_cell, preds) in &self.preds {
            if preds.is_empty() {
                return Err(format!("empty precedent set stored for {}", formula_cell));
            }
            for pred in preds {
                if !self.succs.get(pred).map_or(false, |s| s.contains(formula_cell)) {
                    return Err(format!("missing dependent edge {} -> {}", pred, formula_cell));
                }
            }
        }
        for (cell, dependents) in &self.succs {
            if dependents.is_empty() {
                return Err(format!("empty dependent set stored for {}", cell));
            }
            for dep in dependents {
                if !self.preds.get(dep).map_or(false, |s| s.contains(cell)) {
                    return Err(format!("missing precedent edge {} -> {}", cell, dep));
                }
            }
        }
        Ok(())
    }

    /// Check all invariants. Panics if any are violated.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        if let Err(violation) = self.check_consistency() {
            panic!("dependency graph inconsistent: {}", violation);
        }
    }
}
