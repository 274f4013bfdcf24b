//! Recalculation types and reporting.
//!
//! This module defines the types used for ordered formula recomputation
//! and cycle detection.

use std::fmt;
use std::time::Instant;

use crate::cell_id::Coord;

/// What triggered a recomputation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecalcTrigger {
    #[default]
    Edit,
    Resize,
    Load,
}

impl RecalcTrigger {
    fn as_str(self) -> &'static str {
        match self {
            RecalcTrigger::Edit => "edit",
            RecalcTrigger::Resize => "resize",
            RecalcTrigger::Load => "load",
        }
    }
}

/// Report from one ordered recompute pass.
#[derive(Debug, Clone, Default)]
pub struct RecalcReport {
    pub trigger: RecalcTrigger,

    /// Time taken in microseconds.
    pub duration_us: u64,

    /// Number of formula cells that were re-evaluated.
    pub cells_recomputed: usize,

    /// Number of cells whose computed value actually changed.
    pub cells_changed: usize,

    /// Number of re-evaluated cells that ended in an error value.
    pub errors: usize,

    /// True if the pass was cut short or an edit was rejected by cycle detection.
    pub had_cycles: bool,
}

impl RecalcReport {
    pub fn new(trigger: RecalcTrigger) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }

    /// Stamp the elapsed time since `started`.
    pub fn finish(mut self, started: Instant) -> Self {
        self.duration_us = started.elapsed().as_micros() as u64;
        self
    }

    /// Format as a one-line log entry.
    ///
    /// Format: `[recalc/edit]   140us  12 cells  changed=3  cycles=0  errors=0`
    pub fn log_line(&self) -> String {
        format!(
            "[recalc/{}] {:>5}us  {} cells  changed={}  cycles={}  errors={}",
            self.trigger.as_str(),
            self.duration_us,
            self.cells_recomputed,
            self.cells_changed,
            if self.had_cycles { 1 } else { 0 },
            self.errors,
        )
    }
}

/// Report when cycle detection finds a circular reference.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Cells participating in the cycle.
    /// May be a subset for large cycles.
    pub cells: Vec<Coord>,

    /// Human-readable description of the cycle.
    pub message: String,
}

impl CycleReport {
    /// Create a cycle report for a self-referencing cell.
    pub fn self_reference(cell: Coord) -> Self {
        Self {
            cells: vec![cell],
            message: format!("Cell {} references itself", cell),
        }
    }

    /// Create a cycle report for a multi-cell cycle.
    pub fn cycle(cells: Vec<Coord>) -> Self {
        let cell_list: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        let message = match (cell_list.first(), cell_list.last()) {
            (Some(first), Some(last)) if cells.len() > 5 => format!(
                "Circular reference involving {} cells: {} → ... → {}",
                cells.len(),
                first,
                last
            ),
            _ => format!("Circular reference: {}", cell_list.join(" → ")),
        };
        Self { cells, message }
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CycleReport {}
