use serde::{Deserialize, Serialize};

use crate::cell_id::Coord;
use crate::formula::{ErrorKind, Expr, ParseError, Value};

/// How a cell's raw input was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Empty,
    String,
    Number,
    Boolean,
    Date,
    Formula,
}

impl CellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CellKind::Empty => "empty",
            CellKind::String => "string",
            CellKind::Number => "number",
            CellKind::Boolean => "boolean",
            CellKind::Date => "date",
            CellKind::Formula => "formula",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "empty" => CellKind::Empty,
            "string" => CellKind::String,
            "number" => CellKind::Number,
            "boolean" => CellKind::Boolean,
            "date" => CellKind::Date,
            "formula" => CellKind::Formula,
            _ => return None,
        })
    }
}

/// Parsed form of a cell's raw input.
#[derive(Debug, Clone, PartialEq)]
pub enum CellContent {
    Empty,
    Literal(Value),
    Formula(Expr),
    /// Formula text that failed to parse; evaluates to `#PARSE`.
    Invalid(ParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub coord: Coord,
    pub raw_input: String,
    pub kind: CellKind,
    pub content: CellContent,
    pub value: Value,
    /// Last document version at which this cell's input or value changed.
    pub version: u64,
    /// The formula was rejected because it would close a dependency cycle.
    /// Such a cell holds `#CYCLE` and contributes no graph edges.
    pub cycle_rejected: bool,
}

impl Cell {
    pub fn new(coord: Coord) -> Self {
        Self {
            coord,
            raw_input: String::new(),
            kind: CellKind::Empty,
            content: CellContent::Empty,
            value: Value::Empty,
            version: 0,
            cycle_rejected: false,
        }
    }

    pub fn is_formula(&self) -> bool {
        self.kind == CellKind::Formula
    }

    pub fn is_empty(&self) -> bool {
        self.kind == CellKind::Empty
    }

    /// The parsed formula, if this cell holds one that participates in
    /// evaluation (not a parse failure and not cycle-rejected).
    pub fn formula(&self) -> Option<&Expr> {
        match &self.content {
            CellContent::Formula(expr) if !self.cycle_rejected => Some(expr),
            _ => None,
        }
    }

    /// Error marker of the computed value, if any.
    pub fn error(&self) -> Option<ErrorKind> {
        self.value.error()
    }

    pub fn display(&self) -> String {
        self.value.display()
    }
}
