// Formula parsing and evaluation

pub mod parser;
pub mod eval;
pub mod functions;
pub mod refs;

use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::cell::{CellContent, CellKind};
use crate::cell_id::{Coord, Extent};

pub use eval::{evaluate, CellLookup, ErrorKind, Value};
pub use parser::{Expr, Op, ParseError};

/// Raw input classified into a cell kind, with its parsed content and the
/// coordinates it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInput {
    pub kind: CellKind,
    pub content: CellContent,
    /// Coordinates a formula reads (empty for literals and parse failures).
    pub references: BTreeSet<Coord>,
}

/// Classify and parse raw cell input.
///
/// Malformed formulas are not an `Err`: they produce a formula-kind input
/// whose content evaluates to `#PARSE`, so the edit is still committed.
pub fn parse_input(raw: &str, limits: Extent) -> ParsedInput {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return literal(CellKind::Empty, CellContent::Empty);
    }

    if trimmed.starts_with('=') {
        return match parser::parse(trimmed) {
            Ok(expr) => {
                let references = refs::extract_refs(&expr, limits);
                ParsedInput {
                    kind: CellKind::Formula,
                    content: CellContent::Formula(expr),
                    references,
                }
            }
            Err(err) => literal(CellKind::Formula, CellContent::Invalid(err)),
        };
    }

    if let Some(text) = trimmed.strip_prefix('\'') {
        return literal(CellKind::String, CellContent::Literal(Value::Text(text.to_string())));
    }

    if trimmed.eq_ignore_ascii_case("TRUE") {
        return literal(CellKind::Boolean, CellContent::Literal(Value::Boolean(true)));
    }
    if trimmed.eq_ignore_ascii_case("FALSE") {
        return literal(CellKind::Boolean, CellContent::Literal(Value::Boolean(false)));
    }

    if let Some(n) = parse_number(trimmed) {
        return literal(CellKind::Number, CellContent::Literal(Value::Number(n)));
    }

    if let Some(date) = parse_date(trimmed) {
        return literal(CellKind::Date, CellContent::Literal(Value::Date(date)));
    }

    literal(CellKind::String, CellContent::Literal(Value::Text(trimmed.to_string())))
}

fn literal(kind: CellKind, content: CellContent) -> ParsedInput {
    ParsedInput {
        kind,
        content,
        references: BTreeSet::new(),
    }
}

/// Decimal number with optional sign and exponent. Rejects `inf`/`NaN`
/// spellings that `f64::from_str` would otherwise accept.
fn parse_number(s: &str) -> Option<f64> {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    if !digits.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }
    if !digits.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')) {
        return None;
    }
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// ISO calendar date `YYYY-MM-DD`.
fn parse_date(s: &str) -> Option<NaiveDate> {
    let bytes = s.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}
