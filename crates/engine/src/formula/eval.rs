// Formula evaluator - evaluates parsed expressions against a document's current values

use std::cmp::Ordering;
use std::fmt;

use chrono::{Duration, NaiveDate};

use crate::cell_id::Coord;
use super::functions;
use super::parser::{Expr, Op};

/// Typed error marker shown in a cell instead of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Formula depends on itself (rejected by the dependency graph)
    Cycle,
    /// Reference outside the document extent
    Ref,
    /// Operand of the wrong type
    Value,
    /// Division by zero
    DivZero,
    /// Formula text could not be parsed
    Parse,
    /// Unknown function or identifier
    Name,
    /// Numeric result out of range (overflow, invalid date)
    Num,
}

impl ErrorKind {
    pub fn marker(self) -> &'static str {
        match self {
            ErrorKind::Cycle => "#CYCLE",
            ErrorKind::Ref => "#REF",
            ErrorKind::Value => "#VALUE",
            ErrorKind::DivZero => "#DIV0",
            ErrorKind::Parse => "#PARSE",
            ErrorKind::Name => "#NAME",
            ErrorKind::Num => "#NUM",
        }
    }

    /// Stable lowercase code used on the wire.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Cycle => "cycle",
            ErrorKind::Ref => "ref",
            ErrorKind::Value => "value",
            ErrorKind::DivZero => "div0",
            ErrorKind::Parse => "parse",
            ErrorKind::Name => "name",
            ErrorKind::Num => "num",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "cycle" => ErrorKind::Cycle,
            "ref" => ErrorKind::Ref,
            "value" => ErrorKind::Value,
            "div0" => ErrorKind::DivZero,
            "parse" => ErrorKind::Parse,
            "name" => ErrorKind::Name,
            "num" => ErrorKind::Num,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Computed value of a cell or sub-expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Error(ErrorKind),
}

impl Value {
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            Value::Error(e) => Some(*e),
            _ => None,
        }
    }

    /// Client-facing rendering of the value.
    pub fn display(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Number(n) => format_number(*n),
            Value::Text(s) => s.clone(),
            Value::Boolean(true) => "TRUE".to_string(),
            Value::Boolean(false) => "FALSE".to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Error(e) => e.marker().to_string(),
        }
    }

    /// Numeric view for arithmetic. Empty reads as zero; other non-numbers fail.
    pub(crate) fn as_number(&self) -> Result<f64, ErrorKind> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Empty => Ok(0.0),
            Value::Error(e) => Err(*e),
            _ => Err(ErrorKind::Value),
        }
    }

    /// Text view for concatenation and text functions.
    pub(crate) fn as_text(&self) -> Result<String, ErrorKind> {
        match self {
            Value::Error(e) => Err(*e),
            other => Ok(other.display()),
        }
    }

    /// Truth view for IF/AND/OR/NOT.
    pub(crate) fn as_bool(&self) -> Result<bool, ErrorKind> {
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Empty => Ok(false),
            Value::Error(e) => Err(*e),
            Value::Text(_) | Value::Date(_) => Err(ErrorKind::Value),
        }
    }

    // Cross-type ordering rank for comparisons: numbers < dates < text < booleans
    fn type_rank(&self) -> u8 {
        match self {
            Value::Number(_) | Value::Empty => 0,
            Value::Date(_) => 1,
            Value::Text(_) => 2,
            Value::Boolean(_) => 3,
            Value::Error(_) => 4,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Render a number with at most 10 fractional digits and no trailing zeros.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    let s = format!("{:.10}", n);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// Read access to the values of the document being evaluated.
pub trait CellLookup {
    /// Current value at `coord`, or `None` if the coordinate lies outside
    /// the document extent.
    fn value_at(&self, coord: Coord) -> Option<Value>;
}

impl<F> CellLookup for F
where
    F: Fn(Coord) -> Option<Value>,
{
    fn value_at(&self, coord: Coord) -> Option<Value> {
        self(coord)
    }
}

/// Evaluate a formula AST to the value stored in its cell.
///
/// A formula that resolves to an empty cell reads as `0`; a bare range
/// (not inside a function) is a `#VALUE` error.
pub fn evaluate(expr: &Expr, lookup: &dyn CellLookup) -> Value {
    match eval_expr(expr, lookup) {
        Value::Empty => Value::Number(0.0),
        value => value,
    }
}

pub(crate) fn eval_expr(expr: &Expr, lookup: &dyn CellLookup) -> Value {
    match expr {
        Expr::Number(n) => Value::Number(*n),
        Expr::Text(s) => Value::Text(s.clone()),
        Expr::Boolean(b) => Value::Boolean(*b),
        Expr::Empty => Value::Empty,
        Expr::CellRef(coord) => lookup.value_at(*coord).unwrap_or(Value::Error(ErrorKind::Ref)),
        Expr::Range { .. } => Value::Error(ErrorKind::Value),
        Expr::Name(_) => Value::Error(ErrorKind::Name),
        Expr::Function { name, args } => functions::call(name, args, lookup),
        Expr::BinaryOp { op, left, right } => {
            let left = eval_expr(left, lookup);
            if let Value::Error(e) = left {
                return Value::Error(e);
            }
            let right = eval_expr(right, lookup);
            if let Value::Error(e) = right {
                return Value::Error(e);
            }
            match op {
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => arithmetic(*op, &left, &right),
                Op::Concat => match (left.as_text(), right.as_text()) {
                    (Ok(l), Ok(r)) => Value::Text(l + &r),
                    (Err(e), _) | (_, Err(e)) => Value::Error(e),
                },
                Op::Lt | Op::Gt | Op::Eq | Op::LtEq | Op::GtEq | Op::NotEq => {
                    let ord = compare(&left, &right);
                    Value::Boolean(match op {
                        Op::Lt => ord == Ordering::Less,
                        Op::Gt => ord == Ordering::Greater,
                        Op::Eq => ord == Ordering::Equal,
                        Op::LtEq => ord != Ordering::Greater,
                        Op::GtEq => ord != Ordering::Less,
                        _ => ord != Ordering::Equal,
                    })
                }
            }
        }
    }
}

fn arithmetic(op: Op, left: &Value, right: &Value) -> Value {
    // Date arithmetic: date ± days, date − date
    match (op, left, right) {
        (Op::Add, Value::Date(d), other) | (Op::Add, other, Value::Date(d)) => {
            return match other.as_number() {
                Ok(days) => shift_date(*d, days),
                Err(e) => Value::Error(e),
            };
        }
        (Op::Sub, Value::Date(a), Value::Date(b)) => {
            return Value::Number((*a - *b).num_days() as f64);
        }
        (Op::Sub, Value::Date(d), other) => {
            return match other.as_number() {
                Ok(days) => shift_date(*d, -days),
                Err(e) => Value::Error(e),
            };
        }
        _ => {}
    }

    let (a, b) = match (left.as_number(), right.as_number()) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return Value::Error(e),
    };
    let result = match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => {
            if b == 0.0 {
                return Value::Error(ErrorKind::DivZero);
            }
            a / b
        }
        Op::Pow => a.powf(b),
        _ => return Value::Error(ErrorKind::Value),
    };
    number(result)
}

/// Wrap a float, mapping NaN/infinity to `#NUM`.
pub(crate) fn number(n: f64) -> Value {
    if n.is_finite() {
        Value::Number(n)
    } else {
        Value::Error(ErrorKind::Num)
    }
}

fn shift_date(date: NaiveDate, days: f64) -> Value {
    if !days.is_finite() || days.abs() > 3_000_000.0 {
        return Value::Error(ErrorKind::Num);
    }
    match date.checked_add_signed(Duration::days(days.trunc() as i64)) {
        Some(d) => Value::Date(d),
        None => Value::Error(ErrorKind::Num),
    }
}

fn compare(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Empty, Value::Text(s)) => "".cmp(&s.to_lowercase().as_str()),
        (Value::Text(s), Value::Empty) => s.to_lowercase().as_str().cmp(""),
        (Value::Empty, Value::Boolean(b)) => false.cmp(b),
        (Value::Boolean(b), Value::Empty) => b.cmp(&false),
        (Value::Text(a), Value::Text(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        (Value::Date(a), Value::Date(b)) => a.cmp(b),
        (l, r) if l.type_rank() == 0 && r.type_rank() == 0 => {
            let a = l.as_number().unwrap_or(0.0);
            let b = r.as_number().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (l, r) => l.type_rank().cmp(&r.type_rank()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::parse;
    use std::collections::HashMap;

    struct Grid {
        rows: usize,
        cols: usize,
        values: HashMap<Coord, Value>,
    }

    impl Grid {
        fn new() -> Self {
            Self { rows: 10, cols: 10, values: HashMap::new() }
        }

        fn set(mut self, a1: &str, value: Value) -> Self {
            self.values.insert(Coord::parse_a1(a1).unwrap(), value);
            self
        }
    }

    impl CellLookup for Grid {
        fn value_at(&self, coord: Coord) -> Option<Value> {
            if coord.row >= self.rows || coord.col >= self.cols {
                return None;
            }
            Some(self.values.get(&coord).cloned().unwrap_or(Value::Empty))
        }
    }

    fn eval_with(grid: &Grid, formula: &str) -> Value {
        evaluate(&parse(formula).unwrap(), grid)
    }

    fn eval(formula: &str) -> Value {
        eval_with(&Grid::new(), formula)
    }

    fn date(y: i32, m: u32, d: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("=1+2*3"), Value::Number(7.0));
        assert_eq!(eval("=(1+2)*3"), Value::Number(9.0));
        assert_eq!(eval("=2^10"), Value::Number(1024.0));
        assert_eq!(eval("=-2^2"), Value::Number(4.0));
        assert_eq!(eval("=10%"), Value::Number(0.1));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval("=1/0"), Value::Error(ErrorKind::DivZero));
        assert_eq!(eval("=1/A1"), Value::Error(ErrorKind::DivZero));
    }

    #[test]
    fn test_text_in_arithmetic_is_value_error() {
        let grid = Grid::new().set("A1", Value::Text("abc".into()));
        assert_eq!(eval_with(&grid, "=A1+1"), Value::Error(ErrorKind::Value));
        assert_eq!(eval("=TRUE*2"), Value::Error(ErrorKind::Value));
    }

    #[test]
    fn test_reference_outside_extent_is_ref_error() {
        assert_eq!(eval("=K1"), Value::Error(ErrorKind::Ref));
        assert_eq!(eval("=A11+1"), Value::Error(ErrorKind::Ref));
    }

    #[test]
    fn test_empty_reference_reads_as_zero() {
        assert_eq!(eval("=A1"), Value::Number(0.0));
        assert_eq!(eval("=A1+5"), Value::Number(5.0));
    }

    #[test]
    fn test_error_propagates_left_first() {
        let grid = Grid::new()
            .set("A1", Value::Error(ErrorKind::Ref))
            .set("B1", Value::Error(ErrorKind::DivZero));
        assert_eq!(eval_with(&grid, "=A1+B1"), Value::Error(ErrorKind::Ref));
        assert_eq!(eval_with(&grid, "=B1&\"x\""), Value::Error(ErrorKind::DivZero));
    }

    #[test]
    fn test_concat_and_compare() {
        assert_eq!(eval("=\"a\"&1&TRUE"), Value::Text("a1TRUE".into()));
        assert_eq!(eval("=\"ABC\"=\"abc\""), Value::Boolean(true));
        assert_eq!(eval("=2<10"), Value::Boolean(true));
        assert_eq!(eval("=1<\"a\""), Value::Boolean(true));
        assert_eq!(eval("=A1=0"), Value::Boolean(true));
        assert_eq!(eval("=3<>3"), Value::Boolean(false));
    }

    #[test]
    fn test_date_arithmetic() {
        let grid = Grid::new()
            .set("A1", date(2024, 1, 30))
            .set("A2", date(2024, 3, 1));
        assert_eq!(eval_with(&grid, "=A1+2"), date(2024, 2, 1));
        assert_eq!(eval_with(&grid, "=A1-30"), date(2023, 12, 31));
        assert_eq!(eval_with(&grid, "=A2-A1"), Value::Number(31.0));
        assert_eq!(eval_with(&grid, "=A1*2"), Value::Error(ErrorKind::Value));
        assert_eq!(eval_with(&grid, "=A1+A2"), Value::Error(ErrorKind::Value));
    }

    #[test]
    fn test_overflow_is_num_error() {
        assert_eq!(eval("=10^400"), Value::Error(ErrorKind::Num));
    }

    #[test]
    fn test_bare_range_and_unknown_name() {
        assert_eq!(eval("=A1:B2"), Value::Error(ErrorKind::Value));
        assert_eq!(eval("=price*2"), Value::Error(ErrorKind::Name));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-12.0), "-12");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(1.0 / 3.0), "0.3333333333");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(-1e-12), "0");
    }

    #[test]
    fn test_display_markers() {
        assert_eq!(Value::Error(ErrorKind::Cycle).display(), "#CYCLE");
        assert_eq!(Value::Error(ErrorKind::DivZero).display(), "#DIV0");
        assert_eq!(Value::Boolean(true).display(), "TRUE");
        assert_eq!(date(2024, 5, 6).display(), "2024-05-06");
    }

    #[test]
    fn test_error_code_round_trip_names() {
        for kind in [ErrorKind::Cycle, ErrorKind::Ref, ErrorKind::Value, ErrorKind::DivZero] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code("bogus"), None);
    }
}
