// Built-in spreadsheet functions

use chrono::NaiveDate;

use crate::cell_id::Coord;
use super::eval::{eval_expr, number, CellLookup, ErrorKind, Value};
use super::parser::Expr;

/// Check if a function name is a known built-in function.
/// Function names must be uppercase (as produced by the parser).
pub fn is_known_function(name: &str) -> bool {
    matches!(name,
        // Aggregates
        "SUM" | "COUNT" | "COUNTA" | "AVERAGE" | "MIN" | "MAX" |
        // Logic
        "IF" | "AND" | "OR" | "NOT" |
        // Math
        "ABS" | "ROUND" |
        // Text
        "CONCAT" | "LEN" | "UPPER" | "LOWER" |
        // Dates
        "DATE"
    )
}

/// Dispatch a function call. Unknown names yield `#NAME`.
pub(crate) fn call(name: &str, args: &[Expr], lookup: &dyn CellLookup) -> Value {
    let result = match name {
        "SUM" => numbers(args, lookup).map(|ns| number(ns.iter().sum())),
        "COUNT" => numbers(args, lookup).map(|ns| Value::Number(ns.len() as f64)),
        "COUNTA" => count_nonempty(args, lookup),
        "AVERAGE" => numbers(args, lookup).map(|ns| {
            if ns.is_empty() {
                Value::Error(ErrorKind::DivZero)
            } else {
                number(ns.iter().sum::<f64>() / ns.len() as f64)
            }
        }),
        "MIN" => numbers(args, lookup)
            .map(|ns| Value::Number(ns.into_iter().reduce(f64::min).unwrap_or(0.0))),
        "MAX" => numbers(args, lookup)
            .map(|ns| Value::Number(ns.into_iter().reduce(f64::max).unwrap_or(0.0))),
        "IF" => fn_if(args, lookup),
        "AND" => booleans(args, lookup).map(|bs| Value::Boolean(bs.iter().all(|b| *b))),
        "OR" => booleans(args, lookup).map(|bs| Value::Boolean(bs.iter().any(|b| *b))),
        "NOT" => arity(args, 1, 1)
            .and_then(|_| scalar(&args[0], lookup)?.as_bool())
            .map(|b| Value::Boolean(!b)),
        "ABS" => arity(args, 1, 1)
            .and_then(|_| scalar(&args[0], lookup)?.as_number())
            .map(|n| Value::Number(n.abs())),
        "ROUND" => fn_round(args, lookup),
        "CONCAT" => texts(args, lookup).map(|ts| Value::Text(ts.concat())),
        "LEN" => single_text(args, lookup).map(|s| Value::Number(s.chars().count() as f64)),
        "UPPER" => single_text(args, lookup).map(|s| Value::Text(s.to_uppercase())),
        "LOWER" => single_text(args, lookup).map(|s| Value::Text(s.to_lowercase())),
        "DATE" => fn_date(args, lookup),
        _ => Err(ErrorKind::Name),
    };
    result.unwrap_or_else(Value::Error)
}

fn arity(args: &[Expr], min: usize, max: usize) -> Result<(), ErrorKind> {
    if args.len() < min || args.len() > max {
        Err(ErrorKind::Value)
    } else {
        Ok(())
    }
}

/// Evaluate an argument that must be a single value; errors become `Err`.
fn scalar(arg: &Expr, lookup: &dyn CellLookup) -> Result<Value, ErrorKind> {
    match eval_expr(arg, lookup) {
        Value::Error(e) => Err(e),
        v => Ok(v),
    }
}

/// Values addressed by a reference argument, row-major.
///
/// Returns `None` when `arg` is not a reference (cell or range).
fn referenced_values(arg: &Expr, lookup: &dyn CellLookup) -> Option<Result<Vec<Value>, ErrorKind>> {
    match arg {
        Expr::CellRef(coord) => Some(
            lookup
                .value_at(*coord)
                .map(|v| vec![v])
                .ok_or(ErrorKind::Ref),
        ),
        Expr::Range { start, end } => {
            let mut values = Vec::new();
            for row in start.row..=end.row {
                for col in start.col..=end.col {
                    match lookup.value_at(Coord::new(row, col)) {
                        Some(v) => values.push(v),
                        None => return Some(Err(ErrorKind::Ref)),
                    }
                }
            }
            Some(Ok(values))
        }
        _ => None,
    }
}

/// Numeric arguments of an aggregate.
///
/// Referenced cells that are not numbers are skipped; a direct argument that
/// is not a number is a `#VALUE` error. Any error value propagates.
fn numbers(args: &[Expr], lookup: &dyn CellLookup) -> Result<Vec<f64>, ErrorKind> {
    let mut out = Vec::new();
    for arg in args {
        if let Some(values) = referenced_values(arg, lookup) {
            for v in values? {
                match v {
                    Value::Number(n) => out.push(n),
                    Value::Error(e) => return Err(e),
                    _ => {}
                }
            }
            continue;
        }
        match scalar(arg, lookup)? {
            Value::Number(n) => out.push(n),
            Value::Empty => {}
            _ => return Err(ErrorKind::Value),
        }
    }
    Ok(out)
}

fn count_nonempty(args: &[Expr], lookup: &dyn CellLookup) -> Result<Value, ErrorKind> {
    let mut count = 0usize;
    for arg in args {
        let values = match referenced_values(arg, lookup) {
            Some(values) => values?,
            None => vec![scalar(arg, lookup)?],
        };
        for v in values {
            match v {
                Value::Empty => {}
                Value::Error(e) => return Err(e),
                _ => count += 1,
            }
        }
    }
    Ok(Value::Number(count as f64))
}

fn booleans(args: &[Expr], lookup: &dyn CellLookup) -> Result<Vec<bool>, ErrorKind> {
    if args.is_empty() {
        return Err(ErrorKind::Value);
    }
    let mut out = Vec::new();
    for arg in args {
        if let Some(values) = referenced_values(arg, lookup) {
            for v in values? {
                match v {
                    Value::Boolean(b) => out.push(b),
                    Value::Number(n) => out.push(n != 0.0),
                    Value::Error(e) => return Err(e),
                    _ => {}
                }
            }
            continue;
        }
        out.push(scalar(arg, lookup)?.as_bool()?);
    }
    Ok(out)
}

fn texts(args: &[Expr], lookup: &dyn CellLookup) -> Result<Vec<String>, ErrorKind> {
    let mut out = Vec::new();
    for arg in args {
        let values = match referenced_values(arg, lookup) {
            Some(values) => values?,
            None => vec![scalar(arg, lookup)?],
        };
        for v in values {
            out.push(v.as_text()?);
        }
    }
    Ok(out)
}

fn single_text(args: &[Expr], lookup: &dyn CellLookup) -> Result<String, ErrorKind> {
    arity(args, 1, 1)?;
    scalar(&args[0], lookup)?.as_text()
}

// Only the chosen branch is evaluated.
fn fn_if(args: &[Expr], lookup: &dyn CellLookup) -> Result<Value, ErrorKind> {
    arity(args, 2, 3)?;
    let condition = scalar(&args[0], lookup)?.as_bool()?;
    let branch = if condition {
        Some(&args[1])
    } else {
        args.get(2)
    };
    match branch {
        Some(expr) => match eval_expr(expr, lookup) {
            Value::Empty => Ok(Value::Number(0.0)),
            v => Ok(v),
        },
        None => Ok(Value::Boolean(false)),
    }
}

fn fn_round(args: &[Expr], lookup: &dyn CellLookup) -> Result<Value, ErrorKind> {
    arity(args, 1, 2)?;
    let n = scalar(&args[0], lookup)?.as_number()?;
    let digits = match args.get(1) {
        Some(arg) => scalar(arg, lookup)?.as_number()?.trunc(),
        None => 0.0,
    };
    if digits.abs() > 15.0 {
        return Ok(Value::Number(n));
    }
    if digits < 0.0 {
        let factor = 10f64.powi(-digits as i32);
        return Ok(number((n / factor).round() * factor));
    }
    let factor = 10f64.powi(digits as i32);
    Ok(number((n * factor).round() / factor))
}

fn fn_date(args: &[Expr], lookup: &dyn CellLookup) -> Result<Value, ErrorKind> {
    arity(args, 3, 3)?;
    let mut parts = [0.0; 3];
    for (slot, arg) in parts.iter_mut().zip(args) {
        *slot = scalar(arg, lookup)?.as_number()?.trunc();
    }
    let [year, month, day] = parts;
    if !(1.0..=9999.0).contains(&year) || !(1.0..=12.0).contains(&month) || !(1.0..=31.0).contains(&day) {
        return Err(ErrorKind::Num);
    }
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .map(Value::Date)
        .ok_or(ErrorKind::Num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::eval::evaluate;
    use crate::formula::parser::parse;

    /// 5x5 grid: A1..A3 = 1, 2, "x"; B1 = TRUE; C1 = #DIV0
    fn lookup(coord: Coord) -> Option<Value> {
        if coord.row >= 5 || coord.col >= 5 {
            return None;
        }
        Some(match (coord.row, coord.col) {
            (0, 0) => Value::Number(1.0),
            (1, 0) => Value::Number(2.0),
            (2, 0) => Value::Text("x".into()),
            (0, 1) => Value::Boolean(true),
            (0, 2) => Value::Error(ErrorKind::DivZero),
            _ => Value::Empty,
        })
    }

    fn eval(formula: &str) -> Value {
        evaluate(&parse(formula).unwrap(), &lookup)
    }

    #[test]
    fn test_aggregates_skip_non_numeric_range_cells() {
        assert_eq!(eval("=SUM(A1:A5)"), Value::Number(3.0));
        assert_eq!(eval("=COUNT(A1:A5)"), Value::Number(2.0));
        assert_eq!(eval("=COUNTA(A1:B5)"), Value::Number(4.0));
        assert_eq!(eval("=AVERAGE(A1:A3)"), Value::Number(1.5));
        assert_eq!(eval("=MIN(A1:A3, 7)"), Value::Number(1.0));
        assert_eq!(eval("=MAX(A1:A3, 7)"), Value::Number(7.0));
        assert_eq!(eval("=SUM(A3)"), Value::Number(0.0));
    }

    #[test]
    fn test_aggregate_direct_text_is_value_error() {
        assert_eq!(eval("=SUM(1, \"two\")"), Value::Error(ErrorKind::Value));
    }

    #[test]
    fn test_aggregate_errors_propagate() {
        assert_eq!(eval("=SUM(A1:C1)"), Value::Error(ErrorKind::DivZero));
        assert_eq!(eval("=SUM(A1:F1)"), Value::Error(ErrorKind::Ref));
        assert_eq!(eval("=AVERAGE(D1:D3)"), Value::Error(ErrorKind::DivZero));
    }

    #[test]
    fn test_min_max_of_nothing_is_zero() {
        assert_eq!(eval("=MIN(D1:D3)"), Value::Number(0.0));
        assert_eq!(eval("=MAX()"), Value::Number(0.0));
    }

    #[test]
    fn test_logic() {
        assert_eq!(eval("=IF(A1>0, \"pos\", \"neg\")"), Value::Text("pos".into()));
        assert_eq!(eval("=IF(A1>5, 1)"), Value::Boolean(false));
        assert_eq!(eval("=IF(FALSE, 1/0, 2)"), Value::Number(2.0));
        assert_eq!(eval("=AND(B1, A1)"), Value::Boolean(true));
        assert_eq!(eval("=OR(FALSE, 0)"), Value::Boolean(false));
        assert_eq!(eval("=NOT(B1)"), Value::Boolean(false));
        assert_eq!(eval("=IF(\"x\", 1, 2)"), Value::Error(ErrorKind::Value));
    }

    #[test]
    fn test_math() {
        assert_eq!(eval("=ABS(-3)"), Value::Number(3.0));
        assert_eq!(eval("=ROUND(2.346, 2)"), Value::Number(2.35));
        assert_eq!(eval("=ROUND(1234, -2)"), Value::Number(1200.0));
        assert_eq!(eval("=ROUND(2.5)"), Value::Number(3.0));
    }

    #[test]
    fn test_text() {
        assert_eq!(eval("=CONCAT(A1:A3)"), Value::Text("12x".into()));
        assert_eq!(eval("=LEN(\"héllo\")"), Value::Number(5.0));
        assert_eq!(eval("=UPPER(A3)"), Value::Text("X".into()));
        assert_eq!(eval("=LOWER(\"AbC\")"), Value::Text("abc".into()));
    }

    #[test]
    fn test_date() {
        assert_eq!(
            eval("=DATE(2024, 2, 29)"),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(eval("=DATE(2023, 2, 29)"), Value::Error(ErrorKind::Num));
        assert_eq!(eval("=DATE(2024, 1, 31)+1").display(), "2024-02-01");
    }

    #[test]
    fn test_unknown_function_and_arity() {
        assert_eq!(eval("=VLOOKUP(1, A1:A3, 1)"), Value::Error(ErrorKind::Name));
        assert_eq!(eval("=ABS(1, 2)"), Value::Error(ErrorKind::Value));
        assert!(is_known_function("SUM"));
        assert!(!is_known_function("VLOOKUP"));
    }
}
