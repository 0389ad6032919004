//! Evaluation of scalar expressions, over a row or over an aggregated bucket

use super::{Error, Result};
use crate::{
    query::{Aggref, BoolOp, Expr},
    value::{DataType, Value},
};
use chrono::{Datelike, Days, NaiveDate};
use std::{cmp::Ordering, collections::HashMap};

/// What variables and aggregates resolve to
#[derive(Clone, Copy, Debug)]
pub enum Scope<'a> {
    /// Variables read the columns of a row
    Row(&'a [Value]),
    /// Grouping expressions read the labels of a bucket, aggregates read their final values
    Bucket {
        keys: &'a [Expr],
        labels: &'a [Value],
        aggregates: &'a HashMap<&'a Aggref, Value>,
    },
}

pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value> {
    match scope {
        Scope::Row(row) => match expr {
            Expr::Var(var) => var
                .attno
                .checked_sub(1)
                .and_then(|index| row.get(index))
                .cloned()
                .ok_or_else(|| Error::unknown_column(&var.name)),
            Expr::Aggref(aggref) => Err(Error::evaluation(format!(
                "Aggregate {aggref} cannot be evaluated on a single row"
            ))),
            expr => eval_node(expr, scope),
        },
        Scope::Bucket {
            keys,
            labels,
            aggregates,
        } => {
            if let Some(label) = keys
                .iter()
                .position(|key| key == expr)
                .and_then(|index| labels.get(index))
            {
                return Ok(label.clone());
            }
            match expr {
                Expr::Var(var) => Err(Error::evaluation(format!(
                    "Column {} must appear in the GROUP BY clause \
                     or be used in an aggregate function",
                    var.name
                ))),
                Expr::Aggref(aggref) => aggregates.get(aggref).cloned().ok_or_else(|| {
                    Error::evaluation(format!("Aggregate {aggref} was not computed"))
                }),
                expr => eval_node(expr, scope),
            }
        }
    }
}

/// True only for a non-NULL true value
pub fn eval_predicate(expr: &Expr, scope: &Scope) -> Result<bool> {
    Ok(eval(expr, scope)? == Value::Boolean(true))
}

fn eval_args(args: &[Expr], scope: &Scope) -> Result<Vec<Value>> {
    args.iter().map(|arg| eval(arg, scope)).collect()
}

fn eval_node(expr: &Expr, scope: &Scope) -> Result<Value> {
    match expr {
        Expr::Const { value, .. } => Ok(value.clone()),
        Expr::Func {
            name,
            args,
            data_type,
            ..
        } => {
            let args = eval_args(args, scope)?;
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            function(name, &args, *data_type)
        }
        Expr::Cast { arg, data_type } => Ok(eval(arg, scope)?.cast(*data_type)?),
        Expr::Op {
            op,
            args,
            data_type,
            ..
        } => {
            let args = eval_args(args, scope)?;
            if args.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            match args.as_slice() {
                [arg] if op == "-" => arithmetic("*", arg, &Value::Integer(-1), *data_type),
                [left, right] => operator(op, left, right, *data_type),
                _ => Err(Error::unsupported(format!("operator {op}"))),
            }
        }
        Expr::Bool { op, args } => {
            let args = eval_args(args, scope)?
                .into_iter()
                .map(|value| match value {
                    Value::Null => Ok(None),
                    Value::Boolean(b) => Ok(Some(b)),
                    value => Err(Error::evaluation(format!("{value} is not a boolean"))),
                })
                .collect::<Result<Vec<Option<bool>>>>()?;
            Ok(bool_op(*op, &args).into())
        }
        Expr::NullTest { arg, negated } => {
            Ok(Value::Boolean(eval(arg, scope)?.is_null() != *negated))
        }
        Expr::Var(var) => Err(Error::unknown_column(&var.name)),
        Expr::Aggref(aggref) => Err(Error::evaluation(format!("Unexpected aggregate {aggref}"))),
    }
}

/// Three-valued logic
fn bool_op(op: BoolOp, args: &[Option<bool>]) -> Option<bool> {
    match op {
        BoolOp::And if args.contains(&Some(false)) => Some(false),
        BoolOp::Or if args.contains(&Some(true)) => Some(true),
        BoolOp::And | BoolOp::Or if args.contains(&None) => None,
        BoolOp::And => Some(true),
        BoolOp::Or => Some(false),
        BoolOp::Not => args.first().copied().flatten().map(|b| !b),
    }
}

/// Compare two non-NULL values, numbers compare by value
pub fn compare(left: &Value, right: &Value) -> Result<Ordering> {
    if let (Value::Integer(l), Value::Integer(r)) = (left, right) {
        return Ok(l.cmp(r));
    }
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Ok(l.total_cmp(&r));
    }
    match (left, right) {
        (l, r) if l.data_type() == r.data_type() => Ok(l.cmp(r)),
        // Text literals compare as the other side's type
        (Value::Text(_), r) => Ok(left.cast(type_of(r)?)?.cmp(r)),
        (l, Value::Text(_)) => Ok(l.cmp(&right.cast(type_of(l)?)?)),
        (l, r) => Err(Error::evaluation(format!("Cannot compare {l} and {r}"))),
    }
}

fn type_of(value: &Value) -> Result<DataType> {
    value
        .data_type()
        .ok_or_else(|| Error::evaluation("NULL has no type"))
}

fn operator(op: &str, left: &Value, right: &Value, data_type: DataType) -> Result<Value> {
    let comparison = |accept: fn(Ordering) -> bool| -> Result<Value> {
        Ok(Value::Boolean(accept(compare(left, right)?)))
    };
    match op {
        "=" => comparison(Ordering::is_eq),
        "<>" => comparison(Ordering::is_ne),
        "<" => comparison(Ordering::is_lt),
        "<=" => comparison(Ordering::is_le),
        ">" => comparison(Ordering::is_gt),
        ">=" => comparison(Ordering::is_ge),
        "||" => Ok(Value::text(format!("{left}{right}"))),
        op => arithmetic(op, left, right, data_type),
    }
}

fn arithmetic(op: &str, left: &Value, right: &Value, data_type: DataType) -> Result<Value> {
    if let (Value::Integer(l), Value::Integer(r), DataType::Integer) = (left, right, data_type) {
        if matches!(op, "/" | "%") && *r == 0 {
            return Err(Error::evaluation("Division by zero"));
        }
        let result = match op {
            "+" => l.checked_add(*r),
            "-" => l.checked_sub(*r),
            "*" => l.checked_mul(*r),
            "/" => l.checked_div(*r),
            "%" => l.checked_rem(*r),
            op => return Err(Error::unsupported(format!("operator {op}"))),
        };
        return result
            .map(Value::Integer)
            .ok_or_else(|| Error::evaluation("Integer out of range"));
    }
    let (l, r) = match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(Error::evaluation(format!(
                "Operator {op} expects numbers, got {left} and {right}"
            )))
        }
    };
    if matches!(op, "/" | "%") && r == 0. {
        return Err(Error::evaluation("Division by zero"));
    }
    let result = match op {
        "+" => l + r,
        "-" => l - r,
        "*" => l * r,
        "/" => l / r,
        "%" => l % r,
        op => return Err(Error::unsupported(format!("operator {op}"))),
    };
    numeric(result, data_type)
}

/// A number in the type the binder inferred
fn numeric(x: f64, data_type: DataType) -> Result<Value> {
    match data_type {
        DataType::Integer if x.is_finite() => Ok(Value::Integer(x as i64)),
        DataType::Integer => Err(Error::evaluation("Integer out of range")),
        _ => Ok(Value::Float(x)),
    }
}

fn number(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| Error::evaluation(format!("{value} is not a number")))
}

fn integer(value: &Value) -> Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Float(f) if f.fract() == 0. => Ok(*f as i64),
        value => Err(Error::evaluation(format!("{value} is not an integer"))),
    }
}

fn text(value: &Value) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| Error::evaluation(format!("{value} is not a text")))
}

/// Round `x` with `digits` decimals, with `rounding` applied to the scaled value
fn with_digits(x: f64, digits: Option<&Value>, rounding: fn(f64) -> f64) -> Result<f64> {
    match digits {
        None => Ok(rounding(x)),
        Some(digits) => {
            let scale = 10f64.powi(i32::try_from(integer(digits)?).map_err(|_| {
                Error::evaluation(format!("Invalid number of digits {digits}"))
            })?);
            Ok(rounding(x * scale) / scale)
        }
    }
}

/// Scalar functions, called with non-NULL arguments
fn function(name: &str, args: &[Value], data_type: DataType) -> Result<Value> {
    match (name, args) {
        // `f64::round` rounds half away from zero
        ("round", [x, digits @ ..]) => {
            numeric(with_digits(number(x)?, digits.first(), f64::round)?, data_type)
        }
        ("trunc", [x, digits @ ..]) => {
            numeric(with_digits(number(x)?, digits.first(), f64::trunc)?, data_type)
        }
        ("floor", [x]) => numeric(number(x)?.floor(), data_type),
        ("ceil" | "ceiling", [x]) => numeric(number(x)?.ceil(), data_type),
        ("width_bucket", [x, low, high, count]) => {
            width_bucket(number(x)?, number(low)?, number(high)?, integer(count)?)
        }
        ("substring", [s, from, rest @ ..]) => {
            substring(text(s)?, integer(from)?, rest.first().map(integer).transpose()?)
        }
        ("lower", [s]) => Ok(Value::text(text(s)?.to_lowercase())),
        ("upper", [s]) => Ok(Value::text(text(s)?.to_uppercase())),
        ("length" | "char_length", [s]) => Ok(Value::integer(text(s)?.chars().count() as i64)),
        ("date_trunc", [part, date]) => date_trunc(text(part)?, date),
        (name, args) => Err(Error::unsupported(format!(
            "function {name} with {} arguments",
            args.len()
        ))),
    }
}

/// Buckets `[low, high)` in `count` equal parts, numbered from 1, with 0 and `count + 1` outside
fn width_bucket(x: f64, low: f64, high: f64, count: i64) -> Result<Value> {
    if count <= 0 {
        return Err(Error::evaluation("Count must be greater than zero"));
    }
    if low == high || !low.is_finite() || !high.is_finite() {
        return Err(Error::evaluation("Lower bound cannot equal upper bound"));
    }
    let bucket = if low < high {
        if x < low {
            0
        } else if x >= high {
            count + 1
        } else {
            ((x - low) / (high - low) * count as f64).floor() as i64 + 1
        }
    } else if x > low {
        0
    } else if x <= high {
        count + 1
    } else {
        ((low - x) / (low - high) * count as f64).floor() as i64 + 1
    };
    Ok(Value::integer(bucket))
}

/// Characters from 1-based position `from`, for `count` characters
fn substring(s: &str, from: i64, count: Option<i64>) -> Result<Value> {
    let end = match count {
        Some(count) if count < 0 => {
            return Err(Error::evaluation("Negative substring length not allowed"))
        }
        Some(count) => from.saturating_add(count),
        None => i64::MAX,
    };
    let start = from.max(1);
    Ok(Value::text(
        s.chars()
            .enumerate()
            .filter(|(index, _)| {
                let position = *index as i64 + 1;
                position >= start && position < end
            })
            .map(|(_, c)| c)
            .collect::<String>(),
    ))
}

fn date_trunc(part: &str, value: &Value) -> Result<Value> {
    let date = match value.cast(DataType::Date)? {
        Value::Date(date) => date,
        _ => return Err(Error::evaluation(format!("{value} is not a date"))),
    };
    let truncated = match part.to_lowercase().as_str() {
        "year" => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        "quarter" => NaiveDate::from_ymd_opt(date.year(), (date.month0() / 3) * 3 + 1, 1),
        "month" => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
        "week" => date.checked_sub_days(Days::new(date.weekday().num_days_from_monday() as u64)),
        "day" => Some(date),
        part => return Err(Error::unsupported(format!("date_trunc unit {part}"))),
    };
    truncated
        .map(Value::date)
        .ok_or_else(|| Error::evaluation(format!("Cannot truncate {date} to {part}")))
}
