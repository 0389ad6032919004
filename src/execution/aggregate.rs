//! Running states of the aggregates of one bucket.
//! Anonymizing aggregates delegate to `aggregation::AggregateState`,
//! the others are computed exactly.

use super::{eval, Error, Result};
use crate::{
    aggregation::{AggregateState, AidDescriptor},
    config::Config,
    hash::Seed,
    query::{AggFunction, Aggref},
    value::Value,
};
use std::{cmp::Ordering, collections::BTreeSet};

/// An exact aggregate
#[derive(Clone, Debug, PartialEq)]
pub enum PlainState {
    CountRows(i64),
    CountValues(i64),
    CountDistinct(BTreeSet<Value>),
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: i64 },
}

impl PlainState {
    pub fn new(aggref: &Aggref) -> Result<PlainState> {
        match (&aggref.function, aggref.distinct) {
            (AggFunction::Count, _) => Ok(PlainState::CountRows(0)),
            (AggFunction::CountAny, false) => Ok(PlainState::CountValues(0)),
            (AggFunction::CountAny, true) => Ok(PlainState::CountDistinct(BTreeSet::new())),
            (AggFunction::Other(name), false) => match name.as_str() {
                "sum" => Ok(PlainState::Sum(None)),
                "min" => Ok(PlainState::Min(None)),
                "max" => Ok(PlainState::Max(None)),
                "avg" => Ok(PlainState::Avg { sum: 0., count: 0 }),
                name => Err(Error::unsupported(format!("aggregate {name}"))),
            },
            (function, _) => Err(Error::unsupported(format!("aggregate {function} with DISTINCT"))),
        }
    }

    fn add(sum: &Option<Value>, value: &Value) -> Result<Value> {
        match (sum, value) {
            (None, value) => Ok(value.clone()),
            (Some(Value::Integer(l)), Value::Integer(r)) => l
                .checked_add(*r)
                .map(Value::Integer)
                .ok_or_else(|| Error::evaluation("Integer out of range")),
            (Some(l), r) => match (l.as_f64(), r.as_f64()) {
                (Some(l), Some(r)) => Ok(Value::float(l + r)),
                _ => Err(Error::evaluation(format!("Cannot sum {l} and {r}"))),
            },
        }
    }

    fn keep(current: &Option<Value>, value: &Value, keep: Ordering) -> Result<Value> {
        match current {
            Some(current) if eval::compare(value, current)? != keep => Ok(current.clone()),
            _ => Ok(value.clone()),
        }
    }

    /// Feed one row, NULLs are ignored except by `count(*)`
    pub fn transition(&mut self, args: &[Value]) -> Result<()> {
        if let PlainState::CountRows(count) = self {
            *count += 1;
            return Ok(());
        }
        let Some(value) = args.first().filter(|value| !value.is_null()) else {
            return Ok(());
        };
        match self {
            PlainState::CountRows(_) => {}
            PlainState::CountValues(count) => *count += 1,
            PlainState::CountDistinct(values) => {
                values.insert(value.clone());
            }
            PlainState::Sum(sum) => *sum = Some(PlainState::add(sum, value)?),
            PlainState::Min(min) => *min = Some(PlainState::keep(min, value, Ordering::Less)?),
            PlainState::Max(max) => *max = Some(PlainState::keep(max, value, Ordering::Greater)?),
            PlainState::Avg { sum, count } => {
                *sum += value
                    .as_f64()
                    .ok_or_else(|| Error::evaluation(format!("Cannot average {value}")))?;
                *count += 1;
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &PlainState) -> Result<()> {
        match (self, other) {
            (PlainState::CountRows(count), PlainState::CountRows(other))
            | (PlainState::CountValues(count), PlainState::CountValues(other)) => *count += other,
            (PlainState::CountDistinct(values), PlainState::CountDistinct(other)) => {
                values.extend(other.iter().cloned())
            }
            (PlainState::Sum(sum), PlainState::Sum(other)) => {
                if let Some(other) = other {
                    *sum = Some(PlainState::add(sum, other)?)
                }
            }
            (PlainState::Min(min), PlainState::Min(Some(other))) => {
                *min = Some(PlainState::keep(min, other, Ordering::Less)?)
            }
            (PlainState::Max(max), PlainState::Max(Some(other))) => {
                *max = Some(PlainState::keep(max, other, Ordering::Greater)?)
            }
            (PlainState::Min(_), PlainState::Min(None))
            | (PlainState::Max(_), PlainState::Max(None)) => {}
            (
                PlainState::Avg { sum, count },
                PlainState::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (state, other) => {
                return Err(Error::other(format!(
                    "Cannot merge {other:?} into {state:?}"
                )))
            }
        }
        Ok(())
    }

    pub fn finalize(&self) -> Value {
        match self {
            PlainState::CountRows(count) | PlainState::CountValues(count) => Value::integer(*count),
            PlainState::CountDistinct(values) => Value::integer(values.len() as i64),
            PlainState::Sum(value) | PlainState::Min(value) | PlainState::Max(value) => {
                value.clone().unwrap_or(Value::Null)
            }
            PlainState::Avg { count: 0, .. } => Value::Null,
            PlainState::Avg { sum, count } => Value::float(sum / *count as f64),
        }
    }
}

/// The state of any aggregate call
#[derive(Clone, Debug, PartialEq)]
pub enum State {
    Anon(AggregateState),
    Plain(PlainState),
}

impl State {
    pub fn new(aggref: &Aggref, config: &Config) -> Result<State> {
        match aggref.function.anon_aggregate() {
            Some(aggregate) => {
                let descriptors = aggref
                    .args
                    .iter()
                    .skip(aggregate.value_arguments())
                    .map(|arg| {
                        arg.data_type()
                            .and_then(AidDescriptor::from_data_type)
                            .ok_or_else(|| Error::evaluation(format!("Invalid AID argument {arg}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(State::Anon(AggregateState::new(aggregate, &descriptors, config)))
            }
            None => Ok(State::Plain(PlainState::new(aggref)?)),
        }
    }

    pub fn transition(&mut self, args: &[Value]) -> Result<()> {
        match self {
            State::Anon(state) => Ok(state.transition(args)?),
            State::Plain(state) => state.transition(args),
        }
    }

    pub fn merge(&mut self, other: &State) -> Result<()> {
        match (self, other) {
            (State::Anon(state), State::Anon(other)) => Ok(state.merge(other)?),
            (State::Plain(state), State::Plain(other)) => state.merge(other),
            _ => Err(Error::other("Cannot merge anonymizing and plain aggregates")),
        }
    }

    /// Anonymizing aggregates need the seed of their bucket
    pub fn finalize(&self, bucket_seed: Option<Seed>, config: &Config) -> Result<Value> {
        match (self, bucket_seed) {
            (State::Anon(state), Some(bucket_seed)) => Ok(state.finalize(bucket_seed, config)),
            (State::Anon(state), None) => Err(Error::missing_context(state.aggregate())),
            (State::Plain(state), _) => Ok(state.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregation::AnonAggregate, query::Expr, value::DataType};

    fn aggref(name: &str, distinct: bool) -> Aggref {
        Aggref {
            distinct,
            ..Aggref::new(
                AggFunction::Other(name.to_string()),
                vec![Expr::var(0, 1, "x", DataType::Integer)],
            )
        }
    }

    fn run(aggref: &Aggref, values: &[Value]) -> Value {
        let mut state = State::new(aggref, &Config::default()).unwrap();
        for value in values {
            state.transition(std::slice::from_ref(value)).unwrap();
        }
        state.finalize(None, &Config::default()).unwrap()
    }

    #[test]
    fn test_plain_aggregates() {
        let values = [Value::integer(3), Value::Null, Value::integer(1), Value::integer(3)];
        assert_eq!(run(&aggref("sum", false), &values), Value::integer(7));
        assert_eq!(run(&aggref("min", false), &values), Value::integer(1));
        assert_eq!(run(&aggref("max", false), &values), Value::integer(3));
        assert_eq!(run(&aggref("avg", false), &values), Value::float(7. / 3.));
        assert_eq!(run(&Aggref::count_star(), &values), Value::integer(4));
        let count = Aggref::new(
            AggFunction::CountAny,
            vec![Expr::var(0, 1, "x", DataType::Integer)],
        );
        assert_eq!(run(&count, &values), Value::integer(3));
        let count_distinct = Aggref {
            distinct: true,
            ..count
        };
        assert_eq!(run(&count_distinct, &values), Value::integer(2));
        assert_eq!(run(&aggref("sum", false), &[]), Value::Null);
        assert_eq!(run(&aggref("avg", false), &[Value::Null]), Value::Null);
    }

    #[test]
    fn test_merge() {
        let config = Config::default();
        let max = aggref("max", false);
        let mut left = State::new(&max, &config).unwrap();
        let mut right = State::new(&max, &config).unwrap();
        left.transition(&[Value::integer(2)]).unwrap();
        right.transition(&[Value::float(2.5)]).unwrap();
        left.merge(&right).unwrap();
        assert_eq!(left.finalize(None, &config).unwrap(), Value::float(2.5));
        let count = State::new(&Aggref::count_star(), &config).unwrap();
        assert!(left.merge(&count).is_err());
    }

    #[test]
    fn test_unsupported() {
        let config = Config::default();
        assert!(matches!(
            State::new(&aggref("stddev", false), &config),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            State::new(&aggref("sum", true), &config),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_anon_state_requires_seed() {
        let config = Config::default();
        let aggref = Aggref::new(
            AggFunction::Anon(AnonAggregate::CountStar),
            vec![Expr::var(0, 1, "user_id", DataType::Integer)],
        );
        let mut state = State::new(&aggref, &config).unwrap();
        state.transition(&[Value::integer(1)]).unwrap();
        assert!(matches!(state.finalize(None, &config), Err(Error::MissingContext(_))));
        assert!(state.finalize(Some(42), &config).is_ok());
        let invalid = Aggref::new(
            AggFunction::Anon(AnonAggregate::CountStar),
            vec![Expr::var(0, 1, "when", DataType::Date)],
        );
        assert!(State::new(&invalid, &config).is_err());
    }
}
