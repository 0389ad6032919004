//! # Anonymizing aggregates
//!
//! The closed set of aggregates the engine knows how to anonymize, and their step functions.
//! Every aggregate takes its usual arguments followed by one value per AID column.
//! States are built row by row with `transition`, combined across partial aggregation
//! stages with `merge` and turned into a published value with `finalize`.
//!

pub mod aid;
pub mod aid_tracker;
pub mod contribution_tracker;
pub mod count;
pub mod count_distinct;
pub mod low_count;

use crate::{
    config::Config,
    hash::Seed,
    value::{self, DataType, Value},
};
use serde::{Deserialize, Serialize};
use std::{error, fmt, result};

pub use aid::{Aid, AidDescriptor};
pub use count::{CountResult, CountResultAccumulator, CountState};
pub use count_distinct::CountDistinctState;
pub use low_count::LowCountState;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    WrongArgumentCount(String),
    InvalidAid(String),
    MismatchedStates(String),
    Other(String),
}

impl Error {
    pub fn wrong_argument_count(aggregate: AnonAggregate, expected: usize, actual: usize) -> Error {
        Error::WrongArgumentCount(format!(
            "{aggregate} expects {expected} arguments, got {actual}"
        ))
    }
    pub fn invalid_aid(value: impl fmt::Display, data_type: impl fmt::Display) -> Error {
        Error::InvalidAid(format!("{value} is not a valid AID of type {data_type}"))
    }
    pub fn mismatched_states(left: AnonAggregate, right: AnonAggregate) -> Error {
        Error::MismatchedStates(format!("Cannot merge a {left} state into a {right} state"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WrongArgumentCount(desc) => writeln!(f, "WrongArgumentCount: {}", desc),
            Error::InvalidAid(desc) => writeln!(f, "InvalidAid: {}", desc),
            Error::MismatchedStates(desc) => writeln!(f, "MismatchedStates: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl From<value::Error> for Error {
    fn from(err: value::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl error::Error for Error {}
pub type Result<T> = result::Result<T, Error>;

/// The anonymizing aggregates
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonAggregate {
    /// `anon_count_star(aids...)`
    CountStar,
    /// `anon_count_value(value, aids...)`
    CountValue,
    /// `anon_count_distinct(value, aids...)`
    CountDistinct,
    /// `low_count(aids...)`, true when the bucket must be suppressed
    LowCount,
}

impl AnonAggregate {
    pub const ALL: [AnonAggregate; 4] = [
        AnonAggregate::CountStar,
        AnonAggregate::CountValue,
        AnonAggregate::CountDistinct,
        AnonAggregate::LowCount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnonAggregate::CountStar => "anon_count_star",
            AnonAggregate::CountValue => "anon_count_value",
            AnonAggregate::CountDistinct => "anon_count_distinct",
            AnonAggregate::LowCount => "low_count",
        }
    }

    pub fn from_name(name: &str) -> Option<AnonAggregate> {
        AnonAggregate::ALL
            .into_iter()
            .find(|aggregate| aggregate.name().eq_ignore_ascii_case(name))
    }

    /// Number of arguments before the AID arguments
    pub fn value_arguments(&self) -> usize {
        match self {
            AnonAggregate::CountValue | AnonAggregate::CountDistinct => 1,
            AnonAggregate::CountStar | AnonAggregate::LowCount => 0,
        }
    }

    pub fn result_type(&self) -> DataType {
        match self {
            AnonAggregate::LowCount => DataType::Boolean,
            _ => DataType::Integer,
        }
    }
}

impl fmt::Display for AnonAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The running state of an anonymizing aggregate in one bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateState {
    aggregate: AnonAggregate,
    descriptors: Vec<AidDescriptor>,
    kind: StateKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum StateKind {
    Count(CountState),
    CountDistinct(CountDistinctState),
    LowCount(LowCountState),
}

impl AggregateState {
    pub fn new(aggregate: AnonAggregate, descriptors: &[AidDescriptor], config: &Config) -> Self {
        let kind = match aggregate {
            AnonAggregate::CountStar | AnonAggregate::CountValue => {
                StateKind::Count(CountState::new(descriptors, config))
            }
            AnonAggregate::CountDistinct => {
                StateKind::CountDistinct(CountDistinctState::new(descriptors))
            }
            AnonAggregate::LowCount => StateKind::LowCount(LowCountState::new(descriptors)),
        };
        AggregateState {
            aggregate,
            descriptors: descriptors.to_vec(),
            kind,
        }
    }

    pub fn aggregate(&self) -> AnonAggregate {
        self.aggregate
    }

    fn make_aids(&self, values: &[Value]) -> Result<Vec<Option<Aid>>> {
        self.descriptors
            .iter()
            .zip(values)
            .map(|(descriptor, value)| descriptor.make_aid(value))
            .collect()
    }

    /// Feed the arguments of one row
    pub fn transition(&mut self, args: &[Value]) -> Result<()> {
        let value_arguments = self.aggregate.value_arguments();
        let expected = value_arguments + self.descriptors.len();
        if args.len() != expected {
            return Err(Error::wrong_argument_count(self.aggregate, expected, args.len()));
        }
        let (values, aid_values) = args.split_at(value_arguments);
        let aids = self.make_aids(aid_values)?;
        match (&mut self.kind, values) {
            (StateKind::Count(state), []) => state.transition(&aids),
            (StateKind::Count(state), [value]) => {
                if !value.is_null() {
                    state.transition(&aids)
                }
            }
            (StateKind::CountDistinct(state), [value]) => state.transition(value, &aids),
            (StateKind::LowCount(state), []) => state.transition(&aids),
            _ => return Err(Error::wrong_argument_count(self.aggregate, expected, args.len())),
        }
        Ok(())
    }

    /// Combine a partial state computed on other rows of the same bucket
    pub fn merge(&mut self, other: &AggregateState) -> Result<()> {
        match (&mut self.kind, &other.kind) {
            (StateKind::Count(state), StateKind::Count(other_state))
                if self.aggregate == other.aggregate =>
            {
                state.merge(other_state)
            }
            (StateKind::CountDistinct(state), StateKind::CountDistinct(other_state)) => {
                state.merge(other_state)
            }
            (StateKind::LowCount(state), StateKind::LowCount(other_state)) => {
                state.merge(other_state)
            }
            _ => return Err(Error::mismatched_states(other.aggregate, self.aggregate)),
        }
        Ok(())
    }

    /// The per AID column count results, if the aggregate is a count
    pub fn count_results(&self, bucket_seed: Seed, config: &Config) -> Option<Vec<CountResult>> {
        match &self.kind {
            StateKind::Count(state) => Some(state.count_results(bucket_seed, config)),
            StateKind::CountDistinct(state) => Some(state.count_results(bucket_seed, config)),
            StateKind::LowCount(_) => None,
        }
    }

    /// The published value of the bucket
    pub fn finalize(&self, bucket_seed: Seed, config: &Config) -> Value {
        match &self.kind {
            StateKind::Count(state) => Value::integer(state.finalize(bucket_seed, config)),
            StateKind::CountDistinct(state) => Value::integer(state.finalize(bucket_seed, config)),
            StateKind::LowCount(state) => Value::boolean(state.finalize(config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integer_aid() -> AidDescriptor {
        AidDescriptor::from_data_type(DataType::Integer).unwrap()
    }

    #[test]
    fn test_names() {
        for aggregate in AnonAggregate::ALL {
            assert_eq!(AnonAggregate::from_name(aggregate.name()), Some(aggregate));
        }
        assert_eq!(AnonAggregate::from_name("LOW_COUNT"), Some(AnonAggregate::LowCount));
        assert_eq!(AnonAggregate::from_name("count"), None);
    }

    #[test]
    fn test_count_star() {
        let config = Config::default();
        let mut state = AggregateState::new(AnonAggregate::CountStar, &[integer_aid()], &config);
        for aid in 0..100 {
            state.transition(&[Value::integer(aid % 20)]).unwrap();
        }
        let result = state.finalize(1, &config);
        println!("anon_count_star = {result}");
        let count = result.as_i64().unwrap();
        assert!((95..=105).contains(&count));
        assert!(state.transition(&[]).is_err());
        assert!(state.transition(&[Value::text("x")]).is_err());
    }

    #[test]
    fn test_count_value_skips_nulls() {
        let config = Config::default();
        let mut with_nulls =
            AggregateState::new(AnonAggregate::CountValue, &[integer_aid()], &config);
        let mut without_nulls = with_nulls.clone();
        for aid in 0..30 {
            with_nulls.transition(&[Value::integer(1), Value::integer(aid)]).unwrap();
            without_nulls.transition(&[Value::integer(1), Value::integer(aid)]).unwrap();
            with_nulls.transition(&[Value::null(), Value::integer(aid)]).unwrap();
        }
        assert_eq!(with_nulls, without_nulls);
    }

    #[test]
    fn test_low_count() {
        let config = Config::default();
        let mut state = AggregateState::new(AnonAggregate::LowCount, &[integer_aid()], &config);
        state.transition(&[Value::integer(1)]).unwrap();
        state.transition(&[Value::null()]).unwrap();
        assert_eq!(state.finalize(0, &config), Value::boolean(true));
        state.transition(&[Value::integer(2)]).unwrap();
        assert_eq!(state.finalize(0, &config), Value::boolean(false));
    }

    #[test]
    fn test_merge() {
        let config = Config::default();
        let descriptors = [integer_aid()];
        let mut full = AggregateState::new(AnonAggregate::CountDistinct, &descriptors, &config);
        let mut left = full.clone();
        let mut right = full.clone();
        for i in 0..50i64 {
            let args = [Value::integer(i % 13), Value::integer(i % 9)];
            full.transition(&args).unwrap();
            let partial = if i < 20 { &mut left } else { &mut right };
            partial.transition(&args).unwrap();
        }
        left.merge(&right).unwrap();
        assert_eq!(left.finalize(5, &config), full.finalize(5, &config));
        let low_count = AggregateState::new(AnonAggregate::LowCount, &descriptors, &config);
        assert!(left.merge(&low_count).is_err());
        let count_star = AggregateState::new(AnonAggregate::CountStar, &descriptors, &config);
        let mut count_value = AggregateState::new(AnonAggregate::CountValue, &descriptors, &config);
        assert!(count_value.merge(&count_star).is_err());
    }

    #[test]
    fn test_multiple_aid_columns() {
        let config = Config::default();
        let text_aid = AidDescriptor::from_data_type(DataType::Text).unwrap();
        let mut state =
            AggregateState::new(AnonAggregate::CountStar, &[integer_aid(), text_aid], &config);
        for i in 0..40 {
            state
                .transition(&[Value::integer(i), Value::text(format!("device {}", i % 10))])
                .unwrap();
        }
        let results = state.count_results(9, &config).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.true_count == 40 && !r.not_enough_aidvs));
        let count = state.finalize(9, &config).as_i64().unwrap();
        assert!((30..=45).contains(&count));
    }
}
