//! # Values flowing through anonymizing queries
//!
//! Grouping labels, AIDs and aggregate results are all `Value`s.
//! Values are totally ordered and hashable (floats by their total order)
//! so that they can be used as bucket keys.
//!

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{cmp, error, fmt, hash, result};

// Error handling

/// The errors values can lead to
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Conversion(String),
    Other(String),
}

impl Error {
    pub fn conversion(value: impl fmt::Display, data_type: impl fmt::Display) -> Error {
        Error::Conversion(format!("Cannot convert {} to {}", value, data_type))
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Conversion(desc) => writeln!(f, "Conversion: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

/// The types a `Value` can have
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
}

impl DataType {
    /// Integers and floats are normalized the same way when seeding
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "boolean"),
            DataType::Integer => write!(f, "integer"),
            DataType::Float => write!(f, "float"),
            DataType::Text => write!(f, "text"),
            DataType::Date => write!(f, "date"),
        }
    }
}

/// A typed value
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn null() -> Value {
        Value::Null
    }

    pub fn boolean(b: bool) -> Value {
        Value::Boolean(b)
    }

    pub fn integer(i: i64) -> Value {
        Value::Integer(i)
    }

    pub fn float(f: f64) -> Value {
        Value::Float(f)
    }

    pub fn text<S: Into<String>>(s: S) -> Value {
        Value::Text(s.into())
    }

    pub fn date(d: NaiveDate) -> Value {
        Value::Date(d)
    }

    /// The type of the value, `None` for NULL
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Float(_) => Some(DataType::Float),
            Value::Text(_) => Some(DataType::Text),
            Value::Date(_) => Some(DataType::Date),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The canonical textual form hashed into seeds.
    /// Numbers go through the shortest decimal that round-trips their `f64` value,
    /// so `1` and `1.0` produce the same material.
    pub fn to_seed_material(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Boolean(b) => if *b { "t" } else { "f" }.to_string(),
            Value::Integer(i) => shortest_decimal(*i as f64),
            Value::Float(f) => shortest_decimal(*f),
            value => value.to_string(),
        }
    }

    /// Cast the value into another type
    pub fn cast(&self, data_type: DataType) -> Result<Value> {
        match (self, data_type) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Boolean(b), DataType::Boolean) => Ok(Value::Boolean(*b)),
            (Value::Boolean(b), DataType::Integer) => Ok(Value::Integer(*b as i64)),
            (Value::Integer(i), DataType::Integer) => Ok(Value::Integer(*i)),
            (Value::Integer(i), DataType::Float) => Ok(Value::Float(*i as f64)),
            (Value::Integer(i), DataType::Boolean) => Ok(Value::Boolean(*i != 0)),
            (Value::Float(f), DataType::Float) => Ok(Value::Float(*f)),
            (Value::Float(f), DataType::Integer) if f.is_finite() => {
                Ok(Value::Integer(f.round() as i64))
            }
            (Value::Text(s), DataType::Integer) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| Error::conversion(self, data_type)),
            (Value::Text(s), DataType::Float) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Error::conversion(self, data_type)),
            (Value::Text(s), DataType::Boolean) => match s.trim().to_lowercase().as_str() {
                "t" | "true" | "yes" | "on" | "1" => Ok(Value::Boolean(true)),
                "f" | "false" | "no" | "off" | "0" => Ok(Value::Boolean(false)),
                _ => Err(Error::conversion(self, data_type)),
            },
            (Value::Text(s), DataType::Date) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| Error::conversion(self, data_type)),
            (Value::Date(d), DataType::Date) => Ok(Value::Date(*d)),
            (value, DataType::Text) => Ok(Value::Text(value.to_string())),
            (value, data_type) => Err(Error::conversion(value, data_type)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Integer(_) => 1,
            Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
            // NULLs sort last
            Value::Null => 5,
        }
    }
}

/// Shortest decimal representation which parses back to the same `f64`
pub fn shortest_decimal(x: f64) -> String {
    // `Display` for f64 already emits the shortest round-tripping digits
    if x == 0. {
        "0".to_string()
    } else {
        format!("{}", x)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match (self, other) {
            (Value::Boolean(l), Value::Boolean(r)) => l.cmp(r),
            (Value::Integer(l), Value::Integer(r)) => l.cmp(r),
            (Value::Float(l), Value::Float(r)) => l.total_cmp(r),
            (Value::Text(l), Value::Text(r)) => l.cmp(r),
            (Value::Date(l), Value::Date(r)) => l.cmp(r),
            (l, r) => l.rank().cmp(&r.rank()),
        }
    }
}

impl hash::Hash for Value {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Date(d) => d.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_seed_material() {
        assert_eq!(Value::integer(1).to_seed_material(), "1");
        assert_eq!(Value::float(1.).to_seed_material(), "1");
        assert_eq!(Value::float(0.1).to_seed_material(), "0.1");
        assert_eq!(Value::float(-0.).to_seed_material(), "0");
        assert_eq!(Value::float(2.5).to_seed_material(), "2.5");
        assert_eq!(Value::null().to_seed_material(), "NULL");
        assert_eq!(Value::text("click").to_seed_material(), "click");
        assert_eq!(Value::boolean(true).to_seed_material(), "t");
        assert_eq!(
            Value::date(NaiveDate::from_ymd_opt(2021, 3, 4).unwrap()).to_seed_material(),
            "2021-03-04"
        );
    }

    #[test]
    fn test_ordering() {
        let values: BTreeSet<Value> = [
            Value::null(),
            Value::float(2.5),
            Value::float(f64::NAN),
            Value::integer(3),
            Value::text("a"),
            Value::integer(-1),
        ]
        .into_iter()
        .collect();
        println!("{:?}", values);
        assert_eq!(values.len(), 6);
        assert_eq!(values.first(), Some(&Value::integer(-1)));
        assert_eq!(values.last(), Some(&Value::null()));
        assert_eq!(Value::float(f64::NAN), Value::float(f64::NAN));
    }

    #[test]
    fn test_cast() {
        assert_eq!(Value::text(" 12 ").cast(DataType::Integer).unwrap(), Value::integer(12));
        assert_eq!(Value::integer(3).cast(DataType::Float).unwrap(), Value::float(3.));
        assert_eq!(Value::float(2.6).cast(DataType::Integer).unwrap(), Value::integer(3));
        assert_eq!(Value::integer(3).cast(DataType::Text).unwrap(), Value::text("3"));
        assert_eq!(Value::null().cast(DataType::Date).unwrap(), Value::null());
        assert!(Value::text("abc").cast(DataType::Integer).is_err());
    }
}
