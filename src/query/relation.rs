//! # Tables, AID columns and the catalog
//!
//! The catalog maps qualified table paths to tables.
//! Suffixes of paths are valid keys when non-ambiguous,
//! so `events` finds `public.events`.
//!

use super::{Error, Result};
use crate::{aggregation::AidDescriptor, value::DataType};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, data_type: DataType) -> Self {
        Column {
            name: name.into(),
            data_type,
        }
    }
}

/// A column whose values name a protected entity
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymizationId {
    /// 1-based position of the column in its table
    pub attno: usize,
    pub name: String,
    pub data_type: DataType,
}

impl AnonymizationId {
    pub fn descriptor(&self) -> Result<AidDescriptor> {
        AidDescriptor::from_data_type(self.data_type).ok_or_else(|| {
            Error::not_supported(format!("AID of type {}", self.data_type))
        })
    }
}

/// A base table, whether it is sensitive, and the names of its AID columns
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub path: Vec<String>,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub aid_columns: Vec<String>,
}

impl Table {
    pub fn new<P: Path>(path: P, columns: Vec<Column>) -> Self {
        Table {
            path: path.path(),
            columns,
            sensitive: false,
            aid_columns: vec![],
        }
    }

    /// Mark the table as sensitive, with or without AID columns
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Declare the AID columns of the table, in order. The table becomes sensitive.
    pub fn with_aids<S: Into<String>, I: IntoIterator<Item = S>>(mut self, aids: I) -> Self {
        self.aid_columns = aids.into_iter().map(Into::into).collect();
        self.sensitive()
    }

    /// The unqualified table name
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// 1-based position of a column
    pub fn attno(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
            .map(|index| index + 1)
    }

    pub fn column(&self, attno: usize) -> Option<&Column> {
        attno.checked_sub(1).and_then(|index| self.columns.get(index))
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive || !self.aid_columns.is_empty()
    }

    /// The table as a sensitive relation, possibly without AID columns
    pub fn sensitive_relation(&self) -> Result<Option<SensitiveRelation>> {
        if !self.is_sensitive() {
            return Ok(None);
        }
        let aid_columns = self
            .aid_columns
            .iter()
            .map(|name| {
                let attno = self
                    .attno(name)
                    .ok_or_else(|| Error::other(format!("Unknown AID column {name} in {self}")))?;
                let column = &self.columns[attno - 1];
                Ok(AnonymizationId {
                    attno,
                    name: column.name.clone(),
                    data_type: column.data_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(SensitiveRelation {
            path: self.path.clone(),
            aid_columns,
        }))
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.join("."))
    }
}

/// A relation and its ordered AID columns
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SensitiveRelation {
    pub path: Vec<String>,
    pub aid_columns: Vec<AnonymizationId>,
}

/// A trait Path to manage conversions
pub trait Path {
    fn path(self) -> Vec<String>;
}

impl Path for &str {
    fn path(self) -> Vec<String> {
        self.split('.').map(str::to_string).collect()
    }
}

impl Path for String {
    fn path(self) -> Vec<String> {
        self.as_str().path()
    }
}

impl<const N: usize> Path for [&str; N] {
    fn path(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl Path for &[String] {
    fn path(self) -> Vec<String> {
        self.to_vec()
    }
}

impl Path for Vec<String> {
    fn path(self) -> Vec<String> {
        self
    }
}

/// How many times is the element
enum Found<T> {
    Zero,
    One(T),
    More,
}

fn is_suffix_of(left: &[String], right: &[String]) -> bool {
    left.len() <= right.len()
        && left
            .iter()
            .rev()
            .zip(right.iter().rev())
            .all(|(s, p)| s.eq_ignore_ascii_case(p))
}

/// The tables visible to queries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog(BTreeMap<Vec<String>, Table>);

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn with(mut self, table: Table) -> Self {
        self.insert(table);
        self
    }

    pub fn insert(&mut self, table: Table) {
        self.0.insert(table.path.clone(), table);
    }

    /// Look a table up by its path or a non-ambiguous suffix of it
    pub fn get(&self, path: &[String]) -> Option<&Table> {
        self.0.get(path).or_else(|| {
            match self
                .0
                .iter()
                .fold(Found::Zero, |found, (qualified_path, table)| {
                    if is_suffix_of(path, qualified_path) {
                        match found {
                            Found::Zero => Found::One(table),
                            _ => Found::More,
                        }
                    } else {
                        found
                    }
                }) {
                Found::One(table) => Some(table),
                Found::Zero | Found::More => None,
            }
        })
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.0.values()
    }

    /// All sensitive tables
    pub fn sensitive_relations(&self) -> Result<Vec<SensitiveRelation>> {
        self.tables()
            .filter_map(|table| table.sensitive_relation().transpose())
            .collect()
    }
}

impl FromIterator<Table> for Catalog {
    fn from_iter<T: IntoIterator<Item = Table>>(iter: T) -> Self {
        Catalog(iter.into_iter().map(|t| (t.path.clone(), t)).collect())
    }
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tables().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Table {
        Table::new(
            "public.events",
            vec![
                Column::new("user_id", DataType::Integer),
                Column::new("action", DataType::Text),
                Column::new("device", DataType::Text),
            ],
        )
        .with_aids(["user_id", "device"])
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = Catalog::new()
            .with(events())
            .with(Table::new("public.items", vec![]))
            .with(Table::new("archive.items", vec![]));
        println!("{catalog}");
        assert_eq!(catalog.get(&"events".path()).unwrap().name(), "events");
        assert_eq!(catalog.get(&"public.events".path()).unwrap().name(), "events");
        assert!(catalog.get(&"public.items".path()).is_some());
        // Ambiguous
        assert!(catalog.get(&"items".path()).is_none());
        assert!(catalog.get(&"users".path()).is_none());
    }

    #[test]
    fn test_sensitive_relation() {
        let relation = events().sensitive_relation().unwrap().unwrap();
        assert_eq!(relation.aid_columns.len(), 2);
        assert_eq!(relation.aid_columns[0].attno, 1);
        assert_eq!(relation.aid_columns[1].attno, 3);
        assert!(relation.aid_columns[1].descriptor().unwrap().is_hash());
        let table = Table::new("t", vec![Column::new("x", DataType::Float)]).with_aids(["x"]);
        let relation = table.sensitive_relation().unwrap().unwrap();
        assert!(relation.aid_columns[0].descriptor().is_err());
        assert!(Table::new("t", vec![]).with_aids(["y"]).sensitive_relation().is_err());
        assert!(Table::new("t", vec![]).sensitive_relation().unwrap().is_none());
        // Sensitive without AID columns
        let table = Table::new("t", vec![Column::new("name", DataType::Text)]).sensitive();
        assert!(table.is_sensitive());
        let relation = table.sensitive_relation().unwrap().unwrap();
        assert!(relation.aid_columns.is_empty());
        let catalog = Catalog::new().with(table).with(Table::new("u", vec![]));
        assert_eq!(catalog.sensitive_relations().unwrap(), vec![relation]);
    }
}
