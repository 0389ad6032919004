//! # Logical queries
//!
//! A bound `SELECT` statement: a range table, a target list, a grouping clause
//! and expressions referencing the range table by position.
//! Anonymizing queries are validated, rewritten and linked at this level,
//! before any physical planning happens.
//!

pub mod link;
pub mod relation;
pub mod rewrite;
pub mod seed;
pub mod validation;

use crate::{
    aggregation::{self, AnonAggregate},
    config,
    value::{DataType, Value},
};
use itertools::Itertools;
use std::{error, fmt, result};

pub use link::{AggrefLink, AnonQueryLinks};
pub use relation::{AnonymizationId, Catalog, Column, SensitiveRelation, Table};
pub use rewrite::AnonymizationContext;

// Error handling

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Unsupported(String),
    NoAidFound(String),
    SeedMaterialTooLong(String),
    UnsupportedConstant(String),
    MismatchedAggregate(String),
    MismatchedContexts(String),
    MismatchedBuckets(String),
    InvalidLink(String),
    Other(String),
}

impl Error {
    /// A construct outside of the supported subset
    pub fn not_supported(feature: impl fmt::Display) -> Error {
        Error::Unsupported(format!("Feature '{feature}' is not currently supported."))
    }
    pub fn unsupported(desc: impl fmt::Display) -> Error {
        Error::Unsupported(desc.to_string())
    }
    pub fn no_aid_found() -> Error {
        Error::NoAidFound("No AID found in target relations.".to_string())
    }
    pub fn seed_material_too_long() -> Error {
        Error::SeedMaterialTooLong("Bucket seed material too long!".to_string())
    }
    pub fn unsupported_constant(value: impl fmt::Display) -> Error {
        Error::UnsupportedConstant(format!(
            "Unsupported constant type used in bucket definition! ({value})"
        ))
    }
    pub fn mismatched_aggregate() -> Error {
        Error::MismatchedAggregate("Mismatched aggregate OIDs during plan rewrite.".to_string())
    }
    pub fn mismatched_contexts() -> Error {
        Error::MismatchedContexts("Mismatched anonymizing subqueries in plan.".to_string())
    }
    pub fn mismatched_buckets() -> Error {
        Error::MismatchedBuckets("Grouping keys changed during planning.".to_string())
    }
    pub fn invalid_link(location: Location) -> Error {
        Error::InvalidLink(format!("No aggregate link at location {location}"))
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unsupported(desc) => writeln!(f, "Unsupported: {}", desc),
            Error::NoAidFound(desc) => writeln!(f, "NoAidFound: {}", desc),
            Error::SeedMaterialTooLong(desc) => writeln!(f, "SeedMaterialTooLong: {}", desc),
            Error::UnsupportedConstant(desc) => writeln!(f, "UnsupportedConstant: {}", desc),
            Error::MismatchedAggregate(desc) => writeln!(f, "MismatchedAggregate: {}", desc),
            Error::MismatchedContexts(desc) => writeln!(f, "MismatchedContexts: {}", desc),
            Error::MismatchedBuckets(desc) => writeln!(f, "MismatchedBuckets: {}", desc),
            Error::InvalidLink(desc) => writeln!(f, "InvalidLink: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl From<config::Error> for Error {
    fn from(err: config::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<aggregation::Error> for Error {
    fn from(err: aggregation::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl error::Error for Error {}
pub type Result<T> = result::Result<T, Error>;

/// Position of a node in the query text, reused as a link slot by anonymizing aggregates
pub type Location = i32;

pub const UNKNOWN_LOCATION: Location = -1;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CommandType {
    Select,
    Insert,
    Update,
    Delete,
    Utility,
}

/// A bound query
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub command_type: CommandType,
    pub range_table: Vec<RangeTableEntry>,
    pub target_list: Vec<TargetEntry>,
    pub where_clause: Option<Expr>,
    pub group_clause: Vec<SortGroupClause>,
    pub having_clause: Option<Expr>,
    pub sort_clause: Vec<SortClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub has_aggs: bool,
    pub has_ctes: bool,
    pub has_for_update: bool,
    pub has_sublinks: bool,
    pub has_target_srfs: bool,
    pub has_grouping_sets: bool,
    pub has_window_funcs: bool,
    pub has_distinct: bool,
    pub has_set_operations: bool,
}

impl Query {
    /// An empty `SELECT`
    pub fn select() -> Query {
        Query {
            command_type: CommandType::Select,
            range_table: vec![],
            target_list: vec![],
            where_clause: None,
            group_clause: vec![],
            having_clause: None,
            sort_clause: vec![],
            limit: None,
            offset: None,
            has_aggs: false,
            has_ctes: false,
            has_for_update: false,
            has_sublinks: false,
            has_target_srfs: false,
            has_grouping_sets: false,
            has_window_funcs: false,
            has_distinct: false,
            has_set_operations: false,
        }
    }

    /// Append a target entry, returns its 1-based position
    pub fn add_target(&mut self, expr: Expr, name: impl Into<String>, junk: bool) -> usize {
        let resno = self.target_list.len() + 1;
        self.target_list.push(TargetEntry {
            expr,
            resno,
            name: name.into(),
            sort_group_ref: None,
            junk,
        });
        resno
    }

    pub fn target(&self, sort_group_ref: usize) -> Option<&TargetEntry> {
        self.target_list
            .iter()
            .find(|entry| entry.sort_group_ref == Some(sort_group_ref))
    }

    /// The grouping expressions, in group clause order
    pub fn group_exprs(&self) -> Vec<&Expr> {
        self.group_clause
            .iter()
            .filter_map(|clause| self.target(clause.sort_group_ref))
            .map(|entry| &entry.expr)
            .collect()
    }

    /// Make `sort_group_ref` the grouping reference of a target entry and group by it
    pub fn add_group_clause(&mut self, resno: usize) {
        let Some(entry) = resno
            .checked_sub(1)
            .and_then(|index| self.target_list.get_mut(index))
        else {
            return;
        };
        let sort_group_ref = *entry.sort_group_ref.get_or_insert(resno);
        if self
            .group_clause
            .iter()
            .any(|clause| clause.sort_group_ref == sort_group_ref)
        {
            return;
        }
        let data_type = entry.expr.data_type();
        self.group_clause.push(SortGroupClause::new(sort_group_ref, data_type));
    }

    /// Top level expressions of the query, not descending into subqueries
    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        self.target_list
            .iter()
            .map(|entry| &entry.expr)
            .chain(self.where_clause.iter())
            .chain(self.having_clause.iter())
    }

    pub fn expressions_mut(&mut self) -> impl Iterator<Item = &mut Expr> {
        self.target_list
            .iter_mut()
            .map(|entry| &mut entry.expr)
            .chain(self.where_clause.iter_mut())
            .chain(self.having_clause.iter_mut())
    }

    /// The base relation a variable reads from
    pub fn relation_of(&self, var: &Var) -> Option<&Table> {
        match &self.range_table.get(var.rte_index)?.kind {
            RteKind::Relation(table) => Some(table),
            _ => None,
        }
    }

    /// All aggregate calls of the query
    pub fn aggregates(&self) -> Vec<&Aggref> {
        self.expressions().flat_map(|expr| expr.aggregates()).collect()
    }

    /// The non-junk output names
    pub fn output_names(&self) -> Vec<&str> {
        self.target_list
            .iter()
            .filter(|entry| !entry.junk)
            .map(|entry| entry.name.as_str())
            .collect()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELECT {}",
            self.target_list
                .iter()
                .map(|entry| {
                    if entry.junk {
                        format!("[{} AS {}]", entry.expr, entry.name)
                    } else {
                        format!("{} AS {}", entry.expr, entry.name)
                    }
                })
                .join(", ")
        )?;
        if !self.range_table.is_empty() {
            write!(f, " FROM {}", self.range_table.iter().join(", "))?;
        }
        if let Some(where_clause) = &self.where_clause {
            write!(f, " WHERE {where_clause}")?;
        }
        if !self.group_clause.is_empty() {
            write!(f, " GROUP BY {}", self.group_exprs().iter().join(", "))?;
        }
        if let Some(having_clause) = &self.having_clause {
            write!(f, " HAVING {having_clause}")?;
        }
        if !self.sort_clause.is_empty() {
            write!(
                f,
                " ORDER BY {}",
                self.sort_clause
                    .iter()
                    .map(|clause| format!(
                        "{}{}",
                        clause.resno,
                        if clause.descending { " DESC" } else { "" }
                    ))
                    .join(", ")
            )?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

/// An item of the FROM clause
#[derive(Clone, Debug, PartialEq)]
pub struct RangeTableEntry {
    pub alias: String,
    pub kind: RteKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RteKind {
    Relation(Table),
    Subquery(Box<Query>),
    Join,
    Function(String),
}

impl RangeTableEntry {
    pub fn relation(table: Table) -> Self {
        RangeTableEntry {
            alias: table.name().to_string(),
            kind: RteKind::Relation(table),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// The name of the column at `attno`
    pub fn column_name(&self, attno: usize) -> Option<&str> {
        match &self.kind {
            RteKind::Relation(table) => table.column(attno).map(|c| c.name.as_str()),
            RteKind::Subquery(query) => query
                .target_list
                .get(attno.checked_sub(1)?)
                .map(|entry| entry.name.as_str()),
            RteKind::Join | RteKind::Function(_) => None,
        }
    }
}

impl fmt::Display for RangeTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RteKind::Relation(table) => write!(f, "{table} AS {}", self.alias),
            RteKind::Subquery(query) => write!(f, "({query}) AS {}", self.alias),
            RteKind::Join => write!(f, "JOIN {}", self.alias),
            RteKind::Function(name) => write!(f, "{name}() AS {}", self.alias),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetEntry {
    pub expr: Expr,
    /// 1-based position in the target list
    pub resno: usize,
    pub name: String,
    /// Set when the entry is referenced by the group clause
    pub sort_group_ref: Option<usize>,
    /// Junk entries are computed but not returned
    pub junk: bool,
}

/// A grouping key, with what is needed to compare its values
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortGroupClause {
    pub sort_group_ref: usize,
    pub data_type: Option<DataType>,
    pub nulls_first: bool,
    pub hashable: bool,
}

impl SortGroupClause {
    pub fn new(sort_group_ref: usize, data_type: Option<DataType>) -> Self {
        SortGroupClause {
            sort_group_ref,
            data_type,
            nulls_first: false,
            hashable: true,
        }
    }
}

/// An ordering key, referencing a target entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortClause {
    pub resno: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortClause {
    /// NULLs come last in ascending order and first in descending order by default
    pub fn new(resno: usize, descending: bool, nulls_first: Option<bool>) -> Self {
        SortClause {
            resno,
            descending,
            nulls_first: nulls_first.unwrap_or(descending),
        }
    }
}

/// A column of a range table entry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Var {
    /// 0-based position in the range table
    pub rte_index: usize,
    /// 1-based column position
    pub attno: usize,
    pub name: String,
    pub data_type: DataType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

/// Aggregate functions as they appear in queries
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AggFunction {
    /// `count(*)`
    Count,
    /// `count(x)`
    CountAny,
    /// Any aggregate we do not anonymize
    Other(String),
    Anon(AnonAggregate),
}

impl AggFunction {
    pub fn anon_aggregate(&self) -> Option<AnonAggregate> {
        match self {
            AggFunction::Anon(aggregate) => Some(*aggregate),
            _ => None,
        }
    }
}

impl fmt::Display for AggFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggFunction::Count | AggFunction::CountAny => write!(f, "count"),
            AggFunction::Other(name) => write!(f, "{name}"),
            AggFunction::Anon(aggregate) => write!(f, "{aggregate}"),
        }
    }
}

/// An aggregate call
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Aggref {
    pub function: AggFunction,
    pub args: Vec<Expr>,
    pub star: bool,
    pub distinct: bool,
    pub location: Location,
}

impl Aggref {
    pub fn new(function: AggFunction, args: Vec<Expr>) -> Self {
        Aggref {
            function,
            args,
            star: false,
            distinct: false,
            location: UNKNOWN_LOCATION,
        }
    }

    pub fn count_star() -> Self {
        Aggref {
            star: true,
            ..Aggref::new(AggFunction::Count, vec![])
        }
    }

    pub fn data_type(&self) -> DataType {
        match &self.function {
            AggFunction::Anon(aggregate) => aggregate.result_type(),
            AggFunction::Count | AggFunction::CountAny => DataType::Integer,
            AggFunction::Other(name) if name == "avg" => DataType::Float,
            AggFunction::Other(_) => self
                .args
                .first()
                .and_then(Expr::data_type)
                .unwrap_or(DataType::Integer),
        }
    }
}

impl fmt::Display for Aggref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.star {
            write!(f, "{}(*)", self.function)
        } else if self.distinct {
            write!(f, "{}(DISTINCT {})", self.function, self.args.iter().join(", "))
        } else {
            write!(f, "{}({})", self.function, self.args.iter().join(", "))
        }
    }
}

/// A scalar expression
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Var(Var),
    Const {
        value: Value,
        location: Location,
    },
    Func {
        name: String,
        args: Vec<Expr>,
        data_type: DataType,
        location: Location,
    },
    Cast {
        arg: Box<Expr>,
        data_type: DataType,
    },
    Op {
        op: String,
        args: Vec<Expr>,
        data_type: DataType,
        location: Location,
    },
    Bool {
        op: BoolOp,
        args: Vec<Expr>,
    },
    NullTest {
        arg: Box<Expr>,
        negated: bool,
    },
    Aggref(Aggref),
}

impl Expr {
    pub fn var(
        rte_index: usize,
        attno: usize,
        name: impl Into<String>,
        data_type: DataType,
    ) -> Expr {
        Expr::Var(Var {
            rte_index,
            attno,
            name: name.into(),
            data_type,
        })
    }

    pub fn val<V: Into<Value>>(value: V) -> Expr {
        Expr::Const {
            value: value.into(),
            location: UNKNOWN_LOCATION,
        }
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>, data_type: DataType) -> Expr {
        Expr::Func {
            name: name.into(),
            args,
            data_type,
            location: UNKNOWN_LOCATION,
        }
    }

    pub fn op(op: impl Into<String>, args: Vec<Expr>, data_type: DataType) -> Expr {
        Expr::Op {
            op: op.into(),
            args,
            data_type,
            location: UNKNOWN_LOCATION,
        }
    }

    pub fn cast(arg: Expr, data_type: DataType) -> Expr {
        Expr::Cast {
            arg: Box::new(arg),
            data_type,
        }
    }

    /// The type of the expression, `None` for untyped NULLs
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Expr::Var(var) => Some(var.data_type),
            Expr::Const { value, .. } => value.data_type(),
            Expr::Func { data_type, .. }
            | Expr::Cast { data_type, .. }
            | Expr::Op { data_type, .. } => Some(*data_type),
            Expr::Bool { .. } | Expr::NullTest { .. } => Some(DataType::Boolean),
            Expr::Aggref(aggref) => Some(aggref.data_type()),
        }
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Var(_) | Expr::Const { .. } => vec![],
            Expr::Func { args, .. } | Expr::Op { args, .. } | Expr::Bool { args, .. } => {
                args.iter().collect()
            }
            Expr::Cast { arg, .. } | Expr::NullTest { arg, .. } => vec![arg.as_ref()],
            Expr::Aggref(aggref) => aggref.args.iter().collect(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Var(_) | Expr::Const { .. } => vec![],
            Expr::Func { args, .. } | Expr::Op { args, .. } | Expr::Bool { args, .. } => {
                args.iter_mut().collect()
            }
            Expr::Cast { arg, .. } | Expr::NullTest { arg, .. } => vec![arg.as_mut()],
            Expr::Aggref(aggref) => aggref.args.iter_mut().collect(),
        }
    }

    /// Iterate over the expression and its sub-expressions, parents first
    pub fn iter(&self) -> Iter<'_> {
        Iter { stack: vec![self] }
    }

    /// Apply `f` to every sub-expression, children first
    pub fn for_each_mut<F: FnMut(&mut Expr)>(&mut self, f: &mut F) {
        for child in self.children_mut() {
            child.for_each_mut(f);
        }
        f(self)
    }

    /// Apply `f` to every sub-expression, children first, stopping at the first error
    pub fn try_for_each_mut<E, F>(&mut self, f: &mut F) -> result::Result<(), E>
    where
        F: FnMut(&mut Expr) -> result::Result<(), E>,
    {
        for child in self.children_mut() {
            child.try_for_each_mut(f)?;
        }
        f(self)
    }

    /// True when the expression reads a column
    pub fn has_var(&self) -> bool {
        self.iter().any(|expr| matches!(expr, Expr::Var(_)))
    }

    pub fn has_aggregate(&self) -> bool {
        self.iter().any(|expr| matches!(expr, Expr::Aggref(_)))
    }

    pub fn aggregates(&self) -> Vec<&Aggref> {
        self.iter()
            .filter_map(|expr| match expr {
                Expr::Aggref(aggref) => Some(aggref),
                _ => None,
            })
            .collect()
    }
}

/// Pre-order iterator over an expression tree
pub struct Iter<'a> {
    stack: Vec<&'a Expr>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Expr;

    fn next(&mut self) -> Option<Self::Item> {
        let expr = self.stack.pop()?;
        self.stack.extend(expr.children().into_iter().rev());
        Some(expr)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(var) => write!(f, "{}", var.name),
            Expr::Const { value, .. } => match value {
                Value::Text(s) => write!(f, "'{s}'"),
                value => write!(f, "{value}"),
            },
            Expr::Func { name, args, .. } => write!(f, "{name}({})", args.iter().join(", ")),
            Expr::Cast { arg, data_type } => write!(f, "CAST({arg} AS {data_type})"),
            Expr::Op { op, args, .. } => match args.as_slice() {
                [left, right] => write!(f, "({left} {op} {right})"),
                args => write!(f, "{op}({})", args.iter().join(", ")),
            },
            Expr::Bool { op: BoolOp::Not, args } => write!(f, "(NOT {})", args.iter().join(", ")),
            Expr::Bool { op, args } => {
                let op = if *op == BoolOp::And { " AND " } else { " OR " };
                write!(f, "({})", args.iter().join(op))
            }
            Expr::NullTest { arg, negated } => {
                write!(f, "({arg} IS {}NULL)", if *negated { "NOT " } else { "" })
            }
            Expr::Aggref(aggref) => write!(f, "{aggref}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_id() -> Expr {
        Expr::var(0, 1, "user_id", DataType::Integer)
    }

    #[test]
    fn test_walk() {
        let expr = Expr::op(
            "+",
            vec![
                Expr::func("round", vec![user_id(), Expr::val(2)], DataType::Float),
                Expr::Aggref(Aggref::count_star()),
            ],
            DataType::Float,
        );
        println!("{expr}");
        assert_eq!(expr.iter().count(), 5);
        assert!(expr.has_var());
        assert!(expr.has_aggregate());
        assert_eq!(expr.aggregates(), vec![&Aggref::count_star()]);
        assert!(!Expr::val(1).has_var());
        let names: Vec<String> = expr.iter().map(|e| e.to_string()).collect();
        assert_eq!(names[1], "round(user_id, 2)");
    }

    #[test]
    fn test_try_for_each_mut() {
        let mut expr = Expr::func("lower", vec![Expr::val("A"), Expr::val("B")], DataType::Text);
        let mut visited = 0;
        expr.try_for_each_mut(&mut |e| -> Result<()> {
            if let Expr::Const { location, .. } = e {
                *location = 7;
            }
            visited += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(visited, 3);
        assert!(expr
            .iter()
            .all(|e| !matches!(e, Expr::Const { location, .. } if *location != 7)));
    }

    #[test]
    fn test_for_each_mut() {
        let mut expr = Expr::op("||", vec![user_id(), Expr::val("x")], DataType::Text);
        let mut order = vec![];
        expr.for_each_mut(&mut |e| {
            if let Expr::Var(var) = e {
                var.name = "renamed".to_string();
            }
            order.push(matches!(e, Expr::Op { .. }));
        });
        // Children first
        assert_eq!(order, vec![false, false, true]);
        assert!(expr
            .iter()
            .all(|e| !matches!(e, Expr::Var(var) if var.name != "renamed")));
    }

    #[test]
    fn test_group_clause() {
        let mut query = Query::select();
        let resno = query.add_target(user_id(), "user_id", false);
        query.add_target(Expr::Aggref(Aggref::count_star()), "count", false);
        query.add_group_clause(resno);
        query.add_group_clause(resno);
        assert_eq!(query.group_clause.len(), 1);
        assert_eq!(query.group_exprs(), vec![&user_id()]);
        assert_eq!(query.aggregates().len(), 1);
        assert_eq!(query.output_names(), vec!["user_id", "count"]);
        println!("{query}");
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            Error::not_supported("WITH").to_string(),
            "Unsupported: Feature 'WITH' is not currently supported.\n"
        );
        assert!(Error::no_aid_found().to_string().contains("No AID found in target relations."));
    }
}
