//! # Binding
//!
//! Resolves a parsed `ast::Query` against a `Catalog` into a logical `Query`:
//! FROM items become range table entries, identifiers become `Var`s,
//! literals become constants and aggregate calls become `Aggref`s.
//!
//! Constructs the logical model cannot represent are rejected here.
//! Constructs it can represent but the engine does not support are only flagged,
//! validation and planning decide what to do with them.
//!

use super::{Error, Result};
use crate::{
    ast,
    query::{
        self, AggFunction, Aggref, BoolOp, Catalog, Expr, Query, RangeTableEntry, RteKind,
        SortClause, TargetEntry,
    },
    value::{DataType, Value},
};
use itertools::Itertools;
use std::fmt;

/// Aggregate functions known to the binder
const AGGREGATE_FUNCTIONS: [&str; 7] = ["count", "sum", "avg", "min", "max", "stddev", "variance"];
/// Set returning functions known to the binder
const SET_RETURNING_FUNCTIONS: [&str; 2] = ["generate_series", "unnest"];
/// The output name of unnamed expressions
const UNNAMED_COLUMN: &str = "?column?";

fn not_supported(feature: impl fmt::Display) -> Error {
    Error::Query(query::Error::not_supported(feature))
}

/// Unquoted identifiers are case insensitive
fn ident_name(ident: &ast::Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn object_name(name: &ast::ObjectName) -> Vec<String> {
    name.0.iter().map(ident_name).collect()
}

/// Map a SQL type to a value type
pub fn data_type(data_type: &ast::DataType) -> Result<DataType> {
    let name = data_type.to_string().to_uppercase();
    let base = name.split('(').next().unwrap_or_default().trim();
    match base {
        "BOOL" | "BOOLEAN" => Ok(DataType::Boolean),
        "INT" | "INTEGER" | "INT2" | "INT4" | "INT8" | "SMALLINT" | "BIGINT" | "TINYINT" => {
            Ok(DataType::Integer)
        }
        "FLOAT" | "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" | "NUMERIC"
        | "DECIMAL" => Ok(DataType::Float),
        "TEXT" | "STRING" | "VARCHAR" | "CHAR" | "CHARACTER" | "CHARACTER VARYING" => {
            Ok(DataType::Text)
        }
        "DATE" => Ok(DataType::Date),
        _ => Err(not_supported(format!("type {data_type}"))),
    }
}

/// The type of a scalar function call
fn function_type(name: &str, args: &[Expr]) -> DataType {
    let first = args.first().and_then(Expr::data_type);
    match name {
        "round" | "trunc" | "floor" | "ceil" | "ceiling" => match first {
            Some(DataType::Float) => DataType::Float,
            _ => DataType::Integer,
        },
        "width_bucket" | "length" | "char_length" => DataType::Integer,
        "substring" | "lower" | "upper" => DataType::Text,
        "date_trunc" => DataType::Date,
        _ => first.unwrap_or(DataType::Text),
    }
}

fn bind_value(value: &ast::Value) -> Result<Value> {
    match value {
        ast::Value::Number(number, _) => number
            .parse::<i64>()
            .map(Value::Integer)
            .or_else(|_| number.parse::<f64>().map(Value::Float))
            .map_err(|_| Error::parsing_error(number)),
        ast::Value::SingleQuotedString(s) => Ok(Value::text(s.clone())),
        ast::Value::Boolean(b) => Ok(Value::Boolean(*b)),
        ast::Value::Null => Ok(Value::Null),
        value => Err(not_supported(format!("literal {value}"))),
    }
}

/// A non-negative LIMIT or OFFSET
fn bind_count(expr: &ast::Expr) -> Result<u64> {
    match expr {
        ast::Expr::Value(ast::Value::Number(number, _)) => {
            number.parse::<u64>().map_err(|_| Error::parsing_error(number))
        }
        expr => Err(not_supported(format!("LIMIT/OFFSET {expr}"))),
    }
}

/// The clause an expression is bound in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Clause {
    Select,
    Where,
    GroupBy,
    Having,
    OrderBy,
    /// Arguments of an aggregate call
    Aggregate,
}

impl Clause {
    fn allows_aggregates(&self) -> bool {
        matches!(self, Clause::Select | Clause::Having | Clause::OrderBy)
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Select => write!(f, "SELECT"),
            Clause::Where => write!(f, "WHERE"),
            Clause::GroupBy => write!(f, "GROUP BY"),
            Clause::Having => write!(f, "HAVING"),
            Clause::OrderBy => write!(f, "ORDER BY"),
            Clause::Aggregate => write!(f, "aggregate arguments"),
        }
    }
}

/// The columns a range table entry exposes
fn rte_columns(entry: &RangeTableEntry) -> Vec<(String, DataType)> {
    match &entry.kind {
        RteKind::Relation(table) => table
            .columns
            .iter()
            .map(|column| (column.name.clone(), column.data_type))
            .collect(),
        RteKind::Subquery(query) => query
            .target_list
            .iter()
            .filter(|entry| !entry.junk)
            .map(|entry| {
                (
                    entry.name.clone(),
                    entry.expr.data_type().unwrap_or(DataType::Text),
                )
            })
            .collect(),
        RteKind::Join | RteKind::Function(_) => vec![],
    }
}

/// Does a qualifier like `e` or `public.events` designate the entry
fn rte_matches(entry: &RangeTableEntry, qualifier: &[String]) -> bool {
    match qualifier {
        [name] if entry.alias.eq_ignore_ascii_case(name) => true,
        _ => match &entry.kind {
            RteKind::Relation(table) => {
                qualifier.len() <= table.path.len()
                    && table.path[table.path.len() - qualifier.len()..]
                        .iter()
                        .zip(qualifier)
                        .all(|(l, r)| l.eq_ignore_ascii_case(r))
            }
            _ => false,
        },
    }
}

/// The default output name of a select item
fn output_name(expr: &ast::Expr) -> String {
    match expr {
        ast::Expr::Identifier(ident) => ident_name(ident),
        ast::Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(ident_name)
            .unwrap_or_else(|| UNNAMED_COLUMN.to_string()),
        ast::Expr::Function(function) => function
            .name
            .0
            .last()
            .map(ident_name)
            .unwrap_or_else(|| UNNAMED_COLUMN.to_string()),
        ast::Expr::Nested(expr) => output_name(expr),
        ast::Expr::Substring { .. } => "substring".to_string(),
        ast::Expr::Ceil { .. } => "ceil".to_string(),
        ast::Expr::Floor { .. } => "floor".to_string(),
        _ => UNNAMED_COLUMN.to_string(),
    }
}

fn conjunction(left: Option<Expr>, right: Expr) -> Expr {
    match left {
        Some(left) => Expr::Bool {
            op: BoolOp::And,
            args: vec![left, right],
        },
        None => right,
    }
}

/// Bind a parsed query against a catalog
pub fn bind(query: &ast::Query, catalog: &Catalog) -> Result<Query> {
    Binder::new(catalog).bind_query(query)
}

/// Builds one query level, subqueries get their own binder
struct Binder<'a> {
    catalog: &'a Catalog,
    query: Query,
}

impl<'a> Binder<'a> {
    fn new(catalog: &'a Catalog) -> Self {
        Binder {
            catalog,
            query: Query::select(),
        }
    }

    fn bind_query(mut self, query: &ast::Query) -> Result<Query> {
        if query.with.is_some() {
            self.query.has_ctes = true;
            return Err(not_supported("WITH"));
        }
        if query.fetch.is_some() {
            return Err(not_supported("FETCH"));
        }
        self.query.has_for_update = !query.locks.is_empty();
        match query.body.as_ref() {
            ast::SetExpr::Select(select) => self.bind_select(select)?,
            ast::SetExpr::Query(inner)
                if query.order_by.is_empty() && query.limit.is_none() && query.offset.is_none() =>
            {
                let mut inner = Binder::new(self.catalog).bind_query(inner)?;
                inner.has_for_update |= self.query.has_for_update;
                return Ok(inner);
            }
            ast::SetExpr::SetOperation { .. } => {
                self.query.has_set_operations = true;
                return Err(not_supported("UNION/INTERSECT"));
            }
            ast::SetExpr::Insert(_) => {
                self.query.command_type = query::CommandType::Insert;
                return Ok(self.query);
            }
            ast::SetExpr::Update(_) => {
                self.query.command_type = query::CommandType::Update;
                return Ok(self.query);
            }
            body => return Err(not_supported(format!("query body {body}"))),
        }
        self.bind_order_by(&query.order_by)?;
        self.query.limit = query.limit.as_ref().map(bind_count).transpose()?;
        self.query.offset = query
            .offset
            .as_ref()
            .map(|offset| bind_count(&offset.value))
            .transpose()?;
        log::debug!("Bound query: {}", self.query);
        Ok(self.query)
    }

    fn bind_select(&mut self, select: &ast::Select) -> Result<()> {
        if select.top.is_some() {
            return Err(not_supported("TOP"));
        }
        if select.into.is_some() {
            return Err(not_supported("INTO"));
        }
        if !select.lateral_views.is_empty() {
            return Err(not_supported("LATERAL VIEW"));
        }
        if !select.cluster_by.is_empty()
            || !select.distribute_by.is_empty()
            || !select.sort_by.is_empty()
        {
            return Err(not_supported("CLUSTER/DISTRIBUTE/SORT BY"));
        }
        if !select.named_window.is_empty() {
            self.query.has_window_funcs = true;
            return Err(not_supported("WINDOW"));
        }
        if select.qualify.is_some() {
            return Err(not_supported("QUALIFY"));
        }
        match &select.distinct {
            None => {}
            Some(ast::Distinct::Distinct) => self.query.has_distinct = true,
            Some(ast::Distinct::On(_)) => return Err(not_supported("DISTINCT ON")),
        }
        for table_with_joins in &select.from {
            self.bind_table_with_joins(table_with_joins)?;
        }
        if let Some(selection) = &select.selection {
            let expr = self.bind_expr(selection, Clause::Where)?;
            self.query.where_clause = Some(conjunction(self.query.where_clause.take(), expr));
        }
        for item in &select.projection {
            self.bind_select_item(item)?;
        }
        match &select.group_by {
            ast::GroupByExpr::All => return Err(not_supported("GROUP BY ALL")),
            ast::GroupByExpr::Expressions(exprs) => {
                for expr in exprs {
                    self.bind_group_by(expr)?;
                }
            }
        }
        if let Some(having) = &select.having {
            self.query.having_clause = Some(self.bind_expr(having, Clause::Having)?);
        }
        Ok(())
    }

    // FROM

    fn bind_table_with_joins(&mut self, table_with_joins: &ast::TableWithJoins) -> Result<()> {
        self.bind_table_factor(&table_with_joins.relation)?;
        for join in &table_with_joins.joins {
            let constraint = match &join.join_operator {
                ast::JoinOperator::Inner(constraint) => Some(constraint),
                ast::JoinOperator::CrossJoin => None,
                operator => return Err(not_supported(format!("{operator:?}"))),
            };
            self.bind_table_factor(&join.relation)?;
            self.query.range_table.push(RangeTableEntry {
                alias: "unnamed_join".to_string(),
                kind: RteKind::Join,
            });
            match constraint {
                Some(ast::JoinConstraint::On(expr)) => {
                    let expr = self.bind_expr(expr, Clause::Where)?;
                    self.query.where_clause =
                        Some(conjunction(self.query.where_clause.take(), expr));
                }
                Some(ast::JoinConstraint::None) | None => {}
                Some(_) => return Err(not_supported("USING/NATURAL JOIN")),
            }
        }
        Ok(())
    }

    fn bind_table_factor(&mut self, table_factor: &ast::TableFactor) -> Result<()> {
        let entry = match table_factor {
            ast::TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    RangeTableEntry {
                        alias: alias
                            .as_ref()
                            .map(|alias| ident_name(&alias.name))
                            .unwrap_or_else(|| name.to_string()),
                        kind: RteKind::Function(name.to_string()),
                    }
                } else {
                    let path = object_name(name);
                    let table = self
                        .catalog
                        .get(&path)
                        .ok_or_else(|| Error::other(format!("Unknown table: {name}")))?;
                    let entry = RangeTableEntry::relation(table.clone());
                    match alias {
                        Some(alias) => entry.with_alias(ident_name(&alias.name)),
                        None => entry,
                    }
                }
            }
            ast::TableFactor::Derived {
                subquery, alias, ..
            } => {
                let subquery = Binder::new(self.catalog).bind_query(subquery)?;
                RangeTableEntry {
                    alias: alias
                        .as_ref()
                        .map(|alias| ident_name(&alias.name))
                        .unwrap_or_else(|| "subquery".to_string()),
                    kind: RteKind::Subquery(Box::new(subquery)),
                }
            }
            ast::TableFactor::UNNEST { alias, .. } => RangeTableEntry {
                alias: alias
                    .as_ref()
                    .map(|alias| ident_name(&alias.name))
                    .unwrap_or_else(|| "unnest".to_string()),
                kind: RteKind::Function("unnest".to_string()),
            },
            table_factor => return Err(not_supported(format!("FROM item {table_factor}"))),
        };
        self.query.range_table.push(entry);
        Ok(())
    }

    // Columns

    fn column_in(&self, rte_index: usize, name: &str) -> Option<Expr> {
        let entry = self.query.range_table.get(rte_index)?;
        rte_columns(entry)
            .into_iter()
            .enumerate()
            .find(|(_, (column, _))| column.eq_ignore_ascii_case(name))
            .map(|(index, (column, data_type))| Expr::var(rte_index, index + 1, column, data_type))
    }

    fn bind_column(&self, qualifier: &[String], name: &str) -> Result<Expr> {
        let mut candidates: Vec<Expr> = self
            .query
            .range_table
            .iter()
            .enumerate()
            .filter(|(_, entry)| qualifier.is_empty() || rte_matches(entry, qualifier))
            .filter_map(|(rte_index, _)| self.column_in(rte_index, name))
            .collect();
        match candidates.len() {
            0 => Err(Error::other(format!(
                "Unknown column: {}",
                qualifier.iter().chain([&name.to_string()]).join(".")
            ))),
            1 => Ok(candidates.remove(0)),
            _ => Err(Error::other(format!("Ambiguous column: {name}"))),
        }
    }

    // Expressions

    fn bind_exprs(&mut self, exprs: &[ast::Expr], clause: Clause) -> Result<Vec<Expr>> {
        exprs.iter().map(|expr| self.bind_expr(expr, clause)).collect()
    }

    fn bind_expr(&mut self, expr: &ast::Expr, clause: Clause) -> Result<Expr> {
        match expr {
            ast::Expr::Identifier(ident) => self.bind_column(&[], &ident_name(ident)),
            ast::Expr::CompoundIdentifier(idents) => match idents.split_last() {
                Some((name, qualifier)) => self.bind_column(
                    &qualifier.iter().map(ident_name).collect::<Vec<_>>(),
                    &ident_name(name),
                ),
                None => Err(Error::parsing_error(expr)),
            },
            ast::Expr::Value(value) => Ok(Expr::val(bind_value(value)?)),
            ast::Expr::TypedString { data_type: t, value } => {
                Ok(Expr::val(Value::text(value.clone()).cast(data_type(t)?).map_err(Error::other)?))
            }
            ast::Expr::Nested(expr) => self.bind_expr(expr, clause),
            ast::Expr::UnaryOp { op, expr } => {
                let arg = self.bind_expr(expr, clause)?;
                match (op, arg) {
                    (ast::UnaryOperator::Plus, arg) => Ok(arg),
                    (ast::UnaryOperator::Minus, Expr::Const { value, location }) => {
                        let value = match value {
                            Value::Integer(i) => Value::Integer(-i),
                            Value::Float(x) => Value::Float(-x),
                            value => return Err(Error::other(format!("Cannot negate {value}"))),
                        };
                        Ok(Expr::Const { value, location })
                    }
                    (ast::UnaryOperator::Minus, arg) => {
                        let data_type = arg.data_type().unwrap_or(DataType::Integer);
                        Ok(Expr::op("-", vec![arg], data_type))
                    }
                    (ast::UnaryOperator::Not, arg) => Ok(Expr::Bool {
                        op: BoolOp::Not,
                        args: vec![arg],
                    }),
                    (op, _) => Err(not_supported(format!("operator {op}"))),
                }
            }
            ast::Expr::BinaryOp { left, op, right } => {
                let left = self.bind_expr(left, clause)?;
                let right = self.bind_expr(right, clause)?;
                bind_binary_op(op, left, right)
            }
            ast::Expr::IsNull(expr) => Ok(Expr::NullTest {
                arg: Box::new(self.bind_expr(expr, clause)?),
                negated: false,
            }),
            ast::Expr::IsNotNull(expr) => Ok(Expr::NullTest {
                arg: Box::new(self.bind_expr(expr, clause)?),
                negated: true,
            }),
            ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let expr = self.bind_expr(expr, clause)?;
                let low = self.bind_expr(low, clause)?;
                let high = self.bind_expr(high, clause)?;
                let between = Expr::Bool {
                    op: BoolOp::And,
                    args: vec![
                        Expr::op(">=", vec![expr.clone(), low], DataType::Boolean),
                        Expr::op("<=", vec![expr, high], DataType::Boolean),
                    ],
                };
                Ok(negate_if(between, *negated))
            }
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let expr = self.bind_expr(expr, clause)?;
                let list = self.bind_exprs(list, clause)?;
                let in_list = Expr::Bool {
                    op: BoolOp::Or,
                    args: list
                        .into_iter()
                        .map(|item| Expr::op("=", vec![expr.clone(), item], DataType::Boolean))
                        .collect(),
                };
                Ok(negate_if(in_list, *negated))
            }
            ast::Expr::Cast {
                expr, data_type: t, ..
            } => Ok(Expr::cast(self.bind_expr(expr, clause)?, data_type(t)?)),
            ast::Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                let mut args = vec![self.bind_expr(expr, clause)?];
                for arg in [substring_from, substring_for].into_iter().flatten() {
                    args.push(self.bind_expr(arg, clause)?);
                }
                Ok(Expr::func("substring", args, DataType::Text))
            }
            ast::Expr::Ceil { expr, .. } => {
                self.bind_scalar_function("ceil", &[expr.as_ref()], clause)
            }
            ast::Expr::Floor { expr, .. } => {
                self.bind_scalar_function("floor", &[expr.as_ref()], clause)
            }
            ast::Expr::Function(function) => self.bind_function(function, clause),
            ast::Expr::Exists { .. }
            | ast::Expr::InSubquery { .. }
            | ast::Expr::Subquery(_) => {
                self.query.has_sublinks = true;
                Err(not_supported("SubLinks"))
            }
            ast::Expr::GroupingSets(_) | ast::Expr::Cube(_) | ast::Expr::Rollup(_) => {
                self.query.has_grouping_sets = true;
                Err(not_supported("GROUPING SETS"))
            }
            expr => Err(not_supported(format!("expression {expr}"))),
        }
    }

    fn bind_scalar_function(
        &mut self,
        name: &str,
        args: &[&ast::Expr],
        clause: Clause,
    ) -> Result<Expr> {
        let args = args
            .iter()
            .map(|arg| self.bind_expr(arg, clause))
            .collect::<Result<Vec<_>>>()?;
        let data_type = function_type(name, &args);
        Ok(Expr::func(name, args, data_type))
    }

    fn bind_function(&mut self, function: &ast::Function, clause: Clause) -> Result<Expr> {
        let name = object_name(&function.name).join(".");
        if function.filter.is_some() {
            return Err(not_supported("FILTER"));
        }
        if !function.within_group.is_empty() {
            return Err(not_supported("WITHIN GROUP"));
        }
        let (distinct, args) = match &function.args {
            ast::FunctionArguments::None => (false, vec![]),
            ast::FunctionArguments::Subquery(_) => {
                self.query.has_sublinks = true;
                return Err(not_supported("SubLinks"));
            }
            ast::FunctionArguments::List(list) => (
                matches!(list.duplicate_treatment, Some(ast::DuplicateTreatment::Distinct)),
                list.args.iter().collect(),
            ),
        };
        let is_aggregate = AGGREGATE_FUNCTIONS.contains(&name.as_str()) && function.over.is_none();
        if is_aggregate && !clause.allows_aggregates() {
            return Err(Error::other(format!(
                "Aggregate functions are not allowed in {clause}"
            )));
        }
        let args_clause = if is_aggregate { Clause::Aggregate } else { clause };
        let mut star = false;
        let mut bound = vec![];
        for arg in args {
            match arg {
                ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(expr)) => {
                    bound.push(self.bind_expr(expr, args_clause)?)
                }
                ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard) => star = true,
                arg => return Err(not_supported(format!("function argument {arg}"))),
            }
        }
        if function.over.is_some() {
            self.query.has_window_funcs = true;
            let data_type = if name == "count" {
                DataType::Integer
            } else {
                function_type(&name, &bound)
            };
            return Ok(Expr::func(name, bound, data_type));
        }
        if is_aggregate {
            self.query.has_aggs = true;
            let aggref = match (name.as_str(), star, bound.len()) {
                ("count", true, 0) if !distinct => Aggref::count_star(),
                ("count", false, 1) => Aggref {
                    distinct,
                    ..Aggref::new(AggFunction::CountAny, bound)
                },
                (_, false, 1) => Aggref {
                    distinct,
                    ..Aggref::new(AggFunction::Other(name.clone()), bound)
                },
                _ => return Err(Error::other(format!("Invalid arguments for {name}"))),
            };
            return Ok(Expr::Aggref(aggref));
        }
        if star || distinct {
            return Err(Error::other(format!("Invalid arguments for {name}")));
        }
        if SET_RETURNING_FUNCTIONS.contains(&name.as_str()) {
            self.query.has_target_srfs = true;
        }
        let data_type = function_type(&name, &bound);
        Ok(Expr::func(name, bound, data_type))
    }

    // Target list

    fn bind_select_item(&mut self, item: &ast::SelectItem) -> Result<()> {
        match item {
            ast::SelectItem::UnnamedExpr(expr) => {
                let name = output_name(expr);
                let expr = self.bind_expr(expr, Clause::Select)?;
                self.query.add_target(expr, name, false);
            }
            ast::SelectItem::ExprWithAlias { expr, alias } => {
                let expr = self.bind_expr(expr, Clause::Select)?;
                self.query.add_target(expr, ident_name(alias), false);
            }
            ast::SelectItem::Wildcard(_) => self.expand_wildcard(&[])?,
            ast::SelectItem::QualifiedWildcard(name, _) => {
                self.expand_wildcard(&object_name(name))?
            }
        }
        Ok(())
    }

    fn expand_wildcard(&mut self, qualifier: &[String]) -> Result<()> {
        let columns: Vec<Expr> = self
            .query
            .range_table
            .iter()
            .enumerate()
            .filter(|(_, entry)| qualifier.is_empty() || rte_matches(entry, qualifier))
            .flat_map(|(rte_index, entry)| {
                rte_columns(entry)
                    .into_iter()
                    .enumerate()
                    .map(move |(index, (name, data_type))| {
                        Expr::var(rte_index, index + 1, name, data_type)
                    })
            })
            .collect();
        if columns.is_empty() && !qualifier.is_empty() {
            return Err(Error::other(format!("Unknown relation: {}", qualifier.join("."))));
        }
        for column in columns {
            let name = match &column {
                Expr::Var(var) => var.name.clone(),
                _ => UNNAMED_COLUMN.to_string(),
            };
            self.query.add_target(column, name, false);
        }
        Ok(())
    }

    /// The output entry named `name`, if exactly one has that name
    fn output_resno(&self, name: &str) -> Option<usize> {
        self.query
            .target_list
            .iter()
            .filter(|entry| !entry.junk && entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.resno)
            .exactly_one()
            .ok()
    }

    /// 1-based position in the select list
    fn position_resno(&self, expr: &ast::Expr, clause: Clause) -> Result<Option<usize>> {
        match expr {
            ast::Expr::Value(ast::Value::Number(number, _)) => {
                let outputs = self.query.target_list.iter().filter(|e| !e.junk).count();
                match number.parse::<usize>() {
                    Ok(position) if (1..=outputs).contains(&position) => Ok(Some(position)),
                    _ => Err(Error::other(format!(
                        "{clause} position {number} is not in select list"
                    ))),
                }
            }
            _ => Ok(None),
        }
    }

    /// An entry computing `expr`, added as junk if none exists
    fn find_or_add_target(&mut self, expr: Expr) -> usize {
        match self
            .query
            .target_list
            .iter()
            .find(|entry| entry.expr == expr)
        {
            Some(TargetEntry { resno, .. }) => *resno,
            None => self.query.add_target(expr, UNNAMED_COLUMN, true),
        }
    }

    fn bind_group_by(&mut self, expr: &ast::Expr) -> Result<()> {
        let resno = match self.position_resno(expr, Clause::GroupBy)? {
            Some(resno) => resno,
            None => {
                // Input columns take precedence over output names
                let bound = match (self.bind_expr(expr, Clause::GroupBy), expr) {
                    (Ok(bound), _) => Ok(bound),
                    (Err(err), ast::Expr::Identifier(ident)) => {
                        match self.output_resno(&ident_name(ident)) {
                            Some(resno) => {
                                self.query.add_group_clause(resno);
                                return Ok(());
                            }
                            None => Err(err),
                        }
                    }
                    (Err(err), _) => Err(err),
                }?;
                self.find_or_add_target(bound)
            }
        };
        self.query.add_group_clause(resno);
        Ok(())
    }

    fn bind_order_by(&mut self, order_by: &[ast::OrderByExpr]) -> Result<()> {
        for ast::OrderByExpr {
            expr,
            asc,
            nulls_first,
            ..
        } in order_by
        {
            // Output names take precedence over input columns
            let by_name = match expr {
                ast::Expr::Identifier(ident) => self.output_resno(&ident_name(ident)),
                _ => None,
            };
            let resno = match by_name {
                Some(resno) => resno,
                None => match self.position_resno(expr, Clause::OrderBy)? {
                    Some(resno) => resno,
                    None => {
                        let bound = self.bind_expr(expr, Clause::OrderBy)?;
                        self.find_or_add_target(bound)
                    }
                },
            };
            let descending = matches!(asc, Some(false));
            self.query
                .sort_clause
                .push(SortClause::new(resno, descending, *nulls_first));
        }
        Ok(())
    }
}

fn negate_if(expr: Expr, negated: bool) -> Expr {
    if negated {
        Expr::Bool {
            op: BoolOp::Not,
            args: vec![expr],
        }
    } else {
        expr
    }
}

fn bind_binary_op(op: &ast::BinaryOperator, left: Expr, right: Expr) -> Result<Expr> {
    let numeric_type = || match (left.data_type(), right.data_type()) {
        (Some(DataType::Float), _) | (_, Some(DataType::Float)) => DataType::Float,
        _ => DataType::Integer,
    };
    let (symbol, data_type) = match op {
        ast::BinaryOperator::And | ast::BinaryOperator::Or => {
            let op = if *op == ast::BinaryOperator::And {
                BoolOp::And
            } else {
                BoolOp::Or
            };
            return Ok(Expr::Bool {
                op,
                args: vec![left, right],
            });
        }
        ast::BinaryOperator::Eq => ("=", DataType::Boolean),
        ast::BinaryOperator::NotEq => ("<>", DataType::Boolean),
        ast::BinaryOperator::Lt => ("<", DataType::Boolean),
        ast::BinaryOperator::LtEq => ("<=", DataType::Boolean),
        ast::BinaryOperator::Gt => (">", DataType::Boolean),
        ast::BinaryOperator::GtEq => (">=", DataType::Boolean),
        ast::BinaryOperator::Plus => ("+", numeric_type()),
        ast::BinaryOperator::Minus => ("-", numeric_type()),
        ast::BinaryOperator::Multiply => ("*", numeric_type()),
        ast::BinaryOperator::Divide => ("/", numeric_type()),
        ast::BinaryOperator::Modulo => ("%", numeric_type()),
        ast::BinaryOperator::StringConcat => ("||", DataType::Text),
        op => return Err(not_supported(format!("operator {op}"))),
    };
    Ok(Expr::op(symbol, vec![left, right], data_type))
}
