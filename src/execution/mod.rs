//! # Execution
//!
//! An in-memory executor for physical plans.
//! Aggregation nodes keep one state per bucket and aggregate call.
//! Partial stages return the states themselves, so that final stages can merge them.
//! `BucketScan` nodes finalize anonymizing aggregates with the seed of each bucket,
//! suppress low-count buckets and expand implicit ones.
//!

pub mod aggregate;
pub mod eval;

use crate::{
    aggregation::{self, AnonAggregate},
    config::{self, AccessLevel, Config},
    plan::{
        self, Agg, AggSplit, Append, BucketScan, Filter, Gather, Limit, Plan, PlannedStatement,
        Planner, Project, SeqScan, Sort, SubqueryScan,
    },
    query::{self, seed, AnonymizationContext, Catalog, SortClause},
    sql, value,
    value::Value,
};
use aggregate::State;
use eval::Scope;
use itertools::Itertools;
use std::{
    cmp::Ordering,
    collections::{btree_map::Entry, BTreeMap, HashMap},
    error, fmt, iter, result, thread,
};

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Sql(sql::Error),
    Plan(plan::Error),
    MissingContext(String),
    UnknownColumn(String),
    UnknownTable(String),
    Evaluation(String),
    Unsupported(String),
    Other(String),
}

impl Error {
    pub fn missing_context(aggregate: AnonAggregate) -> Error {
        Error::MissingContext(format!(
            "Anonymizing aggregate {aggregate} is not linked to an anonymization context"
        ))
    }
    pub fn unknown_column(name: impl fmt::Display) -> Error {
        Error::UnknownColumn(format!("Unknown column {name}"))
    }
    pub fn unknown_table(name: impl fmt::Display) -> Error {
        Error::UnknownTable(format!("Unknown table {name}"))
    }
    pub fn evaluation(desc: impl fmt::Display) -> Error {
        Error::Evaluation(desc.to_string())
    }
    pub fn unsupported(desc: impl fmt::Display) -> Error {
        Error::Unsupported(desc.to_string())
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Sql(err) => write!(f, "{}", err),
            Error::Plan(err) => write!(f, "{}", err),
            Error::MissingContext(desc) => writeln!(f, "MissingContext: {}", desc),
            Error::UnknownColumn(desc) => writeln!(f, "UnknownColumn: {}", desc),
            Error::UnknownTable(desc) => writeln!(f, "UnknownTable: {}", desc),
            Error::Evaluation(desc) => writeln!(f, "Evaluation: {}", desc),
            Error::Unsupported(desc) => writeln!(f, "Unsupported: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<sql::Error> for Error {
    fn from(err: sql::Error) -> Self {
        Error::Sql(err)
    }
}
impl From<plan::Error> for Error {
    fn from(err: plan::Error) -> Self {
        Error::Plan(err)
    }
}
impl From<query::Error> for Error {
    fn from(err: query::Error) -> Self {
        Error::Sql(sql::Error::Query(err))
    }
}
impl From<aggregation::Error> for Error {
    fn from(err: aggregation::Error) -> Self {
        Error::Evaluation(err.to_string())
    }
}
impl From<value::Error> for Error {
    fn from(err: value::Error) -> Self {
        Error::Evaluation(err.to_string())
    }
}
impl From<config::Error> for Error {
    fn from(err: config::Error) -> Self {
        Error::Other(err.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;

pub type Row = Vec<Value>;

/// The rows returned by a query
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl fmt::Display for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.columns.join(" | "))?;
        for row in &self.rows {
            writeln!(f, "{}", row.iter().join(" | "))?;
        }
        Ok(())
    }
}

/// Tables and their rows
#[derive(Clone, Debug, Default)]
pub struct Database {
    catalog: Catalog,
    tables: BTreeMap<Vec<String>, Vec<Row>>,
}

impl Database {
    pub fn new() -> Self {
        Database::default()
    }

    /// Add a table, values are cast to the types of their columns
    pub fn with_table(mut self, table: query::Table, rows: Vec<Row>) -> Result<Self> {
        let rows = rows
            .into_iter()
            .map(|row| {
                if row.len() != table.columns.len() {
                    return Err(Error::other(format!(
                        "Table {} has {} columns, got a row with {} values",
                        table.name(),
                        table.columns.len(),
                        row.len()
                    )));
                }
                row.iter()
                    .zip(&table.columns)
                    .map(|(value, column)| Ok(value.cast(column.data_type)?))
                    .collect()
            })
            .collect::<Result<Vec<Row>>>()?;
        log::info!("Loaded {} rows in {}", rows.len(), table.name());
        self.tables.insert(table.path.clone(), rows);
        self.catalog.insert(table);
        Ok(self)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run a query as a user with the default access level
    pub fn query(&self, sql: &str, planner: &Planner, config: &Config) -> Result<ResultSet> {
        self.query_with_access_level(sql, planner, config, None)
    }

    pub fn query_with_access_level(
        &self,
        sql: &str,
        planner: &Planner,
        config: &Config,
        access_level: Option<AccessLevel>,
    ) -> Result<ResultSet> {
        config.validate()?;
        let anonymized =
            sql::anonymize_with_access_level(sql, &self.catalog, config, access_level)?;
        let statement = planner.plan(&anonymized.query)?.resolve(&anonymized.links)?;
        if anonymized.is_anonymizing() {
            log::debug!("Anonymizing plan:\n{statement}");
        }
        execute(&statement, &self.tables, config)
    }
}

/// Run a planned statement
pub fn execute(
    statement: &PlannedStatement,
    tables: &BTreeMap<Vec<String>, Vec<Row>>,
    config: &Config,
) -> Result<ResultSet> {
    let executor = Executor { tables, config };
    let width = statement.column_names.len();
    let rows = executor
        .execute(&statement.plan)?
        .into_rows()?
        .into_iter()
        .map(|mut row| {
            // Junk columns come last
            row.truncate(width);
            row
        })
        .collect();
    Ok(ResultSet {
        columns: statement.column_names.clone(),
        rows,
    })
}

/// Label values of a bucket, and the states of its aggregates
type Group = (Vec<Value>, Vec<State>);

/// The output of a node
enum Output {
    Rows(Vec<Row>),
    /// Partial aggregation states
    Groups(Vec<Group>),
}

impl Output {
    fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            Output::Rows(rows) => Ok(rows),
            Output::Groups(_) => Err(Error::other("Expected rows, got partial aggregates")),
        }
    }

    fn into_groups(self) -> Result<Vec<Group>> {
        match self {
            Output::Groups(groups) => Ok(groups),
            Output::Rows(_) => Err(Error::other("Expected partial aggregates, got rows")),
        }
    }

    fn concat(outputs: Vec<Output>) -> Result<Output> {
        match outputs.first() {
            Some(Output::Groups(_)) => Ok(Output::Groups(
                outputs
                    .into_iter()
                    .map(Output::into_groups)
                    .flatten_ok()
                    .collect::<Result<_>>()?,
            )),
            _ => Ok(Output::Rows(
                outputs
                    .into_iter()
                    .map(Output::into_rows)
                    .flatten_ok()
                    .collect::<Result<_>>()?,
            )),
        }
    }
}

struct Executor<'a> {
    tables: &'a BTreeMap<Vec<String>, Vec<Row>>,
    config: &'a Config,
}

impl<'a> Executor<'a> {
    fn execute(&self, plan: &Plan) -> Result<Output> {
        match plan {
            Plan::SeqScan(scan) => self.seq_scan(scan).map(Output::Rows),
            Plan::Filter(Filter { qual, input }) => {
                let mut rows = self.execute(input)?.into_rows()?;
                let mut keep = vec![];
                for row in &rows {
                    keep.push(eval::eval_predicate(qual, &Scope::Row(row))?);
                }
                let mut keep = keep.into_iter();
                rows.retain(|_| keep.next().unwrap_or(false));
                Ok(Output::Rows(rows))
            }
            Plan::Agg(agg) => self.agg(agg, None),
            Plan::BucketScan(BucketScan { context, agg }) => self.agg(agg, Some(context.as_ref())),
            Plan::Gather(Gather { workers, input }) => self.gather(*workers, input),
            Plan::Append(Append { inputs }) => Output::concat(
                inputs
                    .iter()
                    .map(|input| self.execute(input))
                    .collect::<Result<_>>()?,
            ),
            Plan::SubqueryScan(SubqueryScan { width, input }) => Ok(Output::Rows(
                self.execute(input)?
                    .into_rows()?
                    .into_iter()
                    .map(|mut row| {
                        row.truncate(*width);
                        row
                    })
                    .collect(),
            )),
            Plan::Sort(Sort { keys, input }) => {
                let mut rows = self.execute(input)?.into_rows()?;
                sort_rows(&mut rows, keys)?;
                Ok(Output::Rows(rows))
            }
            Plan::Limit(Limit {
                limit,
                offset,
                input,
            }) => {
                let rows = self.execute(input)?.into_rows()?;
                let offset = offset.unwrap_or(0) as usize;
                let limit = limit.map_or(usize::MAX, |limit| limit as usize);
                Ok(Output::Rows(rows.into_iter().skip(offset).take(limit).collect()))
            }
            Plan::Project(Project { targets, input }) => {
                let rows = self.execute(input)?.into_rows()?;
                let rows = rows
                    .iter()
                    .map(|row| {
                        targets
                            .iter()
                            .map(|target| eval::eval(&target.expr, &Scope::Row(row)))
                            .collect()
                    })
                    .collect::<Result<Vec<Row>>>()?;
                Ok(Output::Rows(rows))
            }
        }
    }

    fn seq_scan(&self, SeqScan { table, partition }: &SeqScan) -> Result<Vec<Row>> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| Error::unknown_table(table.join(".")))?;
        Ok(match partition {
            Some((k, n)) => rows
                .iter()
                .enumerate()
                .filter(|(index, _)| index % n == *k)
                .map(|(_, row)| row.clone())
                .collect(),
            None => rows.clone(),
        })
    }

    /// Run the partitions of an `Append` in parallel
    fn gather(&self, workers: usize, input: &Plan) -> Result<Output> {
        let Plan::Append(Append { inputs }) = input else {
            return self.execute(input);
        };
        log::debug!("Gathering {} partitions with {workers} workers", inputs.len());
        let outputs = thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .iter()
                .map(|input| scope.spawn(move || self.execute(input)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| Error::other("A parallel worker panicked"))?
                })
                .collect::<Result<Vec<Output>>>()
        })?;
        Output::concat(outputs)
    }

    fn new_states(&self, agg: &Agg) -> Result<Vec<State>> {
        agg.aggregates()
            .into_iter()
            .map(|aggref| State::new(aggref, self.config))
            .collect()
    }

    /// Group the input of an aggregation node
    fn accumulate(&self, agg: &Agg) -> Result<BTreeMap<Vec<Value>, Vec<State>>> {
        let aggregates = agg.aggregates();
        let mut groups = BTreeMap::new();
        match agg.split {
            AggSplit::Simple | AggSplit::InitialSerial => {
                for row in self.execute(&agg.input)?.into_rows()? {
                    let scope = Scope::Row(&row);
                    let labels = agg
                        .group_keys
                        .iter()
                        .map(|key| eval::eval(key, &scope))
                        .collect::<Result<Vec<Value>>>()?;
                    let states = match groups.entry(labels) {
                        Entry::Vacant(entry) => entry.insert(self.new_states(agg)?),
                        Entry::Occupied(entry) => entry.into_mut(),
                    };
                    for (aggref, state) in aggregates.iter().zip(states.iter_mut()) {
                        let args = aggref
                            .args
                            .iter()
                            .map(|arg| eval::eval(arg, &scope))
                            .collect::<Result<Vec<Value>>>()?;
                        state.transition(&args)?;
                    }
                }
            }
            AggSplit::FinalDeserial => {
                for (labels, partial) in self.execute(&agg.input)?.into_groups()? {
                    if partial.len() != aggregates.len() {
                        return Err(Error::other("Partial aggregates do not match the final stage"));
                    }
                    match groups.entry(labels) {
                        Entry::Vacant(entry) => {
                            entry.insert(partial);
                        }
                        Entry::Occupied(mut entry) => {
                            for (state, other) in entry.get_mut().iter_mut().zip(&partial) {
                                state.merge(other)?;
                            }
                        }
                    }
                }
            }
        }
        // Global aggregates always have a bucket
        if agg.group_keys.is_empty() && groups.is_empty() {
            groups.insert(vec![], self.new_states(agg)?);
        }
        Ok(groups)
    }

    fn agg(&self, agg: &Agg, context: Option<&AnonymizationContext>) -> Result<Output> {
        let groups = self.accumulate(agg)?;
        if agg.split == AggSplit::InitialSerial {
            return Ok(Output::Groups(groups.into_iter().collect()));
        }
        let aggregates = agg.aggregates();
        let junk_index = |aggregate: AnonAggregate| {
            agg.targets
                .iter()
                .position(|target| target.junk && target.name == aggregate.name())
        };
        let low_count = context.and_then(|_| junk_index(AnonAggregate::LowCount));
        let count_star = context
            .filter(|context| context.expand_buckets)
            .and_then(|_| junk_index(AnonAggregate::CountStar));

        let mut rows = vec![];
        for (labels, states) in groups {
            let bucket_seed =
                context.map(|context| seed::compute_bucket_seed(context.sql_seed, &labels));
            let finalized = aggregates
                .iter()
                .zip(&states)
                .map(|(aggref, state)| Ok((*aggref, state.finalize(bucket_seed, self.config)?)))
                .collect::<Result<HashMap<_, _>>>()?;
            let scope = Scope::Bucket {
                keys: context.map_or(&agg.group_keys, |context| &context.group_keys),
                labels: &labels,
                aggregates: &finalized,
            };
            let row = agg
                .targets
                .iter()
                .map(|target| eval::eval(&target.expr, &scope))
                .collect::<Result<Row>>()?;
            if low_count.is_some_and(|index| row[index] == Value::Boolean(true)) {
                log::debug!("Suppressing low count bucket ({})", labels.iter().join(", "));
                continue;
            }
            if let Some(having) = &agg.having {
                if !eval::eval_predicate(having, &scope)? {
                    continue;
                }
            }
            match count_star {
                Some(index) => {
                    let count = row[index].as_i64().unwrap_or(1).max(0) as usize;
                    rows.extend(iter::repeat(row).take(count));
                }
                None => rows.push(row),
            }
        }
        Ok(Output::Rows(rows))
    }
}

fn sort_rows(rows: &mut [Row], keys: &[SortClause]) -> Result<()> {
    if let Some(key) = keys
        .iter()
        .find(|key| key.resno == 0 || rows.iter().any(|row| row.len() < key.resno))
    {
        return Err(Error::other(format!("Invalid sort column {}", key.resno)));
    }
    let mut error = None;
    rows.sort_by(|left, right| {
        keys.iter()
            .map(|key| {
                let (l, r) = (&left[key.resno - 1], &right[key.resno - 1]);
                match (l.is_null(), r.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) if key.nulls_first => Ordering::Less,
                    (true, false) => Ordering::Greater,
                    (false, true) if key.nulls_first => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    (false, false) => {
                        let ordering = eval::compare(l, r).unwrap_or_else(|err| {
                            error.get_or_insert(err);
                            Ordering::Equal
                        });
                        if key.descending {
                            ordering.reverse()
                        } else {
                            ordering
                        }
                    }
                }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query::Column, value::DataType};

    fn database() -> Database {
        let rows = (0..30)
            .map(|i| {
                vec![
                    Value::integer(i),
                    Value::text(if i % 3 == 0 { "buy" } else { "view" }),
                    Value::integer(i % 4),
                ]
            })
            .collect();
        Database::new()
            .with_table(
                query::Table::new(
                    "events",
                    vec![
                        Column::new("user_id", DataType::Integer),
                        Column::new("action", DataType::Text),
                        Column::new("amount", DataType::Float),
                    ],
                ),
                rows,
            )
            .unwrap()
    }

    fn run(sql: &str, planner: &Planner) -> ResultSet {
        let result = database().query(sql, planner, &Config::default()).unwrap();
        println!("{result}");
        result
    }

    #[test]
    fn test_plain_queries() {
        for planner in [Planner::simple(), Planner::parallel(4)] {
            let result = run(
                "SELECT action, count(*), sum(amount) FROM events GROUP BY action ORDER BY action",
                &planner,
            );
            assert_eq!(result.columns, vec!["action", "count", "sum"]);
            assert_eq!(
                result.rows,
                vec![
                    vec![Value::text("buy"), Value::integer(10), Value::float(15.)],
                    vec![Value::text("view"), Value::integer(20), Value::float(28.)],
                ]
            );
            let result = run("SELECT count(*) FROM events WHERE user_id > 100", &planner);
            assert_eq!(result.rows, vec![vec![Value::integer(0)]]);
        }
    }

    #[test]
    fn test_sort_and_limit() {
        let result = run(
            "SELECT user_id FROM events WHERE amount = 3 ORDER BY user_id DESC LIMIT 2 OFFSET 1",
            &Planner::simple(),
        );
        assert_eq!(result.rows, vec![vec![Value::integer(23)], vec![Value::integer(19)]]);
        // Sorting by a column which is not returned
        let result = run(
            "SELECT action FROM events ORDER BY user_id DESC LIMIT 1",
            &Planner::simple(),
        );
        assert_eq!(result.rows, vec![vec![Value::text("view")]]);
    }

    #[test]
    fn test_nulls_order() {
        let mut rows = vec![
            vec![Value::integer(2)],
            vec![Value::Null],
            vec![Value::float(1.5)],
        ];
        sort_rows(&mut rows, &[SortClause::new(1, false, None)]).unwrap();
        assert_eq!(rows, vec![vec![Value::float(1.5)], vec![Value::integer(2)], vec![Value::Null]]);
        sort_rows(&mut rows, &[SortClause::new(1, true, None)]).unwrap();
        assert_eq!(rows, vec![vec![Value::Null], vec![Value::integer(2)], vec![Value::float(1.5)]]);
        assert!(sort_rows(&mut rows, &[SortClause::new(2, true, None)]).is_err());
    }

    #[test]
    fn test_errors() {
        let database = database();
        let err = database
            .query("SELECT count(*) FROM unknown", &Planner::simple(), &Config::default())
            .unwrap_err();
        println!("{err}");
        assert!(matches!(err, Error::Sql(_)));
        let err = database
            .query(
                "SELECT 1 / (user_id - user_id) FROM events",
                &Planner::simple(),
                &Config::default(),
            )
            .unwrap_err();
        assert_eq!(err, Error::evaluation("Division by zero"));
        let empty = BTreeMap::new();
        let query = sql::bind(
            &sql::parse("SELECT count(*) FROM events").unwrap(),
            database.catalog(),
        )
        .unwrap();
        let statement = Planner::simple().plan(&query).unwrap();
        assert!(matches!(
            execute(&statement, &empty, &Config::default()),
            Err(Error::UnknownTable(_))
        ));
    }
}
