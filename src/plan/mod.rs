//! # Physical plans
//!
//! A small tree of physical operators, produced by the `Planner` from a logical `Query`.
//! Aggregation nodes copy the aggregate calls of the query, link tokens included.
//! Once planned, `rewrite_plan` resolves the tokens and turns every aggregation node
//! owning an anonymizing context into a `BucketScan`.
//!

pub mod planner;

use crate::query::{
    self,
    link::{self, AnonQueryLinks},
    Aggref, AnonymizationContext, Expr, SortClause, TargetEntry,
};
use colored::Colorize;
use itertools::Itertools;
use std::{error, fmt, result, sync::Arc};

pub use planner::Planner;

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Unsupported(String),
    Query(query::Error),
    Other(String),
}

impl Error {
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
            Error::Unsupported(desc) => writeln!(f, "Unsupported: {}", desc),
            Error::Query(err) => write!(f, "{}", err),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<query::Error> for Error {
    fn from(err: query::Error) -> Self {
        Error::Query(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// How an aggregation node takes part in a multi-stage aggregation
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AggSplit {
    /// Reads rows, emits results
    Simple,
    /// Reads rows, emits partial states
    InitialSerial,
    /// Reads partial states, emits results
    FinalDeserial,
}

impl fmt::Display for AggSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggSplit::Simple => write!(f, "Simple"),
            AggSplit::InitialSerial => write!(f, "Partial"),
            AggSplit::FinalDeserial => write!(f, "Finalize"),
        }
    }
}

/// Reads the rows of a base table, or of one partition of it
#[derive(Clone, Debug, PartialEq)]
pub struct SeqScan {
    pub table: Vec<String>,
    /// `(k, n)` keeps the rows whose index is `k` modulo `n`
    pub partition: Option<(usize, usize)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub qual: Expr,
    pub input: Box<Plan>,
}

/// Groups rows and computes aggregates
#[derive(Clone, Debug, PartialEq)]
pub struct Agg {
    pub group_keys: Vec<Expr>,
    /// The output of the node, junk entries included
    pub targets: Vec<TargetEntry>,
    pub having: Option<Expr>,
    pub split: AggSplit,
    pub input: Box<Plan>,
}

impl Agg {
    /// The expressions owning the aggregate calls of the node
    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        self.targets
            .iter()
            .map(|target| &target.expr)
            .chain(self.having.iter())
    }

    pub fn expressions_mut(&mut self) -> impl Iterator<Item = &mut Expr> {
        self.targets
            .iter_mut()
            .map(|target| &mut target.expr)
            .chain(self.having.iter_mut())
    }

    /// The distinct aggregate calls, in order of first appearance.
    /// Every stage of a split aggregation sees the same list.
    pub fn aggregates(&self) -> Vec<&Aggref> {
        self.expressions()
            .flat_map(|expr| expr.aggregates())
            .unique()
            .collect()
    }
}

/// Runs its input in parallel workers
#[derive(Clone, Debug, PartialEq)]
pub struct Gather {
    pub workers: usize,
    pub input: Box<Plan>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Append {
    pub inputs: Vec<Plan>,
}

/// Reads the output of a subquery, without its junk columns
#[derive(Clone, Debug, PartialEq)]
pub struct SubqueryScan {
    pub width: usize,
    pub input: Box<Plan>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    pub keys: Vec<SortClause>,
    pub input: Box<Plan>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Limit {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub input: Box<Plan>,
}

/// Computes the target list of a query without aggregates
#[derive(Clone, Debug, PartialEq)]
pub struct Project {
    pub targets: Vec<TargetEntry>,
    pub input: Box<Plan>,
}

/// An aggregation node publishing anonymized buckets
#[derive(Clone, Debug, PartialEq)]
pub struct BucketScan {
    pub context: Arc<AnonymizationContext>,
    pub agg: Agg,
}

/// A physical plan
#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    SeqScan(SeqScan),
    Filter(Filter),
    Agg(Agg),
    Gather(Gather),
    Append(Append),
    SubqueryScan(SubqueryScan),
    Sort(Sort),
    Limit(Limit),
    Project(Project),
    BucketScan(BucketScan),
}

impl Plan {
    pub fn inputs(&self) -> Vec<&Plan> {
        match self {
            Plan::SeqScan(_) => vec![],
            Plan::Filter(Filter { input, .. })
            | Plan::Agg(Agg { input, .. })
            | Plan::Gather(Gather { input, .. })
            | Plan::SubqueryScan(SubqueryScan { input, .. })
            | Plan::Sort(Sort { input, .. })
            | Plan::Limit(Limit { input, .. })
            | Plan::Project(Project { input, .. })
            | Plan::BucketScan(BucketScan {
                agg: Agg { input, .. },
                ..
            }) => vec![input.as_ref()],
            Plan::Append(Append { inputs }) => inputs.iter().collect(),
        }
    }

    /// Iterate over the plan and its inputs, parents first
    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let plan = stack.pop()?;
            stack.extend(plan.inputs().into_iter().rev());
            Some(plan)
        })
    }

    /// The output columns of the plan
    pub fn width(&self) -> Option<usize> {
        match self {
            Plan::SeqScan(_) => None,
            Plan::Agg(agg) | Plan::BucketScan(BucketScan { agg, .. }) => Some(agg.targets.len()),
            Plan::Project(Project { targets, .. }) => Some(targets.len()),
            Plan::SubqueryScan(SubqueryScan { width, .. }) => Some(*width),
            Plan::Filter(Filter { input, .. })
            | Plan::Gather(Gather { input, .. })
            | Plan::Sort(Sort { input, .. })
            | Plan::Limit(Limit { input, .. }) => input.width(),
            Plan::Append(Append { inputs }) => inputs.first().and_then(Plan::width),
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let keyword = |name: &str| name.to_string().bold().blue();
        let targets = |targets: &[TargetEntry]| {
            targets
                .iter()
                .map(|target| {
                    if target.junk {
                        format!("[{}]", target.expr)
                    } else {
                        format!("{}", target.expr)
                    }
                })
                .join(", ")
        };
        match self {
            Plan::SeqScan(SeqScan { table, partition }) => {
                write!(f, "{indent}{} {}", keyword("SeqScan"), table.join(".").red())?;
                if let Some((k, n)) = partition {
                    write!(f, " ({k}/{n})")?;
                }
            }
            Plan::Filter(Filter { qual, .. }) => write!(f, "{indent}{} {qual}", keyword("Filter"))?,
            Plan::Agg(agg) => write!(
                f,
                "{indent}{} {} [{}] BY [{}]{}",
                keyword("Agg"),
                agg.split,
                targets(&agg.targets),
                agg.group_keys.iter().join(", "),
                agg.having
                    .as_ref()
                    .map(|having| format!(" HAVING {having}"))
                    .unwrap_or_default()
            )?,
            Plan::Gather(Gather { workers, .. }) => {
                write!(f, "{indent}{} workers={workers}", keyword("Gather"))?
            }
            Plan::Append(_) => write!(f, "{indent}{}", keyword("Append"))?,
            Plan::SubqueryScan(SubqueryScan { width, .. }) => {
                write!(f, "{indent}{} width={width}", keyword("SubqueryScan"))?
            }
            Plan::Sort(Sort { keys, .. }) => write!(
                f,
                "{indent}{} {}",
                keyword("Sort"),
                keys.iter()
                    .map(|key| {
                        let order = if key.descending { " DESC" } else { "" };
                        format!("{}{order}", key.resno)
                    })
                    .join(", ")
            )?,
            Plan::Limit(Limit { limit, offset, .. }) => write!(
                f,
                "{indent}{} {} OFFSET {}",
                keyword("Limit"),
                limit.map_or("ALL".to_string(), |limit| limit.to_string()),
                offset.unwrap_or(0)
            )?,
            Plan::Project(Project { targets: t, .. }) => {
                write!(f, "{indent}{} {}", keyword("Project"), targets(t))?
            }
            Plan::BucketScan(BucketScan { context, agg }) => write!(
                f,
                "{indent}{} seed={:x} expand={} [{}] BY [{}]",
                keyword("BucketScan").purple(),
                context.sql_seed,
                context.expand_buckets,
                targets(&agg.targets),
                agg.group_keys.iter().join(", ")
            )?,
        }
        for input in self.inputs() {
            writeln!(f)?;
            input.fmt_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// A plan and the names of the columns it returns
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedStatement {
    pub plan: Plan,
    /// Junk columns come last and are not named
    pub column_names: Vec<String>,
}

impl PlannedStatement {
    /// Attach the anonymization contexts to the plan
    pub fn resolve(self, links: &AnonQueryLinks) -> Result<PlannedStatement> {
        Ok(PlannedStatement {
            plan: rewrite_plan(self.plan, links)?,
            column_names: self.column_names,
        })
    }
}

impl fmt::Display for PlannedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "({})", self.column_names.join(", "))?;
        write!(f, "{}", self.plan)
    }
}

fn rewrite_input(input: Box<Plan>, links: &AnonQueryLinks) -> Result<Box<Plan>> {
    Ok(Box::new(rewrite_plan(*input, links)?))
}

/// Resolve the link tokens of a plan.
/// Aggregation nodes linked to a context become `BucketScan`s, partial stages keep
/// their shape and the final stage owns the context. Without links the plan is unchanged.
pub fn rewrite_plan(plan: Plan, links: &AnonQueryLinks) -> Result<Plan> {
    if links.is_empty() {
        return Ok(plan);
    }
    Ok(match plan {
        Plan::Agg(mut agg) => {
            agg.input = rewrite_input(agg.input, links)?;
            let context = link::extract_anon_context(agg.expressions_mut(), links)?;
            match (context, agg.split) {
                (Some(context), AggSplit::Simple | AggSplit::FinalDeserial) => {
                    if agg.group_keys != context.group_keys {
                        return Err(query::Error::mismatched_buckets().into());
                    }
                    log::debug!(
                        "Attaching anonymization context {:x} to aggregation",
                        context.sql_seed
                    );
                    Plan::BucketScan(BucketScan { context, agg })
                }
                _ => Plan::Agg(agg),
            }
        }
        Plan::Filter(Filter { qual, input }) => Plan::Filter(Filter {
            qual,
            input: rewrite_input(input, links)?,
        }),
        Plan::Gather(Gather { workers, input }) => Plan::Gather(Gather {
            workers,
            input: rewrite_input(input, links)?,
        }),
        Plan::Append(Append { inputs }) => Plan::Append(Append {
            inputs: inputs
                .into_iter()
                .map(|input| rewrite_plan(input, links))
                .collect::<Result<Vec<_>>>()?,
        }),
        Plan::SubqueryScan(SubqueryScan { width, input }) => Plan::SubqueryScan(SubqueryScan {
            width,
            input: rewrite_input(input, links)?,
        }),
        Plan::Sort(Sort { keys, input }) => Plan::Sort(Sort {
            keys,
            input: rewrite_input(input, links)?,
        }),
        Plan::Limit(Limit {
            limit,
            offset,
            input,
        }) => Plan::Limit(Limit {
            limit,
            offset,
            input: rewrite_input(input, links)?,
        }),
        Plan::Project(Project { targets, input }) => Plan::Project(Project {
            targets,
            input: rewrite_input(input, links)?,
        }),
        plan @ (Plan::SeqScan(_) | Plan::BucketScan(_)) => plan,
    })
}
