//! # Supported subset of anonymizing queries
//!
//! Anonymizing queries are plain `SELECT`s over a single table,
//! counting rows or values, and defining buckets with a small set of functions.
//!

use super::{AggFunction, CommandType, Error, Expr, Query, Result, RteKind};
use crate::config::Config;

/// Functions allowed in bucket definitions
pub const ALLOWED_FUNCTIONS: [&str; 11] = [
    "round",
    "floor",
    "ceil",
    "ceiling",
    "trunc",
    "width_bucket",
    "substring",
    "lower",
    "upper",
    "date_trunc",
    "length",
];

pub fn is_allowed_function(name: &str) -> bool {
    ALLOWED_FUNCTIONS
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(name))
}

fn not_supported(condition: bool, feature: &str) -> Result<()> {
    if condition {
        Err(Error::not_supported(feature))
    } else {
        Ok(())
    }
}

/// Check the configuration and the query before any rewriting happens
pub fn verify_anonymization_requirements(query: &Query, config: &Config) -> Result<()> {
    // The configuration may have been assembled by hand since it was loaded
    config.validate()?;
    verify_query(query)
}

fn verify_query(query: &Query) -> Result<()> {
    not_supported(query.command_type != CommandType::Select, "non-select query")?;
    not_supported(query.has_ctes, "WITH")?;
    not_supported(query.has_for_update, "FOR [KEY] UPDATE/SHARE")?;
    not_supported(query.has_sublinks, "SubLinks")?;
    not_supported(query.has_target_srfs, "SRF functions")?;
    not_supported(query.has_grouping_sets, "GROUPING SETS")?;
    not_supported(query.has_window_funcs, "window functions")?;
    not_supported(query.has_distinct, "DISTINCT")?;
    not_supported(query.has_set_operations, "UNION/INTERSECT")?;

    verify_aggregators(query)?;
    verify_bucket_functions(query)?;
    verify_rtable(query)
}

fn verify_rtable(query: &Query) -> Result<()> {
    // Cross joins list several items in FROM
    not_supported(query.range_table.len() > 1, "JOINs in anonymizing queries")?;
    for entry in &query.range_table {
        match entry.kind {
            RteKind::Relation(_) => {}
            RteKind::Subquery(_) => {
                return Err(Error::not_supported("Subqueries in anonymizing queries"))
            }
            RteKind::Join => return Err(Error::not_supported("JOINs in anonymizing queries")),
            RteKind::Function(_) => return Err(Error::unsupported("Unsupported FROM clause.")),
        }
    }
    Ok(())
}

fn verify_aggregators(query: &Query) -> Result<()> {
    for aggref in query.aggregates() {
        match aggref.function {
            AggFunction::Count | AggFunction::CountAny => {}
            _ => return Err(Error::unsupported("Unsupported aggregate in query.")),
        }
    }
    Ok(())
}

fn verify_bucket_function(expr: &Expr) -> Result<()> {
    for node in expr.iter() {
        match node {
            Expr::Func { name, .. } if !is_allowed_function(name) => {
                return Err(Error::unsupported("Unsupported function used to define buckets."))
            }
            Expr::Op { .. } => {
                return Err(Error::unsupported("Unsupported operator used to define buckets."))
            }
            _ => {}
        }
    }
    Ok(())
}

/// The expressions defining buckets, explicitly or implicitly
pub fn bucket_expressions(query: &Query) -> Vec<&Expr> {
    if !query.group_clause.is_empty() {
        query.group_exprs()
    } else if !query.has_aggs {
        query
            .target_list
            .iter()
            .filter(|entry| !entry.junk)
            .map(|entry| &entry.expr)
            .collect()
    } else {
        // The global bucket
        vec![]
    }
}

fn verify_bucket_functions(query: &Query) -> Result<()> {
    bucket_expressions(query)
        .into_iter()
        .try_for_each(verify_bucket_function)
}
