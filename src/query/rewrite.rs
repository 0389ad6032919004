//! # Anonymizing rewrite of queries
//!
//! Turns a validated counting query into an AID aware one:
//! - simple selects are grouped by their non-constant targets and counted,
//! - count aggregates are replaced by their anonymizing counterparts, taking every AID in scope,
//! - a hidden low-count aggregate decides which buckets are suppressed.
//!

use super::{
    link::{self, AnonQueryLinks},
    seed, validation, AggFunction, Aggref, AnonymizationId, Error, Expr, Query, Result, RteKind,
    SensitiveRelation,
};
use crate::{aggregation::AnonAggregate, config::Config, hash::Seed};
use std::sync::Arc;

/// What an anonymizing query scope decided at rewrite time
#[derive(Clone, Debug, PartialEq)]
pub struct AnonymizationContext {
    pub sql_seed: Seed,
    /// A copy of the grouping expressions, the labels of every bucket
    pub group_keys: Vec<Expr>,
    /// Implicit buckets are repeated as many times as their count
    pub expand_buckets: bool,
}

/// An AID column in the scope of a query
#[derive(Clone, Debug, PartialEq)]
pub struct AidRef {
    pub relation: SensitiveRelation,
    pub aid: AnonymizationId,
    /// 0-based position in the range table
    pub rte_index: usize,
}

impl AidRef {
    pub fn expr(&self) -> Expr {
        Expr::var(self.rte_index, self.aid.attno, &self.aid.name, self.aid.data_type)
    }
}

fn find_relation<'a>(
    table_path: &[String],
    relations: &'a [SensitiveRelation],
) -> Option<&'a SensitiveRelation> {
    relations.iter().find(|relation| relation.path == table_path)
}

/// Does the query, or any of its subqueries, read a sensitive relation
pub fn is_sensitive_query(query: &Query, relations: &[SensitiveRelation]) -> bool {
    query.range_table.iter().any(|entry| match &entry.kind {
        RteKind::Relation(table) => find_relation(&table.path, relations).is_some(),
        RteKind::Subquery(subquery) => is_sensitive_query(subquery, relations),
        RteKind::Join | RteKind::Function(_) => false,
    })
}

/// The AID columns of the relations in the range table
pub fn gather_aid_refs(query: &Query, relations: &[SensitiveRelation]) -> Result<Vec<AidRef>> {
    let mut aid_refs = vec![];
    for (rte_index, entry) in query.range_table.iter().enumerate() {
        if let RteKind::Relation(table) = &entry.kind {
            if let Some(relation) = find_relation(&table.path, relations) {
                for aid in &relation.aid_columns {
                    aid.descriptor()?;
                    aid_refs.push(AidRef {
                        relation: relation.clone(),
                        aid: aid.clone(),
                        rte_index,
                    });
                }
            }
        }
    }
    Ok(aid_refs)
}

fn append_aid_args(aggref: &mut Aggref, aid_refs: &[AidRef]) -> Result<()> {
    if aid_refs.is_empty() {
        return Err(Error::no_aid_found());
    }
    aggref.args.extend(aid_refs.iter().map(AidRef::expr));
    Ok(())
}

fn rewrite_to_anon_aggregator(
    aggref: &mut Aggref,
    aid_refs: &[AidRef],
    aggregate: AnonAggregate,
) -> Result<()> {
    aggref.function = AggFunction::Anon(aggregate);
    aggref.star = false;
    aggref.distinct = false;
    append_aid_args(aggref, aid_refs)
}

fn rewrite_aggregates(expr: &mut Expr, aid_refs: &[AidRef]) -> Result<()> {
    expr.try_for_each_mut(&mut |node| {
        if let Expr::Aggref(aggref) = node {
            let aggregate = match aggref.function {
                AggFunction::Count => AnonAggregate::CountStar,
                AggFunction::CountAny if aggref.distinct => AnonAggregate::CountDistinct,
                AggFunction::CountAny => AnonAggregate::CountValue,
                _ => return Ok(()),
            };
            rewrite_to_anon_aggregator(aggref, aid_refs, aggregate)?;
        }
        Ok(())
    })
}

/// Group by every target reading a column
fn group_implicit_buckets(query: &mut Query) {
    let resnos: Vec<usize> = query
        .target_list
        .iter()
        .filter(|entry| entry.expr.has_var())
        .map(|entry| entry.resno)
        .collect();
    for resno in resnos {
        query.add_group_clause(resno);
    }
}

fn add_junk_count_star(query: &mut Query) {
    query.add_target(
        Expr::Aggref(Aggref::count_star()),
        AnonAggregate::CountStar.name(),
        true,
    );
}

fn add_junk_low_count_agg(query: &mut Query, aid_refs: &[AidRef]) -> Result<()> {
    let mut aggref = Aggref::new(AggFunction::Anon(AnonAggregate::LowCount), vec![]);
    append_aid_args(&mut aggref, aid_refs)?;
    query.add_target(Expr::Aggref(aggref), AnonAggregate::LowCount.name(), true);
    Ok(())
}

/// Rewrite the query in place, returns its context with an unset SQL seed
pub fn make_query_anonymizing(
    query: &mut Query,
    relations: &[SensitiveRelation],
) -> Result<AnonymizationContext> {
    let aid_refs = gather_aid_refs(query, relations)?;
    if aid_refs.is_empty() {
        return Err(Error::no_aid_found());
    }

    let initial_has_aggs = query.has_aggs;
    let initial_has_group_clause = !query.group_clause.is_empty();
    let initial_all_targets_constant = !query.target_list.iter().any(|entry| entry.expr.has_var());

    let mut expand_buckets = false;
    // Only simple select queries require implicit grouping
    if !initial_has_aggs && !initial_has_group_clause {
        log::debug!("Rewriting query to group and expand implicit buckets");
        group_implicit_buckets(query);
        add_junk_count_star(query);
        expand_buckets = true;
    }

    for expr in query.expressions_mut() {
        rewrite_aggregates(expr, &aid_refs)?;
    }

    // Global aggregates are not low-count filtered
    if initial_has_group_clause || (!initial_has_aggs && !initial_all_targets_constant) {
        log::debug!("Adding low count filter");
        add_junk_low_count_agg(query, &aid_refs)?;
    }

    query.has_aggs = true;

    Ok(AnonymizationContext {
        sql_seed: 0,
        group_keys: query.group_exprs().into_iter().cloned().collect(),
        expand_buckets,
    })
}

/// Validate, rewrite and link an anonymizing query.
/// The returned links are needed to attach contexts to the planned query.
pub fn compile_anonymizing_query(
    query: &mut Query,
    relations: &[SensitiveRelation],
    config: &Config,
) -> Result<AnonQueryLinks> {
    validation::verify_anonymization_requirements(query, config)?;
    let mut context = make_query_anonymizing(query, relations)?;
    context.sql_seed = seed::prepare_bucket_seeds(query)?;
    log::debug!("SQL seed of anonymizing query: {:x}", context.sql_seed);
    Ok(link::link_anon_context(query, Arc::new(context)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query::{Column, RangeTableEntry, Table},
        value::DataType,
    };

    fn events() -> Table {
        Table::new(
            "events",
            vec![
                Column::new("user_id", DataType::Integer),
                Column::new("action", DataType::Text),
                Column::new("device", DataType::Text),
            ],
        )
        .with_aids(["user_id", "device"])
    }

    fn relations() -> Vec<SensitiveRelation> {
        vec![events().sensitive_relation().unwrap().unwrap()]
    }

    fn action() -> Expr {
        Expr::var(0, 2, "action", DataType::Text)
    }

    fn query() -> Query {
        let mut query = Query::select();
        query.range_table.push(RangeTableEntry::relation(events()));
        query
    }

    fn anon_aggregates(query: &Query) -> Vec<(AnonAggregate, usize)> {
        query
            .aggregates()
            .into_iter()
            .filter_map(|aggref| Some((aggref.function.anon_aggregate()?, aggref.args.len())))
            .collect()
    }

    #[test]
    fn test_grouped_count() {
        let mut query = query();
        let resno = query.add_target(action(), "action", false);
        query.add_target(Expr::Aggref(Aggref::count_star()), "count", false);
        let mut count_distinct = Aggref::new(AggFunction::CountAny, vec![action()]);
        count_distinct.distinct = true;
        query.add_target(Expr::Aggref(count_distinct), "distinct_actions", false);
        let count_actions = Aggref::new(AggFunction::CountAny, vec![action()]);
        query.add_target(Expr::Aggref(count_actions), "actions", false);
        query.add_group_clause(resno);
        query.has_aggs = true;

        let context = make_query_anonymizing(&mut query, &relations()).unwrap();
        println!("{query}");
        assert!(!context.expand_buckets);
        assert_eq!(context.group_keys, vec![action()]);
        assert_eq!(
            anon_aggregates(&query),
            vec![
                (AnonAggregate::CountStar, 2),
                (AnonAggregate::CountDistinct, 3),
                (AnonAggregate::CountValue, 3),
                (AnonAggregate::LowCount, 2),
            ]
        );
        assert!(query.aggregates().iter().all(|aggref| !aggref.star && !aggref.distinct));
        assert_eq!(query.output_names(), vec!["action", "count", "distinct_actions", "actions"]);
    }

    #[test]
    fn test_implicit_grouping() {
        let mut query = query();
        query.add_target(action(), "action", false);
        query.add_target(Expr::val(1), "one", false);
        let context = make_query_anonymizing(&mut query, &relations()).unwrap();
        println!("{query}");
        assert!(context.expand_buckets);
        assert!(query.has_aggs);
        assert_eq!(query.group_clause.len(), 1);
        assert_eq!(query.group_exprs(), vec![&action()]);
        assert_eq!(context.group_keys, vec![action()]);
        assert_eq!(
            anon_aggregates(&query),
            vec![(AnonAggregate::CountStar, 2), (AnonAggregate::LowCount, 2)]
        );
        assert_eq!(query.output_names(), vec!["action", "one"]);
    }

    #[test]
    fn test_global_aggregate_has_no_low_count() {
        let mut query = query();
        query.add_target(Expr::Aggref(Aggref::count_star()), "count", false);
        query.has_aggs = true;
        let context = make_query_anonymizing(&mut query, &relations()).unwrap();
        assert!(!context.expand_buckets);
        assert!(query.group_clause.is_empty());
        assert_eq!(anon_aggregates(&query), vec![(AnonAggregate::CountStar, 2)]);
    }

    #[test]
    fn test_no_aid_found() {
        let mut query = query();
        query.add_target(Expr::Aggref(Aggref::count_star()), "count", false);
        query.has_aggs = true;
        assert_eq!(
            make_query_anonymizing(&mut query, &[]).unwrap_err(),
            Error::no_aid_found()
        );
        assert!(!is_sensitive_query(&query, &[]));
        assert!(is_sensitive_query(&query, &relations()));
    }

    #[test]
    fn test_compile() {
        let mut query = query();
        let resno = query.add_target(action(), "action", false);
        query.add_target(Expr::Aggref(Aggref::count_star()), "count", false);
        query.add_group_clause(resno);
        query.has_aggs = true;
        let links =
            compile_anonymizing_query(&mut query, &relations(), &Config::default()).unwrap();
        assert_eq!(links.len(), 2);
        let context = links.get(0).unwrap().context.clone();
        assert_ne!(context.sql_seed, 0);
        assert_eq!(
            context.sql_seed,
            seed::prepare_bucket_seeds(&query).unwrap()
        );
    }
}
