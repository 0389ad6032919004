//! # Links between anonymizing aggregates and their context
//!
//! Planning copies, splits and reorders aggregates, so rewritten aggregates cannot point
//! at their context directly. Instead, each one gets a token in its `location` slot:
//! `AGGREF_LINK_OFFSET` plus an index in a side table of links.
//! Once the query is planned, tokens are resolved back to contexts
//! and the original locations are restored.
//!

use super::{rewrite::AnonymizationContext, Aggref, Error, Expr, Location, Query, Result};
use crate::aggregation::AnonAggregate;
use std::sync::Arc;

/// Large enough not to overlap with real locations
pub const AGGREF_LINK_OFFSET: Location = 1_000_000_000;

fn link_index_to_location(link_index: usize) -> Location {
    AGGREF_LINK_OFFSET + link_index as Location
}

fn location_to_link_index(location: Location) -> Option<usize> {
    location
        .checked_sub(AGGREF_LINK_OFFSET)
        .filter(|index| *index >= 0)
        .map(|index| index as usize)
}

pub fn is_link_location(location: Location) -> bool {
    location >= AGGREF_LINK_OFFSET
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggrefLink {
    pub context: Arc<AnonymizationContext>,
    pub original_location: Location,
    /// Recorded to detect unexpected plan transformations
    pub aggregate: AnonAggregate,
}

/// The side table of links of a query
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnonQueryLinks {
    links: Vec<AggrefLink>,
}

impl AnonQueryLinks {
    pub fn new() -> Self {
        AnonQueryLinks::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, link_index: usize) -> Option<&AggrefLink> {
        self.links.get(link_index)
    }

    /// Stamp a token on the aggregate
    fn link(
        &mut self,
        aggref: &mut Aggref,
        aggregate: AnonAggregate,
        context: &Arc<AnonymizationContext>,
    ) {
        let link_index = self.links.len();
        self.links.push(AggrefLink {
            context: context.clone(),
            original_location: aggref.location,
            aggregate,
        });
        aggref.location = link_index_to_location(link_index);
    }

    /// Resolve the token of an aggregate, if it carries one
    pub fn resolve(&self, aggref: &Aggref) -> Result<Option<&AggrefLink>> {
        let Some(aggregate) = aggref.function.anon_aggregate() else {
            return Ok(None);
        };
        if !is_link_location(aggref.location) {
            return Ok(None);
        }
        let link = location_to_link_index(aggref.location)
            .and_then(|index| self.get(index))
            .ok_or_else(|| Error::invalid_link(aggref.location))?;
        if link.aggregate != aggregate {
            return Err(Error::mismatched_aggregate());
        }
        Ok(Some(link))
    }
}

/// Attach the context to every anonymizing aggregate of the query
pub fn link_anon_context(query: &mut Query, context: Arc<AnonymizationContext>) -> AnonQueryLinks {
    let mut links = AnonQueryLinks::new();
    for expr in query.expressions_mut() {
        expr.for_each_mut(&mut |node| {
            if let Expr::Aggref(aggref) = node {
                if let Some(aggregate) = aggref.function.anon_aggregate() {
                    links.link(aggref, aggregate, &context);
                }
            }
        });
    }
    links
}

/// Extract the context linked to a set of expressions, restoring the original locations.
/// All linked aggregates must share the same context.
pub fn extract_anon_context<'a, I>(
    exprs: I,
    links: &AnonQueryLinks,
) -> Result<Option<Arc<AnonymizationContext>>>
where
    I: IntoIterator<Item = &'a mut Expr>,
{
    let mut context: Option<Arc<AnonymizationContext>> = None;
    for expr in exprs {
        expr.try_for_each_mut(&mut |node| {
            if let Expr::Aggref(aggref) = node {
                if let Some(link) = links.resolve(aggref)? {
                    if let Some(current) = &context {
                        if !Arc::ptr_eq(current, &link.context) {
                            return Err(Error::mismatched_contexts());
                        }
                    }
                    context = Some(link.context.clone());
                    aggref.location = link.original_location;
                }
            }
            Ok(())
        })?;
    }
    Ok(context)
}
