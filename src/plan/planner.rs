//! Builds physical plans from bound queries.
//! A parallel planner splits aggregations over base tables in partial and final stages.

use super::{
    Agg, AggSplit, Append, Error, Filter, Gather, Limit, Plan, PlannedStatement, Project, Result,
    SeqScan, Sort, SubqueryScan,
};
use crate::query::{CommandType, Query, RteKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Planner {
    workers: usize,
}

impl Default for Planner {
    fn default() -> Self {
        Planner::simple()
    }
}

impl Planner {
    /// Every node runs once, in the calling thread
    pub fn simple() -> Self {
        Planner { workers: 1 }
    }

    /// Aggregations over base tables run in `workers` partitions
    pub fn parallel(workers: usize) -> Self {
        Planner {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn plan(&self, query: &Query) -> Result<PlannedStatement> {
        let plan = self.plan_query(query)?;
        log::debug!("Planned query:\n{plan}");
        Ok(PlannedStatement {
            plan,
            column_names: query.output_names().into_iter().map(String::from).collect(),
        })
    }

    fn plan_query(&self, query: &Query) -> Result<Plan> {
        if query.command_type != CommandType::Select {
            return Err(Error::unsupported("Only SELECT statements can be planned."));
        }
        if query.has_distinct {
            return Err(Error::unsupported("DISTINCT"));
        }
        if query.has_window_funcs {
            return Err(Error::unsupported("Window functions"));
        }
        if query.has_target_srfs {
            return Err(Error::unsupported("Set returning functions"));
        }
        if query
            .target_list
            .iter()
            .skip_while(|target| !target.junk)
            .any(|target| !target.junk)
        {
            return Err(Error::other("Junk entries must follow the output columns."));
        }

        let is_grouped =
            query.has_aggs || !query.group_clause.is_empty() || query.having_clause.is_some();
        let plan = match query.range_table.as_slice() {
            [entry] => match &entry.kind {
                RteKind::Relation(table) if is_grouped && self.workers > 1 => {
                    self.plan_parallel_agg(query, &table.path)
                }
                RteKind::Relation(table) => {
                    let scan = Plan::SeqScan(SeqScan {
                        table: table.path.clone(),
                        partition: None,
                    });
                    self.plan_upper(query, scan, is_grouped)
                }
                RteKind::Subquery(subquery) => {
                    let scan = Plan::SubqueryScan(SubqueryScan {
                        width: subquery.output_names().len(),
                        input: Box::new(self.plan_query(subquery)?),
                    });
                    self.plan_upper(query, scan, is_grouped)
                }
                RteKind::Join | RteKind::Function(_) => {
                    return Err(Error::unsupported("Unsupported FROM clause."))
                }
            },
            _ => return Err(Error::unsupported("Unsupported FROM clause.")),
        };
        Ok(add_sort_and_limit(query, plan))
    }

    fn filter(query: &Query, input: Plan) -> Plan {
        match &query.where_clause {
            Some(qual) => Plan::Filter(Filter {
                qual: qual.clone(),
                input: Box::new(input),
            }),
            None => input,
        }
    }

    fn agg(query: &Query, split: AggSplit, input: Plan) -> Plan {
        Plan::Agg(Agg {
            group_keys: query.group_exprs().into_iter().cloned().collect(),
            targets: query.target_list.clone(),
            having: query.having_clause.clone(),
            split,
            input: Box::new(input),
        })
    }

    /// Filter, then aggregate or project
    fn plan_upper(&self, query: &Query, scan: Plan, is_grouped: bool) -> Plan {
        let input = Planner::filter(query, scan);
        if is_grouped {
            Planner::agg(query, AggSplit::Simple, input)
        } else {
            Plan::Project(Project {
                targets: query.target_list.clone(),
                input: Box::new(input),
            })
        }
    }

    /// Partial aggregations of table partitions, gathered and finalized.
    /// Partial stages carry the same aggregates as the final one,
    /// HAVING is only applied at the end.
    fn plan_parallel_agg(&self, query: &Query, table: &[String]) -> Plan {
        let partials = (0..self.workers)
            .map(|k| {
                let scan = Plan::SeqScan(SeqScan {
                    table: table.to_vec(),
                    partition: Some((k, self.workers)),
                });
                Planner::agg(query, AggSplit::InitialSerial, Planner::filter(query, scan))
            })
            .collect();
        let gather = Plan::Gather(Gather {
            workers: self.workers,
            input: Box::new(Plan::Append(Append { inputs: partials })),
        });
        Planner::agg(query, AggSplit::FinalDeserial, gather)
    }
}

fn add_sort_and_limit(query: &Query, plan: Plan) -> Plan {
    let plan = if query.sort_clause.is_empty() {
        plan
    } else {
        Plan::Sort(Sort {
            keys: query.sort_clause.clone(),
            input: Box::new(plan),
        })
    };
    if query.limit.is_some() || query.offset.is_some() {
        Plan::Limit(Limit {
            limit: query.limit,
            offset: query.offset,
            input: Box::new(plan),
        })
    } else {
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query::{Catalog, Column, Table},
        sql,
        value::DataType,
    };

    fn catalog() -> Catalog {
        Catalog::new()
            .with(Table::new(
                "events",
                vec![
                    Column::new("user_id", DataType::Integer),
                    Column::new("action", DataType::Text),
                    Column::new("amount", DataType::Float),
                ],
            ))
            .with(Table::new("cities", vec![Column::new("name", DataType::Text)]))
    }

    fn bind(sql: &str) -> Query {
        sql::bind(&sql::parse(sql).unwrap(), &catalog()).unwrap()
    }

    #[test]
    fn test_simple_plans() {
        let planner = Planner::simple();
        let statement = planner
            .plan(&bind("SELECT action, count(*) FROM events WHERE amount > 1 GROUP BY action"))
            .unwrap();
        println!("{statement}");
        assert_eq!(statement.column_names, vec!["action", "count"]);
        let kinds: Vec<&str> = statement
            .plan
            .iter()
            .map(|plan| match plan {
                Plan::Agg(_) => "agg",
                Plan::Filter(_) => "filter",
                Plan::SeqScan(_) => "scan",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["agg", "filter", "scan"]);

        let statement = planner
            .plan(&bind("SELECT action FROM events ORDER BY amount DESC LIMIT 3"))
            .unwrap();
        println!("{statement}");
        assert!(matches!(statement.plan, Plan::Limit(Limit { limit: Some(3), .. })));
        // The sort key is a junk column
        assert_eq!(statement.column_names, vec!["action"]);
        assert_eq!(statement.plan.width(), Some(2));
    }

    #[test]
    fn test_parallel_plans() {
        let planner = Planner::parallel(3);
        let statement = planner
            .plan(&bind("SELECT action, count(*) FROM events GROUP BY action HAVING count(*) > 1"))
            .unwrap();
        println!("{statement}");
        let Plan::Agg(agg) = &statement.plan else {
            panic!()
        };
        assert_eq!(agg.split, AggSplit::FinalDeserial);
        let partials: Vec<&Agg> = statement
            .plan
            .iter()
            .filter_map(|plan| match plan {
                Plan::Agg(agg) if agg.split == AggSplit::InitialSerial => Some(agg),
                _ => None,
            })
            .collect();
        assert_eq!(partials.len(), 3);
        assert!(partials.iter().all(|partial| partial.aggregates() == agg.aggregates()));
        let partitions: Vec<(usize, usize)> = statement
            .plan
            .iter()
            .filter_map(|plan| match plan {
                Plan::SeqScan(scan) => scan.partition,
                _ => None,
            })
            .collect();
        assert_eq!(partitions, vec![(0, 3), (1, 3), (2, 3)]);
        // Projections are not split
        let statement = planner.plan(&bind("SELECT name FROM cities")).unwrap();
        assert!(matches!(statement.plan, Plan::Project(_)));
    }

    #[test]
    fn test_subquery_plans() {
        let statement = Planner::parallel(2)
            .plan(&bind(
                "SELECT count(*) FROM (SELECT action FROM events ORDER BY amount) AS t",
            ))
            .unwrap();
        println!("{statement}");
        let scan = statement
            .plan
            .iter()
            .find_map(|plan| match plan {
                Plan::SubqueryScan(scan) => Some(scan),
                _ => None,
            })
            .unwrap();
        assert_eq!(scan.width, 1);
        assert!(matches!(scan.input.as_ref(), Plan::Sort(_)));
    }

    #[test]
    fn test_unsupported_plans() {
        let planner = Planner::simple();
        for sql in [
            "SELECT DISTINCT action FROM events",
            "SELECT e.action FROM events e JOIN cities c ON e.action = c.name",
            "SELECT generate_series(1, 3) FROM events",
        ] {
            let err = planner.plan(&bind(sql)).unwrap_err();
            println!("{err}");
            assert!(matches!(err, Error::Unsupported(_)));
        }
    }
}
