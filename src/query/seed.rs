//! # Bucket seeds
//!
//! The SQL seed depends only on the shape of the grouping expressions.
//! The bucket seed mixes it with the actual label values of a bucket.
//!

use super::{Error, Expr, Query, Result};
use crate::{
    hash::{self, Hash, Seed},
    value::Value,
};
use std::collections::BTreeSet;

/// Fixed bound on the material of one grouping expression
pub const MAX_SEED_MATERIAL_SIZE: usize = 1024;

/// The canonical text of one grouping expression
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedMaterial(String);

impl SeedMaterial {
    pub fn new() -> Self {
        SeedMaterial::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn append(&mut self, material: &str, separator: char) -> Result<()> {
        if self.0.len() + material.len() + 2 > MAX_SEED_MATERIAL_SIZE {
            return Err(Error::seed_material_too_long());
        }
        if !self.0.is_empty() {
            self.0.push(separator);
        }
        self.0.push_str(material);
        Ok(())
    }

    pub fn hash(&self) -> Hash {
        hash::hash_string(&self.0)
    }
}

/// Collect the material of an expression, parents first
pub fn collect_seed_material(
    expr: &Expr,
    query: &Query,
    material: &mut SeedMaterial,
) -> Result<()> {
    for node in expr.iter() {
        match node {
            // Casts are not part of the material, only their argument
            Expr::Func { name, .. } => material.append(name, ',')?,
            Expr::Var(var) => {
                if let Some(table) = query.relation_of(var) {
                    material.append(table.name(), ',')?;
                }
                let column = query
                    .range_table
                    .get(var.rte_index)
                    .and_then(|entry| entry.column_name(var.attno))
                    .unwrap_or(&var.name);
                material.append(column, '.')?;
            }
            Expr::Const { value, .. } => match value {
                Value::Integer(_) | Value::Float(_) => {
                    material.append(&value.to_seed_material(), ',')?
                }
                value => return Err(Error::unsupported_constant(value)),
            },
            _ => {}
        }
    }
    Ok(())
}

/// The data independent part of bucket seeds.
/// The group clause must be explicit when this is called.
pub fn prepare_bucket_seeds(query: &Query) -> Result<Seed> {
    let hashes = query
        .group_exprs()
        .into_iter()
        .map(|expr| {
            let mut material = SeedMaterial::new();
            collect_seed_material(expr, query, &mut material)?;
            log::debug!("Bucket seed material: {}", material.as_str());
            Ok(material.hash())
        })
        .collect::<Result<BTreeSet<Hash>>>()?;
    Ok(hash::hash_set_to_seed(hashes))
}

pub fn hash_label(value: &Value) -> Hash {
    hash::hash_string(&value.to_seed_material())
}

/// The seed of a bucket, from its label values
pub fn compute_bucket_seed(sql_seed: Seed, labels: &[Value]) -> Seed {
    sql_seed ^ hash::hash_set_to_seed(labels.iter().map(hash_label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query::{Aggref, Column, RangeTableEntry, Table},
        value::DataType,
    };

    fn query_grouping_by(exprs: Vec<Expr>) -> Query {
        let table = Table::new(
            "public.events",
            vec![
                Column::new("user_id", DataType::Integer),
                Column::new("amount", DataType::Float),
                Column::new("city", DataType::Text),
            ],
        );
        let mut query = Query::select();
        query.range_table.push(RangeTableEntry::relation(table).with_alias("e"));
        for expr in exprs {
            let resno = query.add_target(expr, "label", false);
            query.add_group_clause(resno);
        }
        query.add_target(Expr::Aggref(Aggref::count_star()), "count", false);
        query
    }

    fn amount() -> Expr {
        Expr::var(0, 2, "amount", DataType::Float)
    }

    fn city() -> Expr {
        Expr::var(0, 3, "city", DataType::Text)
    }

    #[test]
    fn test_material() {
        let query = query_grouping_by(vec![]);
        let mut material = SeedMaterial::new();
        let expr = Expr::func("round", vec![amount(), Expr::val(2.0)], DataType::Float);
        collect_seed_material(&expr, &query, &mut material).unwrap();
        assert_eq!(material.as_str(), "round,events.amount,2");
        let mut material = SeedMaterial::new();
        collect_seed_material(&Expr::cast(city(), DataType::Text), &query, &mut material).unwrap();
        assert_eq!(material.as_str(), "events.city");
        let mut material = SeedMaterial::new();
        let expr = Expr::func("substring", vec![city(), Expr::val("a")], DataType::Text);
        assert!(matches!(
            collect_seed_material(&expr, &query, &mut material),
            Err(Error::UnsupportedConstant(_))
        ));
    }

    #[test]
    fn test_material_too_long() {
        let mut material = SeedMaterial::new();
        let chunk = "x".repeat(500);
        material.append(&chunk, ',').unwrap();
        material.append(&chunk, ',').unwrap();
        assert_eq!(material.append(&chunk, ','), Err(Error::seed_material_too_long()));
    }

    #[test]
    fn test_sql_seed() {
        let forward = prepare_bucket_seeds(&query_grouping_by(vec![amount(), city()])).unwrap();
        let backward = prepare_bucket_seeds(&query_grouping_by(vec![city(), amount()])).unwrap();
        assert_eq!(forward, backward);
        let single = prepare_bucket_seeds(&query_grouping_by(vec![city()])).unwrap();
        assert_ne!(single, forward);
        // Duplicates collapse
        let twice = prepare_bucket_seeds(&query_grouping_by(vec![city(), city()])).unwrap();
        assert_eq!(twice, single);
        assert_eq!(prepare_bucket_seeds(&query_grouping_by(vec![])).unwrap(), 0);
    }

    #[test]
    fn test_bucket_seed() {
        let labels = [Value::integer(1), Value::text("Berlin")];
        let seed = compute_bucket_seed(42, &labels);
        assert_eq!(seed, compute_bucket_seed(42, &[Value::text("Berlin"), Value::float(1.)]));
        assert_ne!(seed, compute_bucket_seed(42, &[Value::integer(2), Value::text("Berlin")]));
        assert_ne!(seed, compute_bucket_seed(43, &labels));
        assert_eq!(hash_label(&Value::null()), hash::hash_string("NULL"));
    }
}
