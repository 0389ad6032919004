//! # Anonymized distinct counting
//!
//! Every distinct non-NULL value is attributed to a single AID per AID column:
//! the smallest AID it was seen with. Values are then counted as contributions
//! of their owner and go through the regular count flattening.
//!

use super::{
    aid::{Aid, AidDescriptor},
    aid_tracker::AidTracker,
    contribution_tracker::{ContributionTracker, ONE_CONTRIBUTION},
    count::{aggregate_count_contributions, CountResult, CountResultAccumulator},
};
use crate::{
    config::Config,
    hash::Seed,
    random::make_seed,
    value::Value,
};
use std::collections::{BTreeSet, HashMap};

/// State of `anon_count_distinct`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountDistinctState {
    descriptors: Vec<AidDescriptor>,
    /// For each distinct value, the AIDs seen with it in each AID column
    values: HashMap<Value, Vec<BTreeSet<Aid>>>,
}

impl CountDistinctState {
    pub fn new(descriptors: &[AidDescriptor]) -> Self {
        CountDistinctState {
            descriptors: descriptors.to_vec(),
            values: HashMap::new(),
        }
    }

    pub fn distinct_values(&self) -> usize {
        self.values.len()
    }

    /// Record a value with its AIDs, NULL values are not counted
    pub fn transition(&mut self, value: &Value, aids: &[Option<Aid>]) {
        if value.is_null() {
            return;
        }
        let dimensions = self.descriptors.len();
        let aid_sets = self
            .values
            .entry(value.clone())
            .or_insert_with(|| vec![BTreeSet::new(); dimensions]);
        for (aid_set, aid) in aid_sets.iter_mut().zip(aids) {
            if let Some(aid) = aid {
                aid_set.insert(*aid);
            }
        }
    }

    pub fn merge(&mut self, other: &CountDistinctState) {
        let dimensions = self.descriptors.len();
        for (value, other_sets) in &other.values {
            let aid_sets = self
                .values
                .entry(value.clone())
                .or_insert_with(|| vec![BTreeSet::new(); dimensions]);
            for (aid_set, other_set) in aid_sets.iter_mut().zip(other_sets) {
                aid_set.extend(other_set.iter().copied());
            }
        }
    }

    /// The count result of the AID column at `dimension`
    fn count_result(&self, dimension: usize, bucket_seed: Seed, config: &Config) -> CountResult {
        let mut aid_tracker = AidTracker::new(self.descriptors[dimension]);
        let mut contribution_tracker = ContributionTracker::new(config.top_contributors_capacity());
        for aid_sets in self.values.values() {
            let aid_set = &aid_sets[dimension];
            aid_set.iter().for_each(|aid| aid_tracker.update(*aid));
            if let Some(owner) = aid_set.first() {
                contribution_tracker.add_contribution(*owner, ONE_CONTRIBUTION);
            }
        }
        aggregate_count_contributions(
            make_seed(config, bucket_seed ^ aid_tracker.seed()),
            self.values.len() as u64,
            aid_tracker.distinct_count(),
            contribution_tracker.top_contributors(config.top_contributors_capacity()),
            config,
        )
    }

    pub fn count_results(&self, bucket_seed: Seed, config: &Config) -> Vec<CountResult> {
        (0..self.descriptors.len())
            .map(|dimension| self.count_result(dimension, bucket_seed, config))
            .collect()
    }

    pub fn finalize(&self, bucket_seed: Seed, config: &Config) -> i64 {
        self.count_results(bucket_seed, config)
            .iter()
            .collect::<CountResultAccumulator>()
            .finalize()
    }
}
