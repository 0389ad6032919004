//! # Anonymized counting
//!
//! For each AID column, the largest contributors (the outliers) are flattened
//! down to the average of the contributors ranked right after them,
//! then noise proportional to the flattening is added.
//! When a relation has several AID columns, the most conservative
//! result (largest flattening, largest noise) is published.
//!

use super::{
    aid::{Aid, AidDescriptor},
    aid_tracker::AidTracker,
    contribution_tracker::{ContributionTracker, Contributor, ONE_CONTRIBUTION},
};
use crate::{
    config::Config,
    hash::Seed,
    random::{self, make_seed},
};

/// Describes the anonymized count for one AID column
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CountResult {
    pub random_seed: Seed,
    pub true_count: u64,
    pub flattening: f64,
    pub flattened_count: f64,
    pub noisy_outlier_count: u32,
    pub noisy_top_count: u32,
    pub noise_sigma: f64,
    pub noise: f64,
    pub not_enough_aidvs: bool,
}

impl CountResult {
    /// The count published for this AID column alone
    pub fn reported_count(&self) -> i64 {
        if self.not_enough_aidvs {
            0
        } else {
            ((self.flattened_count + self.noise).round() as i64).max(0)
        }
    }
}

fn sum(contributors: &[Contributor]) -> f64 {
    contributors.iter().map(|c| c.contribution as f64).sum()
}

/// Flatten and noise the count of one AID column.
/// `top_contributors` must be in ranking order and hold at least
/// `outlier_count_max + top_count_max` contributors when that many exist.
pub fn aggregate_count_contributions(
    seed: Seed,
    true_count: u64,
    distinct_contributors: usize,
    top_contributors: &[Contributor],
    config: &Config,
) -> CountResult {
    let mut result = CountResult {
        random_seed: seed,
        true_count,
        flattening: 0.,
        flattened_count: true_count as f64,
        noisy_outlier_count: 0,
        noisy_top_count: 0,
        noise_sigma: 0.,
        noise: 0.,
        not_enough_aidvs: distinct_contributors < config.minimum_allowed_aids as usize,
    };
    if result.not_enough_aidvs {
        return result;
    }

    let mut seed = seed;
    let outlier_count =
        random::next_uniform_int(&mut seed, config.outlier_count_min, config.outlier_count_max + 1);
    let top_count =
        random::next_uniform_int(&mut seed, config.top_count_min, config.top_count_max + 1);

    // The top group keeps at least one contributor
    let available = top_contributors.len().min(distinct_contributors);
    let outlier_end = (outlier_count as usize).min(available.saturating_sub(1));
    let top_end = (outlier_end + top_count as usize).min(available);
    let outliers = &top_contributors[..outlier_end];
    let top_group = &top_contributors[outlier_end..top_end];
    result.noisy_outlier_count = outliers.len() as u32;
    result.noisy_top_count = top_group.len() as u32;

    let replacement = if top_group.is_empty() {
        0.
    } else {
        sum(top_group) / top_group.len() as f64
    };
    result.flattening = (sum(outliers) - outliers.len() as f64 * replacement).max(0.);
    result.flattened_count = true_count as f64 - result.flattening;
    result.noise_sigma = config.noise_sigma * result.flattening.max(1.);
    result.noise = random::next_noise(&mut seed, result.noise_sigma, config);
    result
}

/// Combines the count results of several AID columns into one published count
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CountResultAccumulator {
    max_flattening: f64,
    count_for_flattening: f64,
    max_noise_sigma: f64,
    noise_with_max_sigma: f64,
    not_enough_aidvs: bool,
    accumulated: bool,
}

impl CountResultAccumulator {
    pub fn new() -> Self {
        CountResultAccumulator::default()
    }

    pub fn accumulate(&mut self, result: &CountResult) {
        if result.not_enough_aidvs {
            self.not_enough_aidvs = true;
            return;
        }
        if !self.accumulated || result.flattening > self.max_flattening {
            self.max_flattening = result.flattening;
            self.count_for_flattening = result.flattened_count;
        }
        if !self.accumulated || result.noise_sigma > self.max_noise_sigma {
            self.max_noise_sigma = result.noise_sigma;
            self.noise_with_max_sigma = result.noise;
        }
        self.accumulated = true;
    }

    /// Fold another accumulator in, keeping the most conservative values
    pub fn merge(&mut self, other: &CountResultAccumulator) {
        self.not_enough_aidvs |= other.not_enough_aidvs;
        if !other.accumulated {
            return;
        }
        if !self.accumulated || other.max_flattening > self.max_flattening {
            self.max_flattening = other.max_flattening;
            self.count_for_flattening = other.count_for_flattening;
        }
        if !self.accumulated || other.max_noise_sigma > self.max_noise_sigma {
            self.max_noise_sigma = other.max_noise_sigma;
            self.noise_with_max_sigma = other.noise_with_max_sigma;
        }
        self.accumulated = true;
    }

    pub fn not_enough_aidvs(&self) -> bool {
        self.not_enough_aidvs || !self.accumulated
    }

    pub fn max_flattening(&self) -> f64 {
        self.max_flattening
    }

    pub fn max_noise_sigma(&self) -> f64 {
        self.max_noise_sigma
    }

    /// The published count
    pub fn finalize(&self) -> i64 {
        if self.not_enough_aidvs() {
            0
        } else {
            ((self.count_for_flattening + self.noise_with_max_sigma).round() as i64).max(0)
        }
    }
}

impl<'a> FromIterator<&'a CountResult> for CountResultAccumulator {
    fn from_iter<T: IntoIterator<Item = &'a CountResult>>(iter: T) -> Self {
        let mut accumulator = CountResultAccumulator::new();
        iter.into_iter().for_each(|result| accumulator.accumulate(result));
        accumulator
    }
}

/// Trackers of one AID column
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountTracker {
    pub aid_tracker: AidTracker,
    pub contribution_tracker: ContributionTracker,
}

impl CountTracker {
    pub fn new(descriptor: AidDescriptor, config: &Config) -> Self {
        CountTracker {
            aid_tracker: AidTracker::new(descriptor),
            contribution_tracker: ContributionTracker::new(config.top_contributors_capacity()),
        }
    }

    pub fn add_contribution(&mut self, aid: Aid, amount: u64) {
        self.aid_tracker.update(aid);
        self.contribution_tracker.add_contribution(aid, amount);
    }

    pub fn merge(&mut self, other: &CountTracker) {
        self.aid_tracker.merge(&other.aid_tracker);
        self.contribution_tracker.merge(&other.contribution_tracker);
    }

    /// The noise layer of this AID column in a bucket
    pub fn seed(&self, bucket_seed: Seed, config: &Config) -> Seed {
        make_seed(config, bucket_seed ^ self.aid_tracker.seed())
    }

    pub fn count_result(&self, true_count: u64, bucket_seed: Seed, config: &Config) -> CountResult {
        aggregate_count_contributions(
            self.seed(bucket_seed, config),
            true_count,
            self.aid_tracker.distinct_count(),
            self.contribution_tracker
                .top_contributors(config.top_contributors_capacity()),
            config,
        )
    }
}

/// State of `anon_count_star` and `anon_count_value`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountState {
    trackers: Vec<CountTracker>,
    true_count: u64,
}

impl CountState {
    pub fn new(descriptors: &[AidDescriptor], config: &Config) -> Self {
        CountState {
            trackers: descriptors
                .iter()
                .map(|descriptor| CountTracker::new(*descriptor, config))
                .collect(),
            true_count: 0,
        }
    }

    pub fn true_count(&self) -> u64 {
        self.true_count
    }

    pub fn trackers(&self) -> &[CountTracker] {
        &self.trackers
    }

    /// Count one row, given its AID in each AID column
    pub fn transition(&mut self, aids: &[Option<Aid>]) {
        self.true_count += 1;
        for (tracker, aid) in self.trackers.iter_mut().zip(aids) {
            if let Some(aid) = aid {
                tracker.add_contribution(*aid, ONE_CONTRIBUTION);
            }
        }
    }

    pub fn merge(&mut self, other: &CountState) {
        self.true_count += other.true_count;
        for (tracker, other_tracker) in self.trackers.iter_mut().zip(&other.trackers) {
            tracker.merge(other_tracker);
        }
    }

    pub fn count_results(&self, bucket_seed: Seed, config: &Config) -> Vec<CountResult> {
        self.trackers
            .iter()
            .map(|tracker| tracker.count_result(self.true_count, bucket_seed, config))
            .collect()
    }

    pub fn finalize(&self, bucket_seed: Seed, config: &Config) -> i64 {
        self.count_results(bucket_seed, config)
            .iter()
            .collect::<CountResultAccumulator>()
            .finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;
    use proptest::prelude::*;

    fn strict_config() -> Config {
        Config::default().with_outlier_count(1, 1).with_top_count(1, 1)
    }

    fn contributors(contributions: &[(Aid, u64)]) -> Vec<Contributor> {
        let mut contributors: Vec<Contributor> = contributions
            .iter()
            .map(|(aid, c)| Contributor::new(*aid, *c))
            .collect();
        contributors.sort();
        contributors
    }

    #[test]
    fn test_flattening_scenario() {
        let config = strict_config();
        let top = contributors(&[(1, 50), (2, 1), (3, 1)]);
        let result = aggregate_count_contributions(1234, 52, 3, &top, &config);
        println!("{:?}", result);
        assert!(!result.not_enough_aidvs);
        assert_eq!(result.noisy_outlier_count, 1);
        assert_eq!(result.noisy_top_count, 1);
        assert_eq!(result.flattening, 49.);
        assert_eq!(result.flattened_count, 3.);
        assert_eq!(result.noise_sigma, 49.);
        assert!(result.noise.abs() <= config.noise_cutoff);
        assert_eq!(result.reported_count(), ((3. + result.noise).round() as i64).max(0));
    }

    #[test]
    fn test_not_enough_aidvs() {
        let config = strict_config();
        let top = contributors(&[(1, 10)]);
        let result = aggregate_count_contributions(1234, 10, 1, &top, &config);
        assert!(result.not_enough_aidvs);
        assert_eq!(result.reported_count(), 0);
        let accumulator: CountResultAccumulator = [result].iter().collect();
        assert!(accumulator.not_enough_aidvs());
        assert_eq!(accumulator.finalize(), 0);
    }

    #[test]
    fn test_no_flattening_for_uniform_contributions() {
        let config = Config::default();
        let top = contributors(&(0..10).map(|aid| (aid, 2)).collect::<Vec<_>>());
        let result = aggregate_count_contributions(99, 20, 10, &top, &config);
        assert_eq!(result.flattening, 0.);
        assert_eq!(result.noise_sigma, config.noise_sigma);
        assert!((1..=2).contains(&result.noisy_outlier_count));
        assert!((4..=6).contains(&result.noisy_top_count));
    }

    #[test]
    fn test_outliers_shrink_with_few_contributors() {
        let config = Config::default().with_outlier_count(2, 2).with_top_count(4, 4);
        let top = contributors(&[(1, 9), (2, 1)]);
        let result = aggregate_count_contributions(5, 10, 2, &top, &config);
        assert_eq!(result.noisy_outlier_count, 1);
        assert_eq!(result.noisy_top_count, 1);
        assert_eq!(result.flattening, 8.);
        assert_eq!(result.flattened_count, 2.);
    }

    #[test]
    fn test_deterministic() {
        let config = Config::default();
        let top = contributors(&[(1, 30), (2, 5), (3, 4), (4, 4), (5, 3), (6, 1), (7, 1)]);
        let first = aggregate_count_contributions(777, 48, 7, &top, &config);
        let second = aggregate_count_contributions(777, 48, 7, &top, &config);
        assert_eq!(first, second);
        let other = aggregate_count_contributions(778, 48, 7, &top, &config);
        println!("{:?}\n{:?}", first, other);
    }

    #[test]
    fn test_accumulator_keeps_most_conservative() {
        let low = CountResult {
            random_seed: 0,
            true_count: 10,
            flattening: 1.,
            flattened_count: 9.,
            noisy_outlier_count: 1,
            noisy_top_count: 4,
            noise_sigma: 3.,
            noise: 0.4,
            not_enough_aidvs: false,
        };
        let high = CountResult {
            flattening: 4.,
            flattened_count: 6.,
            noise_sigma: 2.,
            noise: -0.2,
            ..low
        };
        let accumulator: CountResultAccumulator = [low, high].iter().collect();
        assert_eq!(accumulator.max_flattening(), 4.);
        assert_eq!(accumulator.max_noise_sigma(), 3.);
        assert_eq!(accumulator.finalize(), 6);
        let reversed: CountResultAccumulator = [high, low].iter().collect();
        assert_eq!(reversed, accumulator);
        let mut merged: CountResultAccumulator = [low].iter().collect();
        merged.merge(&[high].iter().collect());
        assert_eq!(merged, accumulator);
    }

    #[test]
    fn test_count_state() {
        let config = strict_config();
        let descriptor = AidDescriptor::from_data_type(DataType::Integer).unwrap();
        let mut state = CountState::new(&[descriptor], &config);
        for _ in 0..50 {
            state.transition(&[Some(1)]);
        }
        state.transition(&[Some(2)]);
        state.transition(&[Some(3)]);
        state.transition(&[None]);
        assert_eq!(state.true_count(), 53);
        let results = state.count_results(42, &config);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].flattening, 49.);
        assert_eq!(results[0].flattened_count, 4.);
        assert_eq!(state.finalize(42, &config), state.finalize(42, &config));
    }

    proptest! {
        #[test]
        fn prop_flattening_bounds(
            contributions in prop::collection::vec(1u64..100, 2..30),
            seed in any::<u64>(),
        ) {
            let config = Config::default();
            let rows: Vec<(Aid, u64)> = contributions
                .iter()
                .enumerate()
                .map(|(aid, c)| (aid as Aid, *c))
                .collect();
            let true_count: u64 = contributions.iter().sum();
            let top = contributors(&rows);
            let capacity = config.top_contributors_capacity().min(top.len());
            let result = aggregate_count_contributions(
                seed,
                true_count,
                rows.len(),
                &top[..capacity],
                &config,
            );
            prop_assert!(result.flattening >= 0.);
            prop_assert!(result.flattened_count <= true_count as f64);
            prop_assert!(result.noise.abs() <= config.noise_cutoff);
            prop_assert!(result.reported_count() >= 0);
        }
    }
}
