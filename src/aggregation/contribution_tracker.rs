//! # Per AID contributions of a bucket
//!
//! The tracker keeps the total contribution of every AID and a bounded,
//! always sorted list of the largest contributors.
//! Contributors are ranked by decreasing contribution, ties broken by increasing AID,
//! so the ranking never depends on insertion order.
//!

use super::aid::Aid;
use itertools::Itertools;
use std::{
    cmp::{Ordering, Reverse},
    collections::{hash_map::Entry, HashMap},
};

/// Magnitude of a contribution
pub type Contribution = u64;

/// The unit contribution of one counted row
pub const ONE_CONTRIBUTION: Contribution = 1;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Contributor {
    pub aid: Aid,
    pub contribution: Contribution,
}

impl Contributor {
    pub fn new(aid: Aid, contribution: Contribution) -> Self {
        Contributor { aid, contribution }
    }
}

/// Ranking order: the largest contributor comes first
impl Ord for Contributor {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .contribution
            .cmp(&self.contribution)
            .then_with(|| self.aid.cmp(&other.aid))
    }
}

impl PartialOrd for Contributor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The top contributors, kept sorted in ranking order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contributors {
    capacity: usize,
    members: Vec<Contributor>,
}

impl Contributors {
    pub fn new(capacity: usize) -> Self {
        Contributors {
            capacity,
            members: Vec::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[Contributor] {
        &self.members
    }

    /// Insert a contributor or update its contribution.
    /// Contributions only grow, so the updated AID is the only one whose rank can change.
    pub fn update(&mut self, contributor: Contributor) {
        if let Some(index) = self.members.iter().position(|c| c.aid == contributor.aid) {
            self.members.remove(index);
        } else if self.members.len() == self.capacity {
            match self.members.last() {
                Some(last) if contributor < *last => {
                    self.members.pop();
                }
                _ => return,
            }
        }
        let index = self.members.partition_point(|c| *c < contributor);
        self.members.insert(index, contributor);
    }
}

impl FromIterator<Contributor> for Contributors {
    fn from_iter<T: IntoIterator<Item = Contributor>>(iter: T) -> Self {
        let mut members: Vec<Contributor> = iter.into_iter().collect();
        members.sort();
        let capacity = members.len();
        Contributors { capacity, members }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContributionTracker {
    contributions: HashMap<Aid, Contribution>,
    top_contributors: Contributors,
    overall_contribution: Contribution,
}

impl ContributionTracker {
    /// A tracker ranking at most `capacity` top contributors
    pub fn new(capacity: usize) -> Self {
        ContributionTracker {
            contributions: HashMap::new(),
            top_contributors: Contributors::new(capacity),
            overall_contribution: 0,
        }
    }

    pub fn add_contribution(&mut self, aid: Aid, amount: Contribution) {
        let total = match self.contributions.entry(aid) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += amount;
                *entry.get()
            }
            Entry::Vacant(entry) => *entry.insert(amount),
        };
        self.overall_contribution += amount;
        self.top_contributors.update(Contributor::new(aid, total));
    }

    /// The `n` largest contributors, in ranking order.
    /// At most `capacity` contributors are ranked, so fewer than `n` may be returned.
    pub fn top_contributors(&self, n: usize) -> &[Contributor] {
        let members = self.top_contributors.as_slice();
        &members[..n.min(members.len())]
    }

    /// Sum of the contributions of everyone beyond the top `n`
    pub fn unaccounted_for(&self, n: usize) -> Contribution {
        let accounted: Contribution = if n <= self.capacity() {
            self.top_contributors(n).iter().map(|c| c.contribution).sum()
        } else {
            // Beyond the ranked members, fall back to every contribution
            self.contributions
                .values()
                .sorted_unstable_by_key(|contribution| Reverse(**contribution))
                .take(n)
                .sum()
        };
        self.overall_contribution - accounted
    }

    pub fn distinct_contributors(&self) -> usize {
        self.contributions.len()
    }

    pub fn overall_contribution(&self) -> Contribution {
        self.overall_contribution
    }

    pub fn capacity(&self) -> usize {
        self.top_contributors.capacity()
    }

    /// Union by AID, summing contributions of AIDs present in both,
    /// then rank again from the merged contributions
    pub fn merge(&mut self, other: &ContributionTracker) {
        for (aid, amount) in &other.contributions {
            *self.contributions.entry(*aid).or_insert(0) += amount;
        }
        self.overall_contribution += other.overall_contribution;
        let mut top_contributors = Contributors::new(self.capacity().max(other.capacity()));
        for (aid, contribution) in &self.contributions {
            top_contributors.update(Contributor::new(*aid, *contribution));
        }
        self.top_contributors = top_contributors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn tracker_of(capacity: usize, contributions: &[(Aid, Contribution)]) -> ContributionTracker {
        let mut tracker = ContributionTracker::new(capacity);
        for (aid, amount) in contributions {
            tracker.add_contribution(*aid, *amount);
        }
        tracker
    }

    #[test]
    fn test_ranking() {
        let tracker = tracker_of(3, &[(1, 5), (2, 1), (3, 7), (4, 1), (2, 1), (5, 2)]);
        println!("{:?}", tracker.top_contributors(3));
        assert_eq!(
            tracker.top_contributors(3),
            &[Contributor::new(3, 7), Contributor::new(1, 5), Contributor::new(2, 2)]
        );
        assert_eq!(tracker.top_contributors(10).len(), 3);
        assert_eq!(tracker.distinct_contributors(), 5);
        assert_eq!(tracker.overall_contribution(), 17);
        assert_eq!(tracker.unaccounted_for(3), 3);
        assert_eq!(tracker.unaccounted_for(1), 10);
        assert_eq!(tracker.unaccounted_for(0), 17);
    }

    #[test]
    fn test_unaccounted_for_beyond_capacity() {
        let tracker = tracker_of(2, &[(1, 5), (2, 4), (3, 3)]);
        assert_eq!(tracker.top_contributors(3).len(), 2);
        assert_eq!(tracker.unaccounted_for(2), 3);
        assert_eq!(tracker.unaccounted_for(3), 0);
        assert_eq!(tracker.unaccounted_for(10), 0);
    }

    #[test]
    fn test_tie_break_by_aid() {
        let forward = tracker_of(2, &[(9, 1), (4, 1), (7, 1)]);
        let backward = tracker_of(2, &[(7, 1), (4, 1), (9, 1)]);
        assert_eq!(forward.top_contributors(2), backward.top_contributors(2));
        assert_eq!(
            forward.top_contributors(2),
            &[Contributor::new(4, 1), Contributor::new(7, 1)]
        );
    }

    #[test]
    fn test_growing_contributor_reenters() {
        let mut tracker = tracker_of(1, &[(1, 3), (2, 1)]);
        assert_eq!(tracker.top_contributors(1), &[Contributor::new(1, 3)]);
        tracker.add_contribution(2, 5);
        assert_eq!(tracker.top_contributors(1), &[Contributor::new(2, 6)]);
    }

    #[test]
    fn test_insertion_order() {
        let mut rows: Vec<(Aid, Contribution)> =
            (0..40u64).flat_map(|aid| (0..(aid % 7)).map(move |_| (aid, 1))).collect();
        let reference = tracker_of(5, &rows);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            rows.shuffle(&mut rng);
            assert_eq!(tracker_of(5, &rows).top_contributors(5), reference.top_contributors(5));
        }
    }

    #[test]
    fn test_merge_promotes_hidden_contributor() {
        // AID 3 is not in the top of either partial but is in the merged top
        let mut left = tracker_of(1, &[(1, 4), (3, 3)]);
        let right = tracker_of(1, &[(2, 5), (3, 3)]);
        left.merge(&right);
        assert_eq!(left.top_contributors(1), &[Contributor::new(3, 6)]);
        assert_eq!(left.unaccounted_for(1), 9);
        assert_eq!(left.distinct_contributors(), 3);
    }

    proptest! {
        #[test]
        fn prop_merge_matches_sequential(
            rows in prop::collection::vec((0u64..20, 1u64..5), 0..80),
            split in 0usize..80,
        ) {
            let split = split.min(rows.len());
            let full = tracker_of(4, &rows);
            let mut left = tracker_of(4, &rows[..split]);
            let right = tracker_of(4, &rows[split..]);
            let mut commuted = right.clone();
            commuted.merge(&left);
            left.merge(&right);
            prop_assert_eq!(left.top_contributors(4), full.top_contributors(4));
            prop_assert_eq!(left.unaccounted_for(4), full.unaccounted_for(4));
            prop_assert_eq!(commuted.top_contributors(4), full.top_contributors(4));
            prop_assert_eq!(left.distinct_contributors(), full.distinct_contributors());
        }
    }
}
