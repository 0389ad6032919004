//! # Distinct AIDs of a bucket
//!
//! The tracker keeps the set of distinct AIDs seen for one AID column
//! and an order independent seed: the XOR of the hashes of those AIDs.
//!

use super::aid::{Aid, AidDescriptor};
use crate::hash::Seed;
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AidTracker {
    descriptor: AidDescriptor,
    aid_set: HashSet<Aid>,
    aid_seed: Seed,
}

impl AidTracker {
    pub fn new(descriptor: AidDescriptor) -> Self {
        AidTracker {
            descriptor,
            aid_set: HashSet::with_capacity(128),
            aid_seed: 0,
        }
    }

    pub fn descriptor(&self) -> AidDescriptor {
        self.descriptor
    }

    /// Record an AID, folding it into the seed the first time it is seen
    pub fn update(&mut self, aid: Aid) {
        if self.aid_set.insert(aid) {
            self.aid_seed ^= self.descriptor.seed_hash(aid);
        }
    }

    pub fn distinct_count(&self) -> usize {
        self.aid_set.len()
    }

    pub fn seed(&self) -> Seed {
        self.aid_seed
    }

    pub fn contains(&self, aid: Aid) -> bool {
        self.aid_set.contains(&aid)
    }

    pub fn aids(&self) -> impl Iterator<Item = &Aid> {
        self.aid_set.iter()
    }

    /// Union with the AIDs of another partial tracker.
    /// AIDs present in both are counted and folded once.
    pub fn merge(&mut self, other: &AidTracker) {
        debug_assert_eq!(self.descriptor, other.descriptor);
        for aid in other.aids() {
            self.update(*aid);
        }
    }
}
