//! Low count detection of buckets

use super::{
    aid::{Aid, AidDescriptor},
    aid_tracker::AidTracker,
};
use crate::config::Config;

/// State of `low_count`: one AID tracker per AID column
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LowCountState {
    trackers: Vec<AidTracker>,
}

impl LowCountState {
    pub fn new(descriptors: &[AidDescriptor]) -> Self {
        LowCountState {
            trackers: descriptors.iter().map(|d| AidTracker::new(*d)).collect(),
        }
    }

    pub fn transition(&mut self, aids: &[Option<Aid>]) {
        for (tracker, aid) in self.trackers.iter_mut().zip(aids) {
            if let Some(aid) = aid {
                tracker.update(*aid);
            }
        }
    }

    pub fn merge(&mut self, other: &LowCountState) {
        for (tracker, other_tracker) in self.trackers.iter_mut().zip(&other.trackers) {
            tracker.merge(other_tracker);
        }
    }

    /// A bucket is low count when any AID column has too few distinct AIDs
    pub fn finalize(&self, config: &Config) -> bool {
        self.trackers
            .iter()
            .any(|tracker| tracker.distinct_count() < config.minimum_allowed_aids as usize)
    }
}
