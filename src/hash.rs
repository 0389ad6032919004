//! # Hashing utilities
//!
//! Stable 64 bits hashes used to derive seeds.
//! Everything here is platform independent: the same material always hashes to the same value.
//!

use std::collections::BTreeSet;
use xxhash_rust::xxh3::xxh3_64;

/// A 64 bits hash
pub type Hash = u64;
/// A 64 bits seed
pub type Seed = u64;

/// Hash raw bytes
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    xxh3_64(bytes)
}

/// Hash a string
pub fn hash_string(material: &str) -> Hash {
    hash_bytes(material.as_bytes())
}

/// Hash a 64 bits integer
pub fn hash_u64(value: u64) -> Hash {
    hash_bytes(&value.to_le_bytes())
}

/// Non commutative combination of two hashes
pub fn combine(left: Hash, right: Hash) -> Hash {
    left ^ right
        .wrapping_add(0x49a0_f4dd_15e5_a8e3)
        .wrapping_add(left << 54)
        .wrapping_add(left >> 7)
}

/// Fold a set of hashes into a seed.
/// Duplicates are collapsed first so that equal hashes cannot cancel each other.
pub fn hash_set_to_seed<I: IntoIterator<Item = Hash>>(hashes: I) -> Seed {
    hashes
        .into_iter()
        .collect::<BTreeSet<Hash>>()
        .into_iter()
        .fold(0, |seed, hash| seed ^ hash)
}
