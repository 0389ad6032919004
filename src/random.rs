//! # Seeded noise generation
//!
//! All randomness used by anonymizing aggregates comes from here.
//! A seed is plain caller-owned state: its 48 low bits are the state of a
//! `drand48`-style linear congruential generator, advanced in place at every draw.
//! Given the same seed, every function here yields bit-identical results.
//!

use crate::{
    config::Config,
    hash::{self, Seed},
};

const MULTIPLIER: u64 = 0x5_DEEC_E66D;
const ADDEND: u64 = 0xB;
const STATE_BITS: u32 = 48;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Seed of a noise layer: the configured secret combined with the layer value
pub fn make_seed(config: &Config, noise_layer_seed: Seed) -> Seed {
    let base_seed = hash::hash_string(&config.noise_seed);
    hash::combine(base_seed, noise_layer_seed)
}

/// Draw a uniform double in `[0, 1)`
pub fn next_uniform(seed: &mut Seed) -> f64 {
    let state = *seed & STATE_MASK;
    let next = state.wrapping_mul(MULTIPLIER).wrapping_add(ADDEND) & STATE_MASK;
    *seed = (*seed & !STATE_MASK) | next;
    // Exact: 48 bits fit in the mantissa
    next as f64 / (1u64 << STATE_BITS) as f64
}

/// Draw a zero-mean gaussian sample with the given standard deviation.
/// Marsaglia polar method: the second sample of each accepted pair is discarded.
pub fn next_gaussian(seed: &mut Seed, stddev: f64) -> f64 {
    loop {
        let v1 = 2. * next_uniform(seed) - 1.;
        let v2 = 2. * next_uniform(seed) - 1.;
        let s = v1 * v1 + v2 * v2;
        if s < 1. && s != 0. {
            return stddev * v1 * (-2. * s.ln() / s).sqrt();
        }
    }
}

/// Draw an integer in `[min, max)`, an empty range gives `min` without drawing
pub fn next_uniform_int(seed: &mut Seed, min: u32, max: u32) -> u32 {
    if max <= min {
        return min;
    }
    min + (next_uniform(seed) * (max - min) as f64) as u32
}

/// Clip noise to `[-cutoff, cutoff]`
pub fn clamp_noise(noise: f64, cutoff: f64) -> f64 {
    noise.max(-cutoff).min(cutoff)
}

/// A clamped gaussian sample
pub fn next_noise(seed: &mut Seed, stddev: f64, config: &Config) -> f64 {
    clamp_noise(next_gaussian(seed, stddev), config.noise_cutoff)
}

/// Add configured noise to an integer value, never going below zero
pub fn apply_noise(value: i64, seed: &mut Seed, config: &Config) -> i64 {
    let noisy = value + next_noise(seed, config.noise_sigma, config).round() as i64;
    noisy.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use statrs::statistics::{Data, Distribution};

    #[test]
    fn test_make_seed() {
        let config = Config::default();
        assert_eq!(make_seed(&config, 42), make_seed(&config, 42));
        assert_ne!(make_seed(&config, 42), make_seed(&config, 43));
        let other = Config::default().with_noise_seed("another secret");
        assert_ne!(make_seed(&config, 42), make_seed(&other, 42));
    }

    #[test]
    fn test_uniform_is_deterministic() {
        let mut s1: Seed = 0xDEAD_BEEF_0123_4567;
        let mut s2: Seed = 0xDEAD_BEEF_0123_4567;
        let a: Vec<f64> = (0..10).map(|_| next_uniform(&mut s1)).collect();
        let b: Vec<f64> = (0..10).map(|_| next_uniform(&mut s2)).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|u| (0. ..1.).contains(u)));
        // The upper 16 bits are left untouched
        assert_eq!(s1 >> 48, 0xDEAD);
    }

    #[test]
    fn test_erand48_sequence() {
        // Reference values of the 48 bits LCG started at 0
        let mut seed: Seed = 0;
        next_uniform(&mut seed);
        assert_eq!(seed, 0xB);
        next_uniform(&mut seed);
        assert_eq!(seed, (0xB * MULTIPLIER + ADDEND) & STATE_MASK);
    }

    #[test]
    fn test_gaussian_moments() {
        let mut seed = make_seed(&Config::default(), 7);
        let samples: Vec<f64> = (0..20_000).map(|_| next_gaussian(&mut seed, 2.)).collect();
        let data = Data::new(samples);
        let mean = data.mean().unwrap();
        let std_dev = data.std_dev().unwrap();
        println!("mean = {mean}, std_dev = {std_dev}");
        assert!(mean.abs() < 0.1);
        assert!((std_dev - 2.).abs() < 0.1);
    }

    #[test]
    fn test_uniform_int_range() {
        let mut seed = 12345;
        let draws: Vec<u32> = (0..1000).map(|_| next_uniform_int(&mut seed, 4, 7)).collect();
        assert!(draws.iter().all(|d| (4..7).contains(d)));
        assert!((4..7).all(|v| draws.contains(&v)));
        assert_eq!(next_uniform_int(&mut seed, 1, 2), 1);
        // Empty ranges leave the seed untouched
        let before = seed;
        assert_eq!(next_uniform_int(&mut seed, 3, 3), 3);
        assert_eq!(next_uniform_int(&mut seed, 5, 2), 5);
        assert_eq!(seed, before);
    }

    #[test]
    fn test_apply_noise() {
        let config = Config::default();
        let mut seed = make_seed(&config, 3);
        let noisy = apply_noise(100, &mut seed, &config);
        assert!((95..=105).contains(&noisy));
        let mut seed = make_seed(&config, 3);
        let again = apply_noise(0, &mut make_seed(&config, 3), &config);
        assert_eq!(apply_noise(0, &mut seed, &config), again);
    }

    proptest! {
        #[test]
        fn prop_noise_respects_cutoff(layer in any::<u64>(), stddev in 0.0f64..1000.0) {
            let config = Config::default();
            let mut seed = make_seed(&config, layer);
            let noise = next_noise(&mut seed, stddev, &config);
            prop_assert!(noise.abs() <= config.noise_cutoff);
        }

        #[test]
        fn prop_same_seed_same_noise(seed in any::<u64>()) {
            let (mut s1, mut s2) = (seed, seed);
            prop_assert_eq!(
                next_gaussian(&mut s1, 3.).to_bits(),
                next_gaussian(&mut s2, 3.).to_bits()
            );
            prop_assert_eq!(s1, s2);
        }
    }
}
