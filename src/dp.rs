// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Differential privacy utilities for the range query planner: domain
//! bucketization, hierarchical range covers, the optimal noise mean, and
//! Laplace sampling.

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

/// Snaps a query outward to bucket boundaries.
///
/// Partitions `[min, max)` into `buckets` equal-width buckets and returns
/// `(from_bucket, to_bucket, padded_lo, padded_hi)`, where the padded bounds
/// are the boundaries of the covering buckets. A query endpoint equal to
/// `max` maps to the last bucket. Query endpoints must already be clamped
/// into `[min, max]`.
pub fn pad_to_buckets(
    query: (u64, u64),
    min: u64,
    max: u64,
    buckets: u64,
) -> (u64, u64, u64, u64) {
    let step = (max - min) as f64 / buckets as f64;

    let mut from_bucket = ((query.0 - min) as f64 / step).floor() as u64;
    let mut to_bucket = ((query.1 - min) as f64 / step).floor() as u64;

    if from_bucket == buckets {
        from_bucket -= 1;
    }
    if to_bucket == buckets {
        to_bucket -= 1;
    }

    (
        from_bucket,
        to_bucket,
        (from_bucket as f64 * step) as u64 + min,
        ((to_bucket + 1) as f64 * step) as u64 + min,
    )
}

/// The mean number of dummy accesses per query that achieves
/// `(epsilon, delta = beta)` differential privacy for a `k`-ary range cover
/// over `n` records spread across `orams` shards.
pub fn optimal_mu(beta: f64, k: u64, n: u64, epsilon: f64, orams: u64) -> u64 {
    let k = k as f64;
    let n = n as f64;

    let nodes_exp = ((k - 1.0).ln() / k.ln() + n.ln() / k.ln() - 1.0).ceil();
    let nodes = ((k.powf(nodes_exp) - 1.0) / (k - 1.0) + n) * orams as f64;

    (-(n.ln()) / (k.ln() * epsilon) * (2.0 - 2.0 * (1.0 - beta).powf(1.0 / nodes)).ln()).ceil()
        as u64
}

/// The minimal set of `(level, index)` nodes of a `fanout`-ary pyramid that
/// exactly covers `[from, to]`, with level 0 at the bottom.
///
/// Endpoints advance toward each other within their current parent, emitting
/// every index they pass; once both sit on parent boundaries the sweep climbs
/// a level. At `max_level` nodes are emitted one by one instead of climbing,
/// so covers never overshoot below the top.
pub fn brc(fanout: u64, from: u64, to: u64, max_level: u32) -> Vec<(u32, u64)> {
    debug_assert!(from <= to);

    let mut result = Vec::new();
    let mut level = 0u32;
    let (mut from, mut to) = (from, to);

    loop {
        // Move FROM right within its parent, but no further than TO.
        while (from % fanout != 0 || level == max_level) && from < to {
            result.push((level, from));
            from += 1;
        }

        // Move TO left within its parent, but no further than FROM.
        while (to % fanout != fanout - 1 || level == max_level) && from < to {
            result.push((level, to));
            to -= 1;
        }

        if from != to {
            from /= fanout;
            to /= fanout;
            level += 1;
        } else {
            // Both endpoints point at the same node; emit it once and finish.
            result.push((level, from));
            return result;
        }
    }
}

/// One draw from the two-sided Laplace distribution with mean `mu` and
/// scale `lambda`.
///
/// The seed comes from the system CSPRNG but the draw goes through a seeded
/// non-cryptographic generator, so tests can reproduce the distribution
/// exactly; see [`sample_laplace_seeded`].
pub fn sample_laplace(mu: f64, lambda: f64) -> f64 {
    sample_laplace_seeded(mu, lambda, rand::rngs::OsRng.next_u64())
}

/// The deterministic core of [`sample_laplace`].
pub fn sample_laplace_seeded(mu: f64, lambda: f64, seed: u64) -> f64 {
    let mut prng = SmallRng::seed_from_u64(seed);
    // Inverse CDF over u uniform in (-1/2, 1/2).
    let u: f64 = prng.gen::<f64>() - 0.5;
    mu - lambda * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use std::collections::BTreeSet;

    /// Expands a cover node to the leaf indices it spans.
    fn expand(level: u32, index: u64, fanout: u64) -> std::ops::Range<u64> {
        let span = fanout.pow(level);
        index * span..(index + 1) * span
    }

    fn check_exact_cover(fanout: u64, from: u64, to: u64, max_level: u32) {
        let cover = brc(fanout, from, to, max_level);

        let mut leaves = BTreeSet::new();
        for (level, index) in &cover {
            assert!(*level <= max_level);
            for leaf in expand(*level, *index, fanout) {
                assert!(
                    leaves.insert(leaf),
                    "leaf {leaf} covered twice by BRC({fanout}, {from}, {to}, {max_level})"
                );
            }
        }
        let expected: BTreeSet<u64> = (from..=to).collect();
        assert_eq!(
            leaves, expected,
            "BRC({fanout}, {from}, {to}, {max_level}) is not exact"
        );
    }

    #[test]
    fn brc_covers_binary_example() {
        let cover = brc(2, 3, 12, 3);
        assert_eq!(cover, vec![(0, 3), (0, 12), (2, 1), (2, 2)]);
        check_exact_cover(2, 3, 12, 3);
    }

    #[test]
    fn brc_single_index() {
        assert_eq!(brc(2, 5, 5, 3), vec![(0, 5)]);
        assert_eq!(brc(16, 0, 0, 2), vec![(0, 0)]);
    }

    #[test]
    fn brc_full_aligned_range_is_one_node() {
        assert_eq!(brc(2, 0, 7, 3), vec![(3, 0)]);
        assert_eq!(brc(4, 0, 15, 2), vec![(2, 0)]);
    }

    #[test]
    fn brc_max_level_zero_enumerates() {
        let cover = brc(2, 3, 6, 0);
        assert_eq!(cover, vec![(0, 3), (0, 4), (0, 5), (0, 6)]);
    }

    #[test]
    fn brc_is_exact_everywhere() {
        for fanout in [2u64, 3, 4, 16] {
            for from in 0..24 {
                for to in from..24 {
                    for max_level in 0..4 {
                        check_exact_cover(fanout, from, to, max_level);
                    }
                }
            }
        }
    }

    #[test]
    fn pad_to_buckets_snaps_outward() {
        assert_eq!(pad_to_buckets((25, 55), 0, 100, 10), (2, 5, 20, 60));
    }

    #[test]
    fn pad_to_buckets_clamps_domain_maximum() {
        let (from, to, lo, hi) = pad_to_buckets((95, 100), 0, 100, 10);
        assert_eq!((from, to), (9, 9));
        assert_eq!((lo, hi), (90, 100));
    }

    #[test]
    fn pad_to_buckets_contains_query() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let min = 0u64;
            let max = 10_000u64;
            let a = rng.gen_range(min..=max);
            let b = rng.gen_range(min..=max);
            let (query_lo, query_hi) = (a.min(b), a.max(b));
            let buckets = rng.gen_range(1..=64u64);

            let (from, to, lo, hi) = pad_to_buckets((query_lo, query_hi), min, max, buckets);
            assert!(from <= to && to < buckets);
            assert!(lo <= query_lo, "{lo} > {query_lo}");
            assert!(hi >= query_hi, "{hi} < {query_hi}");

            // The padded bounds sit on bucket boundaries.
            let step = (max - min) as f64 / buckets as f64;
            assert_eq!(lo, (from as f64 * step) as u64 + min);
            assert_eq!(hi, ((to + 1) as f64 * step) as u64 + min);
        }
    }

    #[test]
    fn optimal_mu_reference_value() {
        let beta = (2.0f64).powi(-20);
        assert_eq!(optimal_mu(beta, 16, 1000, 0.693, 4), 79);
    }

    #[test]
    fn optimal_mu_grows_with_privacy_demands() {
        let beta = (2.0f64).powi(-20);
        let base = optimal_mu(beta, 16, 1000, 0.693, 1);
        assert!(optimal_mu(beta, 16, 1000, 0.1, 1) > base);
        assert!(optimal_mu(beta, 16, 1000, 0.693, 64) > base);
        assert!(optimal_mu((2.0f64).powi(-40), 16, 1000, 0.693, 1) > base);
    }

    #[test]
    fn laplace_is_deterministic_per_seed() {
        let a = sample_laplace_seeded(20.0, 2.0, 7);
        let b = sample_laplace_seeded(20.0, 2.0, 7);
        assert_eq!(a, b);
        assert_ne!(a, sample_laplace_seeded(20.0, 2.0, 8));
    }

    #[test]
    fn laplace_centers_on_mu() {
        let mu = 50.0;
        let lambda = 1.0 / 0.693;
        let samples: Vec<f64> = (0..4000)
            .map(|seed| sample_laplace_seeded(mu, lambda, seed))
            .collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((mean - mu).abs() < 0.5, "sample mean {mean}");

        let above = samples.iter().filter(|&&s| s > mu).count();
        let below = samples.len() - above;
        assert!(above.abs_diff(below) < samples.len() / 10);
    }
}
