//! Imbalance arithmetic.
//!
//! Imbalance is the coefficient of variation of per-silo load, scaled by
//! `1 / sqrt(n - 1)`. The worst case (all load on one of `n` silos) has a
//! coefficient of variation of exactly `sqrt(n - 1)`, so the scaled value
//! always lands in `[0, 1]`, independently of cluster size.

/// Mean of `loads`, `0.0` for an empty slice.
pub fn mean_load(loads: &[f64]) -> f64 {
    if loads.is_empty() {
        return 0.0;
    }
    loads.iter().sum::<f64>() / loads.len() as f64
}

/// Cluster imbalance in `[0, 1]`.
///
/// `0.0` with fewer than two silos or no load at all.
pub fn cluster_imbalance(loads: &[f64]) -> f64 {
    let n = loads.len();
    if n < 2 {
        return 0.0;
    }
    let mean = mean_load(loads);
    if mean <= 0.0 {
        return 0.0;
    }

    let variance = loads.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n as f64;
    let cv = variance.sqrt() / mean;
    (cv / ((n - 1) as f64).sqrt()).clamp(0.0, 1.0)
}

/// How many activations a silo at `local` load should shed this cycle.
///
/// The excess over the mean, rounded down, capped at `limit`.
pub fn dispersal_count(local: f64, mean: f64, limit: u64) -> u64 {
    let excess = (local - mean).floor();
    if excess < 1.0 {
        return 0;
    }
    // f64 -> u64 saturates, so huge excesses still clamp to `limit`.
    (excess as u64).min(limit)
}
