//! Exponential backoff with jitter for job retries.
//!
//! Formula: `min(base * 2^attempt, max) + uniform_jitter`
//! where jitter is a fraction of the computed delay.

use std::time::Duration;

use crate::config::JobsConfig;

const JITTER_FRACTION: f64 = 0.25;

/// Calculate the retry delay for `attempt` (0-indexed: the delay applied
/// after the first failure uses attempt 0).
///
/// Returns `min(base_ms * 2^attempt, max_ms)` plus a pseudo-random jitter of
/// up to `±12.5%` — always non-negative.
pub fn next_backoff(attempt: u32, config: &JobsConfig) -> Duration {
    let base = config.backoff_base_ms as f64;
    let raw = base * 2f64.powi(attempt as i32);
    let capped = raw.min(config.backoff_max_ms as f64);

    // Deterministic pseudo-jitter derived from attempt (avoids a rand dep).
    let jitter_range = capped * JITTER_FRACTION;
    let with_jitter = (capped + pseudo_rand(attempt) * jitter_range).max(0.0);

    Duration::from_millis(with_jitter as u64)
}

/// Produce a float in [-0.5, 0.5) using a simple LCG seeded by `attempt`.
fn pseudo_rand(attempt: u32) -> f64 {
    // LCG parameters (Numerical Recipes)
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(attempt as u64).wrapping_add(C) % M;
    (state as f64 / M as f64) - 0.5
}
