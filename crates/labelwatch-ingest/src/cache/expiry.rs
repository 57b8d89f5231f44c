//! Jittered expiry.
//!
//! Entries resolved in the same instant would otherwise all expire together
//! and refetch in one burst. Each entry's lifetime is stretched or shrunk by
//! a pseudo-random fraction seeded by its completion time, so the spread is
//! deterministic for a given timestamp.

use std::time::Duration;

/// LCG constants (Numerical Recipes).
const LCG_A: u64 = 1_664_525;
const LCG_C: u64 = 1_013_904_223;
const LCG_M: u64 = 1 << 32;

/// Pseudo-random value in `[0, 1)` derived from `seed`.
pub fn seeded_random(seed: i64) -> f64 {
    let next = (seed as u64).wrapping_mul(LCG_A).wrapping_add(LCG_C) % LCG_M;
    next as f64 / LCG_M as f64
}

/// Expiry time (unix ms) of an entry completed at `completed_ms`.
///
/// The lifetime is `base * (1 + (2r - 1) * fraction)`, so it always falls
/// in `[base * (1 - fraction), base * (1 + fraction))`.
pub fn expires_at(completed_ms: i64, base: Duration, fraction: f64) -> i64 {
    let base_ms = base.as_millis() as f64;
    let jitter = (2.0 * seeded_random(completed_ms) - 1.0) * fraction.clamp(0.0, 1.0) * base_ms;
    completed_ms + (base_ms + jitter).floor() as i64
}
