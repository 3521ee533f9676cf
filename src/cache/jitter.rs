//! TTL jitter.
//!
//! Keys written in the same instant must not expire in the same instant, so
//! every physical TTL handed to the store is perturbed by a random ratio.

use std::time::Duration;

const MIN_TTL: Duration = Duration::from_millis(1);

/// Perturb `ttl` uniformly within `[ttl * (1 - ratio), ttl * (1 + ratio)]`.
pub fn jitter_ttl(ttl: Duration, ratio: f64) -> Duration {
    let ratio = clamp_ratio(ratio);
    let factor = (1.0 - ratio + fastrand::f64() * 2.0 * ratio).clamp(1.0 - ratio, 1.0 + ratio);
    scale(ttl, factor)
}

/// Perturb `ttl` uniformly within `[ttl, ttl * (1 + ratio)]`.
///
/// Used where the nominal TTL is a floor that must not be shortened.
pub fn jitter_ttl_upward(ttl: Duration, ratio: f64) -> Duration {
    let ratio = clamp_ratio(ratio);
    let factor = (1.0 + fastrand::f64() * ratio).min(1.0 + ratio);
    scale(ttl, factor).max(ttl)
}

fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(0.0, 0.99)
    } else {
        0.0
    }
}

fn scale(ttl: Duration, factor: f64) -> Duration {
    ttl.mul_f64(factor).max(MIN_TTL)
}
