//! Jittered exponential backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 2_000,
            max_ms: 30_000,
            factor: 1.8,
            jitter_fraction: 0.25,
        }
    }
}

/// Delay before the given 1-indexed attempt. Attempts `<= 1` yield
/// `initial_ms` plus jitter.
pub fn compute_backoff(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let unit: f64 = rand::thread_rng().r#gen();
    compute_backoff_with_unit(policy, attempt, unit)
}

/// Same as [`compute_backoff`] with the random draw supplied by the caller.
/// `unit` is clamped into `[0, 1)`.
pub fn compute_backoff_with_unit(policy: &BackoffPolicy, attempt: u32, unit: f64) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let factor = if policy.factor.is_finite() && policy.factor >= 1.0 {
        policy.factor
    } else {
        1.0
    };
    let base = policy.initial_ms as f64 * factor.powi(exponent);
    let jitter_fraction = if policy.jitter_fraction.is_finite() {
        policy.jitter_fraction.max(0.0)
    } else {
        0.0
    };
    let unit = if unit.is_finite() {
        unit.clamp(0.0, 1.0 - f64::EPSILON)
    } else {
        0.0
    };
    let jitter = base * jitter_fraction * unit;
    let total = (base + jitter).round();
    let capped = if total.is_finite() {
        total.min(policy.max_ms as f64)
    } else {
        policy.max_ms as f64
    };
    Duration::from_millis(capped as u64)
}
