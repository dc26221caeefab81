//! Retry delay arithmetic.
//!
//! Failed (or expired) jobs with retry budget left are rescheduled at
//! `now + retry_delay(base, retry_count, backoff)`:
//!
//! - **Linear** (the default): `base * retry_count` — 30s, 60s, 90s...
//! - **Exponential with jitter**: the delay doubles per attempt and lands
//!   uniformly in the upper half of the doubled band, so many jobs failing
//!   together do not retry in lockstep.
//!
//! The jitter band of attempt `n` ends exactly where attempt `n + 1`'s begins,
//! which keeps consecutive retry delays strictly increasing.

use rand::Rng;
use std::time::Duration;

/// Exponent cap; past this the backoff band stops growing.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Delay before the `retry_count`-th retry attempt (1-based).
pub fn retry_delay(base: Duration, retry_count: i32, backoff: bool) -> Duration {
    let attempt = retry_count.max(1) as u32;

    if !backoff {
        return base.saturating_mul(attempt);
    }

    let full = base.saturating_mul(2u32.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT)));
    let half = full / 2;
    let jitter = rand::thread_rng().gen_range(0.0..=1.0);
    half + Duration::from_secs_f64(half.as_secs_f64() * jitter)
}
