//! # Retry Backoff
//!
//! Computes the delay before a failed sync job becomes claimable again.
//! Attempts 1-5 follow a fixed minute table, later attempts double, and every
//! delay is capped before symmetric jitter is applied.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Minute delays for the first five attempts.
const BASE_DELAY_MINUTES: [u64; 5] = [1, 2, 4, 8, 16];

const MILLIS_PER_MINUTE: u64 = 60_000;

/// Tunables for [`delay`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffOptions {
    /// Fraction of the capped delay used as jitter amplitude (0 disables jitter)
    pub jitter_ratio: f64,
    /// Upper bound applied before jitter
    pub cap: Duration,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            jitter_ratio: 0.1,
            cap: Duration::from_secs(30 * 60),
        }
    }
}

/// Un-jittered delay in minutes for a 1-based attempt number.
fn base_delay_minutes(attempt: u32) -> u64 {
    let attempt = attempt.max(1);
    match BASE_DELAY_MINUTES.get(attempt as usize - 1) {
        Some(minutes) => *minutes,
        None => 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX),
    }
}

/// Delay before `attempt` may run, using the thread-local RNG for jitter.
pub fn delay(attempt: u32, options: &BackoffOptions) -> Duration {
    let mut rng = rand::thread_rng();
    delay_with_rng(attempt, options, &mut rng)
}

/// Delay before `attempt` may run, drawing jitter from `rng`.
///
/// The result lies within `capped ± capped * jitter_ratio` and never goes
/// below zero.
pub fn delay_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    options: &BackoffOptions,
    rng: &mut R,
) -> Duration {
    let cap_ms = u64::try_from(options.cap.as_millis()).unwrap_or(u64::MAX);
    let base_ms = base_delay_minutes(attempt).saturating_mul(MILLIS_PER_MINUTE);
    let capped_ms = base_ms.min(cap_ms);

    let ratio = options.jitter_ratio.max(0.0);
    if ratio == 0.0 {
        return Duration::from_millis(capped_ms);
    }

    let amplitude = capped_ms as f64 * ratio;
    let offset = amplitude * (2.0 * rng.gen_range(0.0..1.0) - 1.0);
    let jittered = (capped_ms as f64 + offset).round().max(0.0);

    Duration::from_millis(jittered as u64)
}

/// Absolute time at which a job failing its `attempt`-th run becomes due.
pub fn next_run_at(attempt: u32, now: DateTime<Utc>, options: &BackoffOptions) -> DateTime<Utc> {
    let wait = delay(attempt, options);
    let wait = chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(wait).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng, rngs::mock::StepRng};

    fn no_jitter() -> BackoffOptions {
        BackoffOptions {
            jitter_ratio: 0.0,
            ..BackoffOptions::default()
        }
    }

    #[test]
    fn follows_minute_table_for_first_attempts() {
        let options = no_jitter();
        let minutes: Vec<u64> = (1..=5)
            .map(|attempt| delay(attempt, &options).as_secs() / 60)
            .collect();
        assert_eq!(minutes, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn later_attempts_are_capped() {
        let options = no_jitter();
        assert_eq!(delay(6, &options), Duration::from_secs(30 * 60));
        assert_eq!(delay(40, &options), Duration::from_secs(30 * 60));
        assert_eq!(delay(200, &options), Duration::from_secs(30 * 60));
    }

    #[test]
    fn raised_cap_exposes_doubling() {
        let options = BackoffOptions {
            jitter_ratio: 0.0,
            cap: Duration::from_secs(24 * 60 * 60),
        };
        assert_eq!(delay(6, &options), Duration::from_secs(32 * 60));
        assert_eq!(delay(7, &options), Duration::from_secs(64 * 60));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        assert_eq!(delay(0, &no_jitter()), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let options = BackoffOptions::default();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let ms = delay_with_rng(1, &options, &mut rng).as_millis();
            assert!((54_000..=66_000).contains(&ms), "{ms} out of bounds");
        }

        for _ in 0..200 {
            let ms = delay_with_rng(9, &options, &mut rng).as_millis();
            assert!((1_620_000..=1_980_000).contains(&ms), "{ms} out of bounds");
        }
    }

    #[test]
    fn zero_ratio_ignores_rng() {
        let mut rng = StepRng::new(u64::MAX / 3, 17);
        let ms = delay_with_rng(3, &no_jitter(), &mut rng).as_millis();
        assert_eq!(ms, 4 * 60_000);
    }

    #[test]
    fn next_run_at_is_offset_from_now() {
        let now = Utc::now();
        let due = next_run_at(2, now, &no_jitter());
        assert_eq!(due - now, chrono::Duration::minutes(2));
    }
}
