//! Admission decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::tier::TierPolicy;
use super::window::WindowCounts;

/// Outcome of one admission check. Produced per request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Set only on allowed requests that crossed a warning threshold
    pub warning: bool,
    pub hourly_count: u64,
    pub burst_count: u64,
    pub limit: u64,
    pub burst_limit: u64,
    pub reset_at_hourly: DateTime<Utc>,
    pub reset_at_burst: DateTime<Utc>,
    /// Time until the nearer window reset; `None` when allowed
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Decision {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.hourly_count)
    }

    pub fn burst_remaining(&self) -> u64 {
        self.burst_limit.saturating_sub(self.burst_count)
    }

    pub fn hourly_exceeded(&self) -> bool {
        self.hourly_count > self.limit
    }

    pub fn burst_exceeded(&self) -> bool {
        self.burst_count > self.burst_limit
    }

    /// `Retry-After` value in whole seconds, rounded up and at least 1.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|wait| {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}

/// Decide whether a request with the given counts may proceed.
///
/// Pure: no I/O, time is passed in. A count equal to the limit is still
/// allowed; the first rejected request is the `limit + 1`-th.
pub fn decide(policy: &TierPolicy, counts: &WindowCounts, now: DateTime<Utc>) -> Decision {
    let hourly_over = counts.hourly > policy.limit;
    let burst_over = counts.burst > policy.burst_limit;
    let allowed = !hourly_over && !burst_over;

    let warning = allowed
        && (counts.hourly as f64 > policy.limit as f64 * policy.warn_threshold
            || counts.burst as f64 > policy.burst_limit as f64 * policy.warn_threshold);

    // Hint at the nearer of the two window resets.
    let retry_after = if allowed {
        None
    } else {
        Some(counts.hourly_reset_in.min(counts.burst_reset_in))
    };

    Decision {
        allowed,
        warning,
        hourly_count: counts.hourly,
        burst_count: counts.burst,
        limit: policy.limit,
        burst_limit: policy.burst_limit,
        reset_at_hourly: reset_at(now, counts.hourly_reset_in),
        reset_at_burst: reset_at(now, counts.burst_reset_in),
        retry_after,
    }
}

fn reset_at(now: DateTime<Utc>, remaining: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(remaining)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
