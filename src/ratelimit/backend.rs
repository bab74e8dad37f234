//! Counter store trait for abstracting the shared and local implementations.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use super::window::{WindowCounts, WindowKeys};
use crate::error::StoreError;

/// Trait for counter store implementations.
///
/// This trait abstracts over the shared `RedisCounterStore` and the
/// in-process `LocalCounterStore` so the limiter can fall back from one to
/// the other.
///
/// Implementations must apply both increments as one atomic unit: a caller
/// may never observe (or cause) the burst counter moving without the hourly
/// one. Each window's TTL is armed only by the increment that creates it.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Increment both window counters of a subject and return the new counts.
    async fn increment_windows(
        &self,
        keys: &WindowKeys,
        hourly_ttl: Duration,
        burst_ttl: Duration,
    ) -> Result<WindowCounts, StoreError>;
}
