//! Counters describing limiter behaviour.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Limiter statistics, shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct LimiterMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    allowed: AtomicU64,
    warned: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
    degraded_episodes: AtomicU64,
    fallback_decisions: AtomicU64,
    internal_errors: AtomicU64,
}

impl LimiterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self, warning: bool) {
        self.inner.allowed.fetch_add(1, Ordering::Relaxed);
        if warning {
            self.inner.warned.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_rejected(&self) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.inner.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_degraded_episode(&self) {
        self.inner.degraded_episodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback_decision(&self) {
        self.inner.fallback_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_internal_error(&self) {
        self.inner.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            allowed: load(&self.inner.allowed),
            warned: load(&self.inner.warned),
            rejected: load(&self.inner.rejected),
            store_failures: load(&self.inner.store_failures),
            degraded_episodes: load(&self.inner.degraded_episodes),
            fallback_decisions: load(&self.inner.fallback_decisions),
            internal_errors: load(&self.inner.internal_errors),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Requests admitted
    pub allowed: u64,
    /// Admitted requests that crossed a warning threshold
    pub warned: u64,
    /// Requests rejected for exceeding a quota
    pub rejected: u64,
    /// Failed calls to the shared store
    pub store_failures: u64,
    /// Times the limiter entered degraded mode
    pub degraded_episodes: u64,
    /// Decisions made from the local fallback counter
    pub fallback_decisions: u64,
    /// Requests failed closed because no counts were available
    pub internal_errors: u64,
}
