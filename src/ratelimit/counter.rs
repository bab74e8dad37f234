//! In-process fallback counter.
//!
//! Used only while the shared store is unavailable. Counts are per instance:
//! with N instances in degraded mode a subject can be admitted up to N times
//! its configured quota across the cluster. That is the accepted price of
//! staying available, and every switch to this store is logged and counted
//! by the limiter.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::backend::CounterStore;
use super::clock::Clock;
use super::window::{WindowCounts, WindowKeys};
use crate::error::StoreError;

/// A fixed window anchored at the first increment of each cycle.
#[derive(Debug, Clone, Copy)]
struct FixedWindow {
    count: u64,
    started: Instant,
    length: Duration,
}

impl FixedWindow {
    fn new(now: Instant, length: Duration) -> Self {
        Self {
            count: 0,
            started: now,
            length,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.length
    }

    /// Count one request, starting a new cycle if the previous one expired.
    ///
    /// Returns the new count and the time left in the current cycle.
    fn hit(&mut self, now: Instant, length: Duration) -> (u64, Duration) {
        if self.count == 0 || self.is_expired(now) {
            self.count = 0;
            self.started = now;
            self.length = length;
        }

        self.count += 1;
        let elapsed = now.saturating_duration_since(self.started);
        (self.count, self.length.saturating_sub(elapsed))
    }
}

/// Both windows of one subject, guarded together by the map entry lock.
#[derive(Debug, Clone, Copy)]
struct SubjectWindows {
    hourly: FixedWindow,
    burst: FixedWindow,
}

/// Process-local two-window counter.
#[derive(Debug)]
pub struct LocalCounterStore {
    entries: DashMap<String, SubjectWindows>,
    clock: Arc<dyn Clock>,
    max_subjects: usize,
}

impl LocalCounterStore {
    /// Create a new local counter tracking at most `max_subjects` subjects.
    pub fn new(clock: Arc<dyn Clock>, max_subjects: usize) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_subjects,
        }
    }

    /// Number of tracked subjects.
    pub fn subject_count(&self) -> usize {
        self.entries.len()
    }

    /// Current counts for a subject without incrementing.
    ///
    /// Expired windows read as zero.
    pub fn peek(&self, keys: &WindowKeys) -> Option<(u64, u64)> {
        let now = self.clock.now();
        self.entries.get(keys.subject()).map(|entry| {
            let read = |w: &FixedWindow| if w.is_expired(now) { 0 } else { w.count };
            (read(&entry.hourly), read(&entry.burst))
        })
    }

    /// Drop subjects whose windows have both expired.
    ///
    /// Returns the number of subjects removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, windows| {
            !(windows.hourly.is_expired(now) && windows.burst.is_expired(now))
        });
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(
                removed = removed,
                remaining = self.entries.len(),
                "Swept expired local counters"
            );
        }
        removed
    }

    /// Sweep expired subjects every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_expired();
            }
        })
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn increment_windows(
        &self,
        keys: &WindowKeys,
        hourly_ttl: Duration,
        burst_ttl: Duration,
    ) -> Result<WindowCounts, StoreError> {
        let subject = keys.subject();

        if !self.entries.contains_key(subject) && self.entries.len() >= self.max_subjects {
            // Expired subjects may be holding the space.
            if self.sweep_expired() == 0 && self.entries.len() >= self.max_subjects {
                return Err(StoreError::CapacityExhausted {
                    max_subjects: self.max_subjects,
                });
            }
        }

        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(subject.to_string())
            .or_insert_with(|| SubjectWindows {
                hourly: FixedWindow::new(now, hourly_ttl),
                burst: FixedWindow::new(now, burst_ttl),
            });

        let (hourly, hourly_reset_in) = entry.hourly.hit(now, hourly_ttl);
        let (burst, burst_reset_in) = entry.burst.hit(now, burst_ttl);
        drop(entry);

        trace!(
            subject = %subject,
            hourly = hourly,
            burst = burst,
            "Incremented local counters"
        );

        Ok(WindowCounts {
            hourly,
            burst,
            hourly_reset_in,
            burst_reset_in,
        })
    }
}
