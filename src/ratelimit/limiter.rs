//! Core admission controller.
//!
//! Resolves the policy for a subject, increments both windows in the shared
//! store (or the local fallback counter while the store is unavailable) and
//! turns the counts into a `Decision`.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::backend::CounterStore;
use super::clock::Clock;
use super::counter::LocalCounterStore;
use super::decision::{decide, Decision};
use super::metrics::LimiterMetrics;
use super::subject::RateSubject;
use super::tier::{Tier, TierPolicy, TierPolicyTable};
use super::window::{WindowCounts, WindowKeys};
use crate::error::LimiterError;

/// Default time to stay on the local counter after a store failure.
pub const DEFAULT_FALLBACK_COOLDOWN: Duration = Duration::from_secs(5);

/// Where the counts behind a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountSource {
    /// The shared, cluster-wide store
    Shared,
    /// This instance's fallback counter
    Local,
}

impl CountSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountSource::Shared => "shared",
            CountSource::Local => "local",
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Tier whose policy was applied
    pub tier: Tier,
    /// Where the counts came from
    pub source: CountSource,
    pub decision: Decision,
}

#[derive(Debug, Default)]
struct HealthState {
    /// Set while the current degraded-mode episode lasts
    episode: Option<Uuid>,
    /// Earliest time to try the shared store again
    retry_at: Option<Instant>,
}

/// Tracks degraded-mode episodes of the shared store.
///
/// An episode starts at the first failure after a success and ends at the
/// next success, so entry and exit are each reported once.
#[derive(Debug, Default)]
struct StoreHealth {
    state: Mutex<HealthState>,
}

impl StoreHealth {
    /// Whether to call the shared store now.
    ///
    /// While degraded only one caller per cooldown gets to probe: the probe
    /// itself pushes `retry_at` forward.
    fn should_try(&self, now: Instant, cooldown: Duration) -> bool {
        let mut state = self.state.lock();
        if state.episode.is_none() {
            return true;
        }
        match state.retry_at {
            Some(at) if now < at => false,
            _ => {
                state.retry_at = Some(now + cooldown);
                true
            }
        }
    }

    /// Record a failure; returns the id of a newly started episode.
    fn record_failure(&self, now: Instant, cooldown: Duration) -> Option<Uuid> {
        let mut state = self.state.lock();
        state.retry_at = Some(now + cooldown);
        if state.episode.is_some() {
            return None;
        }
        let episode = Uuid::new_v4();
        state.episode = Some(episode);
        Some(episode)
    }

    /// Record a success; returns the id of the episode that just ended.
    fn record_success(&self) -> Option<Uuid> {
        let mut state = self.state.lock();
        state.retry_at = None;
        state.episode.take()
    }

    fn is_degraded(&self) -> bool {
        self.state.lock().episode.is_some()
    }
}

/// The admission controller.
///
/// This struct is thread-safe and meant to be shared behind an `Arc`.
/// Each instance owns its own counters and health state, so independently
/// configured limiters never interfere.
#[derive(Debug)]
pub struct RateLimiter {
    policies: TierPolicyTable,
    store: Option<Arc<dyn CounterStore>>,
    fallback: Arc<LocalCounterStore>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    health: StoreHealth,
    metrics: LimiterMetrics,
}

impl RateLimiter {
    /// Create a limiter that counts only on the local counter.
    pub fn new(
        policies: TierPolicyTable,
        fallback: Arc<LocalCounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies,
            store: None,
            fallback,
            clock,
            cooldown: DEFAULT_FALLBACK_COOLDOWN,
            health: StoreHealth::default(),
            metrics: LimiterMetrics::new(),
        }
    }

    /// Count on a shared store, falling back to the local counter for
    /// `cooldown` after each failure.
    pub fn with_shared_store(mut self, store: Arc<dyn CounterStore>, cooldown: Duration) -> Self {
        self.store = Some(store);
        self.cooldown = cooldown;
        self
    }

    pub fn policies(&self) -> &TierPolicyTable {
        &self.policies
    }

    pub fn metrics(&self) -> &LimiterMetrics {
        &self.metrics
    }

    pub fn fallback(&self) -> &Arc<LocalCounterStore> {
        &self.fallback
    }

    /// Whether decisions are currently made from per-instance counts.
    pub fn is_degraded(&self) -> bool {
        self.store.is_none() || self.health.is_degraded()
    }

    /// Check and count one request from `subject`.
    ///
    /// Returns an error only when no counts could be obtained at all; the
    /// caller must then reject the request.
    pub async fn check(&self, subject: &RateSubject) -> Result<Admission, LimiterError> {
        let (tier, policy) = self.policies.lookup(&subject.tier);
        let keys = WindowKeys::for_subject(subject);

        trace!(subject = %subject, tier = %tier, "Checking rate limit");

        let (counts, source) = self.increment(&keys, policy).await?;
        let decision = decide(policy, &counts, self.clock.utc_now());

        if decision.allowed {
            self.metrics.record_allowed(decision.warning);
            if decision.warning {
                debug!(
                    subject = %subject,
                    tier = %tier,
                    hourly_count = decision.hourly_count,
                    burst_count = decision.burst_count,
                    "Approaching rate limit"
                );
            }
        } else {
            self.metrics.record_rejected();
            info!(
                subject = %subject,
                tier = %tier,
                hourly_count = decision.hourly_count,
                burst_count = decision.burst_count,
                limit = decision.limit,
                burst_limit = decision.burst_limit,
                source = source.as_str(),
                "Rate limit exceeded"
            );
        }

        Ok(Admission {
            tier,
            source,
            decision,
        })
    }

    async fn increment(
        &self,
        keys: &WindowKeys,
        policy: &TierPolicy,
    ) -> Result<(WindowCounts, CountSource), LimiterError> {
        if let Some(store) = &self.store {
            let now = self.clock.now();
            if self.health.should_try(now, self.cooldown) {
                match store.increment_windows(keys, policy.window, policy.burst_window).await {
                    Ok(counts) => {
                        if let Some(episode) = self.health.record_success() {
                            info!(
                                store = store.name(),
                                episode = %episode,
                                "counter store recovered, leaving degraded mode"
                            );
                        }
                        return Ok((counts, CountSource::Shared));
                    }
                    Err(err) if !err.is_unavailable() => {
                        self.metrics.record_internal_error();
                        error!(
                            subject = %keys.subject(),
                            store = store.name(),
                            error = %err,
                            "Counter store failed, rejecting request"
                        );
                        return Err(LimiterError::Internal(err.to_string()));
                    }
                    Err(err) => {
                        self.metrics.record_store_failure();
                        match self.health.record_failure(now, self.cooldown_with_jitter()) {
                            Some(episode) => {
                                self.metrics.record_degraded_episode();
                                warn!(
                                    store = store.name(),
                                    episode = %episode,
                                    error = %err,
                                    cooldown_secs = self.cooldown.as_secs(),
                                    "counter store unavailable, entering degraded mode"
                                );
                            }
                            None => {
                                debug!(
                                    store = store.name(),
                                    error = %err,
                                    "Counter store still unavailable"
                                );
                            }
                        }
                    }
                }
            }
        }

        match self
            .fallback
            .increment_windows(keys, policy.window, policy.burst_window)
            .await
        {
            Ok(counts) => {
                self.metrics.record_fallback_decision();
                Ok((counts, CountSource::Local))
            }
            Err(err) => {
                self.metrics.record_internal_error();
                error!(
                    subject = %keys.subject(),
                    store = self.fallback.name(),
                    error = %err,
                    "No counter available, rejecting request"
                );
                Err(LimiterError::Internal(err.to_string()))
            }
        }
    }

    /// Cooldown plus up to 10% jitter so instances do not probe in lockstep.
    fn cooldown_with_jitter(&self) -> Duration {
        let max_jitter_ms = u64::try_from(self.cooldown.as_millis() / 10).unwrap_or(0);
        if max_jitter_ms == 0 {
            return self.cooldown;
        }
        self.cooldown + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ratelimit::clock::MockClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    /// A shared store that can be switched off, backed by a separate local counter.
    #[derive(Debug)]
    struct SwitchableStore {
        inner: LocalCounterStore,
        up: AtomicBool,
        calls: AtomicUsize,
    }

    impl SwitchableStore {
        fn new(clock: Arc<dyn Clock>, up: bool) -> Self {
            Self {
                inner: LocalCounterStore::new(clock, 1000),
                up: AtomicBool::new(up),
                calls: AtomicUsize::new(0),
            }
        }

        fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CounterStore for SwitchableStore {
        fn name(&self) -> &'static str {
            "switchable"
        }

        async fn increment_windows(
            &self,
            keys: &WindowKeys,
            hourly_ttl: Duration,
            burst_ttl: Duration,
        ) -> Result<WindowCounts, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.up.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable {
                    store: "switchable",
                    reason: "connection refused".to_string(),
                });
            }
            self.inner.increment_windows(keys, hourly_ttl, burst_ttl).await
        }
    }

    /// A shared store that answers but reports an error the limiter cannot recover from.
    #[derive(Debug, Default)]
    struct BrokenStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn increment_windows(
            &self,
            _keys: &WindowKeys,
            _hourly_ttl: Duration,
            _burst_ttl: Duration,
        ) -> Result<WindowCounts, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::CapacityExhausted { max_subjects: 0 })
        }
    }

    fn subject(id: &str, tier: &str) -> RateSubject {
        RateSubject {
            id: id.to_string(),
            tier: tier.to_string(),
        }
    }

    fn local_limiter() -> (RateLimiter, MockClock) {
        let clock = MockClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let fallback = Arc::new(LocalCounterStore::new(shared_clock.clone(), 1000));
        (
            RateLimiter::new(TierPolicyTable::default(), fallback, shared_clock),
            clock,
        )
    }

    fn shared_limiter(up: bool) -> (RateLimiter, Arc<SwitchableStore>, MockClock) {
        let clock = MockClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(SwitchableStore::new(shared_clock.clone(), up));
        let fallback = Arc::new(LocalCounterStore::new(shared_clock.clone(), 1000));
        let limiter = RateLimiter::new(TierPolicyTable::default(), fallback, shared_clock)
            .with_shared_store(store.clone(), Duration::from_secs(10));
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_burst_limit_rejects_eleventh_request() {
        let (limiter, _clock) = local_limiter();
        let caller = subject("user:burst", "free");

        for i in 1..=10u64 {
            let admission = limiter.check(&caller).await.unwrap();
            assert!(admission.decision.allowed, "request {} should be allowed", i);
            assert_eq!(admission.decision.burst_count, i);
        }

        for _ in 11..=80 {
            let admission = limiter.check(&caller).await.unwrap();
            assert!(!admission.decision.allowed);
            assert!(admission.decision.hourly_count <= 80);
            let retry = admission.decision.retry_after_secs().unwrap();
            assert!(retry <= 60, "retry after {} should be within the burst window", retry);
        }
    }

    #[tokio::test]
    async fn test_hourly_limit_and_reset() {
        let (limiter, clock) = local_limiter();
        let caller = subject("user:steady", "free");

        // Spaced out so the burst window never fills
        for i in 1..=100u64 {
            let admission = limiter.check(&caller).await.unwrap();
            assert!(admission.decision.allowed, "request {} should be allowed", i);
            assert_eq!(admission.decision.hourly_count, i);
            clock.advance(Duration::from_secs(35));
        }

        let rejected = limiter.check(&caller).await.unwrap();
        assert!(!rejected.decision.allowed);
        assert!(rejected.decision.hourly_exceeded());

        clock.advance(HOUR);
        let admission = limiter.check(&caller).await.unwrap();
        assert!(admission.decision.allowed);
        assert_eq!(admission.decision.hourly_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_tier_uses_free_policy() {
        let (limiter, _clock) = local_limiter();

        let admission = limiter.check(&subject("user:x", "bogus")).await.unwrap();
        assert_eq!(admission.tier, Tier::Free);
        assert_eq!(admission.decision.limit, 100);
        assert_eq!(admission.decision.burst_limit, 10);
    }

    #[tokio::test]
    async fn test_warning_near_limit() {
        let (limiter, _clock) = local_limiter();
        let caller = subject("user:warn", "free");

        for _ in 0..8 {
            assert!(!limiter.check(&caller).await.unwrap().decision.warning);
        }
        let ninth = limiter.check(&caller).await.unwrap();
        assert!(ninth.decision.allowed);
        assert!(ninth.decision.warning);

        assert_eq!(limiter.metrics().snapshot().warned, 1);
    }

    #[tokio::test]
    async fn test_shared_store_is_used_when_healthy() {
        let (limiter, store, _clock) = shared_limiter(true);

        let admission = limiter.check(&subject("user:a", "pro")).await.unwrap();
        assert_eq!(admission.source, CountSource::Shared);
        assert_eq!(store.calls(), 1);
        assert_eq!(limiter.fallback().subject_count(), 0);
        assert!(!limiter.is_degraded());
    }

    #[tokio::test]
    async fn test_fallback_serves_requests_and_reports_once() {
        let (limiter, store, clock) = shared_limiter(false);
        let caller = subject("user:a", "pro");

        for _ in 0..20 {
            let admission = limiter.check(&caller).await.unwrap();
            assert!(admission.decision.allowed);
            assert_eq!(admission.source, CountSource::Local);
        }

        // The store is skipped during the cooldown
        assert_eq!(store.calls(), 1);
        assert!(limiter.is_degraded());

        // Probing again after the cooldown fails within the same episode
        clock.advance(Duration::from_secs(20));
        limiter.check(&caller).await.unwrap();
        assert_eq!(store.calls(), 2);

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.degraded_episodes, 1);
        assert_eq!(snapshot.store_failures, 2);
        assert_eq!(snapshot.fallback_decisions, 21);
    }

    #[tokio::test]
    async fn test_recovery_ends_episode() {
        let (limiter, store, clock) = shared_limiter(false);
        let caller = subject("user:b", "free");

        limiter.check(&caller).await.unwrap();
        assert!(limiter.is_degraded());

        store.set_up(true);
        clock.advance(Duration::from_secs(20));
        let admission = limiter.check(&caller).await.unwrap();
        assert_eq!(admission.source, CountSource::Shared);
        assert!(!limiter.is_degraded());

        // A new failure starts a second episode
        store.set_up(false);
        limiter.check(&caller).await.unwrap();
        assert_eq!(limiter.metrics().snapshot().degraded_episodes, 2);
    }

    #[tokio::test]
    async fn test_fallback_failure_fails_closed() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let fallback = Arc::new(LocalCounterStore::new(clock.clone(), 1));
        let limiter = RateLimiter::new(TierPolicyTable::default(), fallback, clock);

        limiter.check(&subject("user:first", "free")).await.unwrap();
        let result = limiter.check(&subject("user:second", "free")).await;

        assert!(matches!(result, Err(LimiterError::Internal(_))));
        assert_eq!(limiter.metrics().snapshot().internal_errors, 1);
    }

    #[tokio::test]
    async fn test_non_recoverable_store_error_fails_closed() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let store = Arc::new(BrokenStore::default());
        let fallback = Arc::new(LocalCounterStore::new(clock.clone(), 1000));
        let limiter = RateLimiter::new(TierPolicyTable::default(), fallback, clock)
            .with_shared_store(store.clone(), Duration::from_secs(10));

        let result = limiter.check(&subject("user:c", "free")).await;
        assert!(matches!(result, Err(LimiterError::Internal(_))));

        // No fallback and no degraded episode
        assert_eq!(limiter.fallback().subject_count(), 0);
        assert!(!limiter.is_degraded());
        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.internal_errors, 1);
        assert_eq!(snapshot.store_failures, 0);
        assert_eq!(snapshot.fallback_decisions, 0);

        // The next request still goes to the store
        assert!(limiter.check(&subject("user:c", "free")).await.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_single_probe_per_cooldown_while_degraded() {
        let health = StoreHealth::default();
        let cooldown = Duration::from_secs(5);
        let start = Instant::now();

        // Healthy: everyone uses the store
        assert!(health.should_try(start, cooldown));
        assert!(health.should_try(start, cooldown));

        assert!(health.record_failure(start, cooldown).is_some());
        assert!(!health.should_try(start + Duration::from_secs(1), cooldown));

        // Cooldown over: one caller probes, the others keep using the fallback
        let later = start + Duration::from_secs(6);
        assert!(health.should_try(later, cooldown));
        assert!(!health.should_try(later, cooldown));
        assert!(!health.should_try(later + Duration::from_secs(4), cooldown));
        assert!(health.should_try(later + cooldown, cooldown));

        assert!(health.record_success().is_some());
        assert!(health.should_try(later, cooldown));
    }

    #[tokio::test]
    async fn test_limiters_do_not_share_state() {
        let (first, _c1) = local_limiter();
        let (second, _c2) = local_limiter();
        let caller = subject("user:same", "free");

        for _ in 0..10 {
            first.check(&caller).await.unwrap();
        }
        let admission = second.check(&caller).await.unwrap();
        assert_eq!(admission.decision.burst_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_burst_never_over_admits() {
        let (limiter, _clock) = local_limiter();
        let limiter = Arc::new(limiter);
        let caller = subject("user:parallel", "free");

        let tasks = (0..64).map(|_| {
            let limiter = limiter.clone();
            let caller = caller.clone();
            tokio::spawn(async move { limiter.check(&caller).await.unwrap().decision.allowed })
        });

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_cooldown_jitter_bounds() {
        let (limiter, _store, _clock) = shared_limiter(true);
        for _ in 0..100 {
            let cooldown = limiter.cooldown_with_jitter();
            assert!(cooldown >= Duration::from_secs(10));
            assert!(cooldown <= Duration::from_secs(11));
        }
    }
}
