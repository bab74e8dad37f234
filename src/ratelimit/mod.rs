//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod decision;
mod limiter;
mod metrics;
mod redis_store;
mod subject;
mod tier;
mod window;

pub use backend::CounterStore;
pub use clock::{Clock, MockClock, SystemClock};
pub use counter::LocalCounterStore;
pub use decision::{decide, Decision};
pub use limiter::{Admission, CountSource, RateLimiter, DEFAULT_FALLBACK_COOLDOWN};
pub use metrics::{LimiterMetrics, MetricsSnapshot};
pub use redis_store::{RedisCounterStore, RedisStoreConfig};
pub use subject::{Principal, RateSubject, RequestContext, UNKNOWN_ORIGIN};
pub use tier::{Tier, TierPolicy, TierPolicyTable, TierTableConfig};
pub use window::{CounterKey, WindowCounts, WindowKeys, WindowKind};
