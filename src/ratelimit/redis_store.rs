//! Redis-backed shared counter store.
//!
//! Both window counters of a subject are updated by a single Lua script,
//! which Redis runs without interleaving any other command. Each key gets
//! its TTL only from the `INCR` that created it, so sustained traffic never
//! pushes a window's expiry forward.
//!
//! The round trip is bounded by `timeout`. A timeout, a connection failure
//! and an unexpected reply are all reported as the store being unavailable;
//! the caller decides what to do about it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::backend::CounterStore;
use super::window::{WindowCounts, WindowKeys};
use crate::error::StoreError;

const STORE_NAME: &str = "redis";

/// KEYS[1] hourly key, KEYS[2] burst key; ARGV[1] hourly TTL ms, ARGV[2] burst TTL ms.
/// Returns {hourly_count, burst_count, hourly_pttl, burst_pttl}.
const INCREMENT_WINDOWS_SCRIPT: &str = r#"
local function hit(key, ttl_ms)
  local count = redis.call('INCR', key)
  if count == 1 then
    redis.call('PEXPIRE', key, ttl_ms)
    return count, tonumber(ttl_ms)
  end
  local ttl = redis.call('PTTL', key)
  if ttl < 0 then
    redis.call('PEXPIRE', key, ttl_ms)
    ttl = tonumber(ttl_ms)
  end
  return count, ttl
end

local hourly, hourly_ttl = hit(KEYS[1], ARGV[1])
local burst, burst_ttl = hit(KEYS[2], ARGV[2])
return {hourly, burst, hourly_ttl, burst_ttl}
"#;

/// Configuration for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key written by the limiter
    pub key_prefix: String,
    /// Upper bound for connecting plus running the script
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "quotaguard:".to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

/// Shared counter store backed by Redis.
///
/// The connection is established lazily and re-established by the
/// `ConnectionManager` after failures, so the service can start while Redis
/// is down and pick it up once it becomes reachable.
pub struct RedisCounterStore {
    client: Client,
    connection: Mutex<Option<ConnectionManager>>,
    script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create a store for the given Redis URL without connecting yet.
    ///
    /// # Errors
    /// Returns error if the URL cannot be parsed.
    pub fn new(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| unavailable(&e))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            script: Script::new(INCREMENT_WINDOWS_SCRIPT),
            config,
        })
    }

    /// Get a handle to the managed connection, connecting on first use.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        debug!("Connecting to Redis counter store");
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| unavailable(&e))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn run_script(
        &self,
        keys: &WindowKeys,
        hourly_ttl: Duration,
        burst_ttl: Duration,
    ) -> Result<WindowCounts, StoreError> {
        let mut conn = self.connection().await?;

        let hourly_key = keys.hourly.to_store_key(&self.config.key_prefix);
        let burst_key = keys.burst.to_store_key(&self.config.key_prefix);

        let reply: Vec<i64> = self
            .script
            .key(&hourly_key)
            .key(&burst_key)
            .arg(ttl_millis(hourly_ttl))
            .arg(ttl_millis(burst_ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;

        parse_reply(&reply)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        STORE_NAME
    }

    async fn increment_windows(
        &self,
        keys: &WindowKeys,
        hourly_ttl: Duration,
        burst_ttl: Duration,
    ) -> Result<WindowCounts, StoreError> {
        let timeout = self.config.timeout;
        let counts = tokio::time::timeout(timeout, self.run_script(keys, hourly_ttl, burst_ttl))
            .await
            .map_err(|_| StoreError::Timeout {
                store: STORE_NAME,
                after: timeout,
            })??;

        trace!(
            subject = %keys.subject(),
            hourly = counts.hourly,
            burst = counts.burst,
            "Incremented shared counters"
        );

        Ok(counts)
    }
}

fn unavailable(err: &RedisError) -> StoreError {
    StoreError::Unavailable {
        store: STORE_NAME,
        reason: err.to_string(),
    }
}

/// TTLs are sent in milliseconds and never below one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn parse_reply(reply: &[i64]) -> Result<WindowCounts, StoreError> {
    let [hourly, burst, hourly_ttl, burst_ttl] = reply else {
        return Err(StoreError::MalformedReply(format!(
            "expected 4 integers, got {}",
            reply.len()
        )));
    };

    let count = |value: i64| {
        u64::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| StoreError::MalformedReply(format!("invalid counter value {}", value)))
    };
    let ttl = |value: i64| Duration::from_millis(u64::try_from(value).unwrap_or(0));

    Ok(WindowCounts {
        hourly: count(*hourly)?,
        burst: count(*burst)?,
        hourly_reset_in: ttl(*hourly_ttl),
        burst_reset_in: ttl(*burst_ttl),
    })
}
