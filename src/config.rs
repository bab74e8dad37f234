//! Configuration management for Quotaguard.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{QuotaGuardError, Result};
use crate::ratelimit::{RedisStoreConfig, TierPolicyTable, TierTableConfig};

/// Prefix of environment variables overriding file settings,
/// e.g. `QUOTAGUARD__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "QUOTAGUARD";

/// Main configuration for the Quotaguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaGuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Local fallback counter configuration
    #[serde(default)]
    pub local: LocalCounterConfig,

    /// Tier policies
    #[serde(default)]
    pub tiers: TierTableConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Take the caller address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that sets these headers.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one every instance counts locally
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for one increment round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Seconds to stay on the local counter after a store failure
    #[serde(default = "default_fallback_cooldown")]
    pub fallback_cooldown_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            fallback_cooldown_secs: default_fallback_cooldown(),
        }
    }
}

impl StoreConfig {
    pub fn redis_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            key_prefix: self.key_prefix.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn fallback_cooldown(&self) -> Duration {
        Duration::from_secs(self.fallback_cooldown_secs)
    }
}

fn default_key_prefix() -> String {
    "quotaguard:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_fallback_cooldown() -> u64 {
    5
}

/// Local fallback counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCounterConfig {
    /// Maximum number of subjects tracked in memory
    #[serde(default = "default_max_subjects")]
    pub max_subjects: usize,

    /// Interval between sweeps of expired subjects in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalCounterConfig {
    fn default() -> Self {
        Self {
            max_subjects: default_max_subjects(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LocalCounterConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_max_subjects() -> usize {
    100_000
}

fn default_sweep_interval() -> u64 {
    60
}

impl QuotaGuardConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaGuardConfig =
            serde_yaml::from_str(yaml).map_err(|e| QuotaGuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, overlaid with
    /// `QUOTAGUARD__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: QuotaGuardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaGuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(QuotaGuardError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.local.max_subjects == 0 {
            return Err(QuotaGuardError::Config(
                "local.max_subjects must be greater than zero".to_string(),
            ));
        }
        TierPolicyTable::from_config(&self.tiers)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Tier;

    #[test]
    fn test_defaults() {
        let config = QuotaGuardConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert!(!config.server.trust_forwarded_for);
        assert!(config.store.redis_url.is_none());
        assert_eq!(config.store.redis_config().timeout, Duration::from_millis(250));
        assert_eq!(config.store.fallback_cooldown(), Duration::from_secs(5));
        assert_eq!(config.local.max_subjects, 100_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
  trust_forwarded_for: true
store:
  redis_url: "redis://cache:6379/"
  timeout_ms: 100
local:
  max_subjects: 500
tiers:
  default_tier: free
  pro:
    limit: 2000
    window_secs: 3600
    burst_limit: 100
    burst_window_secs: 60
    warn_threshold: 0.75
"#;
        let config = QuotaGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert!(config.server.trust_forwarded_for);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379/"));
        assert_eq!(config.store.key_prefix, "quotaguard:");
        assert_eq!(config.local.max_subjects, 500);

        let table = TierPolicyTable::from_config(&config.tiers).unwrap();
        assert_eq!(table.get(Tier::Pro).limit, 2000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(QuotaGuardConfig::from_yaml("store:\n  timeout_ms: 0\n").is_err());
        assert!(QuotaGuardConfig::from_yaml("local:\n  max_subjects: 0\n").is_err());
        assert!(QuotaGuardConfig::from_yaml("server: [1, 2]\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("quotaguard-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "store:\n  key_prefix: \"test:\"\n").unwrap();

        let config = QuotaGuardConfig::load(path.to_str()).unwrap();
        assert_eq!(config.store.key_prefix, "test:");

        std::fs::remove_file(path).unwrap();
    }
}
