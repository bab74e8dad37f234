//! Subscription tiers and their quota policies.
//!
//! Tiers are a closed set. Policies are loaded once at startup from the
//! `tiers` configuration block; any tier block that is absent falls back to
//! the built-in defaults below.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::error::{QuotaGuardError, Result};

/// Subscription tier of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// All tiers, most restrictive first.
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Pro, Tier::Enterprise];

    /// Parse a tier name as carried by the identity provider.
    ///
    /// Matching ignores case and surrounding whitespace.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(name))
    }

    /// Get the tier name for logging and headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota parameters for one tier.
///
/// `burst_window < window` and `burst_limit <= limit` are assumed but only
/// warned about, never enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Requests allowed per sustained window
    pub limit: u64,
    /// Sustained (hourly) window length
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
    /// Requests allowed per burst window
    pub burst_limit: u64,
    /// Burst window length
    #[serde(rename = "burst_window_secs", with = "duration_secs")]
    pub burst_window: Duration,
    /// Fraction of either limit above which allowed requests carry a warning
    pub warn_threshold: f64,
}

impl TierPolicy {
    pub fn free_default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(3600),
            burst_limit: 10,
            burst_window: Duration::from_secs(60),
            warn_threshold: 0.8,
        }
    }

    pub fn pro_default() -> Self {
        Self {
            limit: 1000,
            window: Duration::from_secs(3600),
            burst_limit: 50,
            burst_window: Duration::from_secs(60),
            warn_threshold: 0.8,
        }
    }

    pub fn enterprise_default() -> Self {
        Self {
            limit: 10_000,
            window: Duration::from_secs(3600),
            burst_limit: 200,
            burst_window: Duration::from_secs(60),
            warn_threshold: 0.9,
        }
    }

    /// Reject values the decision engine cannot work with.
    fn validate(&self, tier: Tier) -> Result<()> {
        if self.limit == 0 || self.burst_limit == 0 {
            return Err(QuotaGuardError::Config(format!(
                "tier '{tier}': limit and burst_limit must be greater than zero"
            )));
        }
        if self.window.is_zero() || self.burst_window.is_zero() {
            return Err(QuotaGuardError::Config(format!(
                "tier '{tier}': window_secs and burst_window_secs must be greater than zero"
            )));
        }
        if !(self.warn_threshold > 0.0 && self.warn_threshold <= 1.0) {
            return Err(QuotaGuardError::Config(format!(
                "tier '{tier}': warn_threshold must be in (0, 1], got {}",
                self.warn_threshold
            )));
        }

        if self.burst_window >= self.window {
            warn!(
                tier = %tier,
                window_secs = self.window.as_secs(),
                burst_window_secs = self.burst_window.as_secs(),
                "Burst window is not shorter than the sustained window"
            );
        }
        if self.burst_limit > self.limit {
            warn!(
                tier = %tier,
                limit = self.limit,
                burst_limit = self.burst_limit,
                "Burst limit exceeds the sustained limit"
            );
        }

        Ok(())
    }
}

/// The `tiers` configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTableConfig {
    /// Tier applied when a caller's tier name is not recognised
    #[serde(default = "default_tier_name")]
    pub default_tier: String,
    #[serde(default = "TierPolicy::free_default")]
    pub free: TierPolicy,
    #[serde(default = "TierPolicy::pro_default")]
    pub pro: TierPolicy,
    #[serde(default = "TierPolicy::enterprise_default")]
    pub enterprise: TierPolicy,
}

impl Default for TierTableConfig {
    fn default() -> Self {
        Self {
            default_tier: default_tier_name(),
            free: TierPolicy::free_default(),
            pro: TierPolicy::pro_default(),
            enterprise: TierPolicy::enterprise_default(),
        }
    }
}

fn default_tier_name() -> String {
    Tier::Free.as_str().to_string()
}

/// Immutable tier-to-policy mapping.
#[derive(Debug, Clone)]
pub struct TierPolicyTable {
    default_tier: Tier,
    free: TierPolicy,
    pro: TierPolicy,
    enterprise: TierPolicy,
}

impl TierPolicyTable {
    /// Build the table from configuration, validating every policy.
    pub fn from_config(config: &TierTableConfig) -> Result<Self> {
        let default_tier = match Tier::parse(&config.default_tier) {
            Some(tier) => tier,
            None => {
                warn!(
                    default_tier = %config.default_tier,
                    "Unknown default tier in configuration, using 'free'"
                );
                Tier::Free
            }
        };

        let table = Self {
            default_tier,
            free: config.free.clone(),
            pro: config.pro.clone(),
            enterprise: config.enterprise.clone(),
        };

        for tier in Tier::ALL {
            table.get(tier).validate(tier)?;
        }

        Ok(table)
    }

    /// Load a standalone tier table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TierTableConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGuardError::Config(format!("Failed to parse tier policies: {}", e)))?;
        Self::from_config(&config)
    }

    /// Policy for a known tier.
    pub fn get(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::Free => &self.free,
            Tier::Pro => &self.pro,
            Tier::Enterprise => &self.enterprise,
        }
    }

    /// Tier used for unrecognised names.
    pub fn default_tier(&self) -> Tier {
        self.default_tier
    }

    /// Resolve a tier name to its policy.
    ///
    /// Never fails: unknown names resolve to the default tier with a warning.
    pub fn lookup(&self, name: &str) -> (Tier, &TierPolicy) {
        let tier = Tier::parse(name).unwrap_or_else(|| {
            warn!(
                tier = %name,
                fallback = %self.default_tier,
                "Unknown tier, applying default tier policy"
            );
            self.default_tier
        });
        (tier, self.get(tier))
    }
}

impl Default for TierPolicyTable {
    fn default() -> Self {
        Self {
            default_tier: Tier::Free,
            free: TierPolicy::free_default(),
            pro: TierPolicy::pro_default(),
            enterprise: TierPolicy::enterprise_default(),
        }
    }
}

/// Serde adapter for durations expressed in whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
