//! Rate-limit subjects and identity resolution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin reported when the network address of a caller is not known.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// A verified principal, as handed over by the upstream identity provider.
///
/// The authentication layer inserts this into the request extensions; the
/// rate limiter never validates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tier: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: tier.into(),
        }
    }
}

/// What the rate limiter knows about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated principal, when the request carries one
    pub principal: Option<Principal>,
    /// Network origin of the caller (IP address or `"unknown"`)
    pub origin: String,
}

impl RequestContext {
    pub fn anonymous(origin: impl Into<String>) -> Self {
        Self {
            principal: None,
            origin: origin.into(),
        }
    }

    pub fn authenticated(principal: Principal, origin: impl Into<String>) -> Self {
        Self {
            principal: Some(principal),
            origin: origin.into(),
        }
    }
}

/// The identity a request is counted against.
///
/// The id is namespaced (`user:` or `ip:`) so a principal id can never
/// share counters with a network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RateSubject {
    pub id: String,
    pub tier: String,
}

impl RateSubject {
    /// Resolve the subject for a request.
    ///
    /// Deterministic and side-effect free: the same context always yields
    /// the same subject.
    pub fn resolve(context: &RequestContext) -> Self {
        match &context.principal {
            Some(principal) => Self {
                id: format!("user:{}", principal.id),
                tier: principal.tier.clone(),
            },
            None => {
                let origin = context.origin.trim();
                let origin = if origin.is_empty() { UNKNOWN_ORIGIN } else { origin };
                Self {
                    id: format!("ip:{}", origin),
                    tier: "free".to_string(),
                }
            }
        }
    }
}

impl fmt::Display for RateSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
