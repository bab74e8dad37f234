//! Counter keys and window counts.

use std::fmt;
use std::time::Duration;

use super::subject::RateSubject;

/// The two windows every subject is counted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Sustained quota window
    Hourly,
    /// Short spike-protection window
    Burst,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Hourly => "hourly",
            WindowKind::Burst => "burst",
        }
    }
}

/// Key identifying one window counter of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The subject id (already namespaced)
    pub subject: String,
    /// Which window this counter belongs to
    pub kind: WindowKind,
}

impl CounterKey {
    pub fn new(subject: &str, kind: WindowKind) -> Self {
        Self {
            subject: subject.to_string(),
            kind,
        }
    }

    /// Convert to a store key string.
    /// Format: "{prefix}{{subject}}:{kind}"
    /// The braces form a Redis Cluster hash tag so both windows of a
    /// subject land in the same slot and can be updated in one script.
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!("{}{{{}}}:{}", prefix, self.subject, self.kind.as_str())
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject, self.kind.as_str())
    }
}

/// The pair of counters incremented together for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKeys {
    pub hourly: CounterKey,
    pub burst: CounterKey,
}

impl WindowKeys {
    pub fn for_subject(subject: &RateSubject) -> Self {
        Self {
            hourly: CounterKey::new(&subject.id, WindowKind::Hourly),
            burst: CounterKey::new(&subject.id, WindowKind::Burst),
        }
    }

    /// The subject both keys belong to.
    pub fn subject(&self) -> &str {
        &self.hourly.subject
    }
}

/// Counts after one atomic increment of both windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    /// Requests counted in the current sustained window, this one included
    pub hourly: u64,
    /// Requests counted in the current burst window, this one included
    pub burst: u64,
    /// Time left before the sustained window resets
    pub hourly_reset_in: Duration,
    /// Time left before the burst window resets
    pub burst_reset_in: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_format() {
        let key = CounterKey::new("user:42", WindowKind::Burst);
        assert_eq!(key.to_store_key("quotaguard:"), "quotaguard:{user:42}:burst");
        assert_eq!(key.to_string(), "user:42:burst");
    }

    #[test]
    fn test_window_keys_share_subject() {
        let subject = RateSubject {
            id: "ip:10.0.0.1".to_string(),
            tier: "free".to_string(),
        };
        let keys = WindowKeys::for_subject(&subject);

        assert_eq!(keys.subject(), "ip:10.0.0.1");
        assert_eq!(keys.hourly.kind, WindowKind::Hourly);
        assert_eq!(keys.burst.kind, WindowKind::Burst);
        assert_ne!(keys.hourly.to_store_key("p:"), keys.burst.to_store_key("p:"));
    }
}
