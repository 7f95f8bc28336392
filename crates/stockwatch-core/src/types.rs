//! Domain types shared by the scheduler, the stores and the bot front end.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the key digest.
pub const FINGERPRINT_LEN: usize = 12;

/// Callback payload prefix of the inline "stop monitoring" action.
pub const STOP_ACTION_PREFIX: &str = "stop_";

/// Chat identity of a subscriber (Telegram chat id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(pub i64);

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity key of a watch: `"{url}|{location_code}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchKey(pub String);

impl WatchKey {
    pub fn new(url: &str, location_code: &str) -> Self {
        Self(format!("{url}|{location_code}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short stable alias used in inline action payloads.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.0.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Fingerprint(hex[..FINGERPRINT_LEN].to_string())
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Truncated SHA-256 of a [`WatchKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Inline action payload that unsubscribes from this watch.
    pub fn stop_action(&self) -> String {
        format!("{STOP_ACTION_PREFIX}{}", self.0)
    }

    /// Inverse of [`Fingerprint::stop_action`].
    pub fn from_stop_action(data: &str) -> Option<Self> {
        data.strip_prefix(STOP_ACTION_PREFIX)
            .filter(|fp| !fp.is_empty())
            .map(|fp| Fingerprint(fp.to_string()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last availability observed by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Unknown,
    Unavailable,
    Available,
}

impl Availability {
    pub fn from_observed(available: bool) -> Self {
        if available {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }

    /// True when moving to `next` is the unavailable→available edge.
    pub fn is_restock(self, next: Availability) -> bool {
        next == Availability::Available && self != Availability::Available
    }

    pub fn label(self) -> &'static str {
        match self {
            Availability::Unknown => "⏳ Checking...",
            Availability::Unavailable => "❌ Out of Stock",
            Availability::Available => "✅ In Stock",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Availability::Unknown => "unknown",
            Availability::Unavailable => "unavailable",
            Availability::Available => "available",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "available" => Availability::Available,
            "unavailable" => Availability::Unavailable,
            _ => Availability::Unknown,
        }
    }
}

/// One monitored (URL, location code) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductWatch {
    pub key: WatchKey,
    pub url: String,
    pub location_code: String,
    #[serde(default)]
    pub last_availability: Availability,
    #[serde(default)]
    pub subscribers: BTreeSet<RecipientId>,
    pub created_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

impl ProductWatch {
    pub fn new(url: &str, location_code: &str) -> Self {
        let key = WatchKey::new(url, location_code);
        let fingerprint = key.fingerprint();
        Self {
            key,
            url: url.to_string(),
            location_code: location_code.to_string(),
            last_availability: Availability::Unknown,
            subscribers: BTreeSet::new(),
            created_at: Utc::now(),
            fingerprint,
        }
    }

    pub fn with_subscriber(mut self, recipient: RecipientId) -> Self {
        self.subscribers.insert(recipient);
        self
    }

    pub fn is_orphaned(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_and_fingerprint_are_deterministic() {
        let a = WatchKey::new("https://shop.example/p/rose-lassi", "396191");
        let b = WatchKey::new("https://shop.example/p/rose-lassi", "396191");
        assert_eq!(a.as_str(), "https://shop.example/p/rose-lassi|396191");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_location_changes_fingerprint() {
        let a = WatchKey::new("https://shop.example/p/x", "396191");
        let b = WatchKey::new("https://shop.example/p/x", "110001");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_stop_action_payload() {
        let fp = WatchKey::new("u1", "396191").fingerprint();
        let data = fp.stop_action();
        assert!(data.starts_with("stop_"));
        assert!(data.len() <= 64);
        assert_eq!(Fingerprint::from_stop_action(&data), Some(fp));
        assert_eq!(Fingerprint::from_stop_action("stop_"), None);
        assert_eq!(Fingerprint::from_stop_action("buy_123"), None);
    }

    #[test]
    fn test_restock_edge() {
        use Availability::*;
        assert!(Unknown.is_restock(Available));
        assert!(Unavailable.is_restock(Available));
        assert!(!Available.is_restock(Available));
        assert!(!Unknown.is_restock(Unavailable));
    }

    #[test]
    fn test_availability_roundtrip_str() {
        for a in [Availability::Unknown, Availability::Unavailable, Availability::Available] {
            assert_eq!(Availability::parse(a.as_str()), a);
        }
    }
}
