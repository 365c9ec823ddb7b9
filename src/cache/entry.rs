use serde::{Deserialize, Serialize};
use tracing::debug;

/// One cached value with the wall-clock time it was stored and its lifetime.
///
/// Entries are replaced whole; nothing mutates one after construction. The
/// serialized field names (`timestamp`, `ttl`) are the durable file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(rename = "timestamp")]
    pub created_at: u64,
    #[serde(rename = "ttl")]
    pub ttl_ms: u64,
    pub key: String,
}

impl<T> CacheEntry<T> {
    /// Builds an entry; a zero TTL is clamped to 1 ms.
    pub fn new(key: impl Into<String>, data: T, created_at: u64, ttl_ms: u64) -> Self {
        let key = key.into();
        let ttl_ms = if ttl_ms == 0 {
            debug!(key = %key, "zero ttl clamped to 1ms");
            1
        } else {
            ttl_ms
        };
        Self {
            data,
            created_at,
            ttl_ms,
            key,
        }
    }

    /// Fresh iff `now - created_at < ttl`. A timestamp in the future counts as
    /// age zero.
    pub fn is_fresh_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) < self.ttl_ms
    }

    /// Milliseconds since the entry was stored, zero if stored in the future.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_strictly_before_ttl() {
        let entry = CacheEntry::new("records:all", 1, 1_000, 500);
        assert!(entry.is_fresh_at(1_000));
        assert!(entry.is_fresh_at(1_499));
        assert!(!entry.is_fresh_at(1_500));
        assert!(!entry.is_fresh_at(10_000));
    }

    #[test]
    fn zero_ttl_is_clamped() {
        let entry = CacheEntry::new("k", (), 0, 0);
        assert_eq!(entry.ttl_ms, 1);
        assert!(entry.is_fresh_at(0));
        assert!(!entry.is_fresh_at(1));
    }

    #[test]
    fn clock_skew_counts_as_fresh() {
        let entry = CacheEntry::new("k", (), 5_000, 10);
        assert!(entry.is_fresh_at(1_000));
        assert_eq!(entry.age_ms(1_000), 0);
    }

    #[test]
    fn serializes_with_durable_field_names() {
        let entry = CacheEntry::new("invoices:open", vec![1, 2], 42, 300_000);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["timestamp"], 42);
        assert_eq!(json["ttl"], 300_000);
        assert_eq!(json["key"], "invoices:open");
        assert_eq!(json["data"], serde_json::json!([1, 2]));
    }
}
