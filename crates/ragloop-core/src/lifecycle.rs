//! Expiration sweep and invalidation policy over the [`SemanticCache`].
//!
//! Every operation is idempotent and a no-op on an empty cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::SemanticCache;
use crate::error::Result;

/// Outcome of one [`CacheManager::cleanup`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_invalid: usize,
    pub removed_expired: usize,
    pub remaining: usize,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.removed_invalid + self.removed_expired
    }
}

#[derive(Clone)]
pub struct CacheManager {
    cache: Arc<SemanticCache>,
}

impl CacheManager {
    pub fn new(cache: Arc<SemanticCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    /// Physically drop invalid and expired entries.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_at(Utc::now())
    }

    /// [`cleanup`](Self::cleanup) with an explicit clock.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let report = self.cache.commit(|entries| {
            let mut report = CleanupReport::default();
            entries.retain(|entry| {
                if !entry.valid {
                    report.removed_invalid += 1;
                    false
                } else if entry.is_expired(now) {
                    report.removed_expired += 1;
                    false
                } else {
                    true
                }
            });
            report.remaining = entries.len();
            report
        })?;
        if report.removed() > 0 {
            tracing::info!(
                invalid = report.removed_invalid,
                expired = report.removed_expired,
                remaining = report.remaining,
                "Cache cleanup"
            );
        }
        Ok(report)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn invalidate_all(&self) -> Result<usize> {
        let removed = self.cache.commit(|entries| {
            let n = entries.len();
            entries.clear();
            n
        })?;
        tracing::info!(removed, "Cache cleared");
        Ok(removed)
    }

    /// Soft-invalidate entries whose stored query equals `query` exactly.
    pub fn invalidate_by_query(&self, query: &str) -> Result<usize> {
        self.cache
            .invalidate_where(|entry| entry.query == query, "query_invalidated")
    }

    /// Soft-invalidate entries answered from the given index.
    pub fn invalidate_by_collection(&self, collection: &str) -> Result<usize> {
        self.cache.invalidate_where(
            |entry| entry.collections.contains(collection),
            "collection_invalidated",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::TableEmbedder;
    use crate::cache::CacheEntry;
    use chrono::Duration;
    use serde_json::json;

    fn entry(id: &str, query: &str, age_secs: i64, ttl: Option<i64>, collections: &[&str]) -> CacheEntry {
        CacheEntry {
            entry_id: id.to_string(),
            query: query.to_string(),
            embedding: vec![1.0, 0.0],
            payload: json!(id),
            collections: collections.iter().map(|c| c.to_string()).collect(),
            created_at: Utc::now() - Duration::seconds(age_secs),
            last_accessed_at: None,
            valid: true,
            invalid_reason: None,
            ttl_secs: ttl,
        }
    }

    fn manager() -> CacheManager {
        let cache = SemanticCache::new(Arc::new(TableEmbedder::new(&[])), 0.9).unwrap();
        CacheManager::new(Arc::new(cache))
    }

    #[test]
    fn test_cleanup_removes_expired_keeps_ttl_none() {
        let manager = manager();
        let cache = manager.cache();
        cache.insert(entry("expired", "q1", 11, Some(10), &[])).unwrap();
        cache.insert(entry("fresh", "q2", 5, Some(10), &[])).unwrap();
        cache.insert(entry("forever", "q3", 10_000_000, None, &[])).unwrap();

        let report = manager.cleanup().unwrap();
        assert_eq!(report.removed_expired, 1);
        assert_eq!(report.remaining, 2);
        let ids: Vec<String> = cache.entries().unwrap().into_iter().map(|e| e.entry_id).collect();
        assert_eq!(ids, vec!["fresh", "forever"]);
    }

    #[test]
    fn test_cleanup_removes_invalidated() {
        let manager = manager();
        manager.cache().insert(entry("a", "q1", 0, None, &[])).unwrap();
        manager.cache().invalidate("a", "manual").unwrap();

        let report = manager.cleanup().unwrap();
        assert_eq!(report.removed_invalid, 1);
        assert!(manager.cache().is_empty().unwrap());
    }

    #[test]
    fn test_operations_on_empty_cache_are_noops() {
        let manager = manager();
        assert_eq!(manager.cleanup().unwrap(), CleanupReport::default());
        assert_eq!(manager.cleanup().unwrap(), CleanupReport::default());
        assert_eq!(manager.invalidate_all().unwrap(), 0);
        assert_eq!(manager.invalidate_by_query("q").unwrap(), 0);
        assert_eq!(manager.invalidate_by_collection("idx").unwrap(), 0);
    }

    #[test]
    fn test_invalidate_by_query_is_exact_match() {
        let manager = manager();
        manager.cache().insert(entry("a", "what is rust", 0, None, &[])).unwrap();
        manager.cache().insert(entry("b", "what is rust?", 0, None, &[])).unwrap();

        assert_eq!(manager.invalidate_by_query("what is rust").unwrap(), 1);
        assert_eq!(manager.invalidate_by_query("what is rust").unwrap(), 0);
        let valid: Vec<bool> = manager.cache().entries().unwrap().iter().map(|e| e.valid).collect();
        assert_eq!(valid, vec![false, true]);
    }

    #[test]
    fn test_invalidate_by_collection() {
        let manager = manager();
        manager.cache().insert(entry("a", "q1", 0, None, &["idx-1", "idx-2"])).unwrap();
        manager.cache().insert(entry("b", "q2", 0, None, &["idx-3"])).unwrap();

        assert_eq!(manager.invalidate_by_collection("idx-2").unwrap(), 1);
        let entries = manager.cache().entries().unwrap();
        assert_eq!(entries[0].invalid_reason.as_deref(), Some("collection_invalidated"));
        assert!(entries[1].valid);
    }

    #[test]
    fn test_invalidate_all_clears_everything() {
        let manager = manager();
        manager.cache().insert(entry("a", "q1", 0, None, &[])).unwrap();
        manager.cache().insert(entry("b", "q2", 0, Some(1), &[])).unwrap();
        assert_eq!(manager.invalidate_all().unwrap(), 2);
        assert!(manager.cache().is_empty().unwrap());
    }
}
