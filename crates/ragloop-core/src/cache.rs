//! Semantic answer cache.
//!
//! Questions are matched by embedding similarity rather than exact text, so
//! a paraphrase of an earlier question can be answered without running the
//! pipeline. Lookup is a linear scan over live entries.
//!
//! Entries are never removed here: [`SemanticCache::invalidate`] only marks
//! an entry invalid. Physical removal belongs to
//! [`CacheManager`](crate::lifecycle::CacheManager).
//!
//! # Matching rule
//!
//! The entry with the highest cosine similarity wins when that similarity is
//! at least the configured threshold (inclusive). On a tie the entry stored
//! first wins. Invalid and TTL-expired entries never match. A threshold of
//! `1.0` accepts similarities within [`SIMILARITY_EPSILON`] of it, so an
//! identical embedding matches despite float rounding; every lower threshold
//! is compared exactly.
//!
//! A TTL too large to represent as a duration never expires.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Error, Result};
use crate::store::{self, BlobStore};

pub const SIMILARITY_EPSILON: f32 = 1e-6;

/// Blob key of the cache snapshot inside [`store::CACHE`].
pub const CACHE_KEY: &str = "entries.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entry_id: String,
    pub query: String,
    pub embedding: Vec<f32>,
    /// Opaque answer object returned on a hit.
    pub payload: serde_json::Value,
    /// Index ids that contributed to the answer.
    #[serde(default)]
    pub collections: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub valid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    /// Lifetime in seconds; `None` never expires by age.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

impl CacheEntry {
    /// `now - created_at > ttl`. Entries without a TTL never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs.and_then(Duration::try_seconds) {
            Some(ttl) => now.signed_duration_since(self.created_at) > ttl,
            None => false,
        }
    }

    /// Valid and not expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.valid && !self.is_expired(now)
    }
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub entry_id: String,
    pub query: String,
    pub payload: serde_json::Value,
    pub similarity: f32,
}

pub struct SemanticCache {
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    entries: RwLock<Vec<CacheEntry>>,
    blobs: Option<Arc<dyn BlobStore>>,
    persist: Mutex<()>,
}

impl SemanticCache {
    /// In-memory cache. `threshold` must lie in `[0, 1]`.
    pub fn new(embedder: Arc<dyn Embedder>, threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::validation(format!(
                "Cache similarity threshold must be within [0, 1], got {threshold}"
            )));
        }
        Ok(Self {
            embedder,
            threshold,
            entries: RwLock::new(Vec::new()),
            blobs: None,
            persist: Mutex::new(()),
        })
    }

    /// Cache that restores its entries from `blobs` and writes a snapshot
    /// after every mutation.
    pub fn persistent(
        embedder: Arc<dyn Embedder>,
        threshold: f32,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let mut cache = Self::new(embedder, threshold)?;
        let entries: Vec<CacheEntry> =
            store::get_json(blobs.as_ref(), store::CACHE, CACHE_KEY)?.unwrap_or_default();
        tracing::debug!(entries = entries.len(), "Restored semantic cache");
        cache.entries = RwLock::new(entries);
        cache.blobs = Some(blobs);
        Ok(cache)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<CacheEntry>>> {
        self.entries.write().map_err(|_| poisoned())
    }

    /// Apply `mutate` under the write lock, then persist the resulting
    /// snapshot. Snapshots are written in mutation order.
    pub(crate) fn commit<R>(&self, mutate: impl FnOnce(&mut Vec<CacheEntry>) -> R) -> Result<R> {
        let _persist = self.persist.lock().map_err(|_| poisoned())?;
        let (result, bytes) = {
            let mut entries = self.write()?;
            let result = mutate(&mut entries);
            let bytes = match self.blobs {
                Some(_) => Some(serde_json::to_vec(&*entries)?),
                None => None,
            };
            (result, bytes)
        };
        if let (Some(blobs), Some(bytes)) = (&self.blobs, bytes) {
            blobs.put(store::CACHE, CACHE_KEY, &bytes)?;
        }
        Ok(result)
    }

    /// Return the best live entry whose similarity reaches the threshold.
    ///
    /// The query is only embedded when at least one live entry exists.
    pub async fn lookup(&self, query: &str) -> Result<Option<CacheHit>> {
        let now = Utc::now();
        let any_live = self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .any(|e| e.is_live(now));
        if !any_live {
            return Ok(None);
        }

        let query_vec = self.embedder.embed(query).await?;

        let best = {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            let mut best: Option<(usize, f32)> = None;
            for (pos, entry) in entries.iter().enumerate() {
                if !entry.is_live(now) {
                    continue;
                }
                let sim = cosine_similarity(&query_vec, &entry.embedding);
                if best.map_or(true, |(_, top)| sim > top) {
                    best = Some((pos, sim));
                }
            }
            best.and_then(|(pos, sim)| {
                if reaches_threshold(sim, self.threshold) {
                    let entry = &entries[pos];
                    Some(CacheHit {
                        entry_id: entry.entry_id.clone(),
                        query: entry.query.clone(),
                        payload: entry.payload.clone(),
                        similarity: sim.min(1.0),
                    })
                } else {
                    None
                }
            })
        };

        match &best {
            Some(hit) => {
                tracing::debug!(entry_id = %hit.entry_id, similarity = hit.similarity, "Semantic cache hit");
                self.touch(&hit.entry_id)?;
            }
            None => tracing::debug!("Semantic cache miss"),
        }
        Ok(best)
    }

    fn touch(&self, entry_id: &str) -> Result<()> {
        let now = Utc::now();
        self.commit(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.entry_id == entry_id) {
                entry.last_accessed_at = Some(now);
            }
        })
    }

    /// Embed `query` and append a new valid entry. Near-duplicates are not
    /// merged. Returns the new entry id.
    pub async fn store(
        &self,
        query: &str,
        payload: serde_json::Value,
        ttl_secs: Option<i64>,
        collections: BTreeSet<String>,
    ) -> Result<String> {
        let embedding = self.embedder.embed(query).await?;
        let entry = CacheEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            embedding,
            payload,
            collections,
            created_at: Utc::now(),
            last_accessed_at: None,
            valid: true,
            invalid_reason: None,
            ttl_secs,
        };
        self.insert(entry)
    }

    /// Append a prepared entry (used when restoring or in tests that need a
    /// specific `created_at`).
    pub fn insert(&self, entry: CacheEntry) -> Result<String> {
        let entry_id = entry.entry_id.clone();
        self.commit(|entries| entries.push(entry))?;
        Ok(entry_id)
    }

    /// Soft-invalidate one entry. Returns `false` when the id is unknown.
    pub fn invalidate(&self, entry_id: &str, reason: &str) -> Result<bool> {
        self.invalidate_where(|e| e.entry_id == entry_id, reason)
            .map(|n| n > 0)
    }

    /// Soft-invalidate every still-valid entry matching `predicate`.
    pub fn invalidate_where<F>(&self, predicate: F, reason: &str) -> Result<usize>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        self.commit(|entries| {
            let mut count = 0;
            for entry in entries.iter_mut().filter(|e| e.valid && predicate(&**e)) {
                entry.valid = false;
                entry.invalid_reason = Some(reason.to_string());
                count += 1;
            }
            count
        })
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.entries.read().map_err(|_| poisoned())?.clone())
    }

    /// Number of entries, including invalid and expired ones.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(|_| poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Inclusive comparison; only the `1.0` threshold tolerates rounding.
fn reaches_threshold(similarity: f32, threshold: f32) -> bool {
    if threshold >= 1.0 {
        similarity + SIMILARITY_EPSILON >= 1.0
    } else {
        similarity >= threshold
    }
}

fn poisoned() -> Error {
    Error::persistence("semantic cache lock poisoned")
}
