//! Key-value blob storage abstraction.
//!
//! Every persistent artifact (documents, chunks, index metadata and vectors,
//! learning state, evaluations, feedback, cache snapshots) is a blob keyed by
//! `(namespace, key)`. The [`BlobStore`] trait lets the same core logic run
//! over the file-backed store in the `ragloop` app crate or the
//! [`memory::InMemoryBlobStore`] used by tests.
//!
//! Implementations must be `Send + Sync` and must make each `put` atomic from
//! the reader's perspective: a concurrent or later `get` observes either the
//! previous bytes or the new bytes, never a partial write.

pub mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Namespace holding one JSON blob per [`DocumentRecord`](crate::models::DocumentRecord).
pub const DOCUMENTS: &str = "documents";
/// Namespace holding one JSON blob per [`ChunkRecord`](crate::models::ChunkRecord).
pub const CHUNKS: &str = "chunks";
/// Namespace holding index metadata and vector blobs.
pub const INDEXES: &str = "indexes";
/// Namespace holding the learning-state snapshot.
pub const STATE: &str = "state";
pub const EVALUATIONS: &str = "evaluations";
pub const FEEDBACK: &str = "feedback";
pub const CACHE: &str = "cache";

/// Abstract blob storage backend.
///
/// Operations are synchronous: blobs are small and the reference deployment
/// is a single process over a local disk.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put`](BlobStore::put) | Atomically write a blob |
/// | [`get`](BlobStore::get) | Read a blob, `None` if absent |
/// | [`delete`](BlobStore::delete) | Remove a blob, `false` if absent |
/// | [`list`](BlobStore::list) | List keys in a namespace, sorted |
pub trait BlobStore: Send + Sync {
    fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    fn list(&self, namespace: &str) -> Result<Vec<String>>;
}

/// Serialize `value` as pretty JSON and store it.
pub fn put_json<T: Serialize>(
    store: &dyn BlobStore,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(namespace, key, &bytes)
}

/// Load and deserialize a JSON blob. A blob that exists but does not parse
/// is a [`Error::Persistence`] naming the offending key.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn BlobStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(namespace, key)? {
        Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            Error::persistence(format!("Invalid blob {namespace}/{key}: {err}"))
        }),
        None => Ok(None),
    }
}
