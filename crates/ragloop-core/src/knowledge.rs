//! Document and chunk stores over a [`BlobStore`].
//!
//! One JSON blob per entity, keyed by id. Bulk loads skip ids that are
//! missing or unreadable so that one bad record never hides the rest;
//! single-record loads report corruption as an error.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::models::{ChunkRecord, DocumentRecord};
use crate::store::{self, BlobStore};

fn blob_key(id: &str) -> String {
    format!("{id}.json")
}

fn id_from_key(key: &str) -> Option<&str> {
    key.strip_suffix(".json")
}

fn list_ids(blobs: &dyn BlobStore, namespace: &str) -> Result<Vec<String>> {
    Ok(blobs
        .list(namespace)?
        .iter()
        .filter_map(|key| id_from_key(key).map(str::to_string))
        .collect())
}

#[derive(Clone)]
pub struct DocumentStore {
    blobs: Arc<dyn BlobStore>,
}

impl DocumentStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn save(&self, doc: &DocumentRecord) -> Result<()> {
        store::put_json(
            self.blobs.as_ref(),
            store::DOCUMENTS,
            &blob_key(&doc.document_id),
            doc,
        )
    }

    pub fn load(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        store::get_json(self.blobs.as_ref(), store::DOCUMENTS, &blob_key(document_id))
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        list_ids(self.blobs.as_ref(), store::DOCUMENTS)
    }

    /// All documents matching `predicate`, unreadable blobs skipped.
    pub fn filter<F>(&self, predicate: F) -> Result<Vec<DocumentRecord>>
    where
        F: Fn(&DocumentRecord) -> bool,
    {
        let mut out = Vec::new();
        for id in self.list_ids()? {
            match self.load(&id) {
                Ok(Some(doc)) if predicate(&doc) => out.push(doc),
                Ok(_) => {}
                Err(err) => tracing::warn!(document_id = %id, error = %err, "Skipping unreadable document"),
            }
        }
        Ok(out)
    }

    /// First stored document with this content hash, if any.
    pub fn find_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>> {
        Ok(self
            .filter(|doc| doc.content_hash == content_hash)?
            .into_iter()
            .next())
    }
}

/// Chunk records. Clones share one bind lock, so index binding through
/// any clone is serialized; separately constructed stores are not.
#[derive(Clone)]
pub struct ChunkStore {
    blobs: Arc<dyn BlobStore>,
    bind_lock: Arc<Mutex<()>>,
}

impl ChunkStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            bind_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn save(&self, chunk: &ChunkRecord) -> Result<()> {
        store::put_json(
            self.blobs.as_ref(),
            store::CHUNKS,
            &blob_key(&chunk.chunk_id),
            chunk,
        )
    }

    pub fn save_many(&self, chunks: &[ChunkRecord]) -> Result<()> {
        chunks.iter().try_for_each(|chunk| self.save(chunk))
    }

    pub fn load(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        store::get_json(self.blobs.as_ref(), store::CHUNKS, &blob_key(chunk_id))
    }

    /// Materialize chunk ids in order. Missing or unreadable ids are
    /// dropped; duplicates are kept.
    pub fn load_many(&self, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>> {
        let mut out = Vec::with_capacity(chunk_ids.len());
        for id in chunk_ids {
            match self.load(id) {
                Ok(Some(chunk)) => out.push(chunk),
                Ok(None) => tracing::debug!(chunk_id = %id, "Dropping unresolvable chunk id"),
                Err(err) => tracing::warn!(chunk_id = %id, error = %err, "Dropping unreadable chunk"),
            }
        }
        Ok(out)
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        list_ids(self.blobs.as_ref(), store::CHUNKS)
    }

    /// Remove a chunk. Indexes still listing its id simply stop resolving it.
    pub fn delete(&self, chunk_id: &str) -> Result<bool> {
        self.blobs.delete(store::CHUNKS, &blob_key(chunk_id))
    }

    pub fn filter<F>(&self, predicate: F) -> Result<Vec<ChunkRecord>>
    where
        F: Fn(&ChunkRecord) -> bool,
    {
        let ids = self.list_ids()?;
        let mut chunks = self.load_many(&ids)?;
        chunks.retain(|chunk| predicate(chunk));
        Ok(chunks)
    }

    /// Chunks of one document ordered by position.
    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let mut chunks = self.filter(|chunk| chunk.document_id == document_id)?;
        chunks.sort_by_key(|chunk| chunk.position);
        Ok(chunks)
    }

    /// Record that each chunk is now part of `index_id`.
    ///
    /// The load-insert-save of each chunk runs under the bind lock so two
    /// concurrent index builds never drop each other's id.
    pub fn bind_index(&self, chunk_ids: &[String], index_id: &str) -> Result<()> {
        let _bind = self
            .bind_lock
            .lock()
            .map_err(|_| Error::persistence("chunk bind lock poisoned"))?;
        for id in chunk_ids {
            if let Some(mut chunk) = self.load(id)? {
                if chunk.index_ids.insert(index_id.to_string()) {
                    self.save(&chunk)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBlobStore;
    use chrono::Utc;

    fn stores() -> (Arc<InMemoryBlobStore>, DocumentStore, ChunkStore) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        (
            blobs.clone(),
            DocumentStore::new(blobs.clone()),
            ChunkStore::new(blobs),
        )
    }

    #[test]
    fn test_document_save_load_and_hash_lookup() {
        let (_, docs, _) = stores();
        let doc = DocumentRecord {
            document_id: "d1".to_string(),
            source: "notes.md".to_string(),
            title: None,
            content: "body".to_string(),
            content_hash: "h1".to_string(),
            created_at: Utc::now(),
        };
        docs.save(&doc).unwrap();
        assert_eq!(docs.load("d1").unwrap(), Some(doc.clone()));
        assert_eq!(docs.list_ids().unwrap(), vec!["d1"]);
        assert_eq!(docs.find_by_hash("h1").unwrap(), Some(doc));
        assert_eq!(docs.find_by_hash("h2").unwrap(), None);
    }

    #[test]
    fn test_load_many_drops_missing_keeps_duplicates() {
        let (blobs, _, chunks) = stores();
        let a = ChunkRecord::new("d1", "alpha", 0);
        chunks.save(&a).unwrap();
        blobs.put(store::CHUNKS, "broken.json", b"{").unwrap();

        let ids = vec![
            a.chunk_id.clone(),
            "missing".to_string(),
            "broken".to_string(),
            a.chunk_id.clone(),
        ];
        let loaded = chunks.load_many(&ids).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|c| c.chunk_id == a.chunk_id));
    }

    #[test]
    fn test_chunks_for_document_sorted_by_position() {
        let (_, _, chunks) = stores();
        chunks
            .save_many(&[
                ChunkRecord::new("d1", "second", 1),
                ChunkRecord::new("d2", "other", 0),
                ChunkRecord::new("d1", "first", 0),
            ])
            .unwrap();
        let got: Vec<String> = chunks
            .chunks_for_document("d1")
            .unwrap()
            .into_iter()
            .map(|c| c.content)
            .collect();
        assert_eq!(got, vec!["first", "second"]);
    }

    #[test]
    fn test_bind_index_grows_index_ids() {
        let (_, _, chunks) = stores();
        let chunk = ChunkRecord::new("d1", "alpha", 0);
        chunks.save(&chunk).unwrap();
        let ids = vec![chunk.chunk_id.clone()];

        chunks.bind_index(&ids, "idx-a").unwrap();
        chunks.bind_index(&ids, "idx-b").unwrap();
        chunks.bind_index(&ids, "idx-a").unwrap();

        let loaded = chunks.load(&chunk.chunk_id).unwrap().unwrap();
        assert_eq!(
            loaded.index_ids.into_iter().collect::<Vec<_>>(),
            vec!["idx-a", "idx-b"]
        );
    }

    #[test]
    fn test_concurrent_binds_keep_every_index() {
        let (_, _, chunks) = stores();
        let chunk = ChunkRecord::new("d1", "alpha", 0);
        chunks.save(&chunk).unwrap();
        let ids = vec![chunk.chunk_id.clone()];

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let chunks = chunks.clone();
                let ids = ids.clone();
                std::thread::spawn(move || chunks.bind_index(&ids, &format!("idx-{i}")).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let loaded = chunks.load(&chunk.chunk_id).unwrap().unwrap();
        assert_eq!(loaded.index_ids.len(), 8);
    }

    #[test]
    fn test_delete_chunk() {
        let (_, _, chunks) = stores();
        let chunk = ChunkRecord::new("d1", "alpha", 0);
        chunks.save(&chunk).unwrap();
        assert!(chunks.delete(&chunk.chunk_id).unwrap());
        assert!(!chunks.delete(&chunk.chunk_id).unwrap());
        assert!(chunks.load_many(&[chunk.chunk_id]).unwrap().is_empty());
    }
}
