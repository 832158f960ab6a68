//! Registry of built vector indexes.
//!
//! Each index is persisted as two blobs under [`store::INDEXES`]:
//! `<index_id>.meta.json` ([`IndexMetadata`]) and `<index_id>.vectors`
//! (the serialized [`VectorIndex`]). The registry scans metadata at open
//! time and loads vector blobs lazily on the first search against an index.
//!
//! A metadata blob that cannot be read during a scan is skipped with a
//! warning; the scan continues. Searching an index that is not registered,
//! or whose vector blob is gone, is a [`Error::NotFound`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::index::{VectorIndex, VectorIndexFactory};
use crate::knowledge::ChunkStore;
use crate::models::{ChunkRecord, IndexMetadata};
use crate::store::{self, BlobStore};

const META_SUFFIX: &str = ".meta.json";
const VECTORS_SUFFIX: &str = ".vectors";

/// One search hit: chunk id and squared-L2 distance.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub chunk_id: String,
    pub distance: f32,
}

pub struct IndexRegistry {
    blobs: Arc<dyn BlobStore>,
    factory: Arc<dyn VectorIndexFactory>,
    chunks: ChunkStore,
    metadata: RwLock<BTreeMap<String, IndexMetadata>>,
    loaded: RwLock<HashMap<String, Arc<dyn VectorIndex>>>,
}

impl IndexRegistry {
    pub fn open(blobs: Arc<dyn BlobStore>, factory: Arc<dyn VectorIndexFactory>) -> Result<Self> {
        let registry = Self {
            chunks: ChunkStore::new(blobs.clone()),
            blobs,
            factory,
            metadata: RwLock::new(BTreeMap::new()),
            loaded: RwLock::new(HashMap::new()),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Rescan metadata blobs and drop every loaded vector index.
    ///
    /// Returns the number of indexes registered after the scan.
    pub fn reload(&self) -> Result<usize> {
        let mut found = BTreeMap::new();
        for key in self.blobs.list(store::INDEXES)? {
            let Some(expected_id) = key.strip_suffix(META_SUFFIX) else {
                continue;
            };
            match store::get_json::<IndexMetadata>(self.blobs.as_ref(), store::INDEXES, &key) {
                Ok(Some(meta)) if meta.index_id == expected_id => {
                    found.insert(meta.index_id.clone(), meta);
                }
                Ok(Some(meta)) => tracing::warn!(
                    key = %key,
                    index_id = %meta.index_id,
                    "Skipping index metadata stored under a mismatched key"
                ),
                Ok(None) => {}
                Err(err) => tracing::warn!(key = %key, error = %err, "Skipping unreadable index metadata"),
            }
        }
        let count = found.len();
        *self.metadata.write().map_err(|_| poisoned())? = found;
        self.loaded.write().map_err(|_| poisoned())?.clear();
        tracing::debug!(indexes = count, "Index registry scanned");
        Ok(count)
    }

    /// All registered indexes, oldest first.
    pub fn list(&self) -> Result<Vec<IndexMetadata>> {
        let mut all: Vec<IndexMetadata> = self
            .metadata
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.index_id.cmp(&b.index_id))
        });
        Ok(all)
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self.list()?.into_iter().map(|m| m.index_id).collect())
    }

    pub fn get(&self, index_id: &str) -> Result<Option<IndexMetadata>> {
        Ok(self
            .metadata
            .read()
            .map_err(|_| poisoned())?
            .get(index_id)
            .cloned())
    }

    pub fn by_role(&self, role: &str) -> Result<Vec<IndexMetadata>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.index_role == role)
            .collect())
    }

    pub fn ids_for_role(&self, role: &str) -> Result<Vec<String>> {
        Ok(self.by_role(role)?.into_iter().map(|m| m.index_id).collect())
    }

    /// Indexes containing at least one chunk of `document_id`.
    pub fn for_document(&self, document_id: &str) -> Result<Vec<IndexMetadata>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.document_ids.contains(document_id))
            .collect())
    }

    /// Persist a built index and make it searchable. The vector blob is
    /// written before the metadata so a registered index always has vectors.
    pub fn register(&self, meta: IndexMetadata, index: Box<dyn VectorIndex>) -> Result<()> {
        if index.size() != meta.chunk_ids.len() {
            return Err(Error::validation(format!(
                "Index {} holds {} vectors for {} chunk ids",
                meta.index_id,
                index.size(),
                meta.chunk_ids.len()
            )));
        }
        self.blobs.put(
            store::INDEXES,
            &format!("{}{VECTORS_SUFFIX}", meta.index_id),
            &index.to_bytes(),
        )?;
        store::put_json(
            self.blobs.as_ref(),
            store::INDEXES,
            &format!("{}{META_SUFFIX}", meta.index_id),
            &meta,
        )?;
        let index_id = meta.index_id.clone();
        self.metadata
            .write()
            .map_err(|_| poisoned())?
            .insert(index_id.clone(), meta);
        self.loaded
            .write()
            .map_err(|_| poisoned())?
            .insert(index_id, Arc::from(index));
        Ok(())
    }

    /// Embed `chunks`, build a new index with a fresh id, persist and
    /// register it, then bind the id into every chunk's `index_ids`.
    pub async fn build_index(
        &self,
        chunks: &[ChunkRecord],
        role: &str,
        summary: Option<String>,
        embedder: &dyn Embedder,
    ) -> Result<IndexMetadata> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&texts).await?
        };
        if vectors.len() != chunks.len() {
            return Err(Error::provider(format!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        let dims = vectors.first().map(Vec::len).unwrap_or_else(|| embedder.dims());
        let mut index = self.factory.create(dims);
        index.add(&vectors)?;

        let meta = IndexMetadata {
            index_id: uuid::Uuid::new_v4().to_string(),
            index_role: role.to_string(),
            embedding_model: embedder.model_name().to_string(),
            dims,
            chunk_ids: chunks.iter().map(|c| c.chunk_id.clone()).collect(),
            document_ids: chunks.iter().map(|c| c.document_id.clone()).collect(),
            summary,
            created_at: Utc::now(),
        };
        self.register(meta.clone(), index)?;
        self.chunks.bind_index(&meta.chunk_ids, &meta.index_id)?;

        tracing::info!(
            index_id = %meta.index_id,
            role = %meta.index_role,
            chunks = meta.chunk_ids.len(),
            "Built index"
        );
        Ok(meta)
    }

    fn vector_index(&self, index_id: &str) -> Result<Arc<dyn VectorIndex>> {
        if let Some(index) = self.loaded.read().map_err(|_| poisoned())?.get(index_id) {
            return Ok(index.clone());
        }
        let bytes = self
            .blobs
            .get(store::INDEXES, &format!("{index_id}{VECTORS_SUFFIX}"))?
            .ok_or_else(|| Error::not_found(format!("Vector data for index {index_id}")))?;
        let index: Arc<dyn VectorIndex> = Arc::from(self.factory.load(&bytes)?);
        tracing::debug!(index_id, vectors = index.size(), "Loaded vector index");
        self.loaded
            .write()
            .map_err(|_| poisoned())?
            .insert(index_id.to_string(), index.clone());
        Ok(index)
    }

    /// Nearest chunks of one index, closest first.
    pub fn search(&self, index_id: &str, query: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        let meta = self
            .get(index_id)?
            .ok_or_else(|| Error::not_found(format!("Index {index_id}")))?;
        let index = self.vector_index(index_id)?;
        let (positions, distances) = index.search(query, k)?;

        Ok(positions
            .into_iter()
            .zip(distances)
            .filter_map(|(pos, distance)| {
                meta.chunk_ids.get(pos).map(|chunk_id| IndexHit {
                    chunk_id: chunk_id.clone(),
                    distance,
                })
            })
            .collect())
    }
}

fn poisoned() -> Error {
    Error::persistence("index registry lock poisoned")
}
