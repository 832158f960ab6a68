//! In-memory [`BlobStore`] implementation for tests and ephemeral runs.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock`, so `list` is naturally
//! sorted and every `put` is atomic.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

use super::BlobStore;

/// In-memory blob store.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of blobs across all namespaces.
    pub fn len(&self) -> Result<usize> {
        Ok(self.blobs.read().map_err(|_| poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn poisoned() -> Error {
    Error::persistence("in-memory blob store lock poisoned")
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.insert((namespace.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        Ok(blobs
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}
