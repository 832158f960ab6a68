//! File-backed [`BlobStore`]: one directory per namespace, one file per key.
//!
//! Writes go to a uniquely named temporary file in the same directory and
//! are then renamed over the target, so readers observe either the old or
//! the new bytes.

use ragloop_core::store::{self, BlobStore};
use ragloop_core::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Every namespace the pipeline writes to.
pub const NAMESPACES: [&str; 7] = [
    store::DOCUMENTS,
    store::CHUNKS,
    store::INDEXES,
    store::STATE,
    store::EVALUATIONS,
    store::FEEDBACK,
    store::CACHE,
];

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        store.init()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and every namespace directory.
    pub fn init(&self) -> Result<()> {
        for namespace in NAMESPACES {
            std::fs::create_dir_all(self.root.join(namespace)).map_err(|e| {
                Error::persistence(format!(
                    "Failed to create {}: {e}",
                    self.root.join(namespace).display()
                ))
            })?;
        }
        Ok(())
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf> {
        check_component(namespace)?;
        check_component(key)?;
        Ok(self.root.join(namespace).join(key))
    }
}

fn check_component(part: &str) -> Result<()> {
    if part.is_empty()
        || part == "."
        || part == ".."
        || part.contains('/')
        || part.contains('\\')
        || part.ends_with(TEMP_SUFFIX)
    {
        return Err(Error::validation(format!("Invalid blob path component '{part}'")));
    }
    Ok(())
}

impl BlobStore for FileBlobStore {
    fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path(namespace, key)?;
        let dir = self.root.join(namespace);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::persistence(format!("Failed to create {}: {e}", dir.display())))?;

        let tmp = dir.join(format!(".{key}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, bytes)
            .map_err(|e| Error::persistence(format!("Failed to write {}: {e}", tmp.display())))?;
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::persistence(format!(
                "Failed to move blob into {}: {e}",
                target.display()
            )));
        }
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(namespace, key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::persistence(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.path(namespace, key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::persistence(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>> {
        check_component(namespace)?;
        let dir = self.root.join(namespace);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "Failed to list {}: {e}",
                    dir.display()
                )))
            }
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }
}
