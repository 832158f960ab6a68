//! Knowledge records shared by the indexing, retrieval and learning layers.
//!
//! Records are persisted as JSON blobs, one per entity. Optional fields are
//! defaulted at the deserialization boundary so older blobs keep loading.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source document as ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    /// Where the text came from (file path, URL, ...).
    pub source: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    /// SHA-256 of `content`, used to skip re-ingesting unchanged documents.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A contiguous slice of a document, the atomic unit of retrieval.
///
/// `content` never changes after creation; `index_ids` grows as the chunk is
/// bound to additional indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub index_ids: BTreeSet<String>,
    #[serde(default)]
    pub position: i64,
    /// SHA-256 of `content`.
    #[serde(default)]
    pub hash: String,
}

impl ChunkRecord {
    pub fn new(document_id: &str, content: &str, position: i64) -> Self {
        Self {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            content: content.to_string(),
            index_ids: BTreeSet::new(),
            position,
            hash: crate::chunk::content_hash(content),
        }
    }
}

/// Metadata for one built vector index. Immutable once written: a rebuild
/// produces a new `index_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub index_id: String,
    /// Category tag such as `"definition"`, `"procedure"` or `"general"`.
    pub index_role: String,
    pub embedding_model: String,
    #[serde(default)]
    pub dims: usize,
    /// Chunk ids in vector-insertion order; position `i` is vector `i`.
    pub chunk_ids: Vec<String>,
    #[serde(default)]
    pub document_ids: BTreeSet<String>,
    /// Optional human-written description used for semantic routing.
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IndexMetadata {
    /// Text that stands for this index during embedding-based routing.
    ///
    /// Prefers the explicit summary, then the joined document ids, then the
    /// raw index id.
    pub fn representative_text(&self) -> String {
        if let Some(summary) = self.summary.as_deref() {
            if !summary.trim().is_empty() {
                return summary.to_string();
            }
        }
        if !self.document_ids.is_empty() {
            return self
                .document_ids
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" ");
        }
        self.index_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(summary: Option<&str>, docs: &[&str]) -> IndexMetadata {
        IndexMetadata {
            index_id: "idx-1".to_string(),
            index_role: "general".to_string(),
            embedding_model: "test".to_string(),
            dims: 2,
            chunk_ids: Vec::new(),
            document_ids: docs.iter().map(|d| d.to_string()).collect(),
            summary: summary.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_representative_text_prefers_summary() {
        assert_eq!(
            meta(Some("Kubernetes runbooks"), &["d1"]).representative_text(),
            "Kubernetes runbooks"
        );
    }

    #[test]
    fn test_representative_text_falls_back_to_documents_then_id() {
        assert_eq!(meta(Some("  "), &["d2", "d1"]).representative_text(), "d1 d2");
        assert_eq!(meta(None, &[]).representative_text(), "idx-1");
    }

    #[test]
    fn test_chunk_index_ids_default_to_empty() {
        let raw = r#"{"chunk_id":"c1","document_id":"d1","content":"text"}"#;
        let chunk: ChunkRecord = serde_json::from_str(raw).unwrap();
        assert!(chunk.index_ids.is_empty());
        assert_eq!(chunk.position, 0);
    }
}
