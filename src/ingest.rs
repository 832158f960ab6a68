//! Ingestion of local text files into the knowledge base.
//!
//! ```text
//! path ─▶ scan (walkdir + globset) ─▶ DocumentStore (skip unchanged)
//!                                        │
//!                                        ▼
//!        IndexRegistry::build_index ◀─ chunk_text + ChunkStore
//!                 │
//!                 ▼
//!        invalidate cache entries answered from indexes of changed documents
//! ```
//!
//! A document's id derives from its source path, so re-ingesting an edited
//! file replaces its chunks instead of adding a second copy.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ragloop_core::chunk::{chunk_text, content_hash};
use ragloop_core::models::{ChunkRecord, DocumentRecord};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::service::RagService;

const INCLUDE_GLOBS: [&str; 2] = ["**/*.md", "**/*.txt"];
const EXCLUDE_GLOBS: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// One text file found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    /// Path relative to the scanned root (the file name for a single file).
    pub source: String,
    pub title: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub files_scanned: usize,
    pub documents_added: usize,
    pub documents_updated: usize,
    pub documents_unchanged: usize,
    pub chunks_written: usize,
    pub index_id: Option<String>,
    pub cache_entries_invalidated: usize,
}

/// Collect the text files under `path`, sorted by source for determinism.
pub fn scan_path(path: &Path) -> Result<Vec<SourceFile>> {
    if !path.exists() {
        bail!("Ingest path does not exist: {}", path.display());
    }
    if path.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        return Ok(vec![read_source(path, &name)?]);
    }

    let include_set = build_globset(&INCLUDE_GLOBS)?;
    let exclude_set = build_globset(&EXCLUDE_GLOBS)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_path = entry.path();
        let relative = file_path.strip_prefix(path).unwrap_or(file_path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(read_source(file_path, &rel_str)?);
    }

    files.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(files)
}

fn read_source(path: &Path, source: &str) -> Result<SourceFile> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let title = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string());
    Ok(SourceFile {
        source: source.to_string(),
        title,
        body,
    })
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Stable document id for a source path.
pub fn document_id_for(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("doc-{hex}")
}

/// Ingest every file under `path` into a single new index with `role`.
pub async fn ingest_path(
    service: &RagService,
    path: &Path,
    role: &str,
    summary: Option<String>,
) -> Result<IngestReport> {
    let files = scan_path(path)?;
    ingest_sources(service, files, role, summary).await
}

pub async fn ingest_sources(
    service: &RagService,
    files: Vec<SourceFile>,
    role: &str,
    summary: Option<String>,
) -> Result<IngestReport> {
    let max_tokens = service.config().chunking.max_tokens;
    let mut report = IngestReport {
        files_scanned: files.len(),
        ..Default::default()
    };
    let mut new_chunks: Vec<ChunkRecord> = Vec::new();
    let mut affected_indexes: BTreeSet<String> = BTreeSet::new();

    for file in files {
        if file.body.trim().is_empty() {
            tracing::debug!(source = %file.source, "Skipping empty file");
            continue;
        }
        let document_id = document_id_for(&file.source);
        let hash = content_hash(&file.body);

        match service.documents().load(&document_id)? {
            Some(existing) if existing.content_hash == hash => {
                report.documents_unchanged += 1;
                continue;
            }
            Some(_) => {
                for chunk in service.chunks().chunks_for_document(&document_id)? {
                    service.chunks().delete(&chunk.chunk_id)?;
                }
                for meta in service.registry().for_document(&document_id)? {
                    affected_indexes.insert(meta.index_id);
                }
                report.documents_updated += 1;
            }
            None => report.documents_added += 1,
        }

        service.documents().save(&DocumentRecord {
            document_id: document_id.clone(),
            source: file.source.clone(),
            title: file.title.clone(),
            content: file.body.clone(),
            content_hash: hash,
            created_at: Utc::now(),
        })?;

        let chunks = chunk_text(&document_id, &file.body, max_tokens);
        service.chunks().save_many(&chunks)?;
        tracing::debug!(source = %file.source, chunks = chunks.len(), "Chunked document");
        new_chunks.extend(chunks);
    }

    report.chunks_written = new_chunks.len();
    if !new_chunks.is_empty() {
        let meta = service
            .registry()
            .build_index(&new_chunks, role, summary, service.embedder().as_ref())
            .await
            .with_context(|| "Failed to build index")?;
        report.index_id = Some(meta.index_id);
    }

    if let Some(manager) = service.cache_manager() {
        for index_id in &affected_indexes {
            report.cache_entries_invalidated += manager.invalidate_by_collection(index_id)?;
        }
    }

    tracing::info!(
        files = report.files_scanned,
        added = report.documents_added,
        updated = report.documents_updated,
        unchanged = report.documents_unchanged,
        chunks = report.chunks_written,
        "Ingest complete"
    );
    Ok(report)
}
