//! Persistent learning state for documents, chunks and indexes.
//!
//! The [`StateStore`] is the only component that reads or mutates learning
//! state. Each entity carries running averages of the evaluation signals it
//! has received plus a derived weight (called `prior` for indexes):
//!
//! ```text
//! new_avg = (old_avg × count + value) / (count + 1)
//! weight  = 0.5 × metric_a + 0.5 × metric_b
//! ```
//!
//! # Lazy creation on read
//!
//! [`StateStore::get_weight`] and its typed shorthands create a default
//! entry (weight `1.0`, scores `0.0`, counts `0`) for an id they have never
//! seen. Reading state for an unseen id is therefore a mutation: the id will
//! show up in [`StateStore::list`] and in the next persisted snapshot. Use
//! [`StateStore::peek`] for a side-effect-free read.
//!
//! # Concurrency
//!
//! All three tables live behind one mutex, so a full evaluation is applied
//! as a single serialized step and running averages observe updates in the
//! order they were submitted. [`StateStore::save_all`] serializes the tables
//! and writes them as one blob while holding a separate persist lock taken
//! before the snapshot, so a newer snapshot is never overwritten by an older
//! one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::evaluation::EvaluationResult;
use crate::store::{self, BlobStore};

/// Blob key of the learning-state snapshot inside [`store::STATE`].
pub const STATE_KEY: &str = "learning_state.json";

/// Multiplier applied to every weight on negative human feedback.
pub const NEGATIVE_DECAY: f64 = 0.98;
/// Multiplier applied to every weight on positive human feedback.
pub const POSITIVE_DECAY: f64 = 1.02;
/// Negative feedback never pushes a weight below this value.
pub const WEIGHT_FLOOR: f64 = 0.01;
/// Positive feedback never pushes a weight above this value.
pub const WEIGHT_CEILING: f64 = 2.0;

/// Which table an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Document,
    Chunk,
    Index,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Document => "document",
            EntityKind::Chunk => "chunk",
            EntityKind::Index => "index",
        })
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "document" | "documents" => Ok(EntityKind::Document),
            "chunk" | "chunks" => Ok(EntityKind::Chunk),
            "index" | "indexes" => Ok(EntityKind::Index),
            other => Err(Error::validation(format!(
                "Unknown entity kind '{other}'. Use document, chunk or index."
            ))),
        }
    }
}

/// Learning record for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub relevance_score: f64,
    pub relevance_count: u64,
    pub answerability_score: f64,
    pub answerability_count: u64,
    pub usage_count: u64,
    pub weight: f64,
    pub last_updated: DateTime<Utc>,
}

/// Learning record for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkState {
    pub relevance_score: f64,
    pub relevance_count: u64,
    pub groundedness_score: f64,
    pub groundedness_count: u64,
    pub usage_count: u64,
    pub weight: f64,
    pub last_updated: DateTime<Utc>,
}

/// Learning record for one index. Both averages advance together, so
/// `relevance_count` is also the groundedness sample count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexState {
    pub avg_relevance: f64,
    pub avg_groundedness: f64,
    pub relevance_count: u64,
    pub usage_count: u64,
    pub prior: f64,
    pub last_updated: DateTime<Utc>,
}

impl DocumentState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            relevance_score: 0.0,
            relevance_count: 0,
            answerability_score: 0.0,
            answerability_count: 0,
            usage_count: 0,
            weight: 1.0,
            last_updated: now,
        }
    }

    fn observe(&mut self, relevance: f64, answerability: f64, now: DateTime<Utc>) {
        self.relevance_score = running_average(self.relevance_score, self.relevance_count, relevance);
        self.relevance_count += 1;
        self.answerability_score =
            running_average(self.answerability_score, self.answerability_count, answerability);
        self.answerability_count += 1;
        self.usage_count += 1;
        self.weight = derived_weight(self.relevance_score, self.answerability_score);
        self.last_updated = now;
    }
}

impl ChunkState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            relevance_score: 0.0,
            relevance_count: 0,
            groundedness_score: 0.0,
            groundedness_count: 0,
            usage_count: 0,
            weight: 1.0,
            last_updated: now,
        }
    }

    fn observe(&mut self, relevance: f64, groundedness: f64, now: DateTime<Utc>) {
        self.relevance_score = running_average(self.relevance_score, self.relevance_count, relevance);
        self.relevance_count += 1;
        self.groundedness_score =
            running_average(self.groundedness_score, self.groundedness_count, groundedness);
        self.groundedness_count += 1;
        self.usage_count += 1;
        self.weight = derived_weight(self.relevance_score, self.groundedness_score);
        self.last_updated = now;
    }
}

impl IndexState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            avg_relevance: 0.0,
            avg_groundedness: 0.0,
            relevance_count: 0,
            usage_count: 0,
            prior: 1.0,
            last_updated: now,
        }
    }

    fn observe(&mut self, relevance: f64, groundedness: f64, now: DateTime<Utc>) {
        self.avg_relevance = running_average(self.avg_relevance, self.relevance_count, relevance);
        self.avg_groundedness =
            running_average(self.avg_groundedness, self.relevance_count, groundedness);
        self.relevance_count += 1;
        self.usage_count += 1;
        self.prior = derived_weight(self.avg_relevance, self.avg_groundedness);
        self.last_updated = now;
    }
}

/// The three state tables, persisted together as one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningTables {
    /// Incremented on every [`StateStore::save_all`].
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub document_state: BTreeMap<String, DocumentState>,
    #[serde(default)]
    pub chunk_state: BTreeMap<String, ChunkState>,
    #[serde(default)]
    pub index_state: BTreeMap<String, IndexState>,
}

impl LearningTables {
    fn weight_of(&self, kind: EntityKind, id: &str) -> Option<f64> {
        match kind {
            EntityKind::Document => self.document_state.get(id).map(|s| s.weight),
            EntityKind::Chunk => self.chunk_state.get(id).map(|s| s.weight),
            EntityKind::Index => self.index_state.get(id).map(|s| s.prior),
        }
    }

    fn ensure(&mut self, kind: EntityKind, id: &str, now: DateTime<Utc>) -> f64 {
        match kind {
            EntityKind::Document => {
                self.document_state
                    .entry(id.to_string())
                    .or_insert_with(|| DocumentState::new(now))
                    .weight
            }
            EntityKind::Chunk => {
                self.chunk_state
                    .entry(id.to_string())
                    .or_insert_with(|| ChunkState::new(now))
                    .weight
            }
            EntityKind::Index => {
                self.index_state
                    .entry(id.to_string())
                    .or_insert_with(|| IndexState::new(now))
                    .prior
            }
        }
    }

    fn observe(&mut self, kind: EntityKind, id: &str, relevance: f64, secondary: f64, now: DateTime<Utc>) {
        let relevance = clamp_signal(relevance);
        let secondary = clamp_signal(secondary);
        match kind {
            EntityKind::Document => self
                .document_state
                .entry(id.to_string())
                .or_insert_with(|| DocumentState::new(now))
                .observe(relevance, secondary, now),
            EntityKind::Chunk => self
                .chunk_state
                .entry(id.to_string())
                .or_insert_with(|| ChunkState::new(now))
                .observe(relevance, secondary, now),
            EntityKind::Index => self
                .index_state
                .entry(id.to_string())
                .or_insert_with(|| IndexState::new(now))
                .observe(relevance, secondary, now),
        }
    }
}

/// Owner of all learning state. Construct once per process and share via `Arc`.
pub struct StateStore {
    blobs: Arc<dyn BlobStore>,
    tables: Mutex<LearningTables>,
    persist: Mutex<()>,
}

impl StateStore {
    /// Load the persisted snapshot, or start empty when none exists.
    ///
    /// A snapshot that exists but cannot be parsed is a persistence error:
    /// learning state is never silently discarded.
    pub fn open(blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let tables: LearningTables =
            store::get_json(blobs.as_ref(), store::STATE, STATE_KEY)?.unwrap_or_default();
        tracing::debug!(
            documents = tables.document_state.len(),
            chunks = tables.chunk_state.len(),
            indexes = tables.index_state.len(),
            "Loaded learning state"
        );
        Ok(Self {
            blobs,
            tables: Mutex::new(tables),
            persist: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LearningTables>> {
        self.tables
            .lock()
            .map_err(|_| Error::persistence("learning state lock poisoned"))
    }

    /// Current weight (or prior, for indexes) of an entity.
    ///
    /// Creates a default entry for unseen ids. See the module docs.
    pub fn get_weight(&self, kind: EntityKind, id: &str) -> Result<f64> {
        Ok(self.lock()?.ensure(kind, id, Utc::now()))
    }

    pub fn document_weight(&self, document_id: &str) -> Result<f64> {
        self.get_weight(EntityKind::Document, document_id)
    }

    pub fn chunk_weight(&self, chunk_id: &str) -> Result<f64> {
        self.get_weight(EntityKind::Chunk, chunk_id)
    }

    pub fn index_prior(&self, index_id: &str) -> Result<f64> {
        self.get_weight(EntityKind::Index, index_id)
    }

    /// Weight of an entity without creating it.
    pub fn peek(&self, kind: EntityKind, id: &str) -> Result<Option<f64>> {
        Ok(self.lock()?.weight_of(kind, id))
    }

    /// Apply one running-average step to an entity.
    ///
    /// `secondary` is answerability for documents and groundedness for
    /// chunks and indexes. Signals are clamped to `[0, 1]`. Calling this
    /// twice for the same evaluation counts it twice; the feedback path
    /// guards against that. Does not persist.
    pub fn update(&self, kind: EntityKind, id: &str, relevance: f64, secondary: f64) -> Result<()> {
        self.lock()?.observe(kind, id, relevance, secondary, Utc::now());
        Ok(())
    }

    pub fn update_document(&self, document_id: &str, relevance: f64, answerability: f64) -> Result<()> {
        self.update(EntityKind::Document, document_id, relevance, answerability)
    }

    pub fn update_chunk(&self, chunk_id: &str, relevance: f64, groundedness: f64) -> Result<()> {
        self.update(EntityKind::Chunk, chunk_id, relevance, groundedness)
    }

    pub fn update_index(&self, index_id: &str, avg_relevance: f64, avg_groundedness: f64) -> Result<()> {
        self.update(EntityKind::Index, index_id, avg_relevance, avg_groundedness)
    }

    /// Fold every chunk, document and index aggregate of an evaluation into
    /// state as one serialized step, then persist.
    pub fn apply_evaluation(&self, evaluation: &EvaluationResult) -> Result<()> {
        {
            let mut tables = self.lock()?;
            let now = Utc::now();
            for chunk in &evaluation.chunks {
                tables.observe(EntityKind::Chunk, &chunk.chunk_id, chunk.relevance, chunk.groundedness, now);
            }
            for doc in &evaluation.documents {
                tables.observe(EntityKind::Document, &doc.document_id, doc.relevance, doc.answerability, now);
            }
            for index in &evaluation.indexes {
                tables.observe(
                    EntityKind::Index,
                    &index.index_id,
                    index.avg_relevance,
                    index.avg_groundedness,
                    now,
                );
            }
        }
        tracing::debug!(
            evaluation_id = %evaluation.evaluation_id,
            chunks = evaluation.chunks.len(),
            documents = evaluation.documents.len(),
            indexes = evaluation.indexes.len(),
            "Applied evaluation to learning state"
        );
        self.save_all()
    }

    /// Scale every tracked weight by the human-feedback factor.
    ///
    /// Negative ratings multiply by [`NEGATIVE_DECAY`] without going below
    /// [`WEIGHT_FLOOR`], positive ratings by [`POSITIVE_DECAY`] without going
    /// above [`WEIGHT_CEILING`]. A zero rating is a no-op. Running averages
    /// are untouched. Does not persist.
    pub fn apply_human_decay(&self, rating: i8) -> Result<()> {
        let factor = match rating.signum() {
            -1 => NEGATIVE_DECAY,
            1 => POSITIVE_DECAY,
            _ => return Ok(()),
        };
        let mut tables = self.lock()?;
        let scale = |w: f64| decay_weight(w, factor);
        for state in tables.document_state.values_mut() {
            state.weight = scale(state.weight);
        }
        for state in tables.chunk_state.values_mut() {
            state.weight = scale(state.weight);
        }
        for state in tables.index_state.values_mut() {
            state.prior = scale(state.prior);
        }
        Ok(())
    }

    /// Persist all three tables as one blob.
    pub fn save_all(&self) -> Result<()> {
        let _persist = self
            .persist
            .lock()
            .map_err(|_| Error::persistence("learning state persist lock poisoned"))?;
        let bytes = {
            let mut tables = self.lock()?;
            tables.generation += 1;
            serde_json::to_vec_pretty(&*tables)?
        };
        self.blobs.put(store::STATE, STATE_KEY, &bytes)
    }

    /// Clone of the current tables.
    pub fn snapshot(&self) -> Result<LearningTables> {
        Ok(self.lock()?.clone())
    }

    /// Ids present in one table, sorted.
    pub fn list(&self, kind: EntityKind) -> Result<Vec<String>> {
        let tables = self.lock()?;
        Ok(match kind {
            EntityKind::Document => tables.document_state.keys().cloned().collect(),
            EntityKind::Chunk => tables.chunk_state.keys().cloned().collect(),
            EntityKind::Index => tables.index_state.keys().cloned().collect(),
        })
    }

    pub fn document_state(&self, id: &str) -> Result<Option<DocumentState>> {
        Ok(self.lock()?.document_state.get(id).cloned())
    }

    pub fn chunk_state(&self, id: &str) -> Result<Option<ChunkState>> {
        Ok(self.lock()?.chunk_state.get(id).cloned())
    }

    pub fn index_state(&self, id: &str) -> Result<Option<IndexState>> {
        Ok(self.lock()?.index_state.get(id).cloned())
    }
}

fn running_average(avg: f64, count: u64, value: f64) -> f64 {
    let n = count as f64;
    (avg * n + value) / (n + 1.0)
}

fn derived_weight(a: f64, b: f64) -> f64 {
    0.5 * a + 0.5 * b
}

fn clamp_signal(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn decay_weight(weight: f64, factor: f64) -> f64 {
    let scaled = weight * factor;
    if factor < 1.0 {
        scaled.max(WEIGHT_FLOOR.min(weight))
    } else {
        scaled.min(WEIGHT_CEILING.max(weight))
    }
}
