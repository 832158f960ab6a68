//! State-weighted reranking.
//!
//! # Scoring
//!
//! ```text
//! score = cos(query, chunk)
//!       × chunk_weight
//!       × document_weight
//!       × mean(index priors)        (1.0 when the chunk has no index)
//!       + Σ adjustments
//! ```
//!
//! Priors are averaged, never multiplied, so a chunk bound to many indexes
//! is not pushed down by compounding. Optional [`ScoreAdjustment`]s add small
//! nudges on top of the primary score before sorting.
//!
//! Reading weights goes through [`StateStore::get_weight`], which creates
//! default state for chunks, documents and indexes seen for the first time.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Error, Result};
use crate::models::ChunkRecord;
use crate::state::StateStore;

/// Per-factor breakdown of a reranked score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankExplanation {
    pub similarity: f32,
    pub chunk_weight: f64,
    pub document_weight: f64,
    pub index_prior: f64,
    pub adjustment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub chunk: ChunkRecord,
    pub score: f64,
    pub explanation: RerankExplanation,
}

/// Additive score nudge applied after the weighted similarity.
pub trait ScoreAdjustment: Send + Sync {
    fn name(&self) -> &str;

    fn adjust(&self, query: &str, chunk: &ChunkRecord) -> f64;
}

/// Bonus for definition questions whose subject appears in the chunk's
/// leading sentence, penalty for manual / installation jargon.
pub struct HeuristicAdjustment {
    definition: Regex,
    jargon: Regex,
    bonus: f64,
    penalty: f64,
}

impl HeuristicAdjustment {
    pub const DEFAULT_NUDGE: f64 = 0.1;

    pub fn new() -> Result<Self> {
        Self::with_nudges(Self::DEFAULT_NUDGE, Self::DEFAULT_NUDGE)
    }

    pub fn with_nudges(bonus: f64, penalty: f64) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::configuration(format!("Invalid heuristic pattern: {e}")))
        };
        Ok(Self {
            definition: compile(r"(?i)^(what is|who is|define)\b")?,
            jargon: compile(r"(?i)\b(install(ation)?|click|menu|toolbar|wizard|settings|press|select)\b")?,
            bonus,
            penalty,
        })
    }

    fn subject(query: &str) -> Option<String> {
        query
            .split_whitespace()
            .last()
            .map(|token| {
                token
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|token| !token.is_empty())
    }

    fn leading_sentence(text: &str) -> String {
        let end = text
            .find(|c: char| matches!(c, '.' | '!' | '?' | '\n'))
            .unwrap_or(text.len());
        text[..end].to_lowercase()
    }
}

impl ScoreAdjustment for HeuristicAdjustment {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn adjust(&self, query: &str, chunk: &ChunkRecord) -> f64 {
        let query = query.trim();
        let mut delta = 0.0;
        if self.definition.is_match(query) {
            if let Some(subject) = Self::subject(query) {
                if Self::leading_sentence(&chunk.content).contains(&subject) {
                    delta += self.bonus;
                }
            }
        }
        if self.jargon.is_match(&chunk.content) {
            delta -= self.penalty;
        }
        delta
    }
}

pub struct Reranker {
    embedder: Arc<dyn Embedder>,
    state: Arc<StateStore>,
    dedup_chunks: bool,
    adjustments: Vec<Arc<dyn ScoreAdjustment>>,
}

impl Reranker {
    pub fn new(embedder: Arc<dyn Embedder>, state: Arc<StateStore>) -> Self {
        Self {
            embedder,
            state,
            dedup_chunks: true,
            adjustments: Vec::new(),
        }
    }

    /// Keep only the best-scoring copy of a chunk recalled more than once.
    pub fn dedup_chunks(mut self, enabled: bool) -> Self {
        self.dedup_chunks = enabled;
        self
    }

    pub fn with_adjustment(mut self, adjustment: Arc<dyn ScoreAdjustment>) -> Self {
        self.adjustments.push(adjustment);
        self
    }

    fn index_prior(&self, chunk: &ChunkRecord) -> Result<f64> {
        if chunk.index_ids.is_empty() {
            return Ok(1.0);
        }
        let mut sum = 0.0;
        for index_id in &chunk.index_ids {
            sum += self.state.index_prior(index_id)?;
        }
        Ok(sum / chunk.index_ids.len() as f64)
    }

    /// Score, sort (stable, descending) and truncate to `top_k`.
    pub async fn rerank(
        &self,
        query: &str,
        chunks: Vec<ChunkRecord>,
        top_k: usize,
    ) -> Result<Vec<RankedChunk>> {
        if chunks.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut texts = Vec::with_capacity(chunks.len() + 1);
        texts.push(query.to_string());
        texts.extend(chunks.iter().map(|c| c.content.clone()));
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(Error::provider(format!(
                "Embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        let (query_vec, chunk_vecs) = vectors.split_at(1);

        let mut ranked = Vec::with_capacity(chunks.len());
        for (chunk, chunk_vec) in chunks.into_iter().zip(chunk_vecs) {
            let similarity = cosine_similarity(&query_vec[0], chunk_vec);
            let chunk_weight = self.state.chunk_weight(&chunk.chunk_id)?;
            let document_weight = self.state.document_weight(&chunk.document_id)?;
            let index_prior = self.index_prior(&chunk)?;
            let adjustment: f64 = self
                .adjustments
                .iter()
                .map(|a| a.adjust(query, &chunk))
                .sum();
            let score =
                similarity as f64 * chunk_weight * document_weight * index_prior + adjustment;
            ranked.push(RankedChunk {
                chunk,
                score,
                explanation: RerankExplanation {
                    similarity,
                    chunk_weight,
                    document_weight,
                    index_prior,
                    adjustment,
                },
            });
        }

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        if self.dedup_chunks {
            let mut seen = HashSet::new();
            ranked.retain(|r| seen.insert(r.chunk.chunk_id.clone()));
        }
        ranked.truncate(top_k);

        tracing::debug!(
            kept = ranked.len(),
            top_score = ranked.first().map(|r| r.score),
            "Reranked candidates"
        );
        Ok(ranked)
    }
}
