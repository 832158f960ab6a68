//! Automatic evaluation of a generated answer.
//!
//! The [`Evaluator`] scores an answer against the chunks it was generated
//! from and aggregates chunk scores per document and per index. The output
//! is exactly what [`StateStore::apply_evaluation`](crate::state::StateStore::apply_evaluation)
//! consumes.
//!
//! | Level | Field | Value |
//! |-------|-------|-------|
//! | answer | `relevance` | cos(question, answer) |
//! | answer | `groundedness` | max over chunks of cos(answer, chunk) |
//! | answer | `answerability` | min(1, chunks / 5) |
//! | chunk | `relevance` | cos(question, chunk) |
//! | chunk | `groundedness` | cos(answer, chunk) |
//! | document | `relevance`, `answerability` | means of chunk relevance, groundedness |
//! | index | `avg_relevance`, `avg_groundedness` | means over the index's chunks |
//!
//! The literal [`FALLBACK_ANSWER`] forces answer-level relevance and
//! groundedness to `1.0`: declining to answer is correct behaviour. Every
//! score is rounded to three decimals.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, round_score, Embedder};
use crate::error::{Error, Result};
use crate::models::ChunkRecord;

pub const FALLBACK_ANSWER: &str = "I do not know.";

/// Chunk count at which answerability saturates at `1.0`.
pub const ANSWERABILITY_SATURATION: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub relevance: f64,
    pub groundedness: f64,
    pub answerability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEvaluation {
    pub chunk_id: String,
    pub document_id: String,
    #[serde(default)]
    pub index_ids: BTreeSet<String>,
    pub relevance: f64,
    pub groundedness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvaluation {
    pub document_id: String,
    pub relevance: f64,
    /// Mean chunk groundedness, named after the document-level state field.
    pub answerability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEvaluation {
    pub index_id: String,
    pub used_chunks: Vec<String>,
    pub avg_relevance: f64,
    pub avg_groundedness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluation_id: String,
    pub question: String,
    pub answer: String,
    pub metrics: EvaluationMetrics,
    pub chunks: Vec<ChunkEvaluation>,
    pub documents: Vec<DocumentEvaluation>,
    pub indexes: Vec<IndexEvaluation>,
    pub created_at: DateTime<Utc>,
}

pub fn is_fallback_answer(answer: &str) -> bool {
    answer.trim() == FALLBACK_ANSWER
}

/// `min(1, chunk_count / 5)`, `0.0` for no chunks.
pub fn answerability(chunk_count: usize) -> f64 {
    round_score((chunk_count as f64 / ANSWERABILITY_SATURATION as f64).min(1.0))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Group chunk scores by document, sorted by document id.
pub fn aggregate_documents(chunks: &[ChunkEvaluation]) -> Vec<DocumentEvaluation> {
    let mut grouped: BTreeMap<&str, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for chunk in chunks {
        let entry = grouped.entry(chunk.document_id.as_str()).or_default();
        entry.0.push(chunk.relevance);
        entry.1.push(chunk.groundedness);
    }
    grouped
        .into_iter()
        .map(|(document_id, (relevance, groundedness))| DocumentEvaluation {
            document_id: document_id.to_string(),
            relevance: round_score(mean(&relevance)),
            answerability: round_score(mean(&groundedness)),
        })
        .collect()
}

/// Group chunk scores by every index each chunk belongs to.
pub fn aggregate_indexes(chunks: &[ChunkEvaluation]) -> Vec<IndexEvaluation> {
    let mut grouped: BTreeMap<&str, (Vec<String>, Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for chunk in chunks {
        for index_id in &chunk.index_ids {
            let entry = grouped.entry(index_id.as_str()).or_default();
            entry.0.push(chunk.chunk_id.clone());
            entry.1.push(chunk.relevance);
            entry.2.push(chunk.groundedness);
        }
    }
    grouped
        .into_iter()
        .map(|(index_id, (used_chunks, relevance, groundedness))| IndexEvaluation {
            index_id: index_id.to_string(),
            used_chunks,
            avg_relevance: round_score(mean(&relevance)),
            avg_groundedness: round_score(mean(&groundedness)),
        })
        .collect()
}

pub struct Evaluator {
    embedder: Arc<dyn Embedder>,
}

impl Evaluator {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    /// Score `answer` for `question` given the chunks used to produce it.
    /// Embeds everything in a single batch.
    pub async fn evaluate(
        &self,
        question: &str,
        answer: &str,
        chunks: &[ChunkRecord],
    ) -> Result<EvaluationResult> {
        let mut texts = Vec::with_capacity(chunks.len() + 2);
        texts.push(question.to_string());
        texts.push(answer.to_string());
        texts.extend(chunks.iter().map(|c| c.content.clone()));
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(Error::provider(format!(
                "Embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        let question_vec = &vectors[0];
        let answer_vec = &vectors[1];

        let chunk_evals: Vec<ChunkEvaluation> = chunks
            .iter()
            .zip(&vectors[2..])
            .map(|(chunk, vec)| ChunkEvaluation {
                chunk_id: chunk.chunk_id.clone(),
                document_id: chunk.document_id.clone(),
                index_ids: chunk.index_ids.clone(),
                relevance: round_score(cosine_similarity(question_vec, vec) as f64),
                groundedness: round_score(cosine_similarity(answer_vec, vec) as f64),
            })
            .collect();

        let fallback = is_fallback_answer(answer);
        let metrics = EvaluationMetrics {
            relevance: if fallback {
                1.0
            } else {
                round_score(cosine_similarity(question_vec, answer_vec) as f64)
            },
            groundedness: if fallback {
                1.0
            } else {
                chunk_evals
                    .iter()
                    .map(|c| c.groundedness)
                    .reduce(f64::max)
                    .unwrap_or(0.0)
            },
            answerability: answerability(chunks.len()),
        };

        let result = EvaluationResult {
            evaluation_id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            metrics,
            documents: aggregate_documents(&chunk_evals),
            indexes: aggregate_indexes(&chunk_evals),
            chunks: chunk_evals,
            created_at: Utc::now(),
        };
        tracing::debug!(
            evaluation_id = %result.evaluation_id,
            relevance = metrics.relevance,
            groundedness = metrics.groundedness,
            answerability = metrics.answerability,
            "Evaluated answer"
        );
        Ok(result)
    }
}
