//! The question-answering loop.
//!
//! [`RagService`] wires the core components together from a [`Config`] and
//! runs one question through:
//!
//! 1. semantic cache lookup (a hit returns the stored answer)
//! 2. routing, retrieval and chunk materialization
//! 3. reranking with learned weights
//! 4. context assembly and generation
//! 5. evaluation, persisted and folded into learning state
//! 6. a feedback shell for the user's rating
//! 7. cache store, tagged with the indexes that produced the answer
//!
//! When nothing is recalled the fallback answer is returned directly: no
//! generation, no evaluation and no learning update.

use anyhow::{Context, Result};
use ragloop_core::analysis::{self, AnalysisReport, PolicyProposal, PolicyThresholds};
use ragloop_core::cache::SemanticCache;
use ragloop_core::context::{ContextBuilder, ContextStrategy};
use ragloop_core::embedding::Embedder;
use ragloop_core::evaluation::{EvaluationMetrics, Evaluator, FALLBACK_ANSWER};
use ragloop_core::feedback::{EvaluationStore, FeedbackOutcome, FeedbackStore};
use ragloop_core::generation::Generator;
use ragloop_core::index::FlatIndexFactory;
use ragloop_core::knowledge::{ChunkStore, DocumentStore};
use ragloop_core::lifecycle::CacheManager;
use ragloop_core::models::ChunkRecord;
use ragloop_core::registry::IndexRegistry;
use ragloop_core::reranker::{HeuristicAdjustment, Reranker};
use ragloop_core::retriever::Retriever;
use ragloop_core::router::{
    CombinedRouter, EmbeddingRouter, IndexRouter, PatternRouter, RouterStrategy,
};
use ragloop_core::state::StateStore;
use ragloop_core::store::BlobStore;
use ragloop_core::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::blob_fs::FileBlobStore;
use crate::config::{self, Config};
use crate::embedding::create_embedder;
use crate::generation::create_generator;

/// A chunk that contributed to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSource {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<AnswerSource>,
    /// Absent when nothing was recalled.
    #[serde(default)]
    pub metrics: Option<EvaluationMetrics>,
    /// Rate the answer with this id. Absent when nothing was recalled.
    #[serde(default)]
    pub feedback_id: Option<String>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_similarity: Option<f32>,
}

impl AskResponse {
    fn fallback(question: &str) -> Self {
        Self {
            question: question.to_string(),
            answer: FALLBACK_ANSWER.to_string(),
            sources: Vec::new(),
            metrics: None,
            feedback_id: None,
            cached: false,
            cache_similarity: None,
        }
    }
}

pub struct RagService {
    config: Config,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    documents: DocumentStore,
    chunks: ChunkStore,
    registry: Arc<IndexRegistry>,
    state: Arc<StateStore>,
    evaluations: EvaluationStore,
    feedback: FeedbackStore,
    cache: Option<CacheManager>,
    router: Arc<dyn IndexRouter>,
    retriever: Retriever,
    reranker: Reranker,
    evaluator: Evaluator,
    context: ContextBuilder,
}

impl RagService {
    /// Open the file-backed store under `storage.root` and build providers
    /// from the configuration.
    pub fn open(config: Config) -> Result<Self> {
        let blobs = FileBlobStore::open(&config.storage.root).with_context(|| {
            format!(
                "Failed to open storage at {}",
                config.storage.root.display()
            )
        })?;
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        Self::with_components(config, Arc::new(blobs), embedder, generator)
    }

    /// Assemble the service over explicit collaborators.
    pub fn with_components(
        config: Config,
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        config::validate(&config)?;
        let policy = config.retrieval.policy()?;

        let registry = Arc::new(IndexRegistry::open(
            blobs.clone(),
            Arc::new(FlatIndexFactory),
        )?);
        let state = Arc::new(StateStore::open(blobs.clone()).with_context(|| "Failed to load learning state")?);

        let cache = if config.cache.enabled {
            let threshold = config.cache.similarity_threshold;
            let cache = if config.cache.persist {
                SemanticCache::persistent(embedder.clone(), threshold, blobs.clone())?
            } else {
                SemanticCache::new(embedder.clone(), threshold)?
            };
            Some(CacheManager::new(Arc::new(cache)))
        } else {
            None
        };

        let pattern: Arc<dyn IndexRouter> = Arc::new(PatternRouter::new()?);
        let semantic: Arc<dyn IndexRouter> = Arc::new(EmbeddingRouter::new(
            embedder.clone(),
            registry.clone(),
            config.router.similarity_threshold,
            config.router.top_k,
        ));
        let router: Arc<dyn IndexRouter> = match config.router.strategy {
            RouterStrategy::Pattern => pattern,
            RouterStrategy::Embedding => semantic,
            RouterStrategy::Combined => Arc::new(CombinedRouter::new(vec![pattern, semantic])),
        };

        let retriever = Retriever::new(registry.clone(), embedder.clone(), policy)?;
        let mut reranker = Reranker::new(embedder.clone(), state.clone())
            .dedup_chunks(config.retrieval.dedup_chunks);
        if config.retrieval.heuristics {
            reranker = reranker.with_adjustment(Arc::new(HeuristicAdjustment::new()?));
        }

        Ok(Self {
            documents: DocumentStore::new(blobs.clone()),
            chunks: ChunkStore::new(blobs.clone()),
            evaluations: EvaluationStore::new(blobs.clone()),
            feedback: FeedbackStore::new(blobs, state.clone()),
            evaluator: Evaluator::new(embedder.clone()),
            context: ContextBuilder::new(ContextStrategy::Qa),
            config,
            embedder,
            generator,
            registry,
            state,
            cache,
            router,
            retriever,
            reranker,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn evaluations(&self) -> &EvaluationStore {
        &self.evaluations
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    /// `None` when `cache.enabled = false`.
    pub fn cache_manager(&self) -> Option<&CacheManager> {
        self.cache.as_ref()
    }

    /// Answer `question`, learning from the automatic evaluation.
    pub async fn ask(&self, question: &str) -> Result<AskResponse> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::validation("Question must not be empty").into());
        }

        if let Some(manager) = &self.cache {
            if let Some(hit) = manager.cache().lookup(question).await? {
                match serde_json::from_value::<AskResponse>(hit.payload) {
                    Ok(mut response) => {
                        tracing::info!(similarity = hit.similarity, cached_query = %hit.query, "Cache hit");
                        response.question = question.to_string();
                        response.cached = true;
                        response.cache_similarity = Some(hit.similarity);
                        return Ok(response);
                    }
                    Err(err) => {
                        tracing::warn!(entry_id = %hit.entry_id, error = %err, "Discarding unreadable cache payload");
                        manager.cache().invalidate(&hit.entry_id, "unreadable_payload")?;
                    }
                }
            } else {
                tracing::debug!("Cache miss");
            }
        }

        let routes = self.router.route(question).await?;
        tracing::debug!(routes = routes.len(), "Routed question");
        let chunk_ids = self.retriever.retrieve(question, &routes).await?;
        let recalled = self.chunks.load_many(&chunk_ids)?;
        tracing::info!(recalled = recalled.len(), "Retrieved chunks");

        if recalled.is_empty() {
            tracing::info!("Nothing recalled, returning fallback answer");
            return Ok(AskResponse::fallback(question));
        }

        let ranked = self
            .reranker
            .rerank(question, recalled, self.retriever.policy().rerank_k)
            .await?;
        let selected: Vec<ChunkRecord> = ranked.iter().map(|r| r.chunk.clone()).collect();
        tracing::debug!(selected = selected.len(), "Reranked chunks");

        let prepared = self.context.prepare(question, &selected);
        let generated = self
            .generator
            .generate(&prepared.prompt())
            .await
            .with_context(|| format!("Generation failed ({})", self.generator.model_name()))?;
        let answer = match generated.trim() {
            "" => FALLBACK_ANSWER.to_string(),
            text => text.to_string(),
        };

        let evaluation = self.evaluator.evaluate(question, &answer, &selected).await?;
        self.evaluations.save(&evaluation)?;
        self.state.apply_evaluation(&evaluation)?;
        let feedback_id = self.feedback.create_shell(&evaluation.evaluation_id)?;
        tracing::info!(
            evaluation_id = %evaluation.evaluation_id,
            relevance = evaluation.metrics.relevance,
            groundedness = evaluation.metrics.groundedness,
            answerability = evaluation.metrics.answerability,
            "Evaluated answer"
        );

        let response = AskResponse {
            question: question.to_string(),
            answer,
            sources: ranked
                .iter()
                .map(|r| AnswerSource {
                    chunk_id: r.chunk.chunk_id.clone(),
                    document_id: r.chunk.document_id.clone(),
                    score: r.score,
                })
                .collect(),
            metrics: Some(evaluation.metrics),
            feedback_id: Some(feedback_id),
            cached: false,
            cache_similarity: None,
        };

        if let Some(manager) = &self.cache {
            let collections: BTreeSet<String> = selected
                .iter()
                .flat_map(|c| c.index_ids.iter().cloned())
                .collect();
            manager
                .cache()
                .store(
                    question,
                    serde_json::to_value(&response)?,
                    self.config.cache.ttl(),
                    collections,
                )
                .await?;
        }

        Ok(response)
    }

    /// Rate a previous answer. Applies the global weight decay at most once
    /// per feedback id.
    pub fn submit_feedback(&self, feedback_id: &str, rating: i8, comment: &str) -> Result<FeedbackOutcome> {
        Ok(self.feedback.submit(feedback_id, rating, comment)?)
    }

    /// Offline report over every stored evaluation and feedback record.
    pub fn analyze(&self) -> Result<(AnalysisReport, Vec<PolicyProposal>)> {
        let evaluations = self.evaluations.list()?;
        let feedback = self.feedback.list()?;
        let report = analysis::run_analysis(&evaluations, &feedback);
        let proposals = analysis::propose_policies(&report, &PolicyThresholds::default());
        Ok((report, proposals))
    }
}
