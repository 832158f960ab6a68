//! Query-to-index routing.
//!
//! A router turns a question into an ordered list of [`RouteCandidate`]s;
//! the first candidate has the first retrieval priority. Two independent
//! strategies implement [`IndexRouter`]:
//!
//! - [`PatternRouter`] looks only at the question text and emits index
//!   *roles* (`definition`, `procedure`, always followed by `general`).
//! - [`EmbeddingRouter`] looks only at registered indexes and emits concrete
//!   index ids whose representative text is similar to the question.
//!
//! [`CombinedRouter`] merges the output of several routers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{Error, Result};
use crate::registry::IndexRegistry;

/// Role emitted for every question by [`PatternRouter`].
pub const GENERAL_ROLE: &str = "general";
pub const DEFINITION_ROLE: &str = "definition";
pub const PROCEDURE_ROLE: &str = "procedure";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    pub index_role: String,
    /// Concrete index, when the router knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_id: Option<String>,
    pub score: f32,
}

impl RouteCandidate {
    pub fn role(role: &str, score: f32) -> Self {
        Self {
            index_role: role.to_string(),
            index_id: None,
            score,
        }
    }
}

#[async_trait]
pub trait IndexRouter: Send + Sync {
    async fn route(&self, query: &str) -> Result<Vec<RouteCandidate>>;
}

/// Which router a deployment uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterStrategy {
    Pattern,
    Embedding,
    #[default]
    Combined,
}

impl fmt::Display for RouterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouterStrategy::Pattern => "pattern",
            RouterStrategy::Embedding => "embedding",
            RouterStrategy::Combined => "combined",
        })
    }
}

impl FromStr for RouterStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pattern" => Ok(RouterStrategy::Pattern),
            "embedding" => Ok(RouterStrategy::Embedding),
            "combined" => Ok(RouterStrategy::Combined),
            other => Err(Error::configuration(format!(
                "Unknown router strategy '{other}'. Use pattern, embedding or combined."
            ))),
        }
    }
}

/// Regex classifier over the question text.
pub struct PatternRouter {
    definition: Regex,
    procedure: Regex,
}

impl PatternRouter {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::configuration(format!("Invalid router pattern: {e}")))
        };
        Ok(Self {
            definition: compile(r"(?i)^(what is|who is|define)\b")?,
            procedure: compile(r"(?i)\b(how to|steps?|install|configure|setup)\b")?,
        })
    }

    /// Synchronous form of [`IndexRouter::route`].
    pub fn classify(&self, query: &str) -> Vec<RouteCandidate> {
        let q = query.trim();
        let mut roles = Vec::with_capacity(3);
        if self.definition.is_match(q) {
            roles.push(RouteCandidate::role(DEFINITION_ROLE, 1.0));
        }
        if self.procedure.is_match(q) {
            roles.push(RouteCandidate::role(PROCEDURE_ROLE, 0.9));
        }
        roles.push(RouteCandidate::role(GENERAL_ROLE, 0.5));
        roles
    }
}

#[async_trait]
impl IndexRouter for PatternRouter {
    async fn route(&self, query: &str) -> Result<Vec<RouteCandidate>> {
        Ok(self.classify(query))
    }
}

/// Similarity between the question and each index's representative text.
///
/// Representative embeddings are computed once per index id and cached;
/// index metadata is immutable so the cache never goes stale.
pub struct EmbeddingRouter {
    embedder: Arc<dyn Embedder>,
    registry: Arc<IndexRegistry>,
    threshold: f32,
    top_k: usize,
    representatives: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingRouter {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        registry: Arc<IndexRegistry>,
        threshold: f32,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            registry,
            threshold,
            top_k,
            representatives: RwLock::new(HashMap::new()),
        }
    }
}

fn poisoned() -> Error {
    Error::persistence("router lock poisoned")
}

#[async_trait]
impl IndexRouter for EmbeddingRouter {
    async fn route(&self, query: &str) -> Result<Vec<RouteCandidate>> {
        let indexes = self.registry.list()?;
        if indexes.is_empty() {
            return Ok(Vec::new());
        }

        let missing: Vec<_> = {
            let cached = self.representatives.read().map_err(|_| poisoned())?;
            indexes
                .iter()
                .filter(|m| !cached.contains_key(&m.index_id))
                .collect()
        };
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|m| m.representative_text()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            let mut cached = self.representatives.write().map_err(|_| poisoned())?;
            for (meta, vector) in missing.iter().zip(vectors) {
                cached.insert(meta.index_id.clone(), vector);
            }
        }

        let query_vec = self.embedder.embed(query).await?;
        let mut candidates: Vec<RouteCandidate> = {
            let cached = self.representatives.read().map_err(|_| poisoned())?;
            indexes
                .iter()
                .filter_map(|meta| {
                    let rep = cached.get(&meta.index_id)?;
                    let score = cosine_similarity(&query_vec, rep);
                    (score >= self.threshold).then(|| RouteCandidate {
                        index_role: meta.index_role.clone(),
                        index_id: Some(meta.index_id.clone()),
                        score,
                    })
                })
                .collect()
        };
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(self.top_k);
        Ok(candidates)
    }
}

/// Runs several routers and merges their candidates.
///
/// Duplicate `(role, index_id)` pairs keep their highest score; the merged
/// list is sorted by descending score, ties in router order.
pub struct CombinedRouter {
    routers: Vec<Arc<dyn IndexRouter>>,
}

impl CombinedRouter {
    pub fn new(routers: Vec<Arc<dyn IndexRouter>>) -> Self {
        Self { routers }
    }
}

#[async_trait]
impl IndexRouter for CombinedRouter {
    async fn route(&self, query: &str) -> Result<Vec<RouteCandidate>> {
        let mut merged: Vec<RouteCandidate> = Vec::new();
        for router in &self.routers {
            for candidate in router.route(query).await? {
                match merged.iter_mut().find(|c| {
                    c.index_role == candidate.index_role && c.index_id == candidate.index_id
                }) {
                    Some(existing) => existing.score = existing.score.max(candidate.score),
                    None => merged.push(candidate),
                }
            }
        }
        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FlatIndexFactory;
    use crate::models::ChunkRecord;
    use crate::store::memory::InMemoryBlobStore;

    fn roles(candidates: &[RouteCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.index_role.as_str()).collect()
    }

    #[test]
    fn test_pattern_definition() {
        let router = PatternRouter::new().unwrap();
        assert_eq!(roles(&router.classify("What is a borrow checker?")), vec!["definition", "general"]);
        assert_eq!(roles(&router.classify("  define lifetime")), vec!["definition", "general"]);
    }

    #[test]
    fn test_pattern_procedure_and_fallback() {
        let router = PatternRouter::new().unwrap();
        let routed = router.classify("How to configure the proxy");
        assert_eq!(roles(&routed), vec!["procedure", "general"]);
        assert_eq!(routed[0].score, 0.9);
        assert_eq!(roles(&router.classify("Tell me about ownership")), vec!["general"]);
        // "what is" only counts as a prefix
        assert_eq!(roles(&router.classify("so what is it")), vec!["general"]);
    }

    #[test]
    fn test_pattern_both_roles() {
        let router = PatternRouter::new().unwrap();
        let routed = router.classify("What is the install step");
        assert_eq!(roles(&routed), vec!["definition", "procedure", "general"]);
    }

    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keyword"
        }

        fn dims(&self) -> usize {
            3
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.contains("kubernetes") as u8 as f32,
                        t.contains("cooking") as u8 as f32,
                        t.contains("music") as u8 as f32,
                    ]
                })
                .collect())
        }
    }

    async fn registry_with(summaries: &[(&str, &str)]) -> Arc<IndexRegistry> {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let registry = IndexRegistry::open(blobs, Arc::new(FlatIndexFactory)).unwrap();
        for (role, summary) in summaries {
            registry
                .build_index(
                    &[ChunkRecord::new("d", summary, 0)],
                    role,
                    Some(summary.to_string()),
                    &KeywordEmbedder,
                )
                .await
                .unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_embedding_router_filters_and_ranks() {
        let registry = registry_with(&[
            ("ops", "Kubernetes runbooks"),
            ("food", "Cooking recipes"),
            ("mixed", "Kubernetes cooking music"),
        ])
        .await;
        let router = EmbeddingRouter::new(Arc::new(KeywordEmbedder), registry, 0.35, 3);

        let routed = router.route("kubernetes pods").await.unwrap();
        assert_eq!(roles(&routed), vec!["ops", "mixed"]);
        assert!(routed[0].index_id.is_some());
        assert!(routed[0].score > routed[1].score);
    }

    #[tokio::test]
    async fn test_embedding_router_truncates_top_k() {
        let registry = registry_with(&[
            ("a", "Kubernetes one"),
            ("b", "Kubernetes two"),
            ("c", "Kubernetes three"),
        ])
        .await;
        let router = EmbeddingRouter::new(Arc::new(KeywordEmbedder), registry, 0.1, 2);
        assert_eq!(router.route("kubernetes").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_embedding_router_empty_registry() {
        let registry = registry_with(&[]).await;
        let router = EmbeddingRouter::new(Arc::new(KeywordEmbedder), registry, 0.0, 3);
        assert!(router.route("anything").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_combined_router_merges() {
        let registry = registry_with(&[("definition", "Kubernetes glossary")]).await;
        let combined = CombinedRouter::new(vec![
            Arc::new(PatternRouter::new().unwrap()),
            Arc::new(EmbeddingRouter::new(Arc::new(KeywordEmbedder), registry, 0.35, 3)),
        ]);
        let routed = combined.route("What is kubernetes").await.unwrap();
        assert_eq!(routed[0].index_role, "definition");
        assert_eq!(routed.last().map(|c| c.index_role.as_str()), Some("general"));
        assert_eq!(routed.len(), 3);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("embedding".parse::<RouterStrategy>().unwrap(), RouterStrategy::Embedding);
        assert!("random".parse::<RouterStrategy>().is_err());
    }
}
