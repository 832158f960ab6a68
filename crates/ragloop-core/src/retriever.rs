//! Resolve routed index candidates to a chunk-id recall set.
//!
//! Role candidates expand to every registered index with that role; id
//! candidates name a single index. The resolved index list is deduplicated
//! in priority order, then each index is searched for `top_k` chunks and the
//! hits are concatenated. The chunk-id list is **not** deduplicated: a chunk
//! recalled from two indexes appears twice and the reranker decides.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::registry::IndexRegistry;
use crate::router::RouteCandidate;

/// Retrieval tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalPolicy {
    /// Chunks requested from each index.
    pub top_k: usize,
    /// Chunks kept after reranking. Never more than `top_k`.
    pub rerank_k: usize,
    pub use_query_rewrite: bool,
}

impl RetrievalPolicy {
    pub fn new(top_k: usize, rerank_k: usize, use_query_rewrite: bool) -> Result<Self> {
        let policy = Self {
            top_k,
            rerank_k,
            use_query_rewrite,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::validation("retrieval top_k must be at least 1"));
        }
        if self.rerank_k > self.top_k {
            return Err(Error::validation(format!(
                "rerank_k ({}) must not exceed top_k ({})",
                self.rerank_k, self.top_k
            )));
        }
        Ok(())
    }
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            top_k: 5,
            rerank_k: 3,
            use_query_rewrite: false,
        }
    }
}

/// Extension point applied to the query before vector search.
pub trait QueryRewriter: Send + Sync {
    fn rewrite(&self, query: &str) -> String;
}

/// Default rewriter: trims surrounding whitespace and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRewriter;

impl QueryRewriter for IdentityRewriter {
    fn rewrite(&self, query: &str) -> String {
        query.trim().to_string()
    }
}

pub struct Retriever {
    registry: Arc<IndexRegistry>,
    embedder: Arc<dyn Embedder>,
    policy: RetrievalPolicy,
    rewriter: Arc<dyn QueryRewriter>,
}

impl Retriever {
    pub fn new(
        registry: Arc<IndexRegistry>,
        embedder: Arc<dyn Embedder>,
        policy: RetrievalPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            registry,
            embedder,
            policy,
            rewriter: Arc::new(IdentityRewriter),
        })
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn policy(&self) -> &RetrievalPolicy {
        &self.policy
    }

    /// Concrete index ids for the candidates, deduplicated, in priority
    /// order. No candidates means every registered index.
    pub fn resolve_indexes(&self, routes: &[RouteCandidate]) -> Result<Vec<String>> {
        if routes.is_empty() {
            return self.registry.ids();
        }
        let mut resolved: Vec<String> = Vec::new();
        for route in routes {
            let ids = match &route.index_id {
                Some(id) => vec![id.clone()],
                None => self.registry.ids_for_role(&route.index_role)?,
            };
            for id in ids {
                if !resolved.contains(&id) {
                    resolved.push(id);
                }
            }
        }
        Ok(resolved)
    }

    /// Chunk ids recalled for `query`, per-index order preserved.
    pub async fn retrieve(&self, query: &str, routes: &[RouteCandidate]) -> Result<Vec<String>> {
        let query = if self.policy.use_query_rewrite {
            self.rewriter.rewrite(query)
        } else {
            query.to_string()
        };

        let index_ids = self.resolve_indexes(routes)?;
        if index_ids.is_empty() {
            tracing::debug!("No index matched the routed roles");
            return Ok(Vec::new());
        }

        let query_vec = self.embedder.embed(&query).await?;
        let mut chunk_ids = Vec::new();
        for index_id in &index_ids {
            let hits = self.registry.search(index_id, &query_vec, self.policy.top_k)?;
            tracing::debug!(index_id = %index_id, hits = hits.len(), "Searched index");
            chunk_ids.extend(hits.into_iter().map(|hit| hit.chunk_id));
        }
        Ok(chunk_ids)
    }
}
