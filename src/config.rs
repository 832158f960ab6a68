//! TOML configuration for the `ragloop` binary and library.
//!
//! Every section except `[storage]` is optional and falls back to the
//! defaults below. [`load_config`] rejects invalid values up front so the
//! pipeline never starts with a policy it would later refuse.
//!
//! ```toml
//! [storage]
//! root = "./data"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [generation]
//! provider = "ollama"
//! model = "llama3.1"
//!
//! [retrieval]
//! top_k = 5
//! rerank_k = 3
//! ```

use anyhow::{Context, Result};
use ragloop_core::retriever::RetrievalPolicy;
use ragloop_core::router::RouterStrategy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "./config/ragloop.toml";

/// Upper bound for `cache.ttl_secs` (100 years).
pub const MAX_CACHE_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory; one sub-directory per blob namespace.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    #[allow(dead_code)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_generation_max_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_temperature() -> f32 {
    0.0
}
fn default_generation_max_tokens() -> u32 {
    512
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rerank_k")]
    pub rerank_k: usize,
    #[serde(default)]
    pub use_query_rewrite: bool,
    #[serde(default = "default_true")]
    pub dedup_chunks: bool,
    /// Enable the definition/procedure score nudges in the reranker.
    #[serde(default)]
    pub heuristics: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank_k: default_rerank_k(),
            use_query_rewrite: false,
            dedup_chunks: true,
            heuristics: false,
        }
    }
}

impl RetrievalConfig {
    pub fn policy(&self) -> ragloop_core::Result<RetrievalPolicy> {
        RetrievalPolicy::new(self.top_k, self.rerank_k, self.use_query_rewrite)
    }
}

fn default_top_k() -> usize {
    5
}
fn default_rerank_k() -> usize {
    3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default)]
    pub strategy: RouterStrategy,
    #[serde(default = "default_router_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_router_top_k")]
    pub top_k: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RouterStrategy::default(),
            similarity_threshold: default_router_threshold(),
            top_k: default_router_top_k(),
        }
    }
}

fn default_router_threshold() -> f32 {
    0.35
}
fn default_router_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_threshold")]
    pub similarity_threshold: f32,
    /// Entry lifetime in seconds; `0` keeps entries until invalidated.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_cache_threshold(),
            ttl_secs: default_ttl_secs(),
            persist: true,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<i64> {
        (self.ttl_secs > 0).then_some(self.ttl_secs)
    }
}

fn default_cache_threshold() -> f32 {
    0.9
}
fn default_ttl_secs() -> i64 {
    3600
}

impl Config {
    /// Configuration rooted at `root` with every other section defaulted.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig { root: root.into() },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a TOML document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    config
        .retrieval
        .policy()
        .with_context(|| "Invalid [retrieval] section")?;

    if !(0.0..=1.0).contains(&config.cache.similarity_threshold) {
        anyhow::bail!("cache.similarity_threshold must be in [0.0, 1.0]");
    }
    if !(0..=MAX_CACHE_TTL_SECS).contains(&config.cache.ttl_secs) {
        anyhow::bail!("cache.ttl_secs must be in [0, {}]", MAX_CACHE_TTL_SECS);
    }

    if !(-1.0..=1.0).contains(&config.router.similarity_threshold) {
        anyhow::bail!("router.similarity_threshold must be in [-1.0, 1.0]");
    }
    if config.router.top_k == 0 {
        anyhow::bail!("router.top_k must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[storage]\nroot = \"./data\"\n").unwrap();
        assert_eq!(config.storage.root, PathBuf::from("./data"));
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.rerank_k, 3);
        assert!(config.retrieval.dedup_chunks);
        assert!(!config.retrieval.use_query_rewrite);
        assert_eq!(config.router.strategy, RouterStrategy::Combined);
        assert_eq!(config.cache.ttl(), Some(3600));
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_rerank_k_above_top_k_rejected() {
        let err = parse_config("[storage]\nroot = \"d\"\n[retrieval]\ntop_k = 2\nrerank_k = 4\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("rerank_k"));
    }

    #[test]
    fn test_cache_threshold_range() {
        assert!(parse_config("[storage]\nroot = \"d\"\n[cache]\nsimilarity_threshold = 1.5\n").is_err());
        let config =
            parse_config("[storage]\nroot = \"d\"\n[cache]\nsimilarity_threshold = 1.0\nttl_secs = 0\n")
                .unwrap();
        assert_eq!(config.cache.ttl(), None);
    }

    #[test]
    fn test_cache_ttl_bounds() {
        let err = parse_config("[storage]\nroot = \"d\"\n[cache]\nttl_secs = 10000000000000000\n")
            .unwrap_err();
        assert!(err.to_string().contains("cache.ttl_secs"));
        assert!(parse_config("[storage]\nroot = \"d\"\n[cache]\nttl_secs = -1\n").is_err());
        let max = format!("[storage]\nroot = \"d\"\n[cache]\nttl_secs = {MAX_CACHE_TTL_SECS}\n");
        assert!(parse_config(&max).is_ok());
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse_config("[storage]\nroot = \"d\"\n[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse_config("[storage]\nroot = \"d\"\n[generation]\nprovider = \"magic\"\n").is_err());
        assert!(parse_config("[storage]\nroot = \"d\"\n[router]\nstrategy = \"random\"\n").is_err());
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse_config("[storage]\nroot = \"d\"\n[embedding]\nprovider = \"ollama\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
        let config = parse_config(
            "[storage]\nroot = \"d\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n",
        )
        .unwrap();
        assert_eq!(config.embedding.dims, Some(768));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config(Path::new("/nonexistent/ragloop.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
