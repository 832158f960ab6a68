//! # ragloop core
//!
//! Pure logic for the ragloop retrieval-augmented generation loop: data
//! models, learning state, semantic cache, index routing, retrieval,
//! reranking, evaluation and feedback.
//!
//! This crate performs no filesystem or network I/O and starts no runtime.
//! Persistence goes through the [`store::BlobStore`] trait; embedding and
//! generation go through [`embedding::Embedder`] and
//! [`generation::Generator`]. The `ragloop` crate supplies file-backed and
//! HTTP implementations.
//!
//! # Request flow
//!
//! ```text
//! question ─▶ SemanticCache ──hit──▶ cached answer
//!               │ miss
//!               ▼
//!          IndexRouter ─▶ Retriever ─▶ ChunkStore ─▶ Reranker ─▶ ContextBuilder
//!                                                                    │
//!          StateStore ◀─ Evaluator ◀──────────── Generator ◀─────────┘
//!               ▲
//!          FeedbackStore (human rating, applied once)
//! ```

pub mod analysis;
pub mod cache;
pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod evaluation;
pub mod feedback;
pub mod generation;
pub mod index;
pub mod knowledge;
pub mod lifecycle;
pub mod models;
pub mod registry;
pub mod reranker;
pub mod retriever;
pub mod router;
pub mod state;
pub mod store;

pub use error::{Error, Result};
