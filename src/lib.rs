//! # ragloop
//!
//! A retrieval-augmented question-answering loop that learns. Every answer
//! is scored against its question and its supporting chunks; the scores
//! feed per-document, per-chunk and per-index weights that steer later
//! reranking. Users can nudge all weights once per answer with a rating.
//!
//! The algorithms live in [`ragloop_core`]. This crate adds what a
//! deployment needs around them:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`blob_fs`] | File-backed blob store (atomic write-then-rename) |
//! | [`embedding`] | OpenAI, Ollama and local embedding providers |
//! | [`generation`] | OpenAI and Ollama answer generation |
//! | [`ingest`] | Walk a directory, chunk documents, build an index |
//! | [`service`] | The ask / feedback orchestration |
//!
//! ## Quick Start
//!
//! ```bash
//! ragloop init
//! ragloop ingest ./docs --role definition
//! ragloop ask "What is a semantic cache?"
//! ragloop feedback <feedback-id> 1
//! ragloop analyze
//! ```

pub mod blob_fs;
pub mod config;
pub mod embedding;
pub mod generation;
mod http;
pub mod ingest;
pub mod service;
