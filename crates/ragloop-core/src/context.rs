//! Context assembly and prompt rendering for the generation step.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::evaluation::FALLBACK_ANSWER;
use crate::models::ChunkRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    /// Chunk contents joined by blank lines.
    Simple,
    /// Each chunk prefixed with a numbered source header.
    #[default]
    Qa,
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextStrategy::Simple => "simple",
            ContextStrategy::Qa => "qa",
        })
    }
}

impl FromStr for ContextStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(ContextStrategy::Simple),
            "qa" => Ok(ContextStrategy::Qa),
            other => Err(Error::configuration(format!(
                "Unknown context strategy '{other}'. Use simple or qa."
            ))),
        }
    }
}

/// Provenance of one chunk placed in the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub chunk_id: String,
    pub document_id: String,
}

/// Everything the generator needs for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedContext {
    pub question: String,
    pub context: String,
    pub sources: Vec<Source>,
    pub strategy: ContextStrategy,
}

impl PreparedContext {
    /// Render the grounded-answer prompt.
    pub fn prompt(&self) -> String {
        format!(
            "You are a helpful assistant.\n\
             Answer the question using ONLY the context below.\n\
             If the answer is not present in the context, reply exactly: {FALLBACK_ANSWER}\n\
             \n\
             Context:\n{}\n\
             \n\
             Question:\n{}\n\
             \n\
             Answer:",
            self.context, self.question
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBuilder {
    strategy: ContextStrategy,
}

impl ContextBuilder {
    pub fn new(strategy: ContextStrategy) -> Self {
        Self { strategy }
    }

    pub fn build(&self, chunks: &[ChunkRecord]) -> String {
        match self.strategy {
            ContextStrategy::Simple => chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            ContextStrategy::Qa => chunks
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    format!(
                        "[Source {}] (doc: {}, chunk: {})\n{}",
                        i + 1,
                        c.document_id,
                        c.chunk_id,
                        c.content
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    pub fn prepare(&self, question: &str, chunks: &[ChunkRecord]) -> PreparedContext {
        PreparedContext {
            question: question.to_string(),
            context: self.build(chunks),
            sources: chunks
                .iter()
                .map(|c| Source {
                    chunk_id: c.chunk_id.clone(),
                    document_id: c.document_id.clone(),
                })
                .collect(),
            strategy: self.strategy,
        }
    }
}
