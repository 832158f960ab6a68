//! Text generation service contract. Providers live in the `ragloop` crate.

use async_trait::async_trait;

use crate::error::Result;

/// Blocking-style completion: one prompt in, the full answer text out.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}
