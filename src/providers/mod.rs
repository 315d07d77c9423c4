//! Remote provider boundary: text embeddings, image captions, and text
//! generation.
//!
//! Each provider is a thin, single-purpose async trait with no retry built
//! in; retry and backoff policy belong to the caller, which knows whether a
//! failed unit of work is skippable (one chunk) or fatal (one query). HTTP
//! implementations live in [`http`], deterministic in-process doubles in
//! [`mock`].

pub mod http;
pub mod mock;

use async_trait::async_trait;

use crate::types::{EMBEDDING_DIMENSIONS, ProviderError};

pub use http::{HttpEmbeddingProvider, HttpTextGenerator, HttpVisionCaptioner, ProviderConfig};
pub use mock::{MockCaptioner, MockEmbeddingProvider, MockGenerator, MockReply};

/// Produces fixed-dimensionality embeddings for text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. Fails with [`ProviderError`] on any non-success
    /// response; the caller decides the blast radius.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Identifier of the embedding function that produced the vectors.
    /// Vectors from different model ids must never be compared.
    fn model_id(&self) -> &str;

    /// Output dimensionality, pinned system-wide.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }
}

/// Produces a natural-language description of an image.
#[async_trait]
pub trait VisionCaptioner: Send + Sync {
    async fn caption(
        &self,
        image_url: &str,
        prompt_hint: Option<&str>,
    ) -> Result<String, ProviderError>;
}

/// A single text-generation request.
///
/// Generation is stateless and idempotent per prompt; no conversation state
/// is carried between calls.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Produces free-form text from a prompt (query rewriting, relevance
/// scoring).
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}
