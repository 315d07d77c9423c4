//! Deterministic in-process provider doubles.
//!
//! These back the test suite and any offline pipeline run: embeddings are
//! hash-seeded so identical text always embeds identically, the generator
//! replays a script, and the captioner echoes a stable description.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EmbeddingProvider, GenerationRequest, TextGenerator, VisionCaptioner};
use crate::types::{EMBEDDING_DIMENSIONS, ProviderError};

#[derive(Clone, Copy, Debug)]
enum EmbeddingMode {
    /// Seeded from a hash of the text: identical text embeds identically,
    /// different text is (near-)orthogonal in high dimensions.
    Hashed,
    /// Every text maps to the same unit vector, making cosine similarity 1.0
    /// between any two inputs. Useful for exercising similarity gates.
    Constant,
    /// Every call fails with a provider error.
    Failing,
}

pub struct MockEmbeddingProvider {
    dimensions: usize,
    mode: EmbeddingMode,
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
            mode: EmbeddingMode::Hashed,
        }
    }

    /// All inputs embed to the same vector (cosine similarity 1.0).
    pub fn constant() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
            mode: EmbeddingMode::Constant,
        }
    }

    /// Every call fails.
    pub fn failing() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
            mode: EmbeddingMode::Failing,
        }
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    fn hashed_vector(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut state = hasher.finish() | 1;
        let mut vector = Vec::with_capacity(self.dimensions);
        for _ in 0..self.dimensions {
            // xorshift64 over the text hash keeps the output deterministic.
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let unit = (state as f64 / u64::MAX as f64) as f32;
            vector.push(unit * 2.0 - 1.0);
        }
        normalize(&mut vector);
        vector
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        match self.mode {
            EmbeddingMode::Hashed => Ok(self.hashed_vector(text)),
            EmbeddingMode::Constant => {
                let mut vector = vec![1.0f32; self.dimensions];
                normalize(&mut vector);
                Ok(vector)
            }
            EmbeddingMode::Failing => Err(ProviderError::Status {
                status: 503,
                body: "mock embedding provider unavailable".to_string(),
            }),
        }
    }

    fn model_id(&self) -> &str {
        "mock-embedding"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// One scripted generator response.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(String),
    /// Responds with the text only after the delay elapses; pairs with the
    /// reranker's timeout race.
    DelayedText(Duration, String),
}

/// Replays a script of [`MockReply`] entries, then falls back to a repeated
/// response when one is configured.
pub struct MockGenerator {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<String>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerator {
    pub fn with_script(replies: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Responds with the same text on every call.
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(text.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails every call.
    pub fn failing() -> Self {
        Self::with_script(Vec::new())
    }

    /// Requests observed so far, in call order.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.lock().push(request.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Error(message)) => Err(ProviderError::Status {
                status: 500,
                body: message,
            }),
            Some(MockReply::DelayedText(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(ProviderError::Status {
                    status: 500,
                    body: "mock generator script exhausted".to_string(),
                }),
            },
        }
    }
}

/// Echoes a stable caption per image URL; optionally fails.
pub struct MockCaptioner {
    fail: bool,
}

impl MockCaptioner {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Default for MockCaptioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisionCaptioner for MockCaptioner {
    async fn caption(
        &self,
        image_url: &str,
        _prompt_hint: Option<&str>,
    ) -> Result<String, ProviderError> {
        if self.fail {
            return Err(ProviderError::Status {
                status: 502,
                body: "mock captioner unavailable".to_string(),
            });
        }
        Ok(format!("A screenshot described from {image_url}."))
    }
}
