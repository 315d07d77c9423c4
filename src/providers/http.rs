//! HTTP clients for the remote embedding, captioning, and generation
//! providers.
//!
//! Responses are deserialized into strict schemas at this boundary; anything
//! that does not match is rejected here with a [`ProviderError`] instead of
//! leaking loosely-typed JSON into the pipeline. Embedding responses are
//! additionally length-checked against the configured dimensionality before
//! they are handed to any caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{EmbeddingProvider, GenerationRequest, TextGenerator, VisionCaptioner};
use crate::types::{EMBEDDING_DIMENSIONS, ProviderError};

/// Connection settings shared by the three provider clients.
///
/// `base_url` should end with a trailing slash; endpoint paths are joined
/// onto it. The request timeout bounds every provider call at the transport
/// level (the reranker adds its own tighter race on top).
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: Url,
    pub api_key: String,
    pub embedding_model: String,
    pub caption_model: String,
    pub generation_model: String,
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn new(base_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            base_url,
            api_key: api_key.into(),
            embedding_model: "text-embedding-004".to_string(),
            caption_model: "vision-caption-001".to_string(),
            generation_model: "text-gen-002".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .use_rustls_tls()
        .build()
        .map_err(ProviderError::from)
}

fn endpoint(base: &Url, path: &str) -> Result<Url, ProviderError> {
    base.join(path)
        .map_err(|err| ProviderError::Endpoint(format!("{path}: {err}")))
}

async fn reject_non_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbeddingRequestBody<'a> {
    model: &'a str,
    input: &'a str,
    /// Pinned output size; providers with a configurable dimensionality must
    /// honor this so every stored vector stays comparable.
    output_dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponseBody {
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            endpoint: endpoint(&config.base_url, "v1/embeddings")?,
            api_key: config.api_key.clone(),
            model: config.embedding_model.clone(),
            dimensions: EMBEDDING_DIMENSIONS,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = EmbeddingRequestBody {
            model: &self.model,
            input: text,
            output_dimensions: self.dimensions,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = reject_non_success(response).await?;
        let payload: EmbeddingResponseBody = response
            .json()
            .await
            .map_err(|err| ProviderError::Schema(err.to_string()))?;

        if payload.embedding.len() != self.dimensions {
            return Err(ProviderError::Dimensions {
                expected: self.dimensions,
                actual: payload.embedding.len(),
            });
        }
        Ok(payload.embedding)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// Vision captions
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CaptionRequestBody<'a> {
    model: &'a str,
    image_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

#[derive(Deserialize)]
struct CaptionResponseBody {
    caption: String,
}

pub struct HttpVisionCaptioner {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl HttpVisionCaptioner {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            endpoint: endpoint(&config.base_url, "v1/captions")?,
            api_key: config.api_key.clone(),
            model: config.caption_model.clone(),
        })
    }
}

#[async_trait]
impl VisionCaptioner for HttpVisionCaptioner {
    async fn caption(
        &self,
        image_url: &str,
        prompt_hint: Option<&str>,
    ) -> Result<String, ProviderError> {
        let body = CaptionRequestBody {
            model: &self.model,
            image_url,
            prompt: prompt_hint,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = reject_non_success(response).await?;
        let payload: CaptionResponseBody = response
            .json()
            .await
            .map_err(|err| ProviderError::Schema(err.to_string()))?;
        Ok(payload.caption)
    }
}

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GenerationRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerationResponseBody {
    text: String,
}

pub struct HttpTextGenerator {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl HttpTextGenerator {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            endpoint: endpoint(&config.base_url, "v1/generate")?,
            api_key: config.api_key.clone(),
            model: config.generation_model.clone(),
        })
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let body = GenerationRequestBody {
            model: &self.model,
            prompt: &request.prompt,
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = reject_non_success(response).await?;
        let payload: GenerationResponseBody = response
            .json()
            .await
            .map_err(|err| ProviderError::Schema(err.to_string()))?;
        Ok(payload.text)
    }
}
