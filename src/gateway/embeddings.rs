//! OpenAI-compatible embeddings adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{classify_status, ErrorContext, ProviderError};
use super::pricing::embedding_cost;
use super::types::*;
use super::{extract_request_id, read_limited_body};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// A 3072-dim float vector serializes to roughly 60KB; leave room for a few.
const MAX_RESPONSE_LEN: usize = 4 * 1_024 * 1_024;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbedProvider: Send + Sync {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingsAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiEmbeddingsAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(60))
    }

    /// Create from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::config("OPENAI_API_KEY not set"))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self::with_config(api_key, base_url, Duration::from_secs(60))
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::config("OPENAI_API_KEY is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }
}

#[derive(Serialize)]
struct EmbeddingsApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsApiResponse {
    data: Vec<EmbeddingItem>,
    usage: Option<EmbeddingUsage>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingUsage {
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    code: Option<String>,
}

#[async_trait]
impl EmbedProvider for OpenAiEmbeddingsAdapter {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if req.texts.is_empty() {
            return Err(ProviderError::invalid_request("no texts to embed"));
        }

        let start = Instant::now();
        let body = EmbeddingsApiRequest {
            model: req.model.as_str(),
            input: &req.texts,
        };

        let response = self
            .client
            .post(self.embeddings_url())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let request_id = extract_request_id(response.headers());
        let raw = read_limited_body("openai", response, MAX_RESPONSE_LEN).await?;

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let error = serde_json::from_str::<ErrorEnvelope>(&raw)
                .ok()
                .and_then(|e| e.error);
            let (message, ctx) = match error {
                Some(ErrorBody { message, code }) => (
                    message.unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
                    match code {
                        Some(code) => ctx.with_code(code),
                        None => ctx,
                    },
                ),
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };
            return Err(classify_status("openai", status.as_u16(), message, ctx));
        }

        let parsed: EmbeddingsApiResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::provider("openai", format!("Invalid JSON: {e}"), false))?;

        if parsed.data.len() != req.texts.len() {
            return Err(ProviderError::provider(
                "openai",
                format!(
                    "expected {} embeddings, got {}",
                    req.texts.len(),
                    parsed.data.len()
                ),
                false,
            ));
        }

        let mut data = parsed.data;
        data.sort_by_key(|item| item.index);
        let tokens = parsed.usage.and_then(|u| u.total_tokens).unwrap_or(0);

        Ok(EmbedResponse {
            embeddings: data.into_iter().map(|item| item.embedding).collect(),
            tokens,
            cost_nanodollars: embedding_cost(req.model.as_str(), tokens),
            latency: start.elapsed(),
        })
    }
}
