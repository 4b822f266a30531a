//! Cohere adapter for semantic reranking.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{classify_status, ErrorContext, ProviderError};
use super::pricing::rerank_cost;
use super::types::*;
use super::{extract_request_id, read_limited_body};

const DEFAULT_BASE_URL: &str = "https://api.cohere.com/v1";

/// Rerank responses are small; anything bigger is a misbehaving endpoint.
const MAX_RESPONSE_LEN: usize = 256 * 1_024;

/// Trait for rerank providers.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    async fn rerank(&self, req: &RerankApiRequest) -> Result<RerankApiResponse, ProviderError>;
}

/// Cohere `/rerank` adapter.
#[derive(Debug, Clone)]
pub struct CohereAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl CohereAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(60))
    }

    /// Create from `COHERE_API_KEY` / `COHERE_BASE_URL`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("COHERE_API_KEY")
            .map_err(|_| ProviderError::config("COHERE_API_KEY not set"))?;
        let base_url =
            std::env::var("COHERE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self::with_config(api_key, base_url, Duration::from_secs(60))
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::config("COHERE_API_KEY is empty"));
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

    fn rerank_url(&self) -> String {
        format!("{}/rerank", self.base_url)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct CohereRerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
    return_documents: bool,
}

#[derive(Deserialize)]
struct CohereRerankResponse {
    #[serde(default)]
    results: Vec<RerankHit>,
    #[serde(default)]
    meta: Option<CohereMeta>,
}

#[derive(Deserialize)]
struct CohereMeta {
    billed_units: Option<BilledUnits>,
}

#[derive(Deserialize)]
struct BilledUnits {
    search_units: Option<u32>,
}

#[derive(Deserialize)]
struct CohereError {
    message: Option<String>,
}

#[async_trait]
impl RerankProvider for CohereAdapter {
    async fn rerank(&self, req: &RerankApiRequest) -> Result<RerankApiResponse, ProviderError> {
        if req.documents.is_empty() {
            return Ok(RerankApiResponse {
                results: Vec::new(),
                search_units: 0,
                cost_nanodollars: 0,
                latency: Duration::from_millis(0),
            });
        }

        let start = Instant::now();
        let body = CohereRerankRequest {
            model: req.model.model_id(),
            query: &req.query,
            documents: &req.documents,
            // Every document must come back with a score.
            top_n: req.documents.len(),
            return_documents: false,
        };

        let response = self
            .client
            .post(self.rerank_url())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let request_id = extract_request_id(response.headers());
        let raw = read_limited_body("cohere", response, MAX_RESPONSE_LEN).await?;

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let message = serde_json::from_str::<CohereError>(&raw)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(classify_status("cohere", status.as_u16(), message, ctx));
        }

        let parsed: CohereRerankResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::provider("cohere", format!("Invalid JSON: {e}"), false))?;

        let search_units = parsed
            .meta
            .and_then(|m| m.billed_units)
            .and_then(|b| b.search_units)
            .unwrap_or(1);

        Ok(RerankApiResponse {
            results: parsed.results,
            search_units,
            cost_nanodollars: rerank_cost(req.model.model_id(), search_units),
            latency: start.elapsed(),
        })
    }
}
