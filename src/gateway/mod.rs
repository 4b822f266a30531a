//! Provider gateway: chat completions (OpenRouter), embeddings (OpenAI),
//! and reranking (Cohere) behind one retrying, usage-recording front.

pub mod cohere;
pub mod embeddings;
pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use cohere::{CohereAdapter, RerankProvider};
use embeddings::{EmbedProvider, OpenAiEmbeddingsAdapter};
use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::{CallStatus, ProviderCallRecord};

pub use error::{ErrorContext, ProviderError};
pub use pricing::*;
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, TallyUsageSink, UsageSink, UsageTotals};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait EmbedGateway: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait RerankGateway: Send + Sync {
    async fn rerank(&self, req: RerankApiRequest) -> Result<RerankApiResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Bound on each attempt, not on the retry loop as a whole. Expiry is a
    /// retryable [`ProviderError::Timeout`].
    pub attempt_timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            attempt_timeout: None,
        }
    }
}

pub struct ProviderGateway<U: UsageSink> {
    openrouter: OpenRouterAdapter,
    embeddings: Option<OpenAiEmbeddingsAdapter>,
    cohere: Option<CohereAdapter>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> EmbedGateway for ProviderGateway<U> {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> RerankGateway for ProviderGateway<U> {
    async fn rerank(&self, req: RerankApiRequest) -> Result<RerankApiResponse, ProviderError> {
        ProviderGateway::rerank(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    /// OpenRouter is required; embeddings and rerank adapters are attached
    /// when their keys are present.
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        let embeddings = std::env::var("OPENAI_API_KEY")
            .is_ok()
            .then(OpenAiEmbeddingsAdapter::from_env)
            .transpose()?;
        let cohere = std::env::var("COHERE_API_KEY")
            .is_ok()
            .then(CohereAdapter::from_env)
            .transpose()?;
        Ok(Self {
            openrouter,
            embeddings,
            cohere,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(
        openrouter: OpenRouterAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            embeddings: None,
            cohere: None,
            usage_sink,
            config,
        }
    }

    pub fn with_embeddings(mut self, adapter: OpenAiEmbeddingsAdapter) -> Self {
        self.embeddings = Some(adapter);
        self
    }

    pub fn with_cohere(mut self, adapter: CohereAdapter) -> Self {
        self.cohere = Some(adapter);
        self
    }

    pub fn with_retry_policy(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn has_embeddings(&self) -> bool {
        self.embeddings.is_some()
    }

    pub fn has_rerank(&self) -> bool {
        self.cohere.is_some()
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let req = &req;
        self.with_retries(|| async move {
            let result = self.bounded(self.openrouter.chat(req)).await;
            let record = ProviderCallRecord::new(
                req.model.provider(),
                "chat/completions",
                req.model.model_id(),
                req.attribution.caller,
            )
            .run(req.attribution.run_id);
            let record = match &result {
                Ok(resp) => record
                    .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
                    .cost(resp.cost_nanodollars)
                    .upstream_cost(resp.upstream_cost_nanodollars)
                    .latency(resp.latency.as_millis() as i32),
                Err(err) => record.error(err.code()),
            };
            self.record_usage(record).await;
            result
        })
        .await
    }

    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let adapter = self
            .embeddings
            .as_ref()
            .ok_or_else(|| ProviderError::config("OPENAI_API_KEY not set"))?;
        let req = &req;
        self.with_retries(|| async move {
            let result = self.bounded(adapter.embed(req)).await;
            let record = ProviderCallRecord::new(
                req.model.provider(),
                "embeddings",
                req.model.as_str(),
                req.attribution.caller,
            )
            .run(req.attribution.run_id);
            let record = match &result {
                Ok(resp) => record
                    .tokens(resp.tokens as i32, 0)
                    .cost(resp.cost_nanodollars)
                    .latency(resp.latency.as_millis() as i32),
                Err(err) => record.error(err.code()),
            };
            self.record_usage(record).await;
            result
        })
        .await
    }

    pub async fn rerank(&self, req: RerankApiRequest) -> Result<RerankApiResponse, ProviderError> {
        let adapter = self
            .cohere
            .as_ref()
            .ok_or_else(|| ProviderError::config("COHERE_API_KEY not set"))?;
        let req = &req;
        self.with_retries(|| async move {
            let result = self.bounded(adapter.rerank(req)).await;
            let record = ProviderCallRecord::new(
                req.model.provider(),
                "rerank",
                req.model.model_id(),
                req.attribution.caller,
            )
            .run(req.attribution.run_id);
            let record = match &result {
                Ok(resp) => record
                    .tokens(resp.search_units as i32, 0)
                    .cost(resp.cost_nanodollars)
                    .latency(resp.latency.as_millis() as i32),
                Err(err) => record.error(err.code()),
            };
            self.record_usage(record).await;
            result
        })
        .await
    }

    async fn bounded<T, F>(&self, attempt: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match self.config.attempt_timeout {
            Some(limit) => with_timeout(limit, attempt).await,
            None => attempt.await,
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::debug!(error = %err, attempt, ?delay, "retrying provider call");
                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }

    async fn record_usage(&self, record: ProviderCallRecord) {
        if record.status == CallStatus::Error {
            tracing::debug!(
                caller = record.caller,
                model = %record.model,
                code = record.error_code.as_deref().unwrap_or("unknown"),
                "provider call failed"
            );
        }
        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

/// Bound one provider call by `limit`; expiry becomes [`ProviderError::Timeout`].
async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit, None)),
    }
}

/// Extract request ID from response headers.
pub(crate) fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Stream a response body, refusing anything larger than `max_len` bytes.
pub(crate) async fn read_limited_body(
    provider: &'static str,
    mut response: reqwest::Response,
    max_len: usize,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > max_len {
            return Err(ProviderError::provider(
                provider,
                format!("Response too large: {new_len} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
