//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for cost tracking and debugging.
///
/// Every request through the gateway carries attribution so we know:
/// - Which optimization run it's part of (run_id)
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Optimization run this request belongs to.
    pub run_id: Option<Uuid>,
    /// Which code path made this call, for debugging.
    /// Use a static string like "generator::generate" or "judge::minto".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Embedding model to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedModel {
    /// OpenAI-compatible model id, e.g. "text-embedding-3-small".
    OpenAI(String),
}

impl EmbedModel {
    pub fn openai(model_id: impl Into<String>) -> Self {
        EmbedModel::OpenAI(model_id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            EmbedModel::OpenAI(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        "openai"
    }
}

/// Request to embed texts.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    /// Model to use for embedding.
    pub model: EmbedModel,
    /// Texts to embed. Each text produces one embedding vector.
    pub texts: Vec<String>,
    /// Attribution for cost tracking.
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(model: EmbedModel, texts: Vec<String>, attribution: Attribution) -> Self {
        Self {
            model,
            texts,
            attribution,
        }
    }
}

/// Response from embedding request.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    /// Embedding vectors, one per input text, in input order.
    pub embeddings: Vec<Vec<f32>>,
    /// Total tokens consumed.
    pub tokens: u32,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    /// Time taken for the request.
    pub latency: Duration,
}

// =============================================================================
// RERANK TYPES
// =============================================================================

/// Reranking model to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerankModel {
    /// Cohere rerank model, e.g. "rerank-english-v3.0".
    Cohere(String),
}

impl RerankModel {
    pub fn cohere(model_id: impl Into<String>) -> Self {
        RerankModel::Cohere(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            RerankModel::Cohere(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            RerankModel::Cohere(_) => "cohere",
        }
    }
}

/// Request to rank documents against a query.
#[derive(Debug, Clone)]
pub struct RerankApiRequest {
    pub model: RerankModel,
    pub query: String,
    pub documents: Vec<String>,
    pub attribution: Attribution,
}

impl RerankApiRequest {
    pub fn new(
        model: RerankModel,
        query: impl Into<String>,
        documents: Vec<String>,
        attribution: Attribution,
    ) -> Self {
        Self {
            model,
            query: query.into(),
            documents,
            attribution,
        }
    }
}

/// One ranked document as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankHit {
    /// Index into the request's `documents`.
    pub index: usize,
    pub relevance_score: f64,
}

/// Response from a rerank request.
#[derive(Debug, Clone)]
pub struct RerankApiResponse {
    /// Hits in provider order (descending relevance).
    pub results: Vec<RerankHit>,
    /// Billed search units, when reported.
    pub search_units: u32,
    pub cost_nanodollars: i64,
    pub latency: Duration,
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat model specification.
#[derive(Debug, Clone)]
pub enum ChatModel {
    /// OpenRouter model, e.g. "anthropic/claude-3-haiku"
    OpenRouter(String),
}

impl ChatModel {
    pub fn openrouter(model_id: impl Into<String>) -> Self {
        ChatModel::OpenRouter(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::OpenRouter(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::OpenRouter(_) => "openrouter",
        }
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use.
    pub model: ChatModel,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Attribution for cost tracking.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated content.
    pub content: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Cost in nanodollars.
    pub cost_nanodollars: i64,
    /// Provider-reported upstream inference cost (nanodollars), if available.
    ///
    /// For OpenRouter this is derived from `usage.cost_details.upstream_inference_cost`.
    pub upstream_cost_nanodollars: Option<i64>,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Convenience constructor for in-process gateways (tests, dry runs).
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_builder_defaults_to_zero_temperature() {
        let req = ChatRequest::new(
            ChatModel::openrouter("anthropic/claude-3-haiku"),
            vec![Message::user("hi")],
            Attribution::new("test"),
        );
        assert_eq!(req.temperature, 0.0);
        assert!(req.max_tokens.is_none());

        let req = req.temperature(0.7).max_tokens(100);
        assert_eq!(req.temperature, 0.7);
        assert_eq!(req.max_tokens, Some(100));
    }

    #[test]
    fn finish_reason_maps_unknown_strings() {
        assert_eq!(FinishReason::from(Some("stop".into())), FinishReason::Stop);
        assert_eq!(
            FinishReason::from(Some("eos".into())),
            FinishReason::Unknown("eos".into())
        );
        assert_eq!(FinishReason::from(None), FinishReason::Unknown("none".into()));
    }

    #[test]
    fn attribution_carries_run_id() {
        let run = Uuid::new_v4();
        let attr = Attribution::new("judge::minto").with_run(run);
        assert_eq!(attr.caller, "judge::minto");
        assert_eq!(attr.run_id, Some(run));
    }
}
