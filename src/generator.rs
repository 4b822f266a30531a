//! Candidate generation: one chat call per prompt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};

pub const DEFAULT_MODEL: &str = "anthropic/claude-3-haiku";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

pub struct CandidateGenerator {
    gateway: Arc<dyn ChatGateway>,
    params: SamplingParams,
    run_id: Option<Uuid>,
}

impl CandidateGenerator {
    pub fn new(gateway: Arc<dyn ChatGateway>, params: SamplingParams, run_id: Option<Uuid>) -> Self {
        Self {
            gateway,
            params,
            run_id,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Generate with the configured sampling parameters.
    pub async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.generate_with(prompt, &self.params).await
    }

    /// Send `prompt` as a single user message and return the trimmed reply.
    pub async fn generate_with(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, ProviderError> {
        if prompt.trim().is_empty() {
            return Err(ProviderError::invalid_request("prompt is empty"));
        }

        let mut attribution = Attribution::new("generator::generate");
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        let req = ChatRequest::new(
            ChatModel::openrouter(&params.model),
            vec![Message::user(prompt)],
            attribution,
        )
        .temperature(params.temperature)
        .max_tokens(params.max_tokens);

        let resp = self.gateway.chat(req).await?;
        debug!(
            model = %params.model,
            output_tokens = resp.output_tokens,
            latency_ms = resp.latency.as_millis() as u64,
            "generated candidate"
        );
        Ok(resp.content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ChatResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Echo {
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatGateway for Echo {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.seen.lock().unwrap().push(req);
            Ok(ChatResponse::text("\n  Meet the earbuds.  \n"))
        }
    }

    #[tokio::test]
    async fn output_is_trimmed_and_params_forwarded() {
        let gw = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        let generator = CandidateGenerator::new(gw.clone(), SamplingParams::default(), None);
        let out = generator.generate("Write an ad").await.unwrap();
        assert_eq!(out, "Meet the earbuds.");

        let seen = gw.seen.lock().unwrap();
        assert_eq!(seen[0].temperature, 0.7);
        assert_eq!(seen[0].max_tokens, Some(512));
        assert_eq!(seen[0].attribution.caller, "generator::generate");
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_a_call() {
        let gw = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        let generator = CandidateGenerator::new(gw.clone(), SamplingParams::default(), None);
        let err = generator.generate("   ").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(gw.seen.lock().unwrap().is_empty());
    }
}
