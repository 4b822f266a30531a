//! Embedding cosine similarity between a candidate and the reference.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{soften, Evaluator, EvaluatorError, EvaluatorId, Judgment};
use crate::gateway::{Attribution, EmbedGateway, EmbedModel, EmbedRequest, ProviderError};

/// Cosine similarity; 0 when either vector has zero norm or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub struct EmbeddingSimilarity {
    gateway: Arc<dyn EmbedGateway>,
    model: EmbedModel,
    run_id: Option<Uuid>,
}

impl EmbeddingSimilarity {
    pub fn new(gateway: Arc<dyn EmbedGateway>, model: impl Into<String>, run_id: Option<Uuid>) -> Self {
        Self {
            gateway,
            model: EmbedModel::openai(model),
            run_id,
        }
    }
}

#[async_trait]
impl Evaluator for EmbeddingSimilarity {
    fn id(&self) -> EvaluatorId {
        EvaluatorId::EmbeddingSimilarity
    }

    async fn score(
        &self,
        candidate: &str,
        reference_or_query: &str,
    ) -> Result<Judgment, EvaluatorError> {
        if candidate.trim().is_empty() || reference_or_query.trim().is_empty() {
            return Ok(Judgment::scored(0.0, Some("empty text".to_string())));
        }

        let mut attribution = Attribution::new("evaluator::embedding_similarity");
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        let req = EmbedRequest::new(
            self.model.clone(),
            vec![candidate.to_string(), reference_or_query.to_string()],
            attribution,
        );

        let resp = match self.gateway.embed(req).await {
            Ok(resp) => resp,
            Err(err) => return soften(self.id(), err),
        };

        match resp.embeddings.as_slice() {
            [a, b] => Ok(Judgment::scored(
                cosine_similarity(a, b).clamp(0.0, 1.0),
                None,
            )),
            other => soften(
                self.id(),
                ProviderError::provider(
                    "openai",
                    format!("expected 2 embeddings, got {}", other.len()),
                    false,
                ),
            ),
        }
    }
}
