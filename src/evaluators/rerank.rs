//! List-wise relevance ranking used for the final cross-iteration pass.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::embedding::cosine_similarity;
use crate::gateway::{
    Attribution, EmbedGateway, EmbedModel, EmbedRequest, ProviderError,
    RerankApiRequest, RerankGateway, RerankModel,
};

/// One document's relevance to the query. `index` points into the input list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub index: usize,
    pub relevance: f64,
}

#[derive(Debug, Error)]
pub enum RerankError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("invalid ranking: {0}")]
    InvalidRanking(String),
}

impl RerankError {
    pub fn is_fatal(&self) -> bool {
        match self {
            RerankError::Provider(e) => e.is_fatal(),
            RerankError::InvalidRanking(_) => false,
        }
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rank every document against `query`. The result holds exactly one
    /// entry per document, relevance in [0, 1], sorted best first.
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RankedDocument>, RerankError>;
}

/// Check that `hits` is a permutation of `0..n` with relevances in [0, 1],
/// then sort by descending relevance (ties by document index).
pub fn validate_ranking(
    n: usize,
    mut hits: Vec<RankedDocument>,
) -> Result<Vec<RankedDocument>, RerankError> {
    if hits.len() != n {
        return Err(RerankError::InvalidRanking(format!(
            "expected {n} ranked documents, got {}",
            hits.len()
        )));
    }
    let mut seen = HashSet::with_capacity(n);
    for hit in &hits {
        if hit.index >= n {
            return Err(RerankError::InvalidRanking(format!(
                "index {} out of range for {n} documents",
                hit.index
            )));
        }
        if !seen.insert(hit.index) {
            return Err(RerankError::InvalidRanking(format!(
                "document {} ranked twice",
                hit.index
            )));
        }
        if !hit.relevance.is_finite() || !(0.0..=1.0).contains(&hit.relevance) {
            return Err(RerankError::InvalidRanking(format!(
                "relevance {} for document {} is outside [0, 1]",
                hit.relevance, hit.index
            )));
        }
    }
    hits.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then_with(|| a.index.cmp(&b.index))
    });
    Ok(hits)
}

// =============================================================================
// Cohere
// =============================================================================

pub struct CohereReranker {
    gateway: Arc<dyn RerankGateway>,
    model: RerankModel,
    run_id: Option<Uuid>,
}

impl CohereReranker {
    pub fn new(gateway: Arc<dyn RerankGateway>, model: impl Into<String>, run_id: Option<Uuid>) -> Self {
        Self {
            gateway,
            model: RerankModel::cohere(model),
            run_id,
        }
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    fn name(&self) -> &'static str {
        "cohere"
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RankedDocument>, RerankError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let mut attribution = Attribution::new("rerank::cohere");
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        let req = RerankApiRequest::new(self.model.clone(), query, documents.to_vec(), attribution);
        let resp = self.gateway.rerank(req).await?;

        let hits = resp
            .results
            .into_iter()
            .map(|hit| RankedDocument {
                index: hit.index,
                relevance: hit.relevance_score,
            })
            .collect();
        validate_ranking(documents.len(), hits)
    }
}

// =============================================================================
// Embedding
// =============================================================================

/// Ranks documents by cosine similarity to the query, clamped to [0, 1].
pub struct EmbeddingReranker {
    gateway: Arc<dyn EmbedGateway>,
    model: EmbedModel,
    run_id: Option<Uuid>,
}

impl EmbeddingReranker {
    pub fn new(gateway: Arc<dyn EmbedGateway>, model: impl Into<String>, run_id: Option<Uuid>) -> Self {
        Self {
            gateway,
            model: EmbedModel::openai(model),
            run_id,
        }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    fn name(&self) -> &'static str {
        "embedding"
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RankedDocument>, RerankError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let mut attribution = Attribution::new("rerank::embedding");
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        let mut texts = Vec::with_capacity(documents.len() + 1);
        texts.push(query.to_string());
        texts.extend(documents.iter().cloned());

        let req = EmbedRequest::new(self.model.clone(), texts, attribution);
        let resp = self.gateway.embed(req).await?;

        let Some((query_vec, doc_vecs)) = resp.embeddings.split_first() else {
            return Err(RerankError::InvalidRanking("no embeddings returned".into()));
        };
        let hits = doc_vecs
            .iter()
            .enumerate()
            .map(|(index, v)| RankedDocument {
                index,
                relevance: cosine_similarity(query_vec, v).clamp(0.0, 1.0),
            })
            .collect();
        validate_ranking(documents.len(), hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(index: usize, relevance: f64) -> RankedDocument {
        RankedDocument { index, relevance }
    }

    #[test]
    fn valid_ranking_is_sorted_descending() {
        let ranked = validate_ranking(3, vec![doc(0, 0.2), doc(1, 0.9), doc(2, 0.5)]).unwrap();
        let order: Vec<_> = ranked.iter().map(|d| d.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn ties_fall_back_to_document_order() {
        let ranked = validate_ranking(3, vec![doc(2, 0.5), doc(0, 0.5), doc(1, 0.5)]).unwrap();
        let order: Vec<_> = ranked.iter().map(|d| d.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn omissions_duplicates_and_out_of_range_are_rejected() {
        assert!(validate_ranking(2, vec![doc(0, 0.3)]).is_err());
        assert!(validate_ranking(2, vec![doc(0, 0.3), doc(0, 0.4)]).is_err());
        assert!(validate_ranking(2, vec![doc(0, 0.3), doc(2, 0.4)]).is_err());
        assert!(validate_ranking(1, vec![doc(0, 1.2)]).is_err());
        assert!(validate_ranking(1, vec![doc(0, f64::NAN)]).is_err());
    }

    #[test]
    fn invalid_ranking_is_not_fatal() {
        let err = validate_ranking(1, vec![]).unwrap_err();
        assert!(!err.is_fatal());
        let err = RerankError::from(ProviderError::config("COHERE_API_KEY not set"));
        assert!(err.is_fatal());
    }
}
