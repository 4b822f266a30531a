//! Evaluators: everything that turns a candidate output into a number.
//!
//! Each scoring provider (lexical metric, embedding similarity, LLM judge)
//! sits behind the [`Evaluator`] trait and returns a [`Judgment`] in its own
//! native range. Turning native values into one comparable score is the
//! aggregator's job, not the evaluator's.
//!
//! Failure policy: transient provider failures and unparseable judge replies
//! come back as `Ok(Judgment::failed(..))` with value 0. Only errors that no
//! retry could fix (missing key, rejected credentials, unknown model) surface
//! as [`EvaluatorError::Fatal`].

pub mod embedding;
pub mod judge;
pub mod lexical;
pub mod panel;
pub mod rerank;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::gateway::ProviderError;

pub use embedding::{cosine_similarity, EmbeddingSimilarity};
pub use judge::{parse_judge_score, JudgeSettings, LlmJudge, JUDGE_TEMPERATURE};
pub use lexical::{LexicalEvaluator, LexicalMetric, LexicalScores};
pub use panel::{EvaluatorPanel, ScoreCard, ScoringContext};
pub use rerank::{
    validate_ranking, CohereReranker, EmbeddingReranker, RankedDocument, RerankError, Reranker,
};

/// Stable identifier for each evaluator; the wire form is snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EvaluatorId {
    #[serde(rename = "minto_judge")]
    MintoJudge,
    #[serde(rename = "feynman_judge")]
    FeynmanJudge,
    #[serde(rename = "reference_judge")]
    ReferenceJudge,
    #[serde(rename = "rouge_1")]
    Rouge1,
    #[serde(rename = "rouge_2")]
    Rouge2,
    #[serde(rename = "rouge_l")]
    RougeL,
    #[serde(rename = "bleu")]
    Bleu,
    #[serde(rename = "embedding_similarity")]
    EmbeddingSimilarity,
}

impl EvaluatorId {
    pub const ALL: [EvaluatorId; 8] = [
        EvaluatorId::MintoJudge,
        EvaluatorId::FeynmanJudge,
        EvaluatorId::ReferenceJudge,
        EvaluatorId::Rouge1,
        EvaluatorId::Rouge2,
        EvaluatorId::RougeL,
        EvaluatorId::Bleu,
        EvaluatorId::EmbeddingSimilarity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorId::MintoJudge => "minto_judge",
            EvaluatorId::FeynmanJudge => "feynman_judge",
            EvaluatorId::ReferenceJudge => "reference_judge",
            EvaluatorId::Rouge1 => "rouge_1",
            EvaluatorId::Rouge2 => "rouge_2",
            EvaluatorId::RougeL => "rouge_l",
            EvaluatorId::Bleu => "bleu",
            EvaluatorId::EmbeddingSimilarity => "embedding_similarity",
        }
    }

    /// Whether the evaluator compares against a reference output rather than
    /// the original prompt.
    pub fn needs_reference(&self) -> bool {
        !matches!(self, EvaluatorId::MintoJudge | EvaluatorId::FeynmanJudge)
    }

    pub fn is_llm_judge(&self) -> bool {
        matches!(
            self,
            EvaluatorId::MintoJudge | EvaluatorId::FeynmanJudge | EvaluatorId::ReferenceJudge
        )
    }

    /// Upper bound of the native range (lower bound is always 0).
    pub fn native_max(&self) -> f64 {
        if self.is_llm_judge() {
            10.0
        } else {
            1.0
        }
    }

    /// Factor that maps the native range onto 0-10.
    pub fn default_rescale(&self) -> f64 {
        10.0 / self.native_max()
    }
}

impl fmt::Display for EvaluatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluatorId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        EvaluatorId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == needle)
            .ok_or_else(|| {
                let known: Vec<_> = EvaluatorId::ALL.iter().map(|id| id.as_str()).collect();
                format!("unknown evaluator '{s}'; expected one of {}", known.join(", "))
            })
    }
}

/// One evaluator's verdict on one candidate, in the evaluator's native range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// True when the value is the fail-soft default rather than a real score.
    #[serde(default)]
    pub failed: bool,
}

impl Judgment {
    pub fn scored(value: f64, explanation: Option<String>) -> Self {
        Self {
            value,
            explanation,
            failed: false,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            value: 0.0,
            explanation: Some(reason.into()),
            failed: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluator {evaluator} cannot run: {source}")]
    Fatal {
        evaluator: EvaluatorId,
        #[source]
        source: ProviderError,
    },
}

/// Scores one candidate against either the reference output or, for
/// reference-free judges, the original prompt.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn id(&self) -> EvaluatorId;

    async fn score(
        &self,
        candidate: &str,
        reference_or_query: &str,
    ) -> Result<Judgment, EvaluatorError>;
}

/// Apply the failure policy to a provider error.
pub(crate) fn soften(evaluator: EvaluatorId, err: ProviderError) -> Result<Judgment, EvaluatorError> {
    if err.is_fatal() {
        return Err(EvaluatorError::Fatal {
            evaluator,
            source: err,
        });
    }
    warn!(evaluator = %evaluator, error = %err, "evaluator call failed; scoring 0");
    Ok(Judgment::failed(format!("{}: {err}", err.code())))
}
