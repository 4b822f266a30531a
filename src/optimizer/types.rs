use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::candidate::{Candidate, CandidateOrigin};
use crate::config::{ConfigError, RunConfig};
use crate::evaluators::{EvaluatorError, RerankError, ScoreCard};
use crate::gateway::{ProviderError, UsageTotals};
use crate::refine::{RefineError, RefinementOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ThresholdMet,
    NoImprovement,
    MaxIterations,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::ThresholdMet => "threshold_met",
            StopReason::NoImprovement => "no_improvement",
            StopReason::MaxIterations => "max_iterations",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// What refinement did in one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementSummary {
    pub diagnosis: String,
    pub variants: Vec<Candidate>,
    /// Ordinal of the best variant; `None` when no variant was evaluated.
    pub chosen_ordinal: Option<usize>,
    pub chosen_score: f64,
    pub adopted: bool,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RefinementSummary {
    pub fn from_outcome(outcome: &RefinementOutcome, adopted: bool) -> Self {
        Self {
            diagnosis: outcome.diagnosis.clone(),
            variants: outcome.variants.clone(),
            chosen_ordinal: outcome.winner.ordinal(),
            chosen_score: outcome.winner.aggregate,
            adopted,
            degraded: outcome.degraded,
            note: outcome.note.clone(),
        }
    }

    pub fn best_variant(&self) -> Option<&Candidate> {
        let ordinal = self.chosen_ordinal?;
        self.variants
            .iter()
            .find(|v| v.origin == CandidateOrigin::Variant { ordinal })
    }
}

/// Append-only snapshot of one completed iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub prompt: String,
    pub output: String,
    pub scores: ScoreCard,
    pub aggregate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<RefinementSummary>,
}

impl IterationRecord {
    pub fn new(incumbent: &Candidate, refinement: Option<RefinementSummary>) -> Self {
        Self {
            iteration: incumbent.iteration,
            prompt: incumbent.prompt.clone(),
            output: incumbent.output.clone(),
            scores: incumbent.scores.clone(),
            aggregate: incumbent.aggregate,
            rationale: incumbent.rationale.clone(),
            refinement,
        }
    }
}

/// One entry of the final ranking; a view into the rerank queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub queue_index: usize,
    /// Reranker relevance in [0, 1]; absent for aggregate-score rankings.
    pub relevance: Option<f64>,
    pub aggregate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMethod {
    /// Queue was empty; the last candidate is the result.
    Unranked,
    Reranker,
    AggregateScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub run_id: Uuid,
    pub created_at: String,
    pub config: RunConfig,
    pub config_hash: String,
    pub stop_reason: StopReason,
    pub iterations_completed: usize,
    pub best_combined_score: f64,
    /// Prompt that was current when the loop stopped.
    pub final_prompt: String,
    pub history: Vec<IterationRecord>,
    pub rerank_queue: Vec<Candidate>,
    pub final_ranking: Vec<RankedCandidate>,
    pub ranking_method: RankingMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranker: Option<String>,
    /// True when the reranker failed and aggregate scores ranked the queue.
    #[serde(default)]
    pub rerank_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_error: Option<String>,
    pub winner: Candidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    pub latency_ms: u128,
}

impl OptimizationReport {
    /// Queue entries in final-ranking order.
    pub fn ranked_candidates(&self) -> impl Iterator<Item = (&RankedCandidate, &Candidate)> {
        self.final_ranking
            .iter()
            .filter_map(|r| self.rerank_queue.get(r.queue_index).map(|c| (r, c)))
    }
}

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("generation failed in iteration {iteration}: {source}")]
    Generation {
        iteration: usize,
        prompt: String,
        #[source]
        source: ProviderError,
    },
    #[error("scoring failed in iteration {iteration}: {source}")]
    Evaluator {
        iteration: usize,
        #[source]
        source: EvaluatorError,
    },
    #[error("refinement failed in iteration {iteration}: {source}")]
    Refinement {
        iteration: usize,
        #[source]
        source: RefineError,
    },
    #[error("final rerank failed: {0}")]
    Rerank(#[source] RerankError),
}

impl OptimizeError {
    /// Iteration the error happened in, when it happened inside the loop.
    pub fn iteration(&self) -> Option<usize> {
        match self {
            OptimizeError::Generation { iteration, .. }
            | OptimizeError::Evaluator { iteration, .. }
            | OptimizeError::Refinement { iteration, .. } => Some(*iteration),
            OptimizeError::InvalidConfig(_) | OptimizeError::Rerank(_) => None,
        }
    }
}
