//! Combining heterogeneous evaluator outputs into one 0-10 score.
//!
//! Each evaluator reports in its own native range. A [`ScaleTable`] maps
//! native values onto 0-10 with a fixed multiplicative factor per evaluator,
//! and a [`ScoringPlan`] names which evaluators participate. The aggregate is
//! the arithmetic mean of the rescaled values of the plan's evaluators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluators::{EvaluatorId, Judgment};

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("scoring plan needs at least one evaluator")]
    EmptyEvaluatorSet,
    #[error("evaluator {0} listed twice")]
    DuplicateEvaluator(EvaluatorId),
    #[error("rescale factor for {evaluator} must be finite and positive, got {factor}")]
    InvalidScale { evaluator: EvaluatorId, factor: f64 },
}

/// Rescale factor per evaluator. Fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleTable(BTreeMap<EvaluatorId, f64>);

impl Default for ScaleTable {
    fn default() -> Self {
        Self(
            EvaluatorId::ALL
                .iter()
                .map(|id| (*id, id.default_rescale()))
                .collect(),
        )
    }
}

impl ScaleTable {
    /// Defaults with `overrides` applied on top.
    pub fn with_overrides(overrides: &BTreeMap<EvaluatorId, f64>) -> Result<Self, PlanError> {
        let mut table = Self::default();
        for (&evaluator, &factor) in overrides {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(PlanError::InvalidScale { evaluator, factor });
            }
            table.0.insert(evaluator, factor);
        }
        Ok(table)
    }

    pub fn factor(&self, id: EvaluatorId) -> f64 {
        self.0
            .get(&id)
            .copied()
            .unwrap_or_else(|| id.default_rescale())
    }

    /// Native value to 0-10. Non-finite input counts as 0.
    pub fn rescale(&self, id: EvaluatorId, native: f64) -> f64 {
        if !native.is_finite() {
            return SCORE_MIN;
        }
        (native * self.factor(id)).clamp(SCORE_MIN, SCORE_MAX)
    }
}

/// The active evaluator set plus its scale table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringPlan {
    evaluators: Vec<EvaluatorId>,
    scales: ScaleTable,
}

impl ScoringPlan {
    pub fn new(evaluators: Vec<EvaluatorId>, scales: ScaleTable) -> Result<Self, PlanError> {
        if evaluators.is_empty() {
            return Err(PlanError::EmptyEvaluatorSet);
        }
        for (i, id) in evaluators.iter().enumerate() {
            if evaluators[..i].contains(id) {
                return Err(PlanError::DuplicateEvaluator(*id));
            }
        }
        Ok(Self { evaluators, scales })
    }

    pub fn evaluators(&self) -> &[EvaluatorId] {
        &self.evaluators
    }

    pub fn scales(&self) -> &ScaleTable {
        &self.scales
    }

    pub fn needs_reference(&self) -> bool {
        self.evaluators.iter().any(|id| id.needs_reference())
    }

    pub fn aggregate(&self, scores: &BTreeMap<EvaluatorId, Judgment>) -> f64 {
        aggregate(self, scores)
    }
}

/// Mean of the plan's rescaled scores, in [0, 10].
///
/// A plan evaluator with no entry in `scores` contributes 0, the same value a
/// failed evaluator reports. Scores from evaluators outside the plan are ignored.
pub fn aggregate(plan: &ScoringPlan, scores: &BTreeMap<EvaluatorId, Judgment>) -> f64 {
    let total: f64 = plan
        .evaluators
        .iter()
        .map(|id| {
            scores
                .get(id)
                .map(|j| plan.scales.rescale(*id, j.value))
                .unwrap_or(SCORE_MIN)
        })
        .sum();
    (total / plan.evaluators.len() as f64).clamp(SCORE_MIN, SCORE_MAX)
}
