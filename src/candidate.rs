//! Scored candidates: a generated output plus everything that produced it.

use serde::{Deserialize, Serialize};

use crate::aggregate::ScoringPlan;
use crate::evaluators::ScoreCard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Output of the prompt that was current when the iteration started.
    Incumbent,
    /// Output of the `ordinal`-th (1-based) refinement variant.
    Variant { ordinal: usize },
    /// The incumbent handed back by a refinement that produced no variants.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub prompt: String,
    pub output: String,
    /// 1-based iteration that produced this candidate.
    pub iteration: usize,
    pub origin: CandidateOrigin,
    pub scores: ScoreCard,
    pub aggregate: f64,
    /// Judge explanations and fail-soft error notes, one `id: text` line each.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Candidate {
    pub fn new(
        prompt: impl Into<String>,
        output: impl Into<String>,
        iteration: usize,
        origin: CandidateOrigin,
        scores: ScoreCard,
        plan: &ScoringPlan,
    ) -> Self {
        let aggregate = plan.aggregate(&scores);
        let rationale = rationale_from(&scores);
        Self {
            prompt: prompt.into(),
            output: output.into(),
            iteration,
            origin,
            scores,
            aggregate,
            rationale,
        }
    }

    /// Copy with a different origin; scores are untouched.
    pub fn relabel(&self, origin: CandidateOrigin) -> Self {
        Self {
            origin,
            ..self.clone()
        }
    }

    /// Aggregate re-derived from the stored scores.
    pub fn rescore(&self, plan: &ScoringPlan) -> f64 {
        plan.aggregate(&self.scores)
    }

    /// One line per evaluator: `id: value` plus the judge's explanation when present.
    pub fn feedback_summary(&self) -> String {
        self.scores
            .iter()
            .map(|(id, j)| {
                let mut line = format!("{id}: {:.2}", j.value);
                if j.failed {
                    line.push_str(" (failed)");
                }
                if let Some(expl) = j.explanation.as_deref().filter(|e| !e.trim().is_empty()) {
                    line.push_str(" - ");
                    line.push_str(&expl.replace('\n', " "));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn ordinal(&self) -> Option<usize> {
        match self.origin {
            CandidateOrigin::Variant { ordinal } => Some(ordinal),
            _ => None,
        }
    }
}

fn rationale_from(scores: &ScoreCard) -> Option<String> {
    let lines: Vec<String> = scores
        .iter()
        .filter_map(|(id, j)| {
            let text = j.explanation.as_deref()?.trim();
            (!text.is_empty()).then(|| format!("{id}: {text}"))
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}
