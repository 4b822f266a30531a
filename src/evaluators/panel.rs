//! Runs a scoring plan's evaluators against one candidate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;

use super::{Evaluator, EvaluatorError, EvaluatorId, Judgment};
use crate::aggregate::ScoringPlan;

/// Per-evaluator verdicts for one candidate, keyed in stable order.
pub type ScoreCard = BTreeMap<EvaluatorId, Judgment>;

/// What candidates are compared against.
#[derive(Debug, Clone)]
pub struct ScoringContext {
    pub original_prompt: String,
    pub reference: Option<String>,
}

impl ScoringContext {
    pub fn new(original_prompt: impl Into<String>, reference: Option<String>) -> Self {
        Self {
            original_prompt: original_prompt.into(),
            reference,
        }
    }

    /// Reference output for reference-based evaluators, the original prompt
    /// for the rest. `None` when a reference is needed but absent.
    pub fn target_for(&self, id: EvaluatorId) -> Option<&str> {
        if id.needs_reference() {
            self.reference.as_deref()
        } else {
            Some(self.original_prompt.as_str())
        }
    }
}

#[derive(Clone, Default)]
pub struct EvaluatorPanel {
    evaluators: HashMap<EvaluatorId, Arc<dyn Evaluator>>,
}

impl EvaluatorPanel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the evaluator's own id, replacing any earlier entry.
    pub fn insert(&mut self, evaluator: Arc<dyn Evaluator>) {
        self.evaluators.insert(evaluator.id(), evaluator);
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.insert(evaluator);
        self
    }

    pub fn contains(&self, id: EvaluatorId) -> bool {
        self.evaluators.contains_key(&id)
    }

    /// Ids in `plan` that have no registered evaluator.
    pub fn missing(&self, plan: &ScoringPlan) -> Vec<EvaluatorId> {
        plan.evaluators()
            .iter()
            .copied()
            .filter(|id| !self.contains(*id))
            .collect()
    }

    pub fn covers(&self, plan: &ScoringPlan) -> bool {
        self.missing(plan).is_empty()
    }

    /// Score `candidate` with every evaluator in `plan`, concurrently.
    ///
    /// Unregistered evaluators and reference evaluators without a reference
    /// are recorded as failed judgments. The first fatal evaluator error
    /// aborts the whole card.
    pub async fn score_all(
        &self,
        plan: &ScoringPlan,
        candidate: &str,
        ctx: &ScoringContext,
    ) -> Result<ScoreCard, EvaluatorError> {
        let jobs = plan.evaluators().iter().map(|&id| async move {
            let Some(evaluator) = self.evaluators.get(&id) else {
                return Ok((id, Judgment::failed("evaluator not configured")));
            };
            let Some(target) = ctx.target_for(id) else {
                return Ok((id, Judgment::failed("no reference output provided")));
            };
            evaluator.score(candidate, target).await.map(|j| (id, j))
        });

        Ok(try_join_all(jobs).await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ScaleTable;
    use crate::evaluators::{LexicalEvaluator, LexicalMetric};

    #[tokio::test]
    async fn lexical_panel_scores_against_reference() {
        let panel = EvaluatorPanel::new()
            .with_evaluator(Arc::new(LexicalEvaluator::new(LexicalMetric::Rouge1)))
            .with_evaluator(Arc::new(LexicalEvaluator::new(LexicalMetric::RougeL)));
        let plan = ScoringPlan::new(
            vec![EvaluatorId::Rouge1, EvaluatorId::RougeL],
            ScaleTable::default(),
        )
        .unwrap();
        assert!(panel.covers(&plan));

        let ctx = ScoringContext::new("write it", Some("the cat sat".into()));
        let card = panel.score_all(&plan, "the cat sat", &ctx).await.unwrap();
        assert_eq!(card.len(), 2);
        assert_eq!(card[&EvaluatorId::Rouge1].value, 1.0);
        assert_eq!(plan.aggregate(&card), 10.0);
    }

    #[tokio::test]
    async fn missing_evaluator_and_missing_reference_fail_soft() {
        let panel = EvaluatorPanel::new()
            .with_evaluator(Arc::new(LexicalEvaluator::new(LexicalMetric::Bleu)));
        let plan = ScoringPlan::new(
            vec![EvaluatorId::Bleu, EvaluatorId::MintoJudge],
            ScaleTable::default(),
        )
        .unwrap();
        assert_eq!(panel.missing(&plan), vec![EvaluatorId::MintoJudge]);

        let ctx = ScoringContext::new("prompt", None);
        let card = panel.score_all(&plan, "output", &ctx).await.unwrap();
        assert!(card[&EvaluatorId::Bleu].failed);
        assert!(card[&EvaluatorId::MintoJudge].failed);
        assert_eq!(plan.aggregate(&card), 0.0);
    }

    #[test]
    fn target_depends_on_reference_need() {
        let ctx = ScoringContext::new("prompt", Some("ref".into()));
        assert_eq!(ctx.target_for(EvaluatorId::MintoJudge), Some("prompt"));
        assert_eq!(ctx.target_for(EvaluatorId::ReferenceJudge), Some("ref"));
    }
}
