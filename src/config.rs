//! Run configuration: what to optimize and how.
//!
//! Loaded from a JSON request file (every field but `initial_prompt` has a
//! default) and overridden field by field from the CLI. Credentials never
//! live here; they come from the environment.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{ScaleTable, ScoringPlan};
use crate::evaluators::EvaluatorId;
use crate::gateway::GatewayConfig;
use crate::generator::{SamplingParams, DEFAULT_MODEL};

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_RERANK_MODEL: &str = "rerank-english-v3.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankerKind {
    #[default]
    Cohere,
    Embedding,
    None,
}

impl RerankerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RerankerKind::Cohere => "cohere",
            RerankerKind::Embedding => "embedding",
            RerankerKind::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Prompt the run starts from; also the "original intent" for diagnosis.
    pub initial_prompt: String,
    /// Optional gold output for reference-based evaluators.
    #[serde(default)]
    pub reference_output: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_variant_count")]
    pub variant_count: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    /// Evaluators for incumbent scoring. Unset picks a default by whether a
    /// reference is present.
    #[serde(default)]
    pub initial_evaluators: Option<Vec<EvaluatorId>>,
    /// Evaluators for variant scoring; same default rule.
    #[serde(default)]
    pub refinement_evaluators: Option<Vec<EvaluatorId>>,
    /// Rescale factor overrides.
    #[serde(default)]
    pub rescale: BTreeMap<EvaluatorId, f64>,
    #[serde(default)]
    pub generator: SamplingParams,
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    #[serde(default = "default_judge_max_tokens")]
    pub judge_max_tokens: u32,
    #[serde(default = "default_diagnosis")]
    pub diagnosis: SamplingParams,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub reranker: RerankerKind,
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_iterations() -> usize {
    3
}
fn default_variant_count() -> usize {
    3
}
fn default_score_threshold() -> f64 {
    9.0
}
fn default_judge_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_judge_max_tokens() -> u32 {
    400
}
fn default_diagnosis() -> SamplingParams {
    SamplingParams {
        model: DEFAULT_MODEL.to_string(),
        temperature: 0.5,
        max_tokens: 600,
    }
}
fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}
fn default_rerank_model() -> String {
    DEFAULT_RERANK_MODEL.to_string()
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}

impl RunConfig {
    pub fn new(initial_prompt: impl Into<String>) -> Self {
        Self {
            initial_prompt: initial_prompt.into(),
            reference_output: None,
            max_iterations: default_max_iterations(),
            variant_count: default_variant_count(),
            score_threshold: default_score_threshold(),
            initial_evaluators: None,
            refinement_evaluators: None,
            rescale: BTreeMap::new(),
            generator: SamplingParams::default(),
            judge_model: default_judge_model(),
            judge_max_tokens: default_judge_max_tokens(),
            diagnosis: default_diagnosis(),
            embedding_model: default_embedding_model(),
            reranker: RerankerKind::default(),
            rerank_model: default_rerank_model(),
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_output = Some(reference.into());
        self
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// A reference output counts only when it has non-whitespace content.
    pub fn reference(&self) -> Option<&str> {
        self.reference_output
            .as_deref()
            .filter(|r| !r.trim().is_empty())
    }

    pub fn default_evaluators(&self) -> Vec<EvaluatorId> {
        if self.reference().is_some() {
            vec![EvaluatorId::ReferenceJudge, EvaluatorId::EmbeddingSimilarity]
        } else {
            vec![EvaluatorId::MintoJudge, EvaluatorId::FeynmanJudge]
        }
    }

    pub fn initial_evaluator_ids(&self) -> Vec<EvaluatorId> {
        self.initial_evaluators
            .clone()
            .unwrap_or_else(|| self.default_evaluators())
    }

    pub fn refinement_evaluator_ids(&self) -> Vec<EvaluatorId> {
        self.refinement_evaluators
            .clone()
            .unwrap_or_else(|| self.default_evaluators())
    }

    pub fn initial_plan(&self) -> Result<ScoringPlan, ConfigError> {
        self.plan_for(self.initial_evaluator_ids(), "initial_evaluators")
    }

    pub fn refinement_plan(&self) -> Result<ScoringPlan, ConfigError> {
        self.plan_for(self.refinement_evaluator_ids(), "refinement_evaluators")
    }

    fn plan_for(&self, ids: Vec<EvaluatorId>, field: &str) -> Result<ScoringPlan, ConfigError> {
        let scales = ScaleTable::with_overrides(&self.rescale)
            .map_err(|e| ConfigError::Invalid(format!("rescale: {e}")))?;
        ScoringPlan::new(ids, scales).map_err(|e| ConfigError::Invalid(format!("{field}: {e}")))
    }

    /// Every evaluator either plan uses, deduplicated, in first-seen order.
    pub fn all_evaluator_ids(&self) -> Vec<EvaluatorId> {
        let mut ids = self.initial_evaluator_ids();
        for id in self.refinement_evaluator_ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            attempt_timeout: Some(self.call_timeout()),
        }
    }

    /// Whether any configured component needs the embeddings provider.
    pub fn needs_embeddings(&self) -> bool {
        self.reranker == RerankerKind::Embedding
            || self
                .all_evaluator_ids()
                .contains(&EvaluatorId::EmbeddingSimilarity)
    }

    /// Check everything that can be checked without a network call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.initial_prompt.trim().is_empty() {
            return invalid("initial_prompt must not be empty".into());
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".into());
        }
        if !self.score_threshold.is_finite() || !(0.0..=10.0).contains(&self.score_threshold) {
            return invalid(format!(
                "score_threshold must be within [0, 10], got {}",
                self.score_threshold
            ));
        }
        if self.call_timeout_secs == 0 {
            return invalid("call_timeout_secs must be positive".into());
        }
        for (name, params) in [("generator", &self.generator), ("diagnosis", &self.diagnosis)] {
            if !params.temperature.is_finite() || !(0.0..=2.0).contains(&params.temperature) {
                return invalid(format!(
                    "{name}.temperature must be within [0, 2], got {}",
                    params.temperature
                ));
            }
            if params.model.trim().is_empty() {
                return invalid(format!("{name}.model must not be empty"));
            }
        }

        self.initial_plan()?;
        self.refinement_plan()?;

        if self.reference().is_none() {
            if let Some(id) = self.all_evaluator_ids().into_iter().find(|id| id.needs_reference()) {
                return invalid(format!("evaluator {id} needs reference_output"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_gets_defaults() {
        let cfg: RunConfig =
            serde_json::from_str(r#"{"initial_prompt": "Write an ad for earbuds"}"#).unwrap();
        assert_eq!(cfg, RunConfig::new("Write an ad for earbuds"));
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.variant_count, 3);
        assert_eq!(cfg.score_threshold, 9.0);
        assert_eq!(cfg.generator.temperature, 0.7);
        assert_eq!(cfg.diagnosis.max_tokens, 600);
        assert_eq!(cfg.reranker, RerankerKind::Cohere);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn call_timeout_bounds_each_gateway_attempt() {
        let mut cfg = RunConfig::new("p");
        cfg.call_timeout_secs = 45;
        cfg.max_retries = 4;
        let gateway = cfg.gateway_config();
        assert_eq!(gateway.attempt_timeout, Some(Duration::from_secs(45)));
        assert_eq!(gateway.max_retries, 4);
    }

    #[test]
    fn default_evaluators_follow_reference_presence() {
        let cfg = RunConfig::new("p");
        assert_eq!(
            cfg.initial_evaluator_ids(),
            vec![EvaluatorId::MintoJudge, EvaluatorId::FeynmanJudge]
        );
        assert!(!cfg.needs_embeddings());

        let cfg = cfg.with_reference("gold");
        assert_eq!(
            cfg.refinement_evaluator_ids(),
            vec![EvaluatorId::ReferenceJudge, EvaluatorId::EmbeddingSimilarity]
        );
        assert!(cfg.needs_embeddings());

        let blank = RunConfig::new("p").with_reference("  ");
        assert!(blank.reference().is_none());
    }

    #[test]
    fn evaluator_ids_parse_from_json() {
        let cfg: RunConfig = serde_json::from_str(
            r#"{"initial_prompt": "p", "reference_output": "r",
                "initial_evaluators": ["rouge_l", "bleu"], "rescale": {"bleu": 20.0},
                "reranker": "embedding"}"#,
        )
        .unwrap();
        let plan = cfg.initial_plan().unwrap();
        assert_eq!(plan.evaluators(), &[EvaluatorId::RougeL, EvaluatorId::Bleu]);
        assert_eq!(plan.scales().factor(EvaluatorId::Bleu), 20.0);
        assert_eq!(cfg.reranker, RerankerKind::Embedding);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let base = RunConfig::new("p");

        let mut c = base.clone();
        c.initial_prompt = " ".into();
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.max_iterations = 0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.score_threshold = 10.5;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.initial_evaluators = Some(vec![]);
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.refinement_evaluators = Some(vec![EvaluatorId::Bleu, EvaluatorId::Bleu]);
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.initial_evaluators = Some(vec![EvaluatorId::RougeL]);
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("rouge_l"), "{err}");

        let mut c = base.clone();
        c.rescale.insert(EvaluatorId::MintoJudge, -1.0);
        assert!(c.validate().is_err());

        let mut c = base;
        c.generator.temperature = 2.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn variant_count_zero_is_valid() {
        let mut c = RunConfig::new("p");
        c.variant_count = 0;
        assert!(c.validate().is_ok());
    }
}
