//! Diagnose-and-mutate refinement of a single prompt.
//!
//! One refinement step:
//! 1. **Diagnose**: a chat call names what limits the current prompt and
//!    proposes numbered replacement prompts.
//! 2. **Parse**: [`parse_variants`] splits the reply into diagnosis text and
//!    up to `variant_count` variants.
//! 3. **Evaluate**: each variant is generated and scored with the refinement
//!    plan, concurrently, results kept in ordinal order.
//! 4. **Select**: strictly highest aggregate wins, ties to the lowest ordinal.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::ScoringPlan;
use crate::candidate::{Candidate, CandidateOrigin};
use crate::evaluators::{EvaluatorError, EvaluatorPanel, ScoringContext};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::generator::{CandidateGenerator, SamplingParams};
use crate::prompts::DIAGNOSE_V1;

#[derive(Debug, Error)]
pub enum RefineError {
    #[error("generation failed for variant {ordinal}: {source}")]
    Generation {
        ordinal: usize,
        prompt: String,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),
    #[error("diagnosis call failed: {0}")]
    Diagnosis(#[source] ProviderError),
}

// =============================================================================
// Parsing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDiagnosis {
    pub diagnosis: String,
    pub variants: Vec<String>,
}

fn is_variants_header(line: &str) -> bool {
    line.trim()
        .trim_matches(|c: char| c == '*' || c == '#' || c.is_whitespace())
        .eq_ignore_ascii_case("variants:")
}

/// Length of the `k.` prefix (1 ≤ k ≤ n) that `line` starts with, if any.
fn variant_prefix_len(line: &str, n: usize) -> Option<usize> {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || line.as_bytes().get(digits) != Some(&b'.') {
        return None;
    }
    let k: usize = line[..digits].parse().ok()?;
    (1..=n).contains(&k).then_some(digits + 1)
}

fn clean_variant(text: &str) -> String {
    let mut s = text.trim();
    loop {
        let before = s;
        for wrap in ["**", "__"] {
            s = s.strip_prefix(wrap).unwrap_or(s);
            s = s.strip_suffix(wrap).unwrap_or(s);
        }
        s = s
            .trim_matches(|c| matches!(c, '"' | '\u{201c}' | '\u{201d}' | '`'))
            .trim();
        if s == before {
            return s.to_string();
        }
    }
}

/// Split a diagnosis reply into the diagnosis text and up to `n` variants.
///
/// If a `VARIANTS:` header line exists, scanning starts after it. Variant
/// mode begins at the first line starting with one of `1.` to `n.` and lasts
/// for the rest of the text; every such line yields a variant. Lines before
/// variant mode (minus the header) form the diagnosis.
pub fn parse_variants(text: &str, n: usize) -> ParsedDiagnosis {
    let lines: Vec<&str> = text.lines().collect();
    let header = lines.iter().position(|l| is_variants_header(l));

    let mut diagnosis: Vec<&str> = match header {
        Some(h) => lines[..h].to_vec(),
        None => Vec::new(),
    };
    let start = header.map_or(0, |h| h + 1);

    let mut variants = Vec::new();
    let mut in_variants = false;
    for line in &lines[start..] {
        let trimmed = line.trim();
        match variant_prefix_len(trimmed, n) {
            Some(len) => {
                in_variants = true;
                let variant = clean_variant(&trimmed[len..]);
                if !variant.is_empty() && variants.len() < n {
                    variants.push(variant);
                }
            }
            None if !in_variants => diagnosis.push(*line),
            None => {}
        }
    }

    ParsedDiagnosis {
        diagnosis: diagnosis.join("\n").trim().to_string(),
        variants,
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone)]
pub struct RefineSettings {
    pub diagnosis: SamplingParams,
    pub variant_count: usize,
    pub run_id: Option<Uuid>,
}

/// What a refinement step starts from.
#[derive(Debug, Clone, Copy)]
pub struct RefineInput<'a> {
    pub iteration: usize,
    pub current_prompt: &'a str,
    pub incumbent: &'a Candidate,
    pub original_intent: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementOutcome {
    pub diagnosis: String,
    /// Scored variants in ordinal order.
    pub variants: Vec<Candidate>,
    pub winner: Candidate,
    /// True when no variant was evaluated and the incumbent came back unchanged.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RefinementOutcome {
    fn unchanged(incumbent: &Candidate, diagnosis: String, note: impl Into<String>) -> Self {
        Self {
            diagnosis,
            variants: Vec::new(),
            winner: incumbent.relabel(CandidateOrigin::Unchanged),
            degraded: true,
            note: Some(note.into()),
        }
    }
}

pub struct Refiner {
    gateway: Arc<dyn ChatGateway>,
    generator: Arc<CandidateGenerator>,
    panel: EvaluatorPanel,
    plan: ScoringPlan,
    context: ScoringContext,
    settings: RefineSettings,
}

impl Refiner {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        generator: Arc<CandidateGenerator>,
        panel: EvaluatorPanel,
        plan: ScoringPlan,
        context: ScoringContext,
        settings: RefineSettings,
    ) -> Self {
        Self {
            gateway,
            generator,
            panel,
            plan,
            context,
            settings,
        }
    }

    pub fn plan(&self) -> &ScoringPlan {
        &self.plan
    }

    pub async fn refine(&self, input: RefineInput<'_>) -> Result<RefinementOutcome, RefineError> {
        let n = self.settings.variant_count;
        if n == 0 {
            return Ok(RefinementOutcome::unchanged(
                input.incumbent,
                String::new(),
                "variant_count is 0",
            ));
        }

        let reply = match self.diagnose(&input).await {
            Ok(reply) => reply,
            Err(err) if err.is_fatal() => return Err(RefineError::Diagnosis(err)),
            Err(err) => {
                warn!(iteration = input.iteration, error = %err, "diagnosis failed; keeping prompt");
                return Ok(RefinementOutcome::unchanged(
                    input.incumbent,
                    String::new(),
                    format!("diagnosis failed: {}", err.code()),
                ));
            }
        };

        let parsed = parse_variants(&reply, n);
        if parsed.variants.is_empty() {
            warn!(iteration = input.iteration, "diagnosis produced no variants; keeping prompt");
            return Ok(RefinementOutcome::unchanged(
                input.incumbent,
                parsed.diagnosis,
                "no variants parsed from diagnosis",
            ));
        }
        debug!(
            iteration = input.iteration,
            variants = parsed.variants.len(),
            "parsed refinement variants"
        );

        let variants: Vec<Candidate> = stream::iter(parsed.variants.iter().enumerate())
            .map(|(i, prompt)| self.evaluate_variant(input.iteration, i + 1, prompt))
            .buffered(n)
            .try_collect()
            .await?;

        let winner = select_winner(&variants)
            .cloned()
            .unwrap_or_else(|| input.incumbent.relabel(CandidateOrigin::Unchanged));
        info!(
            iteration = input.iteration,
            ordinal = winner.ordinal().unwrap_or(0),
            score = winner.aggregate,
            "selected best variant"
        );

        Ok(RefinementOutcome {
            diagnosis: parsed.diagnosis,
            variants,
            winner,
            degraded: false,
            note: None,
        })
    }

    async fn diagnose(&self, input: &RefineInput<'_>) -> Result<String, ProviderError> {
        let variant_count = self.settings.variant_count.to_string();
        let feedback = input.incumbent.feedback_summary();
        let prompt = DIAGNOSE_V1.render(&[
            ("variant_count", variant_count.as_str()),
            ("original_intent", input.original_intent),
            ("prompt", input.current_prompt),
            ("output", input.incumbent.output.as_str()),
            ("feedback", feedback.as_str()),
        ]);

        let mut attribution = Attribution::new("refine::diagnose");
        if let Some(run_id) = self.settings.run_id {
            attribution = attribution.with_run(run_id);
        }
        let params = &self.settings.diagnosis;
        let req = ChatRequest::new(
            ChatModel::openrouter(&params.model),
            prompt.to_messages(),
            attribution,
        )
        .temperature(params.temperature)
        .max_tokens(params.max_tokens);

        let resp = self.gateway.chat(req).await?;
        Ok(resp.content)
    }

    async fn evaluate_variant(
        &self,
        iteration: usize,
        ordinal: usize,
        prompt: &str,
    ) -> Result<Candidate, RefineError> {
        let output = self
            .generator
            .generate(prompt)
            .await
            .map_err(|source| RefineError::Generation {
                ordinal,
                prompt: prompt.to_string(),
                source,
            })?;
        let scores = self.panel.score_all(&self.plan, &output, &self.context).await?;
        let candidate = Candidate::new(
            prompt,
            output,
            iteration,
            CandidateOrigin::Variant { ordinal },
            scores,
            &self.plan,
        );
        debug!(iteration, ordinal, score = candidate.aggregate, "scored variant");
        Ok(candidate)
    }
}

/// Highest aggregate; the earliest candidate wins ties.
pub fn select_winner(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().fold(None, |best: Option<&Candidate>, c| match best {
        Some(b) if c.aggregate <= b.aggregate => Some(b),
        _ => Some(c),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ScaleTable;
    use crate::evaluators::{EvaluatorId, Judgment, ScoreCard};

    #[test]
    fn header_separates_diagnosis_from_variants() {
        let text = "LIMITING FACTORS:\n1. Too vague\n2. No audience\n\nVARIANTS:\n1. Write a punchy ad for earbuds.\n2. \"Describe the earbuds' battery life.\"\n3. **Pitch earbuds to runners.**";
        let parsed = parse_variants(text, 3);
        assert_eq!(
            parsed.variants,
            vec![
                "Write a punchy ad for earbuds.",
                "Describe the earbuds' battery life.",
                "Pitch earbuds to runners.",
            ]
        );
        assert_eq!(parsed.diagnosis, "LIMITING FACTORS:\n1. Too vague\n2. No audience");
    }

    #[test]
    fn without_header_first_numbered_line_starts_variants() {
        let text = "The prompt lacks focus.\n- vague\n1. First\nnot numbered\n2. Second\n3. Third\n4. Fourth";
        let parsed = parse_variants(text, 3);
        assert_eq!(parsed.variants, vec!["First", "Second", "Third"]);
        assert_eq!(parsed.diagnosis, "The prompt lacks focus.\n- vague");
    }

    #[test]
    fn out_of_range_prefixes_and_empty_variants_are_skipped() {
        let text = "VARIANTS:\n7. not expected\n1.\n2. Real one\n10. also no";
        let parsed = parse_variants(text, 3);
        assert_eq!(parsed.variants, vec!["Real one"]);
        assert!(parsed.diagnosis.contains("7. not expected"));
    }

    #[test]
    fn parsing_is_deterministic() {
        let text = "x\nVARIANTS:\n1. a\n2. b";
        assert_eq!(parse_variants(text, 2), parse_variants(text, 2));
        assert!(parse_variants("just prose", 3).variants.is_empty());
    }

    fn scored(ordinal: usize, aggregate: f64) -> Candidate {
        let plan = ScoringPlan::new(vec![EvaluatorId::MintoJudge], ScaleTable::default()).unwrap();
        let mut scores = ScoreCard::new();
        scores.insert(EvaluatorId::MintoJudge, Judgment::scored(aggregate, None));
        Candidate::new("p", "o", 1, CandidateOrigin::Variant { ordinal }, scores, &plan)
    }

    #[test]
    fn winner_is_strict_max_with_ties_to_lowest_ordinal() {
        let vs = vec![scored(1, 7.0), scored(2, 7.8), scored(3, 7.8)];
        assert_eq!(select_winner(&vs).unwrap().ordinal(), Some(2));
        let flat = vec![scored(1, 5.0), scored(2, 5.0)];
        assert_eq!(select_winner(&flat).unwrap().ordinal(), Some(1));
        assert!(select_winner(&[]).is_none());
    }
}
