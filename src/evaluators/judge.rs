//! LLM-as-judge evaluators.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{soften, Evaluator, EvaluatorError, EvaluatorId, Judgment};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest};
use crate::prompts::{PromptTemplate, FEYNMAN_JUDGE_V1, MINTO_JUDGE_V1, REFERENCE_JUDGE_V1};

/// Judges always sample at zero temperature so repeated scoring of the same
/// output is reproducible.
pub const JUDGE_TEMPERATURE: f32 = 0.0;

static SCORE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("Invalid score regex"));

/// Pull a 0-10 score out of a judge reply.
///
/// The first decimal number on the first non-empty line wins; when that line
/// has none, the first number anywhere in the reply is used. The value is
/// clamped to [0, 10]. The rest of the reply is returned as the explanation.
pub fn parse_judge_score(reply: &str) -> Option<(f64, String)> {
    let reply = reply.trim();
    let mut lines = reply.lines();
    let first = lines.find(|l| !l.trim().is_empty())?;

    if let Some(m) = SCORE_TOKEN.find(first) {
        let value: f64 = m.as_str().parse().ok()?;
        let rest = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        return Some((value.clamp(0.0, 10.0), rest));
    }

    let m = SCORE_TOKEN.find(reply)?;
    let value: f64 = m.as_str().parse().ok()?;
    Some((value.clamp(0.0, 10.0), reply.to_string()))
}

/// Model and token limit shared by every judge in a run.
#[derive(Debug, Clone)]
pub struct JudgeSettings {
    pub model: String,
    pub max_tokens: u32,
    pub run_id: Option<Uuid>,
}

pub struct LlmJudge {
    id: EvaluatorId,
    template: PromptTemplate,
    caller: &'static str,
    gateway: Arc<dyn ChatGateway>,
    settings: JudgeSettings,
}

impl LlmJudge {
    /// Build the judge for `id`; returns `None` for non-judge evaluators.
    pub fn for_id(
        id: EvaluatorId,
        gateway: Arc<dyn ChatGateway>,
        settings: JudgeSettings,
    ) -> Option<Self> {
        let (template, caller) = match id {
            EvaluatorId::MintoJudge => (MINTO_JUDGE_V1, "judge::minto"),
            EvaluatorId::FeynmanJudge => (FEYNMAN_JUDGE_V1, "judge::feynman"),
            EvaluatorId::ReferenceJudge => (REFERENCE_JUDGE_V1, "judge::reference"),
            _ => return None,
        };
        Some(Self {
            id,
            template,
            caller,
            gateway,
            settings,
        })
    }

    pub fn template_slug(&self) -> &'static str {
        self.template.slug
    }
}

#[async_trait]
impl Evaluator for LlmJudge {
    fn id(&self) -> EvaluatorId {
        self.id
    }

    async fn score(
        &self,
        candidate: &str,
        reference_or_query: &str,
    ) -> Result<Judgment, EvaluatorError> {
        if candidate.trim().is_empty() {
            return Ok(Judgment::failed("empty candidate output"));
        }

        let prompt = self
            .template
            .render(&[("query", reference_or_query), ("candidate", candidate)]);
        let mut attribution = Attribution::new(self.caller);
        if let Some(run_id) = self.settings.run_id {
            attribution = attribution.with_run(run_id);
        }
        let req = ChatRequest::new(
            ChatModel::openrouter(&self.settings.model),
            prompt.to_messages(),
            attribution,
        )
        .temperature(JUDGE_TEMPERATURE)
        .max_tokens(self.settings.max_tokens);

        let resp = match self.gateway.chat(req).await {
            Ok(resp) => resp,
            Err(err) => return soften(self.id, err),
        };

        match parse_judge_score(&resp.content) {
            Some((value, explanation)) => {
                debug!(evaluator = %self.id, score = value, "judge scored candidate");
                let explanation = (!explanation.is_empty()).then_some(explanation);
                Ok(Judgment::scored(value, explanation))
            }
            None => {
                warn!(evaluator = %self.id, "judge reply had no numeric score; scoring 0");
                Ok(Judgment::failed(format!(
                    "parse error: no score in judge reply: {}",
                    truncate(&resp.content, 200)
                )))
            }
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_on_first_line_is_split_from_explanation() {
        let (score, rest) = parse_judge_score("8.5\nClear and relevant.\nGood hook.").unwrap();
        assert_eq!(score, 8.5);
        assert_eq!(rest, "Clear and relevant.\nGood hook.");
    }

    #[test]
    fn first_line_number_may_be_embedded_in_text() {
        let (score, _) = parse_judge_score("Score: 7/10\nbecause...").unwrap();
        assert_eq!(score, 7.0);
    }

    #[test]
    fn falls_back_to_first_number_anywhere() {
        let (score, rest) =
            parse_judge_score("Overall verdict below.\nI would rate this a 6.25 out of 10.")
                .unwrap();
        assert_eq!(score, 6.25);
        assert!(rest.starts_with("Overall verdict"));
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        assert_eq!(parse_judge_score("85").unwrap().0, 10.0);
        assert_eq!(parse_judge_score("0.0").unwrap().0, 0.0);
    }

    #[test]
    fn pure_prose_has_no_score() {
        assert!(parse_judge_score("The output is engaging and well structured.").is_none());
        assert!(parse_judge_score("   \n  ").is_none());
    }

    #[test]
    fn for_id_rejects_non_judges() {
        struct Never;
        #[async_trait]
        impl ChatGateway for Never {
            async fn chat(
                &self,
                _req: ChatRequest,
            ) -> Result<crate::gateway::ChatResponse, crate::gateway::ProviderError> {
                unreachable!()
            }
        }
        let settings = JudgeSettings {
            model: "m".into(),
            max_tokens: 10,
            run_id: None,
        };
        let gw: Arc<dyn ChatGateway> = Arc::new(Never);
        assert!(LlmJudge::for_id(EvaluatorId::Bleu, gw.clone(), settings.clone()).is_none());
        let judge = LlmJudge::for_id(EvaluatorId::FeynmanJudge, gw, settings).unwrap();
        assert_eq!(judge.template_slug(), "feynman_judge_v1");
    }
}
