//! Deterministic lexical-overlap metrics: ROUGE-1, ROUGE-2, ROUGE-L and BLEU.
//!
//! All values are F-measures or precisions in [0, 1]. Tokenization lowercases
//! and keeps runs of letters and digits, so punctuation never counts as a match.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Evaluator, EvaluatorError, EvaluatorId, Judgment};

static WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("Invalid word regex"));

const BLEU_MAX_ORDER: usize = 4;

pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD.find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if n == 0 || tokens.len() < n {
        return counts;
    }
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

/// Matched n-grams between prediction and reference, with clipping.
fn clipped_overlap(pred: &HashMap<&[String], usize>, reference: &HashMap<&[String], usize>) -> usize {
    pred.iter()
        .map(|(gram, &count)| count.min(reference.get(gram).copied().unwrap_or(0)))
        .sum()
}

fn f_measure(matches: usize, pred_total: usize, ref_total: usize) -> f64 {
    if matches == 0 || pred_total == 0 || ref_total == 0 {
        return 0.0;
    }
    let precision = matches as f64 / pred_total as f64;
    let recall = matches as f64 / ref_total as f64;
    2.0 * precision * recall / (precision + recall)
}

/// ROUGE-N F1 over n-gram multisets. Order 0 has no n-grams and scores 0.
pub fn rouge_n(prediction: &str, reference: &str, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let pred = tokenize(prediction);
    let refr = tokenize(reference);
    let pred_counts = ngram_counts(&pred, n);
    let ref_counts = ngram_counts(&refr, n);
    let matches = clipped_overlap(&pred_counts, &ref_counts);
    f_measure(
        matches,
        pred.len().saturating_sub(n - 1),
        refr.len().saturating_sub(n - 1),
    )
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// ROUGE-L F1 from the longest common subsequence.
pub fn rouge_l(prediction: &str, reference: &str) -> f64 {
    let pred = tokenize(prediction);
    let refr = tokenize(reference);
    f_measure(lcs_len(&pred, &refr), pred.len(), refr.len())
}

/// Sentence BLEU-4 with uniform weights and brevity penalty, no smoothing:
/// any order with zero matches yields 0.
pub fn bleu(prediction: &str, reference: &str) -> f64 {
    let pred = tokenize(prediction);
    let refr = tokenize(reference);
    if pred.is_empty() || refr.is_empty() {
        return 0.0;
    }

    let mut log_precision_sum = 0.0;
    for n in 1..=BLEU_MAX_ORDER {
        let pred_counts = ngram_counts(&pred, n);
        let total: usize = pred_counts.values().sum();
        let matches = clipped_overlap(&pred_counts, &ngram_counts(&refr, n));
        if total == 0 || matches == 0 {
            return 0.0;
        }
        log_precision_sum += (matches as f64 / total as f64).ln();
    }
    let geo_mean = (log_precision_sum / BLEU_MAX_ORDER as f64).exp();

    let c = pred.len() as f64;
    let r = refr.len() as f64;
    let brevity_penalty = if c > r { 1.0 } else { (1.0 - r / c).exp() };

    (geo_mean * brevity_penalty).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LexicalMetric {
    Rouge1,
    Rouge2,
    RougeL,
    Bleu,
}

impl LexicalMetric {
    pub fn from_id(id: EvaluatorId) -> Option<Self> {
        match id {
            EvaluatorId::Rouge1 => Some(LexicalMetric::Rouge1),
            EvaluatorId::Rouge2 => Some(LexicalMetric::Rouge2),
            EvaluatorId::RougeL => Some(LexicalMetric::RougeL),
            EvaluatorId::Bleu => Some(LexicalMetric::Bleu),
            _ => None,
        }
    }

    pub fn id(&self) -> EvaluatorId {
        match self {
            LexicalMetric::Rouge1 => EvaluatorId::Rouge1,
            LexicalMetric::Rouge2 => EvaluatorId::Rouge2,
            LexicalMetric::RougeL => EvaluatorId::RougeL,
            LexicalMetric::Bleu => EvaluatorId::Bleu,
        }
    }

    pub fn compute(&self, prediction: &str, reference: &str) -> f64 {
        match self {
            LexicalMetric::Rouge1 => rouge_n(prediction, reference, 1),
            LexicalMetric::Rouge2 => rouge_n(prediction, reference, 2),
            LexicalMetric::RougeL => rouge_l(prediction, reference),
            LexicalMetric::Bleu => bleu(prediction, reference),
        }
    }
}

/// All lexical metrics for one prediction/reference pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LexicalScores {
    pub rouge_1: f64,
    pub rouge_2: f64,
    pub rouge_l: f64,
    pub bleu: f64,
}

impl LexicalScores {
    pub fn compute(prediction: &str, reference: &str) -> Self {
        Self {
            rouge_1: rouge_n(prediction, reference, 1),
            rouge_2: rouge_n(prediction, reference, 2),
            rouge_l: rouge_l(prediction, reference),
            bleu: bleu(prediction, reference),
        }
    }
}

pub struct LexicalEvaluator {
    metric: LexicalMetric,
}

impl LexicalEvaluator {
    pub fn new(metric: LexicalMetric) -> Self {
        Self { metric }
    }
}

#[async_trait]
impl Evaluator for LexicalEvaluator {
    fn id(&self) -> EvaluatorId {
        self.metric.id()
    }

    async fn score(
        &self,
        candidate: &str,
        reference_or_query: &str,
    ) -> Result<Judgment, EvaluatorError> {
        Ok(Judgment::scored(
            self.metric.compute(candidate, reference_or_query),
            None,
        ))
    }
}
