//! Markdown rendering of a finished optimization run.

use crate::candidate::Candidate;
use crate::optimizer::{OptimizationReport, RankingMethod};

pub fn render_markdown(report: &OptimizationReport) -> String {
    let mut out = String::new();
    out.push_str("# Prompt Optimization Report\n\n");
    out.push_str(&format!("- Run: `{}`\n", report.run_id));
    out.push_str(&format!("- Created: {}\n", report.created_at));
    out.push_str(&format!("- Config hash: `{}`\n", report.config_hash));
    out.push_str(&format!("- Stop reason: {}\n", report.stop_reason.as_str()));
    out.push_str(&format!(
        "- Iterations: {} of {}\n",
        report.iterations_completed, report.config.max_iterations
    ));
    out.push_str(&format!(
        "- Best combined score: {:.2} (threshold {:.2})\n",
        report.best_combined_score, report.config.score_threshold
    ));
    out.push_str(&format!("- Latency: {} ms\n", report.latency_ms));
    if let Some(usage) = &report.usage {
        out.push_str(&format!(
            "- Provider calls: {} ({} failed), {} in / {} out tokens, ${:.4}\n",
            usage.calls,
            usage.failed_calls,
            usage.input_tokens,
            usage.output_tokens,
            usage.cost_usd()
        ));
    }

    out.push_str("\n## Iterations\n");
    for record in &report.history {
        out.push_str(&format!("\n### Iteration {}\n\n", record.iteration));
        out.push_str(&format!("- Prompt: {}\n", one_line(&record.prompt)));
        out.push_str(&format!("- Score: {:.2}\n", record.aggregate));
        for (id, judgment) in &record.scores {
            let flag = if judgment.failed { " (failed)" } else { "" };
            out.push_str(&format!("  - `{id}`: {:.3}{flag}\n", judgment.value));
        }
        out.push_str(&format!("- Output: {}\n", one_line(&record.output)));

        if let Some(refinement) = &record.refinement {
            if !refinement.diagnosis.is_empty() {
                out.push_str(&format!(
                    "- Diagnosis: {}\n",
                    one_line(&refinement.diagnosis)
                ));
            }
            match refinement.best_variant() {
                Some(best) => {
                    out.push_str(&format!(
                        "- Best variant ({} of {}): {:.2}{}\n",
                        best.ordinal().unwrap_or(0),
                        refinement.variants.len(),
                        best.aggregate,
                        if refinement.adopted { ", adopted" } else { ", not adopted" }
                    ));
                    out.push_str(&format!("  - Prompt: {}\n", one_line(&best.prompt)));
                }
                None => out.push_str(&format!(
                    "- Refinement kept the prompt: {}\n",
                    refinement.note.as_deref().unwrap_or("no variants")
                )),
            }
        }
    }

    out.push_str("\n## Final Rankings\n\n");
    match report.ranking_method {
        RankingMethod::Unranked => out.push_str("Nothing was queued for reranking.\n"),
        RankingMethod::Reranker => out.push_str(&format!(
            "Ranked by `{}` against the original prompt.\n\n",
            report.reranker.as_deref().unwrap_or("reranker")
        )),
        RankingMethod::AggregateScore => {
            if let Some(err) = &report.rerank_error {
                out.push_str(&format!(
                    "Reranker failed ({err}); ranked by aggregate score.\n\n"
                ));
            } else {
                out.push_str("Ranked by aggregate score.\n\n");
            }
        }
    }
    for (rank, (entry, candidate)) in report.ranked_candidates().enumerate() {
        let relevance = entry
            .relevance
            .map(|r| format!("relevance {r:.3}, "))
            .unwrap_or_default();
        out.push_str(&format!(
            "{}. {}score {:.2}, {} - {}\n",
            rank + 1,
            relevance,
            candidate.aggregate,
            describe(candidate),
            one_line(&candidate.output)
        ));
    }

    out.push_str("\n## Ultimate Winner\n\n");
    out.push_str(&format!(
        "{} with score {:.2}\n\n",
        describe(&report.winner),
        report.winner.aggregate
    ));
    out.push_str("**Prompt**\n\n");
    out.push_str(&quote(&report.winner.prompt));
    out.push_str("\n**Output**\n\n");
    out.push_str(&quote(&report.winner.output));
    out
}

fn describe(candidate: &Candidate) -> String {
    match candidate.ordinal() {
        Some(ordinal) => format!("iteration {} variant {}", candidate.iteration, ordinal),
        None => format!("iteration {} incumbent", candidate.iteration),
    }
}

fn one_line(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out: String = flat.chars().take(160).collect();
    if flat.chars().count() > 160 {
        out.push_str("...");
    }
    out
}

fn quote(text: &str) -> String {
    text.lines().map(|l| format!("> {l}\n")).collect()
}
