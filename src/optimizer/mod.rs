//! The optimization loop.
//!
//! ```text
//! INIT -> ITERATING -> (THRESHOLD_MET | NO_IMPROVEMENT | MAX_ITER | CANCELLED)
//!      -> FINAL_RERANK -> DONE
//! ```
//!
//! Each iteration generates from the current prompt, scores the output with
//! the initial plan and, below threshold, runs one refinement step. The
//! incumbent and the winning variant join the rerank queue; the winner's
//! prompt is adopted only when its score strictly beats the best so far.
//! When the loop stops, the queue is reranked once against the original
//! prompt and the top entry is the result.

mod types;

pub use types::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::ScoringPlan;
use crate::candidate::{Candidate, CandidateOrigin};
use crate::config::{ConfigError, RerankerKind, RunConfig};
use crate::evaluators::{
    CohereReranker, EmbeddingReranker, EmbeddingSimilarity, Evaluator, EvaluatorId,
    EvaluatorPanel, JudgeSettings, LexicalEvaluator, LexicalMetric, LlmJudge, Reranker,
    ScoringContext,
};
use crate::gateway::{
    ChatGateway, EmbedGateway, ProviderGateway, RerankGateway, TallyUsageSink, UsageSink,
};
use crate::generator::CandidateGenerator;
use crate::refine::{RefineInput, RefineSettings, Refiner};
use crate::trace::{ScoreTrace, TraceSink, TraceStage};

/// Provider handles the loop talks to. Chat is required; the others are
/// needed only by the evaluators or reranker that use them.
#[derive(Clone)]
pub struct Gateways {
    pub chat: Arc<dyn ChatGateway>,
    pub embed: Option<Arc<dyn EmbedGateway>>,
    pub rerank: Option<Arc<dyn RerankGateway>>,
}

impl Gateways {
    pub fn chat_only(chat: Arc<dyn ChatGateway>) -> Self {
        Self {
            chat,
            embed: None,
            rerank: None,
        }
    }

    pub fn with_embed(mut self, embed: Arc<dyn EmbedGateway>) -> Self {
        self.embed = Some(embed);
        self
    }

    pub fn with_rerank(mut self, rerank: Arc<dyn RerankGateway>) -> Self {
        self.rerank = Some(rerank);
        self
    }

    /// Share one provider gateway across every role it has an adapter for.
    pub fn from_provider<U: UsageSink + 'static>(gateway: Arc<ProviderGateway<U>>) -> Self {
        let embed = gateway
            .has_embeddings()
            .then(|| gateway.clone() as Arc<dyn EmbedGateway>);
        let rerank = gateway
            .has_rerank()
            .then(|| gateway.clone() as Arc<dyn RerankGateway>);
        Self {
            chat: gateway,
            embed,
            rerank,
        }
    }
}

pub struct Optimizer {
    config: RunConfig,
    run_id: Uuid,
    chat: Arc<dyn ChatGateway>,
    generator: Arc<CandidateGenerator>,
    panel: EvaluatorPanel,
    initial_plan: ScoringPlan,
    refinement_plan: ScoringPlan,
    context: ScoringContext,
    reranker: Option<Arc<dyn Reranker>>,
    trace: Option<Arc<dyn TraceSink>>,
    usage: Option<Arc<TallyUsageSink>>,
}

impl Optimizer {
    /// Validate `config` and wire every evaluator and the reranker it names.
    /// Fails before any network call when a required provider is missing.
    pub fn new(config: RunConfig, gateways: Gateways) -> Result<Self, OptimizeError> {
        config.validate()?;
        let run_id = Uuid::new_v4();

        let generator = Arc::new(CandidateGenerator::new(
            gateways.chat.clone(),
            config.generator.clone(),
            Some(run_id),
        ));

        let judge_settings = JudgeSettings {
            model: config.judge_model.clone(),
            max_tokens: config.judge_max_tokens,
            run_id: Some(run_id),
        };
        let mut panel = EvaluatorPanel::new();
        for id in config.all_evaluator_ids() {
            let evaluator: Arc<dyn Evaluator> = if let Some(metric) = LexicalMetric::from_id(id) {
                Arc::new(LexicalEvaluator::new(metric))
            } else if let Some(judge) =
                LlmJudge::for_id(id, gateways.chat.clone(), judge_settings.clone())
            {
                Arc::new(judge)
            } else {
                let embed = gateways.embed.clone().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "evaluator {id} needs an embeddings provider (set OPENAI_API_KEY)"
                    ))
                })?;
                Arc::new(EmbeddingSimilarity::new(
                    embed,
                    &config.embedding_model,
                    Some(run_id),
                ))
            };
            panel.insert(evaluator);
        }

        let reranker: Option<Arc<dyn Reranker>> = match config.reranker {
            RerankerKind::None => None,
            RerankerKind::Cohere => {
                let gateway = gateways.rerank.clone().ok_or_else(|| {
                    ConfigError::Invalid(
                        "reranker cohere needs COHERE_API_KEY (or use --reranker embedding|none)"
                            .to_string(),
                    )
                })?;
                Some(Arc::new(CohereReranker::new(
                    gateway,
                    &config.rerank_model,
                    Some(run_id),
                )) as Arc<dyn Reranker>)
            }
            RerankerKind::Embedding => {
                let gateway = gateways.embed.clone().ok_or_else(|| {
                    ConfigError::Invalid(
                        "reranker embedding needs an embeddings provider (set OPENAI_API_KEY)"
                            .to_string(),
                    )
                })?;
                Some(Arc::new(EmbeddingReranker::new(
                    gateway,
                    &config.embedding_model,
                    Some(run_id),
                )) as Arc<dyn Reranker>)
            }
        };

        let initial_plan = config.initial_plan()?;
        let refinement_plan = config.refinement_plan()?;
        let context = ScoringContext::new(
            config.initial_prompt.clone(),
            config.reference().map(str::to_string),
        );

        Ok(Self {
            config,
            run_id,
            chat: gateways.chat,
            generator,
            panel,
            initial_plan,
            refinement_plan,
            context,
            reranker,
            trace: None,
            usage: None,
        })
    }

    /// Replace the configured reranker; `None` ranks by aggregate score.
    pub fn with_reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    /// Replace the evaluator registered under the same id.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.panel.insert(evaluator);
        self
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Include these running totals in the report.
    pub fn with_usage(mut self, usage: Arc<TallyUsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Score one output with the given evaluators, outside the loop.
    pub async fn score_output(
        &self,
        output: &str,
        evaluators: &[EvaluatorId],
    ) -> Result<Candidate, OptimizeError> {
        let plan = ScoringPlan::new(evaluators.to_vec(), self.initial_plan.scales().clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let scores = self
            .panel
            .score_all(&plan, output, &self.context)
            .await
            .map_err(|source| OptimizeError::Evaluator {
                iteration: 0,
                source,
            })?;
        Ok(Candidate::new(
            &self.config.initial_prompt,
            output,
            0,
            CandidateOrigin::Incumbent,
            scores,
            &plan,
        ))
    }

    /// Run the loop to completion. `cancel` is checked between iterations;
    /// the first iteration always runs.
    pub async fn run(&self, cancel: Option<&AtomicBool>) -> Result<OptimizationReport, OptimizeError> {
        let started = Instant::now();
        let cfg = &self.config;
        let refiner = Refiner::new(
            self.chat.clone(),
            self.generator.clone(),
            self.panel.clone(),
            self.refinement_plan.clone(),
            self.context.clone(),
            RefineSettings {
                diagnosis: cfg.diagnosis.clone(),
                variant_count: cfg.variant_count,
                run_id: Some(self.run_id),
            },
        );

        info!(
            run_id = %self.run_id,
            max_iterations = cfg.max_iterations,
            threshold = cfg.score_threshold,
            "starting optimization"
        );

        let mut current_prompt = cfg.initial_prompt.clone();
        let mut best_combined_score = 0.0_f64;
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut queue: Vec<Candidate> = Vec::new();
        let mut last: Option<Candidate> = None;
        let mut stop_reason = StopReason::MaxIterations;

        for iteration in 1..=cfg.max_iterations {
            if iteration > 1 && cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                info!(iteration, "cancelled; skipping remaining iterations");
                stop_reason = StopReason::Cancelled;
                break;
            }

            let output = self.generator.generate(&current_prompt).await.map_err(|source| {
                OptimizeError::Generation {
                    iteration,
                    prompt: current_prompt.clone(),
                    source,
                }
            })?;
            let scores = self
                .panel
                .score_all(&self.initial_plan, &output, &self.context)
                .await
                .map_err(|source| OptimizeError::Evaluator { iteration, source })?;
            let incumbent = Candidate::new(
                &current_prompt,
                output,
                iteration,
                CandidateOrigin::Incumbent,
                scores,
                &self.initial_plan,
            );
            self.record_trace(ScoreTrace::for_candidate(
                self.run_id,
                TraceStage::Incumbent,
                &incumbent,
            ));
            info!(iteration, score = incumbent.aggregate, "scored incumbent");

            if incumbent.aggregate >= cfg.score_threshold {
                info!(iteration, score = incumbent.aggregate, "threshold met");
                best_combined_score = best_combined_score.max(incumbent.aggregate);
                if !queue.is_empty() {
                    queue.push(incumbent.clone());
                }
                history.push(IterationRecord::new(&incumbent, None));
                last = Some(incumbent);
                stop_reason = StopReason::ThresholdMet;
                break;
            }

            let outcome = refiner
                .refine(RefineInput {
                    iteration,
                    current_prompt: &current_prompt,
                    incumbent: &incumbent,
                    original_intent: &cfg.initial_prompt,
                })
                .await
                .map_err(|source| OptimizeError::Refinement { iteration, source })?;
            for variant in &outcome.variants {
                self.record_trace(ScoreTrace::for_candidate(
                    self.run_id,
                    TraceStage::Variant,
                    variant,
                ));
            }

            queue.push(incumbent.clone());
            if outcome.winner.origin != CandidateOrigin::Unchanged {
                queue.push(outcome.winner.clone());
            }

            let adopted = outcome.winner.aggregate > best_combined_score;
            history.push(IterationRecord::new(
                &incumbent,
                Some(RefinementSummary::from_outcome(&outcome, adopted)),
            ));
            last = Some(incumbent);

            if adopted {
                info!(
                    iteration,
                    previous_best = best_combined_score,
                    score = outcome.winner.aggregate,
                    "adopting refined prompt"
                );
                best_combined_score = outcome.winner.aggregate;
                current_prompt = outcome.winner.prompt;
            } else {
                info!(
                    iteration,
                    best = best_combined_score,
                    score = outcome.winner.aggregate,
                    "no improvement; stopping"
                );
                stop_reason = StopReason::NoImprovement;
                break;
            }
        }

        // The first iteration always runs, so `last` is set unless the loop
        // was configured with zero iterations, which validation rejects.
        let last = last.ok_or_else(|| {
            OptimizeError::InvalidConfig(ConfigError::Invalid(
                "max_iterations must be at least 1".to_string(),
            ))
        })?;

        let ranking = self.final_rank(&queue).await?;
        let winner = match ranking.entries.first() {
            Some(top) => queue[top.queue_index].clone(),
            None => last,
        };
        for (rank, entry) in ranking.entries.iter().enumerate() {
            let row = ScoreTrace::for_candidate(
                self.run_id,
                TraceStage::FinalRanking,
                &queue[entry.queue_index],
            )
            .ranked(rank, entry.relevance);
            self.record_trace(row);
        }
        info!(
            stop_reason = stop_reason.as_str(),
            best = best_combined_score,
            winner_score = winner.aggregate,
            "optimization finished"
        );

        Ok(OptimizationReport {
            run_id: self.run_id,
            created_at: Utc::now().to_rfc3339(),
            config: cfg.clone(),
            config_hash: hash_config(cfg),
            stop_reason,
            iterations_completed: history.len(),
            best_combined_score,
            final_prompt: current_prompt,
            history,
            rerank_queue: queue,
            final_ranking: ranking.entries,
            ranking_method: ranking.method,
            reranker: ranking.reranker,
            rerank_fallback: ranking.error.is_some(),
            rerank_error: ranking.error,
            winner,
            usage: self.usage.as_ref().map(|u| u.totals()),
            latency_ms: started.elapsed().as_millis(),
        })
    }

    async fn final_rank(&self, queue: &[Candidate]) -> Result<FinalRanking, OptimizeError> {
        if queue.is_empty() {
            return Ok(FinalRanking {
                entries: Vec::new(),
                method: RankingMethod::Unranked,
                reranker: None,
                error: None,
            });
        }
        let Some(reranker) = &self.reranker else {
            return Ok(FinalRanking {
                entries: rank_by_aggregate(queue),
                method: RankingMethod::AggregateScore,
                reranker: None,
                error: None,
            });
        };

        let documents: Vec<String> = queue.iter().map(|c| c.output.clone()).collect();
        match reranker.rerank(&self.config.initial_prompt, &documents).await {
            Ok(ranked) => Ok(FinalRanking {
                entries: ranked
                    .into_iter()
                    .map(|d| RankedCandidate {
                        queue_index: d.index,
                        relevance: Some(d.relevance),
                        aggregate: queue[d.index].aggregate,
                    })
                    .collect(),
                method: RankingMethod::Reranker,
                reranker: Some(reranker.name().to_string()),
                error: None,
            }),
            Err(err) if err.is_fatal() => Err(OptimizeError::Rerank(err)),
            Err(err) => {
                warn!(error = %err, "final rerank failed; ranking by aggregate score");
                Ok(FinalRanking {
                    entries: rank_by_aggregate(queue),
                    method: RankingMethod::AggregateScore,
                    reranker: Some(reranker.name().to_string()),
                    error: Some(err.to_string()),
                })
            }
        }
    }

    fn record_trace(&self, row: ScoreTrace) {
        if let Some(sink) = &self.trace {
            if let Err(e) = sink.record(row) {
                warn!(error = %e, "failed to record score trace");
            }
        }
    }
}

struct FinalRanking {
    entries: Vec<RankedCandidate>,
    method: RankingMethod,
    reranker: Option<String>,
    error: Option<String>,
}

/// Descending aggregate; equal scores keep queue order.
pub fn rank_by_aggregate(queue: &[Candidate]) -> Vec<RankedCandidate> {
    let mut entries: Vec<RankedCandidate> = queue
        .iter()
        .enumerate()
        .map(|(queue_index, c)| RankedCandidate {
            queue_index,
            relevance: None,
            aggregate: c.aggregate,
        })
        .collect();
    entries.sort_by(|a, b| b.aggregate.total_cmp(&a.aggregate));
    entries
}

fn hash_config(config: &RunConfig) -> String {
    let bytes = serde_json::to_vec(config).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
