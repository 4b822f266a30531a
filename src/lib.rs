#![forbid(unsafe_code)]

//! # refine-harness
//!
//! Iterative prompt optimization with a panel of judges.
//!
//! Start from a task prompt (and optionally a reference output), generate a
//! candidate, score it with several evaluators (lexical overlap, embedding
//! similarity, LLM judges), fold the scores into one 0-10 number, and while
//! that number is below the threshold ask a model what limits the prompt and
//! try its suggested rewrites. Every refining round sends the incumbent and
//! its best rewrite into a queue; a semantic reranker picks the final winner
//! across all rounds.

pub mod aggregate;
pub mod candidate;
pub mod config;
pub mod evaluators;
pub mod gateway;
pub mod generator;
pub mod optimizer;
pub mod prompts;
pub mod refine;
pub mod report;
pub mod trace;

pub use aggregate::{aggregate, PlanError, ScaleTable, ScoringPlan};
pub use candidate::{Candidate, CandidateOrigin};
pub use config::{ConfigError, RerankerKind, RunConfig};
pub use evaluators::{
    Evaluator, EvaluatorError, EvaluatorId, EvaluatorPanel, Judgment, RankedDocument,
    RerankError, Reranker, ScoreCard, ScoringContext,
};
pub use gateway::{
    Attribution, ChatGateway, EmbedGateway, ProviderError, ProviderGateway, RerankGateway,
    UsageSink,
};
pub use generator::{CandidateGenerator, SamplingParams};
pub use optimizer::{
    Gateways, IterationRecord, OptimizationReport, OptimizeError, Optimizer, RankedCandidate,
    RankingMethod, RefinementSummary, StopReason,
};
pub use refine::{parse_variants, ParsedDiagnosis, RefineError, RefinementOutcome, Refiner};
pub use report::render_markdown;
pub use trace::{JsonlTraceSink, ScoreTrace, TraceError, TraceSink, TraceStage, TraceWorker};
