#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use refine_harness::evaluators::{EvaluatorPanel, LexicalEvaluator, LexicalMetric, LexicalScores};
use refine_harness::gateway::usage::ProviderCallRecord;
use refine_harness::gateway::{ProviderGateway, StderrUsageSink, TallyUsageSink, UsageSink};
use refine_harness::prompts::PROMPTS;
use refine_harness::{
    render_markdown, Candidate, CandidateOrigin, EvaluatorId, Gateways, JsonlTraceSink,
    OptimizationReport, Optimizer, RerankerKind, RunConfig, ScaleTable, ScoringContext,
    ScoringPlan, TraceSink,
};

#[derive(Parser)]
#[command(name = "refine", version, about = "Iterative prompt refinement CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the optimization loop (LLM calls)
    Run {
        /// JSON run configuration
        #[arg(long, conflicts_with = "prompt")]
        request: Option<PathBuf>,
        /// Initial prompt (instead of --request)
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        reference: Option<String>,
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Variants proposed per refinement
        #[arg(long)]
        variants: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long, value_enum)]
        reranker: Option<RerankerArg>,
        /// Evaluators for both plans, comma separated
        #[arg(long, value_delimiter = ',')]
        evaluators: Vec<EvaluatorId>,
        #[arg(long)]
        out: PathBuf,
        /// Also write a Markdown report
        #[arg(long)]
        report: Option<PathBuf>,
        /// JSONL score trace
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Print one JSON line per provider call to stderr
        #[arg(long)]
        usage_log: bool,
    },
    /// Score one output with selected evaluators
    Score {
        #[arg(long)]
        output: String,
        /// Original prompt (query for reference-free judges)
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        reference: Option<String>,
        #[arg(long, value_delimiter = ',', required = true)]
        evaluators: Vec<EvaluatorId>,
    },
    /// Lexical metrics only (no network)
    Lexical {
        #[arg(long)]
        prediction: String,
        #[arg(long)]
        reference: String,
    },
    /// Render a Markdown report from a run's JSON output
    Report {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// List prompt templates
    Prompts,
}

#[derive(Clone, Copy, ValueEnum)]
enum RerankerArg {
    Cohere,
    Embedding,
    None,
}

impl From<RerankerArg> for RerankerKind {
    fn from(arg: RerankerArg) -> Self {
        match arg {
            RerankerArg::Cohere => RerankerKind::Cohere,
            RerankerArg::Embedding => RerankerKind::Embedding,
            RerankerArg::None => RerankerKind::None,
        }
    }
}

/// Keeps run totals for the report and optionally echoes every call.
struct CliUsageSink {
    tally: Arc<TallyUsageSink>,
    echo: Option<StderrUsageSink>,
}

#[async_trait]
impl UsageSink for CliUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        if let Some(echo) = &self.echo {
            echo.record(record.clone()).await;
        }
        self.tally.record(record).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            request,
            prompt,
            reference,
            max_iterations,
            variants,
            threshold,
            reranker,
            evaluators,
            out,
            report,
            trace,
            usage_log,
        } => {
            let mut config = match (request, prompt) {
                (Some(path), _) => RunConfig::from_path(path)?,
                (None, Some(prompt)) => RunConfig::new(prompt),
                (None, None) => return Err("run requires --request or --prompt".into()),
            };
            if let Some(reference) = reference {
                config.reference_output = Some(reference);
            }
            if let Some(n) = max_iterations {
                config.max_iterations = n;
            }
            if let Some(n) = variants {
                config.variant_count = n;
            }
            if let Some(t) = threshold {
                config.score_threshold = t;
            }
            if let Some(kind) = reranker {
                config.reranker = kind.into();
            }
            if !evaluators.is_empty() {
                config.initial_evaluators = Some(evaluators.clone());
                config.refinement_evaluators = Some(evaluators);
            }
            config.validate()?;

            let tally = Arc::new(TallyUsageSink::new());
            let sink = Arc::new(CliUsageSink {
                tally: tally.clone(),
                echo: usage_log.then_some(StderrUsageSink),
            });
            let gateway =
                ProviderGateway::from_env(sink)?.with_retry_policy(config.gateway_config());
            let gateways = Gateways::from_provider(Arc::new(gateway));

            let (trace_sink, trace_worker) = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    (Some(sink), Some(worker))
                }
                None => (None, None),
            };

            let mut optimizer = Optimizer::new(config, gateways)?.with_usage(tally);
            if let Some(sink) = &trace_sink {
                optimizer = optimizer.with_trace(Arc::new(sink.clone()) as Arc<dyn TraceSink>);
            }

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received; finishing current iteration");
                        cancel.store(true, Ordering::SeqCst);
                    }
                });
            }

            let result = optimizer.run(Some(cancel.as_ref())).await;
            drop(optimizer);
            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }
            let result = result?;

            write_json(&out, &result)?;
            if let Some(path) = report {
                std::fs::write(path, render_markdown(&result))?;
            }
            info!(
                stop_reason = result.stop_reason.as_str(),
                score = result.winner.aggregate,
                out = %out.display(),
                "wrote report"
            );
            println!("{}", result.winner.output);
        }
        Commands::Score {
            output,
            prompt,
            reference,
            evaluators,
        } => {
            let candidate = if evaluators.iter().all(|id| LexicalMetric::from_id(*id).is_some()) {
                score_lexical(&output, &prompt, reference, evaluators).await?
            } else {
                let mut config = RunConfig::new(prompt);
                config.reference_output = reference;
                config.initial_evaluators = Some(evaluators.clone());
                config.refinement_evaluators = Some(evaluators.clone());
                config.reranker = RerankerKind::None;
                let gateway = ProviderGateway::from_env(Arc::new(TallyUsageSink::new()))?
                    .with_retry_policy(config.gateway_config());
                let optimizer = Optimizer::new(config, Gateways::from_provider(Arc::new(gateway)))?;
                optimizer.score_output(&output, &evaluators).await?
            };
            println!("{}", serde_json::to_string_pretty(&candidate)?);
        }
        Commands::Lexical {
            prediction,
            reference,
        } => {
            let scores = LexicalScores::compute(&prediction, &reference);
            println!("{}", serde_json::to_string_pretty(&scores)?);
        }
        Commands::Report { input, out } => {
            let report: OptimizationReport = read_json(&input)?;
            std::fs::write(out, render_markdown(&report))?;
        }
        Commands::Prompts => {
            for template in PROMPTS {
                println!("{}\t{}", template.slug, template.description);
            }
        }
    }

    Ok(())
}

async fn score_lexical(
    output: &str,
    prompt: &str,
    reference: Option<String>,
    evaluators: Vec<EvaluatorId>,
) -> Result<Candidate, Box<dyn std::error::Error>> {
    if reference.as_deref().map_or(true, |r| r.trim().is_empty()) {
        return Err("lexical evaluators need --reference".into());
    }
    let plan = ScoringPlan::new(evaluators.clone(), ScaleTable::default())?;
    let mut panel = EvaluatorPanel::new();
    for metric in evaluators.iter().filter_map(|id| LexicalMetric::from_id(*id)) {
        panel.insert(Arc::new(LexicalEvaluator::new(metric)));
    }
    let ctx = ScoringContext::new(prompt, reference);
    let scores = panel.score_all(&plan, output, &ctx).await?;
    Ok(Candidate::new(
        prompt,
        output,
        0,
        CandidateOrigin::Incumbent,
        scores,
        &plan,
    ))
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
