//! Usage tracking via the UsageSink trait.
//!
//! Every adapter call is reported through a UsageSink so the gateway does not
//! care where usage ends up:
//! - `refine run` uses TallyUsageSink and copies the totals into the report
//! - `--usage-log` switches to StderrUsageSink
//! - Tests use NoopUsageSink

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call for logging.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name: "openai", "openrouter", "cohere".
    pub provider: &'static str,
    /// Endpoint: "embeddings", "chat/completions", "rerank".
    pub endpoint: &'static str,
    /// Model used.
    pub model: String,
    /// Input tokens consumed (search units for rerank).
    pub input_tokens: i32,
    /// Output tokens generated (0 for embeddings and rerank).
    pub output_tokens: i32,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    /// Provider-reported upstream inference cost in nanodollars, if available.
    pub upstream_cost_nanodollars: Option<i64>,
    /// Optimization run the call belongs to.
    pub run_id: Option<Uuid>,
    /// Latency in milliseconds.
    pub latency_ms: i32,
    /// Call status.
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// When the call was made.
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            run_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: i32, output: i32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn upstream_cost(mut self, nanodollars: Option<i64>) -> Self {
        self.upstream_cost_nanodollars = nanodollars;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn latency(mut self, ms: i32) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {
        // Discard
    }
}

/// Usage sink that writes to stderr as JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        let line = serde_json::json!({
            "provider": record.provider,
            "endpoint": record.endpoint,
            "model": record.model,
            "tokens": record.input_tokens + record.output_tokens,
            "cost_nanos": record.cost_nanodollars,
            "status": record.status.as_str(),
            "error": record.error_code,
            "caller": record.caller,
            "latency_ms": record.latency_ms,
        });
        eprintln!("{line}");
    }
}

/// Snapshot of accumulated usage for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl UsageTotals {
    pub fn cost_usd(&self) -> f64 {
        self.cost_nanodollars as f64 / 1_000_000_000.0
    }
}

/// In-memory usage sink that keeps running totals.
#[derive(Debug, Default)]
pub struct TallyUsageSink {
    calls: AtomicU64,
    failed_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_nanodollars: AtomicI64,
}

impl TallyUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> UsageTotals {
        UsageTotals {
            calls: self.calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            cost_nanodollars: self.cost_nanodollars.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl UsageSink for TallyUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if record.status == CallStatus::Error {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.input_tokens
            .fetch_add(record.input_tokens.max(0) as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(record.output_tokens.max(0) as u64, Ordering::Relaxed);
        self.cost_nanodollars
            .fetch_add(record.cost_nanodollars, Ordering::Relaxed);
    }
}
