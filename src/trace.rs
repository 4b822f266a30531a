//! Score trace capture for optimization runs.
//!
//! One JSONL row per scored candidate plus one per final-ranking entry.
//! Rows are sent over a channel to a writer thread so tracing never blocks
//! the async loop on file I/O.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::candidate::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStage {
    Incumbent,
    Variant,
    FinalRanking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreTrace {
    pub timestamp_ms: i64,
    pub run_id: Uuid,
    pub iteration: usize,
    pub stage: TraceStage,
    pub ordinal: Option<usize>,
    pub prompt_hash: String,
    pub output_hash: String,
    /// Native-range value per evaluator.
    pub scores: BTreeMap<String, f64>,
    /// Evaluators whose value is a fail-soft 0.
    pub failed: Vec<String>,
    pub aggregate: f64,
    pub relevance: Option<f64>,
    pub queue_index: Option<usize>,
}

impl ScoreTrace {
    pub fn for_candidate(run_id: Uuid, stage: TraceStage, candidate: &Candidate) -> Self {
        Self {
            timestamp_ms: now_epoch_ms(),
            run_id,
            iteration: candidate.iteration,
            stage,
            ordinal: candidate.ordinal(),
            prompt_hash: hash_text(&candidate.prompt),
            output_hash: hash_text(&candidate.output),
            scores: candidate
                .scores
                .iter()
                .map(|(id, j)| (id.to_string(), j.value))
                .collect(),
            failed: candidate
                .scores
                .iter()
                .filter(|(_, j)| j.failed)
                .map(|(id, _)| id.to_string())
                .collect(),
            aggregate: candidate.aggregate,
            relevance: None,
            queue_index: None,
        }
    }

    pub fn ranked(mut self, queue_index: usize, relevance: Option<f64>) -> Self {
        self.queue_index = Some(queue_index);
        self.relevance = relevance;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: ScoreTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<ScoreTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    /// Wait for the writer to drain. Drop every sink clone first.
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(TraceError::Join("trace worker panicked".to_string()))),
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<ScoreTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: ScoreTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<ScoreTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Short content hash for trace rows; full text stays out of the trace.
pub fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex()[..16].to_string()
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_short() {
        assert_eq!(hash_text("abc"), hash_text("abc"));
        assert_ne!(hash_text("abc"), hash_text("abd"));
        assert_eq!(hash_text("").len(), 16);
    }
}
