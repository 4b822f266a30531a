use std::collections::BTreeMap;

use refine_harness::{JsonlTraceSink, ScoreTrace, TraceSink, TraceStage};
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    iteration: usize,
    stage: String,
    ordinal: Option<usize>,
    failed: Vec<String>,
}

fn make_trace(iteration: usize, ordinal: Option<usize>) -> ScoreTrace {
    let mut scores = BTreeMap::new();
    scores.insert("minto_judge".to_string(), 7.0);
    scores.insert("rouge_l".to_string(), 0.0);
    ScoreTrace {
        timestamp_ms: 0,
        run_id: Uuid::nil(),
        iteration,
        stage: if ordinal.is_some() {
            TraceStage::Variant
        } else {
            TraceStage::Incumbent
        },
        ordinal,
        prompt_hash: "prompt_hash".to_string(),
        output_hash: "output_hash".to_string(),
        scores,
        failed: vec!["rouge_l".to_string()],
        aggregate: 3.5,
        relevance: None,
        queue_index: None,
    }
}

#[test]
fn jsonl_trace_sink_writes_rows_in_order_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(1, None)).unwrap();
    sink.record(make_trace(1, Some(2))).unwrap();
    sink.record(make_trace(2, None).ranked(0, Some(0.8))).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].stage, "incumbent");
    assert_eq!(rows[1].stage, "variant");
    assert_eq!(rows[1].ordinal, Some(2));
    assert_eq!(rows[2].iteration, 2);
    assert_eq!(rows[0].failed, vec!["rouge_l".to_string()]);
}

#[test]
fn sink_clones_share_one_writer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    let clone = sink.clone();
    drop(sink);
    clone.record(make_trace(1, None)).unwrap();
    drop(clone);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 1);
}
