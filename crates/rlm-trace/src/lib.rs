// SPDX-License-Identifier: MIT OR Apache-2.0
//! Turn-indexed trace aggregation.
//!
//! The collector accumulates, per turn, the root prompt, the extracted
//! program, the step observables, and the resolved tool traffic. At
//! finalization the artifact is summarized with span/tool metrics and
//! gzip-persisted to the blob store. Not on the critical path: trace
//! persistence failures never fail an execution.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rlm_citation::merge_span_log;
use rlm_core::{
    JsonObject, JsonValue, SpanLogEntry, StepResult, ToolRequestsEnvelope, ToolResultsEnvelope,
};
use rlm_store::{BlobError, BlobStore, join_s3_uri};
use serde_json::json;
use std::collections::BTreeMap;

/// Trace artifact schema version.
pub const TRACE_SCHEMA_VERSION: &str = "rlm_trace_v1";

/// Default key prefix for trace blobs.
pub const DEFAULT_TRACE_PREFIX: &str = "traces";

/// Blob key for an execution's trace artifact.
#[must_use]
pub fn build_trace_key(tenant_id: &str, execution_id: &str, prefix: &str) -> String {
    format!("{prefix}/{tenant_id}/{execution_id}/trace.json.gz")
}

/// Replace every leaf value with `"[REDACTED]"`, preserving structure.
#[must_use]
pub fn redact_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => JsonValue::Null,
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), redact_value(inner)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(redact_value).collect()),
        _ => JsonValue::String("[REDACTED]".into()),
    }
}

fn span_metrics(spans: &[SpanLogEntry]) -> (u64, u64, usize, u64) {
    let merged = merge_span_log(spans, 0);
    let total: u64 = spans
        .iter()
        .map(|span| span.end_char.saturating_sub(span.start_char))
        .sum();
    let unique: u64 = merged
        .iter()
        .map(|span| span.end_char.saturating_sub(span.start_char))
        .sum();
    let docs_touched = merged
        .iter()
        .map(|span| span.doc_index)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    let max_span = spans
        .iter()
        .map(|span| span.end_char.saturating_sub(span.start_char))
        .max()
        .unwrap_or(0);
    (total, unique, docs_touched, max_span)
}

/// Span coverage metrics, split by read vs scan spans.
#[must_use]
pub fn compute_span_metrics(span_log: &[SpanLogEntry]) -> JsonObject {
    let (read_spans, scan_spans): (Vec<SpanLogEntry>, Vec<SpanLogEntry>) =
        span_log.iter().cloned().partition(|span| !span.is_scan());
    let (span_chars, unique_span_chars, docs_touched, max_span_chars) = span_metrics(&read_spans);
    let (scan_chars, scan_unique, scan_docs, scan_max) = span_metrics(&scan_spans);
    let mut metrics = JsonObject::new();
    metrics.insert("span_chars".into(), span_chars.into());
    metrics.insert("unique_span_chars".into(), unique_span_chars.into());
    metrics.insert("docs_touched".into(), docs_touched.into());
    metrics.insert("max_span_chars".into(), max_span_chars.into());
    metrics.insert("scan_span_chars".into(), scan_chars.into());
    metrics.insert("scan_unique_span_chars".into(), scan_unique.into());
    metrics.insert("scan_docs_touched".into(), scan_docs.into());
    metrics.insert("scan_max_span_chars".into(), scan_max.into());
    metrics
}

/// One turn's artifacts.
#[derive(Debug, Clone, Default)]
pub struct TurnTrace {
    /// Turn index.
    pub turn_index: i64,
    /// Root prompt sent this turn.
    pub root_prompt: Option<String>,
    /// Template version identifier.
    pub root_prompt_version: Option<String>,
    /// Budget snapshot going into the turn.
    pub budget_snapshot: Option<JsonValue>,
    /// Extracted program.
    pub repl_code: Option<String>,
    /// Step observables.
    pub step: Option<JsonValue>,
    /// Spans read during the step.
    pub span_log: Vec<SpanLogEntry>,
    /// Tool requests queued during the step.
    pub tool_requests: Option<ToolRequestsEnvelope>,
    /// Resolved tool results.
    pub tool_results: Option<ToolResultsEnvelope>,
}

/// A recorded root-output parse failure.
#[derive(Debug, Clone)]
pub struct ParseErrorTrace {
    /// Turn the failure occurred at.
    pub turn_index: i64,
    /// Parse error text.
    pub error: String,
    /// The raw root output.
    pub output: String,
}

/// Accumulates turn artifacts for one execution.
#[derive(Debug, Default)]
pub struct TraceCollector {
    redact: bool,
    turns: BTreeMap<i64, TurnTrace>,
    parse_errors: Vec<ParseErrorTrace>,
}

impl TraceCollector {
    /// New collector; `redact` replaces content leaves in the artifact.
    #[must_use]
    pub fn new(redact: bool) -> Self {
        Self {
            redact,
            turns: BTreeMap::new(),
            parse_errors: Vec::new(),
        }
    }

    /// Record the prompt side of a turn.
    pub fn start_turn(
        &mut self,
        turn_index: i64,
        root_prompt: &str,
        root_prompt_version: &str,
        budget_snapshot: Option<&JsonValue>,
    ) {
        let turn = self.turns.entry(turn_index).or_default();
        turn.turn_index = turn_index;
        turn.root_prompt = Some(root_prompt.to_string());
        turn.root_prompt_version = Some(root_prompt_version.to_string());
        turn.budget_snapshot = budget_snapshot.cloned();
    }

    /// Record the extracted program of a turn.
    pub fn record_repl_code(&mut self, turn_index: i64, repl_code: &str) {
        let turn = self.turns.entry(turn_index).or_default();
        turn.turn_index = turn_index;
        turn.repl_code = Some(repl_code.to_string());
    }

    /// Record a root-output parse failure.
    pub fn record_parse_error(&mut self, turn_index: i64, error: &str, output: &str) {
        self.parse_errors.push(ParseErrorTrace {
            turn_index,
            error: error.to_string(),
            output: output.to_string(),
        });
    }

    /// Record the step observables of a turn.
    pub fn record_step(&mut self, turn_index: i64, result: &StepResult) {
        let turn = self.turns.entry(turn_index).or_default();
        turn.turn_index = turn_index;
        turn.step = Some(json!({
            "success": result.success,
            "stdout": result.stdout,
            "final": result.final_marker,
            "error": result.error,
        }));
        turn.span_log = result.span_log.clone();
        turn.tool_requests = result.tool_requests.clone();
    }

    /// Record resolved tool results of a turn.
    pub fn record_tool_results(&mut self, turn_index: i64, results: &ToolResultsEnvelope) {
        let turn = self.turns.entry(turn_index).or_default();
        turn.turn_index = turn_index;
        turn.tool_results = Some(results.clone());
    }

    /// Number of recorded turns.
    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Aggregate metrics over everything recorded.
    #[must_use]
    pub fn metrics(&self) -> JsonObject {
        let mut span_log: Vec<SpanLogEntry> = Vec::new();
        let mut step_errors = 0u64;
        let mut llm_subcalls = 0u64;
        let mut search_requests = 0u64;
        let mut total_subcall_prompt_chars = 0u64;
        for turn in self.turns.values() {
            span_log.extend(turn.span_log.iter().cloned());
            if turn
                .step
                .as_ref()
                .and_then(|step| step.get("error"))
                .is_some_and(|error| !error.is_null())
            {
                step_errors += 1;
            }
            if let Some(requests) = &turn.tool_requests {
                llm_subcalls += requests.llm.len() as u64;
                search_requests += requests.search.len() as u64;
                total_subcall_prompt_chars += requests
                    .llm
                    .iter()
                    .map(|request| request.prompt.chars().count() as u64)
                    .sum::<u64>();
            }
        }
        let mut metrics = compute_span_metrics(&span_log);
        metrics.insert("turns".into(), self.turns.len().into());
        metrics.insert("parse_errors".into(), self.parse_errors.len().into());
        metrics.insert("step_errors".into(), step_errors.into());
        metrics.insert("llm_subcalls".into(), llm_subcalls.into());
        metrics.insert("search_requests".into(), search_requests.into());
        metrics.insert(
            "total_subcall_prompt_chars".into(),
            total_subcall_prompt_chars.into(),
        );
        metrics
    }

    fn maybe_redact(&self, value: JsonValue) -> JsonValue {
        if self.redact { redact_value(&value) } else { value }
    }

    /// Assemble the trace artifact.
    #[must_use]
    pub fn build_artifact(
        &self,
        execution_id: &str,
        session_id: &str,
        documents: &JsonValue,
    ) -> JsonValue {
        let turns: Vec<JsonValue> = self
            .turns
            .values()
            .map(|turn| {
                json!({
                    "turn_index": turn.turn_index,
                    "root_prompt": self.maybe_redact(json!(turn.root_prompt)),
                    "root_prompt_version": turn.root_prompt_version,
                    "budget_snapshot": turn.budget_snapshot,
                    "repl_code": self.maybe_redact(json!(turn.repl_code)),
                    "step": self.maybe_redact(json!(turn.step)),
                    "span_log": turn.span_log,
                    "tool_requests": self.maybe_redact(json!(turn.tool_requests)),
                    "tool_results": self.maybe_redact(json!(turn.tool_results)),
                })
            })
            .collect();
        let parse_errors: Vec<JsonValue> = self
            .parse_errors
            .iter()
            .map(|entry| {
                json!({
                    "turn_index": entry.turn_index,
                    "error": entry.error,
                    "output": self.maybe_redact(json!(entry.output)),
                })
            })
            .collect();
        json!({
            "schema_version": TRACE_SCHEMA_VERSION,
            "execution": execution_id,
            "session": session_id,
            "documents": documents,
            "turns": turns,
            "parse_errors": parse_errors,
            "metrics": self.metrics(),
        })
    }

    /// Persist the artifact gzip-compressed and return its URI.
    ///
    /// # Errors
    ///
    /// Propagates the blob write failure; callers treat it as non-fatal.
    #[allow(clippy::too_many_arguments)]
    pub fn persist(
        &self,
        store: &dyn BlobStore,
        bucket: &str,
        prefix: &str,
        tenant_id: &str,
        execution_id: &str,
        session_id: &str,
        documents: &JsonValue,
    ) -> Result<String, BlobError> {
        let key = build_trace_key(tenant_id, execution_id, prefix);
        let artifact = self.build_artifact(execution_id, session_id, documents);
        store.put_gzip_json(bucket, &key, &artifact)?;
        Ok(join_s3_uri(bucket, &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_core::StepFinal;
    use rlm_store::MemoryBlobStore;

    fn span(doc_index: u32, start: u64, end: u64, tag: Option<&str>) -> SpanLogEntry {
        SpanLogEntry {
            doc_index,
            start_char: start,
            end_char: end,
            tag: tag.map(String::from),
        }
    }

    fn step_result(span_log: Vec<SpanLogEntry>) -> StepResult {
        StepResult {
            success: true,
            stdout: "ok".into(),
            state: None,
            span_log,
            tool_requests: None,
            final_marker: Some(StepFinal { is_final: false, answer: None }),
            error: None,
        }
    }

    #[test]
    fn span_metrics_split_reads_and_scans() {
        let log = vec![
            span(0, 0, 10, None),
            span(0, 5, 15, None),
            span(0, 0, 100, Some("scan:find")),
            span(1, 0, 4, None),
        ];
        let metrics = compute_span_metrics(&log);
        assert_eq!(metrics["span_chars"], 24);
        assert_eq!(metrics["unique_span_chars"], 19);
        assert_eq!(metrics["docs_touched"], 2);
        assert_eq!(metrics["max_span_chars"], 10);
        assert_eq!(metrics["scan_span_chars"], 100);
        assert_eq!(metrics["scan_docs_touched"], 1);
    }

    #[test]
    fn collector_accumulates_turns_in_order() {
        let mut collector = TraceCollector::new(false);
        collector.start_turn(1, "prompt-1", "root_prompt_v1", None);
        collector.start_turn(0, "prompt-0", "root_prompt_v1", None);
        collector.record_repl_code(0, "tool.yield()");
        collector.record_step(0, &step_result(vec![span(0, 0, 5, None)]));

        let artifact = collector.build_artifact("e1", "s1", &json!([]));
        let turns = artifact["turns"].as_array().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["turn_index"], 0);
        assert_eq!(turns[1]["turn_index"], 1);
        assert_eq!(turns[0]["repl_code"], "tool.yield()");
        assert_eq!(artifact["schema_version"], TRACE_SCHEMA_VERSION);
    }

    #[test]
    fn metrics_count_parse_and_step_errors() {
        let mut collector = TraceCollector::new(false);
        collector.record_parse_error(0, "no block", "freeform text");
        let mut failed = step_result(vec![]);
        failed.success = false;
        failed.error = Some(rlm_core::StepError::new(
            rlm_error::ErrorCode::StepTimeout,
            "step exceeded max_step_seconds",
        ));
        collector.record_step(1, &failed);

        let metrics = collector.metrics();
        assert_eq!(metrics["parse_errors"], 1);
        assert_eq!(metrics["step_errors"], 1);
        assert_eq!(metrics["turns"], 1);
    }

    #[test]
    fn redaction_preserves_structure() {
        let value = json!({"a": {"b": [1, "secret"]}, "c": null});
        let redacted = redact_value(&value);
        assert_eq!(
            redacted,
            json!({"a": {"b": ["[REDACTED]", "[REDACTED]"]}, "c": null})
        );
    }

    #[test]
    fn redacting_collector_hides_prompts() {
        let mut collector = TraceCollector::new(true);
        collector.start_turn(0, "sensitive prompt", "root_prompt_v1", None);
        let artifact = collector.build_artifact("e1", "s1", &json!([]));
        assert_eq!(artifact["turns"][0]["root_prompt"], "[REDACTED]");
        // Structural fields stay readable.
        assert_eq!(artifact["turns"][0]["root_prompt_version"], "root_prompt_v1");
    }

    #[test]
    fn persist_writes_gzip_artifact() {
        let store = MemoryBlobStore::new();
        let mut collector = TraceCollector::new(false);
        collector.start_turn(0, "p", "root_prompt_v1", None);
        let uri = collector
            .persist(&store, "bucket", "traces", "t1", "e1", "s1", &json!([]))
            .unwrap();
        assert_eq!(uri, "s3://bucket/traces/t1/e1/trace.json.gz");
        let artifact = store
            .get_gzip_json("bucket", "traces/t1/e1/trace.json.gz")
            .unwrap();
        assert_eq!(artifact["execution"], "e1");
    }
}
