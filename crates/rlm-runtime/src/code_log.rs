// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only code-log entries for introspection.
//!
//! Not on the critical path: the worker writes these best-effort and an
//! append failure never fails the execution.

use rlm_core::records::CodeLogEntry;
use rlm_core::time::utc_now_string;
use rlm_core::{JsonValue, ToolRequestStatus, ToolRequestsEnvelope, ToolResultsEnvelope};
use rlm_store::RecordStore;
use rlm_trace::redact_value;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

fn entry(source: &str, kind: &str, content: JsonValue) -> CodeLogEntry {
    CodeLogEntry {
        execution_id: String::new(),
        sequence: 0,
        created_at: utc_now_string(),
        source: source.into(),
        kind: kind.into(),
        model_name: None,
        tool_type: None,
        content,
    }
}

/// A parsed program emitted by the root model.
#[must_use]
pub fn build_repl_entry(model_name: Option<&str>, code: &str) -> CodeLogEntry {
    let mut log_entry = entry("ROOT", "REPL", json!(code));
    log_entry.model_name = model_name.map(String::from);
    log_entry
}

/// A root output that failed to parse.
#[must_use]
pub fn build_repl_parse_error_entry(
    model_name: Option<&str>,
    error: &str,
    output: &str,
) -> CodeLogEntry {
    let mut log_entry = entry(
        "ROOT",
        "REPL_PARSE_ERROR",
        json!({"error": error, "output": output}),
    );
    log_entry.model_name = model_name.map(String::from);
    log_entry
}

/// One entry per queued tool request.
#[must_use]
pub fn build_tool_request_entries(envelope: &ToolRequestsEnvelope) -> Vec<CodeLogEntry> {
    let mut entries = Vec::new();
    for request in &envelope.llm {
        let mut log_entry = entry(
            "TOOL",
            "TOOL_REQUEST",
            serde_json::to_value(request).expect("request serializes"),
        );
        log_entry.tool_type = Some("llm".into());
        entries.push(log_entry);
    }
    for request in &envelope.search {
        let mut log_entry = entry(
            "TOOL",
            "TOOL_REQUEST",
            serde_json::to_value(request).expect("request serializes"),
        );
        log_entry.tool_type = Some("search".into());
        entries.push(log_entry);
    }
    entries
}

/// One entry per resolved tool result.
#[must_use]
pub fn build_tool_result_entries(
    results: &ToolResultsEnvelope,
    statuses: &BTreeMap<String, ToolRequestStatus>,
) -> Vec<CodeLogEntry> {
    let mut entries = Vec::new();
    for (key, result) in &results.llm {
        let mut log_entry = entry(
            "TOOL",
            "TOOL_RESULT",
            json!({
                "key": key,
                "status": statuses.get(key).map(ToolRequestStatus::as_str),
                "result": result,
            }),
        );
        log_entry.tool_type = Some("llm".into());
        entries.push(log_entry);
    }
    for (key, result) in &results.search {
        let mut log_entry = entry(
            "TOOL",
            "TOOL_RESULT",
            json!({
                "key": key,
                "status": statuses.get(key).map(ToolRequestStatus::as_str),
                "result": result,
            }),
        );
        log_entry.tool_type = Some("search".into());
        entries.push(log_entry);
    }
    entries
}

/// Best-effort writer for one execution's code log.
pub struct CodeLogWriter {
    records: Arc<dyn RecordStore>,
    execution_id: String,
    redact: bool,
}

impl CodeLogWriter {
    /// New writer; `redact` replaces content leaves before storage.
    pub fn new(records: Arc<dyn RecordStore>, execution_id: impl Into<String>, redact: bool) -> Self {
        Self {
            records,
            execution_id: execution_id.into(),
            redact,
        }
    }

    /// Append entries, redacting content when configured. Failures are
    /// logged and swallowed.
    pub fn write(&self, mut entries: Vec<CodeLogEntry>) {
        if entries.is_empty() {
            return;
        }
        if self.redact {
            for log_entry in &mut entries {
                log_entry.content = redact_value(&log_entry.content);
            }
        }
        if let Err(err) = self.records.append_code_log(&self.execution_id, entries) {
            debug!(
                target: "rlm.orchestrator",
                execution_id = %self.execution_id,
                error = %err,
                "code log append failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_core::{LlmToolRequest, LlmToolResult};
    use rlm_store::MemoryRecordStore;

    #[test]
    fn writer_appends_in_order() {
        let records = Arc::new(MemoryRecordStore::new());
        let writer = CodeLogWriter::new(Arc::clone(&records) as Arc<dyn RecordStore>, "e1", false);
        writer.write(vec![
            build_repl_entry(Some("root-model"), "tool.yield()"),
            build_repl_parse_error_entry(Some("root-model"), "no block", "oops"),
        ]);
        let stored = records.list_code_log("e1").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].kind, "REPL");
        assert_eq!(stored[0].content, json!("tool.yield()"));
        assert_eq!(stored[1].kind, "REPL_PARSE_ERROR");
        assert_eq!(stored[1].sequence, 1);
    }

    #[test]
    fn redaction_applies_to_content_only() {
        let records = Arc::new(MemoryRecordStore::new());
        let writer = CodeLogWriter::new(Arc::clone(&records) as Arc<dyn RecordStore>, "e1", true);
        writer.write(vec![build_repl_entry(None, "secret code")]);
        let stored = records.list_code_log("e1").unwrap();
        assert_eq!(stored[0].content, json!("[REDACTED]"));
        assert_eq!(stored[0].kind, "REPL");
    }

    #[test]
    fn tool_entries_carry_tool_type() {
        let envelope = ToolRequestsEnvelope {
            llm: vec![LlmToolRequest {
                key: "k1".into(),
                prompt: "p".into(),
                model_hint: None,
                max_tokens: 10,
                temperature: None,
                metadata: None,
            }],
            search: vec![],
        };
        let entries = build_tool_request_entries(&envelope);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool_type.as_deref(), Some("llm"));

        let mut results = ToolResultsEnvelope::default();
        results.llm.insert(
            "k1".into(),
            LlmToolResult { text: "t".into(), meta: None },
        );
        let mut statuses = BTreeMap::new();
        statuses.insert("k1".to_string(), ToolRequestStatus::Resolved);
        let entries = build_tool_result_entries(&results, &statuses);
        assert_eq!(entries[0].content["status"], "resolved");
    }
}
