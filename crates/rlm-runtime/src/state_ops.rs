// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reserved-namespace state operations.
//!
//! The orchestrator owns the `_tool_results`, `_tool_status`, `_budgets`,
//! and `_trace` keys of the state object. Programs may rebind `state`
//! wholesale; before persistence the reserved keys are shallow-merged back
//! onto the program's value so orchestrator bookkeeping is never lost.

use rlm_core::{JsonObject, JsonValue, ToolRequestStatus, ToolResultsEnvelope};
use std::collections::BTreeMap;

/// The reserved top-level state keys, owned by the orchestrator.
pub const RESERVED_STATE_KEYS: &[&str] = &["_tool_results", "_tool_status", "_budgets", "_trace"];

/// Errors from reserved-namespace maintenance.
#[derive(Debug, thiserror::Error)]
pub enum StateOpsError {
    /// A reserved key holds a value of the wrong shape.
    #[error("invalid tool state: {0}")]
    InvalidToolState(String),
}

/// Ensure `_tool_results.{llm,search}` and `_tool_status` exist and have the
/// right shapes, creating them when absent.
///
/// # Errors
///
/// [`StateOpsError::InvalidToolState`] when an existing reserved value is
/// not an object.
pub fn ensure_tool_state(state: &mut JsonObject) -> Result<(), StateOpsError> {
    let tool_results = state
        .entry("_tool_results".to_string())
        .or_insert_with(|| serde_json::json!({"llm": {}, "search": {}}));
    let Some(tool_results) = tool_results.as_object_mut() else {
        return Err(StateOpsError::InvalidToolState(
            "_tool_results must be an object".into(),
        ));
    };
    for bucket in ["llm", "search"] {
        let entry = tool_results
            .entry(bucket.to_string())
            .or_insert_with(|| serde_json::json!({}));
        if !entry.is_object() {
            return Err(StateOpsError::InvalidToolState(format!(
                "_tool_results.{bucket} must be an object"
            )));
        }
    }
    let tool_status = state
        .entry("_tool_status".to_string())
        .or_insert_with(|| serde_json::json!({}));
    if !tool_status.is_object() {
        return Err(StateOpsError::InvalidToolState(
            "_tool_status must be an object".into(),
        ));
    }
    Ok(())
}

/// Shallow-merge the reserved keys of `previous` onto `next` (the program's
/// state), returning the merged object.
#[must_use]
pub fn merge_reserved_state(next: JsonObject, previous: &JsonObject) -> JsonObject {
    let mut merged = next;
    for key in RESERVED_STATE_KEYS {
        if let Some(value) = previous.get(*key) {
            merged.insert((*key).to_string(), value.clone());
        }
    }
    merged
}

/// Parse `_tool_results` out of a state payload, `None` when absent or
/// malformed.
#[must_use]
pub fn tool_results_from_state(state: Option<&JsonValue>) -> Option<ToolResultsEnvelope> {
    let raw = state?.as_object()?.get("_tool_results")?;
    serde_json::from_value(raw.clone()).ok()
}

/// Write resolved tool results and statuses into the reserved namespace.
///
/// # Errors
///
/// [`StateOpsError::InvalidToolState`] when the reserved buckets have been
/// corrupted into non-objects.
pub fn apply_tool_results(
    state: &mut JsonObject,
    results: &ToolResultsEnvelope,
    statuses: &BTreeMap<String, ToolRequestStatus>,
) -> Result<(), StateOpsError> {
    ensure_tool_state(state)?;
    let tool_results = state
        .get_mut("_tool_results")
        .and_then(JsonValue::as_object_mut)
        .ok_or_else(|| StateOpsError::InvalidToolState("_tool_results must be an object".into()))?;

    let llm_bucket = tool_results
        .get_mut("llm")
        .and_then(JsonValue::as_object_mut)
        .ok_or_else(|| StateOpsError::InvalidToolState("_tool_results.llm must be an object".into()))?;
    for (key, result) in &results.llm {
        llm_bucket.insert(
            key.clone(),
            serde_json::to_value(result).expect("tool result serializes"),
        );
    }

    let search_bucket = tool_results
        .get_mut("search")
        .and_then(JsonValue::as_object_mut)
        .ok_or_else(|| {
            StateOpsError::InvalidToolState("_tool_results.search must be an object".into())
        })?;
    for (key, result) in &results.search {
        search_bucket.insert(
            key.clone(),
            serde_json::to_value(result).expect("tool result serializes"),
        );
    }

    let tool_status = state
        .get_mut("_tool_status")
        .and_then(JsonValue::as_object_mut)
        .ok_or_else(|| StateOpsError::InvalidToolState("_tool_status must be an object".into()))?;
    for (key, status) in statuses {
        tool_status.insert(key.clone(), serde_json::json!(status.as_str()));
    }
    Ok(())
}
