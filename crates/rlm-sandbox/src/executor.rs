// SPDX-License-Identifier: MIT OR Apache-2.0
//! The step executor.
//!
//! Accepts a [`StepEvent`], runs the program through policy validation and
//! the interpreter, classifies the termination, and applies the ordered
//! post-checks: state validation + size, tool-request count, span count.
//! On any failure the state from before the step is retained, but the span
//! log and tool requests observed so far are still reported.

use crate::objects::{ContextObject, ToolObject};
use crate::policy;
use crate::tool::ToolApi;
use rlm_context::ContextView;
use rlm_core::{JsonObject, LimitsSnapshot, StepError, StepEvent, StepFinal, StepResult};
use rlm_error::ErrorCode;
use rlm_repl::{Interp, InterpConfig, RunError, Value, parse_program};
use rlm_state::canonical_state_bytes;
use rlm_store::BlobStore;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Execute one step.
#[must_use]
pub fn execute_step(event: &StepEvent, store: Arc<dyn BlobStore>) -> StepResult {
    let limits = event.limits.as_ref();

    if let Some(max_lines) = limits.and_then(|l| l.max_code_lines) {
        let observed = event.code.lines().count() as u32;
        if observed > max_lines {
            let mut details = JsonObject::new();
            details.insert("limit".into(), max_lines.into());
            details.insert("observed".into(), observed.into());
            return failed(
                event,
                String::new(),
                Vec::new(),
                None,
                StepError::with_details(
                    ErrorCode::SandboxLineLimit,
                    format!("program exceeds {max_lines} lines"),
                    details,
                ),
            );
        }
    }

    let program = match parse_program(&event.code) {
        Ok(program) => program,
        Err(err) => {
            let mut details = JsonObject::new();
            details.insert("line".into(), err.line.into());
            details.insert("col".into(), err.col.into());
            return failed(
                event,
                String::new(),
                Vec::new(),
                None,
                StepError::with_details(ErrorCode::ValidationError, err.message, details),
            );
        }
    };

    if let Err(violations) = policy::validate_program(&program) {
        let message = violations
            .iter()
            .map(|v| format!("{} at {}:{}", v.message, v.line, v.col))
            .collect::<Vec<_>>()
            .join("; ");
        let mut details = JsonObject::new();
        details.insert(
            "violations".into(),
            serde_json::to_value(&violations).unwrap_or_default(),
        );
        return failed(
            event,
            String::new(),
            Vec::new(),
            None,
            StepError::with_details(ErrorCode::SandboxAstRejected, message, details),
        );
    }

    let max_step_seconds = limits.and_then(|l| l.max_step_seconds);
    if max_step_seconds == Some(0) {
        let mut details = JsonObject::new();
        details.insert("limit".into(), 0.into());
        return failed(
            event,
            String::new(),
            Vec::new(),
            None,
            StepError::with_details(
                ErrorCode::StepTimeout,
                "step exceeded max_step_seconds",
                details,
            ),
        );
    }

    let context_view = match ContextView::new(&event.context_manifest, store) {
        Ok(view) => Rc::new(view),
        Err(err) => {
            return failed(
                event,
                String::new(),
                Vec::new(),
                None,
                StepError::new(ErrorCode::InternalError, err.to_string()),
            );
        }
    };
    let tool_api = Rc::new(ToolApi::new(
        event.limits.clone(),
        event.tool_results.as_ref(),
    ));

    let mut globals: BTreeMap<String, Value> = BTreeMap::new();
    globals.insert(
        "context".into(),
        Value::Native(Rc::new(ContextObject::new(Rc::clone(&context_view)))),
    );
    globals.insert(
        "state".into(),
        event
            .state
            .as_ref()
            .map_or(Value::None, Value::from_json),
    );
    globals.insert(
        "tool".into(),
        Value::Native(Rc::new(ToolObject::new(Rc::clone(&tool_api)))),
    );

    let deadline = max_step_seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut interp = Interp::new(InterpConfig { deadline });
    let outcome = interp.run(&program, globals);

    let stdout = truncate_chars(&outcome.stdout, limits.and_then(|l| l.max_stdout_chars));
    let span_log = context_view.span_log();
    let tool_requests = tool_api.tool_requests();

    debug!(
        target: "rlm.step",
        execution_id = %event.execution_id,
        turn_index = event.turn_index,
        spans = span_log.len(),
        tools = tool_requests.as_ref().map_or(0, rlm_core::ToolRequestsEnvelope::len),
        "step program finished"
    );

    // Classify the termination.
    let (final_marker, error) = match outcome.result {
        Ok(()) => (None, None),
        Err(RunError::Yield(reason)) => (
            Some(StepFinal { is_final: false, answer: reason }),
            None,
        ),
        Err(RunError::Final(answer)) => (
            Some(StepFinal { is_final: true, answer: Some(answer) }),
            None,
        ),
        Err(RunError::Timeout) => {
            let mut details = JsonObject::new();
            if let Some(limit) = max_step_seconds {
                details.insert("limit".into(), limit.into());
            }
            (
                None,
                Some(StepError::with_details(
                    ErrorCode::StepTimeout,
                    "step exceeded max_step_seconds",
                    details,
                )),
            )
        }
        Err(RunError::ToolLimit { limit }) => {
            let mut details = JsonObject::new();
            details.insert("limit".into(), limit.into());
            (
                None,
                Some(StepError::with_details(
                    ErrorCode::BudgetExceeded,
                    format!("tool request limit exceeded: {limit}"),
                    details,
                )),
            )
        }
        Err(RunError::Precondition { message, missing }) => {
            let mut details = JsonObject::new();
            details.insert(
                "missing_llm_keys".into(),
                serde_json::Value::from(missing),
            );
            (
                None,
                Some(StepError::with_details(
                    ErrorCode::ValidationError,
                    message,
                    details,
                )),
            )
        }
        Err(RunError::Exception { kind, message }) => {
            let code = if kind == "S3ReadError" {
                ErrorCode::S3ReadError
            } else {
                ErrorCode::InternalError
            };
            let mut details = JsonObject::new();
            details.insert("type".into(), serde_json::Value::from(kind.clone()));
            (
                None,
                Some(StepError::with_details(
                    code,
                    format!("{kind}: {message}"),
                    details,
                )),
            )
        }
    };

    if let Some(error) = error {
        return failed(event, stdout, span_log, tool_requests, error);
    }

    // The program may rebind `state` wholesale; read the binding back out.
    let state_value = match interp.global("state").map(Value::to_json) {
        None | Some(Ok(serde_json::Value::Null)) => None,
        Some(Ok(value)) => Some(value),
        Some(Err(err)) => {
            return failed(
                event,
                stdout,
                span_log,
                tool_requests,
                StepError::new(ErrorCode::StateInvalidType, err.to_string()),
            );
        }
    };

    // Post-check 1: state validation + size limit. Failure retains the
    // pre-step state.
    if let Some(error) = state_limit_error(state_value.as_ref(), limits) {
        return failed(event, stdout, span_log, tool_requests, error);
    }

    // Post-check 2: tool-request count.
    if let Some(limit) = limits.and_then(|l| l.max_tool_requests_per_step) {
        let observed = tool_api.queued_len() as u32;
        if observed > limit {
            let mut details = JsonObject::new();
            details.insert("limit".into(), limit.into());
            details.insert("observed".into(), observed.into());
            return StepResult {
                success: false,
                stdout,
                state: state_value,
                span_log,
                tool_requests,
                final_marker: None,
                error: Some(StepError::with_details(
                    ErrorCode::BudgetExceeded,
                    format!("tool request limit exceeded: {limit}"),
                    details,
                )),
            };
        }
    }

    // Post-check 3: span count.
    if let Some(limit) = limits.and_then(|l| l.max_spans_per_step) {
        let observed = span_log.len() as u32;
        if observed > limit {
            let mut details = JsonObject::new();
            details.insert("limit".into(), limit.into());
            details.insert("observed".into(), observed.into());
            return StepResult {
                success: false,
                stdout,
                state: state_value,
                span_log,
                tool_requests,
                final_marker: None,
                error: Some(StepError::with_details(
                    ErrorCode::BudgetExceeded,
                    format!("span limit exceeded: {limit}"),
                    details,
                )),
            };
        }
    }

    StepResult {
        success: true,
        stdout,
        state: state_value,
        span_log,
        tool_requests,
        final_marker,
        error: None,
    }
}

fn failed(
    event: &StepEvent,
    stdout: String,
    span_log: Vec<rlm_core::SpanLogEntry>,
    tool_requests: Option<rlm_core::ToolRequestsEnvelope>,
    error: StepError,
) -> StepResult {
    StepResult {
        success: false,
        stdout,
        state: event.state.clone(),
        span_log,
        tool_requests,
        final_marker: None,
        error: Some(error),
    }
}

fn state_limit_error(
    state: Option<&serde_json::Value>,
    limits: Option<&LimitsSnapshot>,
) -> Option<StepError> {
    if let Err(err) = rlm_state::validate_state_payload(state) {
        return Some(StepError::new(ErrorCode::StateInvalidType, err.to_string()));
    }
    let max_state_chars = limits.and_then(|l| l.max_state_chars)?;
    let canonical = canonical_state_bytes(state);
    let observed = String::from_utf8_lossy(&canonical).chars().count() as u64;
    if observed <= max_state_chars {
        return None;
    }
    let mut details = JsonObject::new();
    details.insert("limit".into(), max_state_chars.into());
    details.insert("observed".into(), observed.into());
    Some(StepError::with_details(
        ErrorCode::StateTooLarge,
        format!("state size exceeded: {max_state_chars}"),
        details,
    ))
}

/// Character-count truncation of captured stdout.
fn truncate_chars(text: &str, limit: Option<u64>) -> String {
    match limit {
        None => text.to_string(),
        Some(limit) => text.chars().take(limit as usize).collect(),
    }
}
