// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model for the RLM runtime.
//!
//! Plain serde types shared by every other crate: lifecycle statuses,
//! budgets and per-step limits, span log entries and citation refs, tool
//! request/result envelopes, step events and results, and the persisted
//! record rows for sessions, documents, executions, and execution state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod readiness;
pub mod records;
pub mod time;

use rlm_error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arbitrary JSON value, the lingua franca of state payloads and metadata.
pub type JsonValue = serde_json::Value;

/// JSON object keyed by strings.
pub type JsonObject = serde_json::Map<String, JsonValue>;

// ---------------------------------------------------------------------------
// Lifecycle statuses
// ---------------------------------------------------------------------------

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Documents are being registered and parsed.
    Creating,
    /// Every document satisfies the session's readiness mode.
    Ready,
    /// Ingestion failed.
    Failed,
    /// TTL elapsed.
    Expired,
    /// Deletion in progress.
    Deleting,
}

/// Per-document ingest status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestStatus {
    /// Row created, raw blob registered.
    Registered,
    /// Parser running.
    Parsing,
    /// Parsed text + offsets available.
    Parsed,
    /// Search indexing running.
    Indexing,
    /// Search index available.
    Indexed,
    /// Ingestion failed.
    Failed,
}

/// Execution lifecycle status. Terminal statuses are reached only from
/// [`ExecutionStatus::Running`] by a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Eligible for scheduling.
    Running,
    /// Finished with an answer.
    Completed,
    /// Hard failure (state corruption, missing prerequisites).
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Per-execution wall clock elapsed.
    Timeout,
    /// A budget dimension was exhausted.
    BudgetExceeded,
    /// The turn budget was exhausted.
    MaxTurnsExceeded,
}

impl ExecutionStatus {
    /// `true` for every status other than [`ExecutionStatus::Running`].
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Execution mode: orchestrator-driven or externally stepped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// The orchestrator drives the loop to a terminal status.
    Answerer,
    /// An external caller drives the loop one step at a time.
    Runtime,
}

/// Resolution status of a queued tool request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolRequestStatus {
    /// Queued, not yet resolved.
    Pending,
    /// Resolved with a usable result.
    Resolved,
    /// Resolution failed; see the result meta.
    Error,
}

impl ToolRequestStatus {
    /// Stable lowercase string form (the value written into `_tool_status`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Budgets, limits, models
// ---------------------------------------------------------------------------

/// Requested budget caps for an execution. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budgets {
    /// Maximum number of turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Maximum total wall-clock seconds across all turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_seconds: Option<u64>,
    /// Per-step wall-clock deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step_seconds: Option<u64>,
    /// Maximum spans across the whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spans_total: Option<u32>,
    /// Maximum spans logged in a single step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spans_per_step: Option<u32>,
    /// Maximum tool requests queued in a single step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_requests_per_step: Option<u32>,
    /// Maximum sub-LLM calls across the whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_llm_subcalls: Option<u32>,
    /// Maximum characters in a single LLM prompt (root or sub).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_llm_prompt_chars: Option<u64>,
    /// Maximum cumulative LLM prompt characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_llm_prompt_chars: Option<u64>,
    /// Stdout truncation limit per step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stdout_chars: Option<u64>,
    /// Canonical state size limit per step, in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_state_chars: Option<u64>,
}

impl Budgets {
    /// Project the per-step enforcement subset out of the full budget set.
    #[must_use]
    pub fn limits_snapshot(&self) -> LimitsSnapshot {
        LimitsSnapshot {
            max_step_seconds: self.max_step_seconds,
            max_spans_per_step: self.max_spans_per_step,
            max_tool_requests_per_step: self.max_tool_requests_per_step,
            max_stdout_chars: self.max_stdout_chars,
            max_state_chars: self.max_state_chars,
            max_code_lines: None,
        }
    }
}

/// The per-step limits handed to the step executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    /// Per-step wall-clock deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step_seconds: Option<u64>,
    /// Maximum spans logged in a single step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spans_per_step: Option<u32>,
    /// Maximum tool requests queued in a single step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_requests_per_step: Option<u32>,
    /// Stdout truncation limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stdout_chars: Option<u64>,
    /// Canonical state size limit in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_state_chars: Option<u64>,
    /// Program line cap, checked before parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_code_lines: Option<u32>,
}

/// Consumed-budget summary recorded on terminal executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetsConsumed {
    /// Turns run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns: Option<u32>,
    /// Sub-LLM calls dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_subcalls: Option<u32>,
    /// Wall-clock seconds elapsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_seconds: Option<u64>,
}

/// Root and sub model names for an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model driving the control loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_model: Option<String>,
    /// Model used for queued sub-calls; absent disables subcalls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_model: Option<String>,
}

/// Session readiness mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadinessMode {
    /// Every document parsed.
    #[default]
    Lax,
    /// Every document parsed and search-indexed.
    Strict,
}

/// Option snapshot taken at session creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Whether `queue_search` is available to programs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_search: Option<bool>,
    /// Readiness mode for executions against this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_mode: Option<ReadinessMode>,
}

// ---------------------------------------------------------------------------
// Spans and citations
// ---------------------------------------------------------------------------

/// A half-open `[start_char, end_char)` read recorded by a document view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanLogEntry {
    /// Index of the document within the session.
    pub doc_index: u32,
    /// Inclusive start character.
    pub start_char: u64,
    /// Exclusive end character.
    pub end_char: u64,
    /// Optional tag; `scan:`-prefixed tags mark probe reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl SpanLogEntry {
    /// `true` when this entry is a scanning probe rather than a read.
    #[must_use]
    pub fn is_scan(&self) -> bool {
        self.tag.as_deref().is_some_and(|t| t.starts_with("scan:"))
    }
}

/// A verified citation: a span plus identity and a text checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRef {
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning session.
    pub session_id: String,
    /// Document identifier.
    pub doc_id: String,
    /// Document index within the session.
    pub doc_index: u32,
    /// Inclusive start character.
    pub start_char: u64,
    /// Exclusive end character.
    pub end_char: u64,
    /// `sha256:`-prefixed digest of the NFC-normalized span text.
    pub checksum: String,
}

// ---------------------------------------------------------------------------
// Tool requests and results
// ---------------------------------------------------------------------------

/// A queued sub-LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolRequest {
    /// Caller-chosen correlation key.
    pub key: String,
    /// Prompt text.
    pub prompt: String,
    /// Model hint (defaults to `"sub"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    /// Output token cap (the three caller aliases resolve here).
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Caller metadata; `requires_llm_keys` enforces read-before-synthesize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonObject>,
}

/// A queued search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchToolRequest {
    /// Caller-chosen correlation key.
    pub key: String,
    /// Query text.
    pub query: String,
    /// Maximum hits requested.
    pub k: u32,
    /// Backend-specific filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<JsonObject>,
}

/// Everything a step queued, grouped by tool kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequestsEnvelope {
    /// Queued sub-LLM requests, in queue order.
    #[serde(default)]
    pub llm: Vec<LlmToolRequest>,
    /// Queued search requests, in queue order.
    #[serde(default)]
    pub search: Vec<SearchToolRequest>,
}

impl ToolRequestsEnvelope {
    /// `true` when nothing was queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.llm.is_empty() && self.search.is_empty()
    }

    /// Total queued requests across both kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.llm.len() + self.search.len()
    }
}

/// Resolved sub-LLM result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmToolResult {
    /// Completion text (empty on error).
    pub text: String,
    /// Resolution metadata; carries `error` on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonObject>,
}

/// A single search hit as a character range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Document index.
    pub doc_index: u32,
    /// Inclusive start character.
    pub start_char: u64,
    /// Exclusive end character.
    pub end_char: u64,
    /// Backend relevance score, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Short preview text, if the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Resolved search result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchToolResult {
    /// Hits, best first.
    pub hits: Vec<SearchHit>,
    /// Resolution metadata; carries `error` on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonObject>,
}

/// Resolved results keyed by the caller-chosen correlation keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResultsEnvelope {
    /// Sub-LLM results by key.
    #[serde(default)]
    pub llm: BTreeMap<String, LlmToolResult>,
    /// Search results by key.
    #[serde(default)]
    pub search: BTreeMap<String, SearchToolResult>,
}

// ---------------------------------------------------------------------------
// Step types
// ---------------------------------------------------------------------------

/// Terminal marker emitted by `tool.yield(...)` or `tool.final(...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinal {
    /// `true` for `final`, `false` for `yield`.
    pub is_final: bool,
    /// The answer (`final`) or the yield reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Structured step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details (violations, limits, observed values).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonObject>,
}

impl StepError {
    /// Build an error without details.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Build an error with structured details.
    #[must_use]
    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: JsonObject) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }
}

/// One document entry of a context manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    /// Document identifier.
    pub doc_id: String,
    /// Dense document index within the session.
    pub doc_index: u32,
    /// Parsed-text blob URI.
    pub text_s3_uri: String,
    /// Structural metadata blob URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_s3_uri: Option<String>,
    /// Character→byte checkpoint index blob URI.
    pub offsets_s3_uri: String,
}

/// The ordered document set a step may read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextManifest {
    /// Documents sorted by `doc_index`.
    pub docs: Vec<ContextDocument>,
}

/// Input to the step executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning session.
    pub session_id: String,
    /// Execution being stepped.
    pub execution_id: String,
    /// Turn this step runs at.
    pub turn_index: i64,
    /// Program source.
    pub code: String,
    /// State payload going into the step (object, string, or null).
    #[serde(default)]
    pub state: Option<JsonValue>,
    /// Documents visible to the program.
    pub context_manifest: ContextManifest,
    /// Prior tool results, for precondition checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<ToolResultsEnvelope>,
    /// Per-step limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsSnapshot>,
}

/// Output of the step executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// `true` iff execution and every post-check passed.
    pub success: bool,
    /// Captured (and truncated) standard output.
    pub stdout: String,
    /// State payload after the step (the pre-step state on failure).
    #[serde(default)]
    pub state: Option<JsonValue>,
    /// Spans read during the step, in program order.
    #[serde(default)]
    pub span_log: Vec<SpanLogEntry>,
    /// Tool requests queued during the step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_requests: Option<ToolRequestsEnvelope>,
    /// Terminal marker, if the program yielded or finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_marker: Option<StepFinal>,
    /// Failure description, if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}
