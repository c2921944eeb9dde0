// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted record rows.
//!
//! These mirror the single-table layout of the record store: one row kind
//! per struct, optional fields omitted from the serialized form.

use crate::{
    Budgets, BudgetsConsumed, ExecutionMode, ExecutionStatus, IngestStatus, JsonObject, JsonValue,
    ModelsConfig, SessionOptions, SessionStatus, SpanLogEntry, SpanRef, StepError, StepFinal,
    ToolRequestsEnvelope,
};
use serde::{Deserialize, Serialize};

/// Session row, keyed by `(tenant_id, session_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Owning tenant.
    pub tenant_id: String,
    /// Session identifier.
    pub session_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: String,
    /// Expiry timestamp.
    pub expires_at: String,
    /// Expiry as an epoch second, for TTL sweeps.
    pub ttl_epoch: i64,
    /// Number of documents, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_count: Option<u32>,
    /// Total parsed characters across documents, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chars: Option<u64>,
    /// Option snapshot taken at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SessionOptions>,
    /// Default models for executions without their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_default: Option<ModelsConfig>,
    /// Default budgets for executions without their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budgets_default: Option<Budgets>,
}

/// Document row, keyed by `(session_id, doc_id)`.
///
/// `doc_index` values form a dense 0-based ordering within the session;
/// once assigned they are never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning session.
    pub session_id: String,
    /// Document identifier.
    pub doc_id: String,
    /// Dense 0-based ordering within the session.
    pub doc_index: u32,
    /// Caller-provided source name.
    pub source_name: String,
    /// MIME type of the raw blob.
    pub mime_type: String,
    /// Raw blob URI.
    pub raw_s3_uri: String,
    /// Parsed-text blob URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_s3_uri: Option<String>,
    /// Structural metadata blob URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_s3_uri: Option<String>,
    /// Offsets (character→byte checkpoint index) blob URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets_s3_uri: Option<String>,
    /// Search index blob URI, once indexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_index_s3_uri: Option<String>,
    /// Parsed text length in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_length: Option<u64>,
    /// Parsed text length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u64>,
    /// `sha256:`-prefixed checksum of the parsed text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_checksum: Option<String>,
    /// Parser version that produced the artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_version: Option<String>,
    /// Ingest status.
    pub ingest_status: IngestStatus,
    /// Failure description when `ingest_status` is `FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Execution row, keyed by `(session_id, execution_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning session.
    pub session_id: String,
    /// Execution identifier.
    pub execution_id: String,
    /// Lifecycle status; terminal statuses only via conditional write.
    pub status: ExecutionStatus,
    /// Answerer or Runtime.
    pub mode: ExecutionMode,
    /// The question being answered (Answerer mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// Requested budget caps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budgets_requested: Option<Budgets>,
    /// Consumed budgets, recorded at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budgets_consumed: Option<BudgetsConsumed>,
    /// Resolved model configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,
    /// Start timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Completion timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Wall-clock duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Final answer, set when `status` is `COMPLETED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Citations backing the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<SpanRef>>,
    /// Trace artifact URI, once exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_s3_uri: Option<String>,
    /// Worker currently holding the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    /// Lease expiry as an epoch second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<i64>,
    /// Last lease acquisition/renewal as an epoch second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_updated_at: Option<i64>,
}

/// Execution-state row: a single row per execution, mutated in place.
///
/// The `state_*` fields and the step-snapshot fields always describe the same
/// turn. Exactly one of `state_json` and `state_s3_uri` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStateRecord {
    /// Execution this row belongs to.
    pub execution_id: String,
    /// Turn the row describes; `-1` before the first runtime step.
    pub turn_index: i64,
    /// Last write timestamp.
    pub updated_at: String,
    /// TTL epoch second inherited from the session.
    pub ttl_epoch: i64,
    /// Inline state payload (small states).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_json: Option<JsonValue>,
    /// Offloaded state blob URI (large states).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_s3_uri: Option<String>,
    /// `sha256:`-prefixed checksum of the canonical state bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Byte/character length summary of the canonical state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<JsonObject>,
    /// Step snapshot: whether the step succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Step snapshot: captured stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Step snapshot: spans read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_log: Option<Vec<SpanLogEntry>>,
    /// Step snapshot: tool requests queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_requests: Option<ToolRequestsEnvelope>,
    /// Step snapshot: terminal marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_marker: Option<StepFinal>,
    /// Step snapshot: failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl ExecutionStateRecord {
    /// `true` when the row carries no step observables, i.e. it describes the
    /// state *before* a step ran at `turn_index`. Such a turn re-runs on
    /// resume rather than advancing.
    #[must_use]
    pub fn is_pre_step(&self) -> bool {
        self.success.is_none()
            && self.stdout.is_none()
            && self.tool_requests.is_none()
            && self.final_marker.is_none()
            && self.error.is_none()
    }

    /// The turn the next step should run at, per the pre-step convention.
    #[must_use]
    pub fn next_turn_index(&self) -> i64 {
        if self.is_pre_step() {
            self.turn_index
        } else {
            self.turn_index + 1
        }
    }
}

/// Append-only introspection entry, keyed by `(execution_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeLogEntry {
    /// Execution this entry belongs to.
    pub execution_id: String,
    /// Monotone sequence within the execution.
    pub sequence: u64,
    /// Write timestamp.
    pub created_at: String,
    /// Producer: `ROOT` or `TOOL`.
    pub source: String,
    /// Entry kind: `REPL`, `REPL_PARSE_ERROR`, `TOOL_REQUEST`, `TOOL_RESULT`.
    pub kind: String,
    /// Model that produced the content, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Tool kind for tool entries: `llm` or `search`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    /// Entry payload (possibly redacted).
    pub content: JsonValue,
}
