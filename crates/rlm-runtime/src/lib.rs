// SPDX-License-Identifier: MIT OR Apache-2.0
//! Orchestration for the RLM runtime.
//!
//! The [`worker::OrchestratorWorker`] drives Answerer executions: it scans
//! for runnable rows, acquires the per-execution lease, and repeats
//! {build prompt, elicit program, execute step, merge state, resolve tools}
//! until a terminal status. The [`runtime_api::RuntimeService`] exposes the
//! same step machinery to external callers who drive the loop themselves.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod budget;
pub mod code_log;
pub mod resolve;
pub mod runtime_api;
pub mod state_ops;
pub mod worker;

pub use budget::BudgetTracker;
pub use runtime_api::RuntimeService;
pub use worker::OrchestratorWorker;

use rlm_core::{Budgets, ModelsConfig};

/// Process-level configuration shared by the worker and the runtime API.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Blob bucket holding parsed text, state, caches, and traces.
    pub bucket: String,
    /// Key prefix for offloaded state blobs.
    pub state_prefix: String,
    /// Key prefix for the LLM and search caches.
    pub cache_prefix: String,
    /// Key prefix for trace artifacts.
    pub trace_prefix: String,
    /// Whether `queue_search` is available when the session does not say.
    pub enable_search: bool,
    /// Replace content leaves in traces and code-log entries.
    pub enable_trace_redaction: bool,
    /// Fallback models when neither execution nor session carries any.
    pub default_models: Option<ModelsConfig>,
    /// Fallback budgets when neither execution nor session carries any.
    pub default_budgets: Option<Budgets>,
    /// Lease duration for Answerer executions, in seconds.
    pub lease_duration_seconds: i64,
    /// In-flight cap for the LLM fan-out.
    pub tool_resolution_max_concurrency: usize,
    /// Inline-vs-offload threshold for state payloads.
    pub max_inline_state_bytes: usize,
    /// Program line cap, enforced before parsing.
    pub max_code_lines: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bucket: "rlm".into(),
            state_prefix: rlm_state::DEFAULT_STATE_PREFIX.into(),
            cache_prefix: "cache".into(),
            trace_prefix: rlm_trace::DEFAULT_TRACE_PREFIX.into(),
            enable_search: false,
            enable_trace_redaction: false,
            default_models: None,
            default_budgets: None,
            lease_duration_seconds: 30,
            tool_resolution_max_concurrency: 4,
            max_inline_state_bytes: rlm_state::DEFAULT_INLINE_MAX_BYTES,
            max_code_lines: None,
        }
    }
}
