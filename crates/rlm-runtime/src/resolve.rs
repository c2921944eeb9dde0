// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool resolution: bounded-concurrency fan-out of queued requests.
//!
//! Budget checks and recording happen serially *before* dispatch so
//! concurrent in-flight calls can never over-commit the budget. A budget
//! breach aborts resolution and bubbles up to a terminal status; individual
//! request failures surface as `status=error` results and never fail the
//! step.

use crate::budget::BudgetTracker;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rlm_core::{
    LlmToolResult, SearchToolResult, ToolRequestStatus, ToolRequestsEnvelope, ToolResultsEnvelope,
};
use rlm_error::ErrorCode;
use rlm_provider::CompletionProvider;
use rlm_search::{SearchBackend, build_error_meta, search_disabled_error_meta};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// A budget dimension was exhausted during resolution.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BudgetBreach {
    /// Human-readable description of the breached dimension.
    pub message: String,
}

/// Resolved results plus the per-key statuses.
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    /// Results keyed by the caller-chosen correlation keys.
    pub results: ToolResultsEnvelope,
    /// `resolved` or `error` per key.
    pub statuses: BTreeMap<String, ToolRequestStatus>,
}

/// Inputs to one resolution pass.
pub struct ResolveRequest<'a> {
    /// The envelope queued by the step.
    pub requests: &'a ToolRequestsEnvelope,
    /// Owning tenant.
    pub tenant_id: &'a str,
    /// Owning session.
    pub session_id: &'a str,
    /// Sub-call model.
    pub sub_model: Option<&'a str>,
    /// Whether search is enabled for the session.
    pub enable_search: bool,
    /// Document indexes visible to search.
    pub doc_indexes: &'a [u32],
    /// Document lengths aligned with `doc_indexes`.
    pub doc_lengths: &'a [u64],
    /// In-flight cap for the LLM fan-out.
    pub max_concurrency: usize,
}

/// Resolve an envelope of queued tool requests.
///
/// # Errors
///
/// [`BudgetBreach`] when an LLM request would exceed the prompt or sub-call
/// budget; the caller finalizes the execution as `BUDGET_EXCEEDED`.
pub async fn resolve_tool_requests(
    request: ResolveRequest<'_>,
    provider: &dyn CompletionProvider,
    search_backend: &dyn SearchBackend,
    tracker: &mut BudgetTracker,
) -> Result<ResolveOutcome, BudgetBreach> {
    let mut outcome = ResolveOutcome::default();

    // Serial budget gate: record every accepted request before any dispatch
    // so concurrent checks stay consistent.
    for llm_request in &request.requests.llm {
        let prompt_chars = llm_request.prompt.chars().count() as u64;
        if !tracker.can_accept_prompt(prompt_chars) {
            return Err(BudgetBreach {
                message: "LLM prompt budget exceeded".into(),
            });
        }
        if !tracker.can_accept_subcalls(1) {
            return Err(BudgetBreach {
                message: "LLM subcall budget exceeded".into(),
            });
        }
        tracker.record_prompt(prompt_chars);
        tracker.record_subcalls(1);
    }

    let mut in_flight = FuturesUnordered::new();
    let mut pending = request.requests.llm.iter();
    let max_concurrency = request.max_concurrency.max(1);
    loop {
        while in_flight.len() < max_concurrency {
            let Some(llm_request) = pending.next() else {
                break;
            };
            let key = llm_request.key.clone();
            in_flight.push(async move {
                let result = provider
                    .complete_subcall(
                        &llm_request.prompt,
                        request.sub_model,
                        llm_request.max_tokens,
                        llm_request.temperature,
                        request.tenant_id,
                    )
                    .await;
                (key, result)
            });
        }
        let Some((key, result)) = in_flight.next().await else {
            break;
        };
        match result {
            Ok(text) => {
                let mut meta = serde_json::Map::new();
                meta.insert("model".into(), json!(request.sub_model));
                outcome.results.llm.insert(
                    key.clone(),
                    LlmToolResult { text, meta: Some(meta) },
                );
                outcome.statuses.insert(key, ToolRequestStatus::Resolved);
            }
            Err(err) => {
                debug!(target: "rlm.orchestrator", key = %key, error = %err, "subcall failed");
                outcome.results.llm.insert(
                    key.clone(),
                    LlmToolResult {
                        text: String::new(),
                        meta: Some(build_error_meta(
                            ErrorCode::LlmProviderError,
                            &err.to_string(),
                            None,
                        )),
                    },
                );
                outcome.statuses.insert(key, ToolRequestStatus::Error);
            }
        }
    }

    for search_request in &request.requests.search {
        if !request.enable_search {
            outcome.results.search.insert(
                search_request.key.clone(),
                SearchToolResult {
                    hits: Vec::new(),
                    meta: Some(search_disabled_error_meta()),
                },
            );
            outcome
                .statuses
                .insert(search_request.key.clone(), ToolRequestStatus::Error);
            continue;
        }
        match search_backend
            .search(
                request.tenant_id,
                request.session_id,
                search_request,
                request.doc_indexes,
                request.doc_lengths,
            )
            .await
        {
            Ok(hits) => {
                let mut meta = serde_json::Map::new();
                meta.insert("query".into(), json!(search_request.query));
                outcome.results.search.insert(
                    search_request.key.clone(),
                    SearchToolResult { hits, meta: Some(meta) },
                );
                outcome
                    .statuses
                    .insert(search_request.key.clone(), ToolRequestStatus::Resolved);
            }
            Err(err) => {
                outcome.results.search.insert(
                    search_request.key.clone(),
                    SearchToolResult {
                        hits: Vec::new(),
                        meta: Some(build_error_meta(
                            ErrorCode::InternalError,
                            "search backend error",
                            Some(json!({"error": err.to_string()})),
                        )),
                    },
                );
                outcome
                    .statuses
                    .insert(search_request.key.clone(), ToolRequestStatus::Error);
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_core::{Budgets, LlmToolRequest, SearchToolRequest};
    use rlm_provider::StaticProvider;
    use rlm_search::StubSearchBackend;

    fn llm_request(key: &str, prompt: &str) -> LlmToolRequest {
        LlmToolRequest {
            key: key.into(),
            prompt: prompt.into(),
            model_hint: Some("sub".into()),
            max_tokens: 100,
            temperature: Some(0.0),
            metadata: None,
        }
    }

    fn search_request(key: &str, query: &str) -> SearchToolRequest {
        SearchToolRequest {
            key: key.into(),
            query: query.into(),
            k: 3,
            filters: None,
        }
    }

    fn resolve_request<'a>(
        requests: &'a ToolRequestsEnvelope,
        enable_search: bool,
    ) -> ResolveRequest<'a> {
        ResolveRequest {
            requests,
            tenant_id: "t1",
            session_id: "s1",
            sub_model: Some("sub-model"),
            enable_search,
            doc_indexes: &[0],
            doc_lengths: &[100],
            max_concurrency: 4,
        }
    }

    #[tokio::test]
    async fn llm_requests_resolve_with_model_meta() {
        let provider = StaticProvider::new();
        let backend = StubSearchBackend;
        let mut tracker = BudgetTracker::new(None);
        let envelope = ToolRequestsEnvelope {
            llm: vec![llm_request("k1", "summarize"), llm_request("k2", "extract")],
            search: vec![],
        };
        let outcome = resolve_tool_requests(
            resolve_request(&envelope, false),
            &provider,
            &backend,
            &mut tracker,
        )
        .await
        .unwrap();
        assert_eq!(outcome.results.llm["k1"].text, "fake:summarize");
        assert_eq!(outcome.results.llm["k2"].text, "fake:extract");
        assert_eq!(outcome.statuses["k1"], ToolRequestStatus::Resolved);
        assert_eq!(
            outcome.results.llm["k1"].meta.as_ref().unwrap()["model"],
            "sub-model"
        );
        assert_eq!(tracker.llm_subcalls(), 2);
    }

    #[tokio::test]
    async fn subcall_budget_breach_aborts() {
        let provider = StaticProvider::new();
        let backend = StubSearchBackend;
        let mut tracker = BudgetTracker::new(Some(Budgets {
            max_llm_subcalls: Some(1),
            ..Budgets::default()
        }));
        let envelope = ToolRequestsEnvelope {
            llm: vec![llm_request("k1", "a"), llm_request("k2", "b")],
            search: vec![],
        };
        let err = resolve_tool_requests(
            resolve_request(&envelope, false),
            &provider,
            &backend,
            &mut tracker,
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("subcall"));
        // Nothing was dispatched.
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn prompt_budget_breach_aborts() {
        let provider = StaticProvider::new();
        let backend = StubSearchBackend;
        let mut tracker = BudgetTracker::new(Some(Budgets {
            max_llm_prompt_chars: Some(3),
            ..Budgets::default()
        }));
        let envelope = ToolRequestsEnvelope {
            llm: vec![llm_request("k1", "longer than three")],
            search: vec![],
        };
        let err = resolve_tool_requests(
            resolve_request(&envelope, false),
            &provider,
            &backend,
            &mut tracker,
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("prompt"));
    }

    #[tokio::test]
    async fn disabled_search_resolves_to_error_status() {
        let provider = StaticProvider::new();
        let backend = StubSearchBackend;
        let mut tracker = BudgetTracker::new(None);
        let envelope = ToolRequestsEnvelope {
            llm: vec![],
            search: vec![search_request("s1", "alpha")],
        };
        let outcome = resolve_tool_requests(
            resolve_request(&envelope, false),
            &provider,
            &backend,
            &mut tracker,
        )
        .await
        .unwrap();
        assert_eq!(outcome.statuses["s1"], ToolRequestStatus::Error);
        let meta = outcome.results.search["s1"].meta.as_ref().unwrap();
        assert_eq!(meta["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(meta["error"]["message"], "Search is disabled");
    }

    #[tokio::test]
    async fn enabled_search_resolves_hits() {
        let provider = StaticProvider::new();
        let backend = StubSearchBackend;
        let mut tracker = BudgetTracker::new(None);
        let envelope = ToolRequestsEnvelope {
            llm: vec![],
            search: vec![search_request("s1", "alpha")],
        };
        let outcome = resolve_tool_requests(
            resolve_request(&envelope, true),
            &provider,
            &backend,
            &mut tracker,
        )
        .await
        .unwrap();
        assert_eq!(outcome.statuses["s1"], ToolRequestStatus::Resolved);
        assert_eq!(outcome.results.search["s1"].hits.len(), 3);
    }
}
