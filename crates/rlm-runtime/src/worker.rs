// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Answerer control loop.
//!
//! Per tick: scan for `RUNNING ∧ ANSWERER` rows (sorted by session then
//! execution for stable fairness), attempt the conditional lease, and drive
//! each held execution to a terminal status. Every terminal transition is a
//! conditional write guarded on `expected_status = RUNNING`; a lost
//! condition means another replica finalized first and is not an error.

use crate::budget::BudgetTracker;
use crate::code_log::{
    CodeLogWriter, build_repl_entry, build_repl_parse_error_entry, build_tool_request_entries,
    build_tool_result_entries,
};
use crate::resolve::{ResolveRequest, resolve_tool_requests};
use crate::state_ops::{
    apply_tool_results, ensure_tool_state, merge_reserved_state, tool_results_from_state,
};
use crate::Settings;
use rlm_citation::{DocumentText, make_span_refs};
use rlm_core::records::{DocumentRecord, ExecutionRecord, SessionRecord};
use rlm_core::time::{epoch_now, utc_now_string};
use rlm_core::{
    Budgets, ContextDocument, ContextManifest, ExecutionStatus, JsonObject, JsonValue,
    ModelsConfig, SpanLogEntry, StepError, StepEvent, StepResult,
};
use rlm_prompt::{ROOT_PROMPT_VERSION, RootPromptInputs, build_root_prompt, parse_root_output};
use rlm_provider::CompletionProvider;
use rlm_sandbox::execute_step;
use rlm_search::SearchBackend;
use rlm_state::persist_state_payload;
use rlm_store::{BlobStore, ExecutionFinalization, RecordStore, split_s3_uri};
use rlm_trace::TraceCollector;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors that abort the replica's work on an execution without finalizing
/// it. The lease is released on the way out and the row stays `RUNNING`, so
/// a future tick (here or on another replica) retries.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Record store failure.
    #[error("record store failure")]
    Record(#[from] rlm_store::RecordError),
    /// The root completion failed after exhausting retries.
    #[error("completion provider failure")]
    Provider(#[from] rlm_provider::ProviderError),
}

/// One worker replica.
pub struct OrchestratorWorker {
    settings: Settings,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    provider: Arc<dyn CompletionProvider>,
    search: Arc<dyn SearchBackend>,
    owner_id: String,
}

/// Everything loaded up-front for one execution run.
struct ExecutionContext {
    session: SessionRecord,
    documents: Vec<DocumentRecord>,
    manifest: ContextManifest,
    doc_indexes: Vec<u32>,
    doc_lengths: Vec<u64>,
    models: ModelsConfig,
    budgets: Option<Budgets>,
    enable_search: bool,
}

impl OrchestratorWorker {
    /// Build a worker replica with a fresh owner id.
    pub fn new(
        settings: Settings,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        provider: Arc<dyn CompletionProvider>,
        search: Arc<dyn SearchBackend>,
    ) -> Self {
        Self {
            settings,
            records,
            blobs,
            provider,
            search,
            owner_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// This replica's lease owner id.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// One scheduler tick: scan, lease, drive. Returns how many executions
    /// this replica processed.
    ///
    /// # Errors
    ///
    /// Storage and provider failures propagate after the lease is released;
    /// the execution row stays `RUNNING`, so a later tick retries it.
    /// Execution-level failures (bad state, missing prerequisites) finalize
    /// the execution instead.
    pub async fn run_once(&self, limit: Option<usize>) -> Result<usize, WorkerError> {
        let candidates = self.records.list_running_answerers()?;
        let mut processed = 0;
        for candidate in candidates {
            if limit.is_some_and(|limit| processed >= limit) {
                break;
            }
            let acquired = self.records.acquire_lease(
                &candidate.session_id,
                &candidate.execution_id,
                &self.owner_id,
                epoch_now(),
                self.settings.lease_duration_seconds,
            )?;
            if !acquired {
                // Another replica holds this execution; move on.
                continue;
            }
            let outcome = self.run_execution(&candidate).await;
            self.records.release_lease(
                &candidate.session_id,
                &candidate.execution_id,
                &self.owner_id,
            )?;
            if outcome? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Drive one held execution to a terminal status.
    async fn run_execution(&self, execution: &ExecutionRecord) -> Result<bool, WorkerError> {
        let session_id = &execution.session_id;
        let execution_id = &execution.execution_id;
        let tenant_id = &execution.tenant_id;
        let question = execution.question.clone().unwrap_or_default();

        let Some(context) = self.load_execution_context(execution)? else {
            self.finalize(execution, ExecutionStatus::Failed, None, None, None, None)?;
            return Ok(true);
        };
        let Some(root_model) = context.models.root_model.clone() else {
            self.finalize(execution, ExecutionStatus::Failed, None, None, None, None)?;
            return Ok(true);
        };
        let sub_model = context.models.sub_model.clone();
        let subcalls_enabled = sub_model.is_some();

        let Some(state_row) = self.records.get_execution_state(execution_id)? else {
            self.finalize(execution, ExecutionStatus::Failed, None, None, None, None)?;
            return Ok(true);
        };
        let loaded = rlm_state::load_state_payload(
            state_row.state_json.as_ref(),
            state_row.state_s3_uri.as_deref(),
            self.blobs.as_ref(),
        );
        let mut state: JsonObject = match loaded {
            Ok(None) | Ok(Some(JsonValue::Null)) => JsonObject::new(),
            Ok(Some(JsonValue::Object(map))) => map,
            Ok(Some(_)) | Err(_) => {
                self.finalize(execution, ExecutionStatus::Failed, None, None, None, None)?;
                return Ok(true);
            }
        };
        if ensure_tool_state(&mut state).is_err() {
            self.finalize(execution, ExecutionStatus::Failed, None, None, None, None)?;
            return Ok(true);
        }

        let mut tracker =
            BudgetTracker::from_state(Some(&JsonValue::Object(state.clone())), context.budgets.clone());
        let mut turn_index = state_row.next_turn_index().max(0);
        let mut last_stdout = state_row.stdout.clone().unwrap_or_default();
        let mut last_error = state_row.error.as_ref().map(format_step_error);
        let mut span_log: Vec<SpanLogEntry> = Vec::new();
        let mut collector = TraceCollector::new(self.settings.enable_trace_redaction);
        let code_log = CodeLogWriter::new(
            Arc::clone(&self.records),
            execution_id.clone(),
            self.settings.enable_trace_redaction,
        );
        let limits = context.budgets.as_ref().map(|budgets| {
            let mut limits = budgets.limits_snapshot();
            limits.max_code_lines = self.settings.max_code_lines;
            limits
        });
        let run_start = Instant::now();

        info!(
            target: "rlm.orchestrator",
            execution_id = %execution_id,
            session_id = %session_id,
            turn_index,
            "driving execution"
        );

        loop {
            if tracker.over_max_turns() {
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::MaxTurnsExceeded,
                    &tracker,
                    run_start,
                    None,
                    None,
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }
            if tracker.over_total_seconds() {
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::BudgetExceeded,
                    &tracker,
                    run_start,
                    None,
                    None,
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }

            let budget_snapshot = tracker.snapshot();
            if let Some(snapshot) = &budget_snapshot {
                state.insert("_budgets".into(), snapshot.clone());
            }
            let prompt = build_root_prompt(&RootPromptInputs {
                question: &question,
                doc_count: context.doc_lengths.len(),
                doc_lengths_chars: &context.doc_lengths,
                budget_snapshot: budget_snapshot.as_ref(),
                last_stdout: if last_stdout.is_empty() {
                    None
                } else {
                    Some(&last_stdout)
                },
                last_error: last_error.as_deref(),
                subcalls_enabled,
            });
            let prompt_chars = prompt.chars().count() as u64;
            if !tracker.can_accept_prompt(prompt_chars) {
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::BudgetExceeded,
                    &tracker,
                    run_start,
                    None,
                    None,
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }
            collector.start_turn(turn_index, &prompt, ROOT_PROMPT_VERSION, budget_snapshot.as_ref());

            // A provider failure propagates: run_once releases the lease on
            // the way out and the row stays RUNNING for a later tick.
            let root_output = self
                .provider
                .complete_root(&prompt, Some(&root_model), tenant_id)
                .await?;
            tracker.record_prompt(prompt_chars);

            let code = match parse_root_output(&root_output) {
                Ok(code) => code,
                Err(err) => {
                    debug!(
                        target: "rlm.orchestrator",
                        execution_id = %execution_id,
                        turn_index,
                        "root output parse error"
                    );
                    collector.record_parse_error(turn_index, &err.0, &root_output);
                    code_log.write(vec![build_repl_parse_error_entry(
                        Some(&root_model),
                        &err.0,
                        &root_output,
                    )]);
                    last_error = Some(err.0);
                    tracker.record_turn();
                    continue;
                }
            };
            collector.record_repl_code(turn_index, &code);
            code_log.write(vec![build_repl_entry(Some(&root_model), &code)]);

            let event = StepEvent {
                tenant_id: tenant_id.clone(),
                session_id: session_id.clone(),
                execution_id: execution_id.clone(),
                turn_index,
                code,
                state: Some(JsonValue::Object(state.clone())),
                context_manifest: context.manifest.clone(),
                tool_results: tool_results_from_state(Some(&JsonValue::Object(state.clone()))),
                limits: limits.clone(),
            };
            let result = execute_step(&event, Arc::clone(&self.blobs));
            span_log.extend(result.span_log.iter().cloned());
            tracker.record_turn();
            collector.record_step(turn_index, &result);
            if let Some(requests) = &result.tool_requests {
                code_log.write(build_tool_request_entries(requests));
            }

            // Merge reserved keys back over whatever the program produced.
            let mut next_state = match &result.state {
                Some(JsonValue::Object(map)) => merge_reserved_state(map.clone(), &state),
                _ => state.clone(),
            };
            if ensure_tool_state(&mut next_state).is_err() {
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::Failed,
                    &tracker,
                    run_start,
                    None,
                    None,
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }
            if let Some(snapshot) = tracker.snapshot() {
                next_state.insert("_budgets".into(), snapshot);
            }

            if self
                .persist_turn(execution, &context, &next_state, turn_index, &result)
                .is_err()
            {
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::Failed,
                    &tracker,
                    run_start,
                    None,
                    None,
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }

            state = next_state;
            last_stdout = result.stdout.clone();
            last_error = result.error.as_ref().map(format_step_error);
            turn_index += 1;

            if result
                .final_marker
                .as_ref()
                .is_some_and(|marker| marker.is_final)
            {
                let answer = result
                    .final_marker
                    .as_ref()
                    .and_then(|marker| marker.answer.clone())
                    .unwrap_or_default();
                let citations = self.build_citations(tenant_id, session_id, &context, &span_log);
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::Completed,
                    &tracker,
                    run_start,
                    Some(answer),
                    Some(citations),
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }

            if !result.success || result.tool_requests.is_none() {
                continue;
            }
            let requests = result.tool_requests.clone().unwrap_or_default();

            let resolve_outcome = resolve_tool_requests(
                ResolveRequest {
                    requests: &requests,
                    tenant_id,
                    session_id,
                    sub_model: sub_model.as_deref(),
                    enable_search: context.enable_search,
                    doc_indexes: &context.doc_indexes,
                    doc_lengths: &context.doc_lengths,
                    max_concurrency: self.settings.tool_resolution_max_concurrency,
                },
                self.provider.as_ref(),
                self.search.as_ref(),
                &mut tracker,
            )
            .await;
            let outcome = match resolve_outcome {
                Ok(outcome) => outcome,
                Err(breach) => {
                    debug!(
                        target: "rlm.orchestrator",
                        execution_id = %execution_id,
                        reason = %breach,
                        "tool resolution budget breach"
                    );
                    self.finalize_with_trace(
                        execution,
                        ExecutionStatus::BudgetExceeded,
                        &tracker,
                        run_start,
                        None,
                        None,
                        &collector,
                        &context,
                    )?;
                    return Ok(true);
                }
            };
            collector.record_tool_results(turn_index - 1, &outcome.results);
            code_log.write(build_tool_result_entries(&outcome.results, &outcome.statuses));

            if apply_tool_results(&mut state, &outcome.results, &outcome.statuses).is_err() {
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::Failed,
                    &tracker,
                    run_start,
                    None,
                    None,
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }
            if let Some(snapshot) = tracker.snapshot() {
                state.insert("_budgets".into(), snapshot);
            }
            // Re-persist at the same turn_index: the tool results belong to
            // the step that queued them.
            if self
                .persist_turn(execution, &context, &state, turn_index - 1, &result)
                .is_err()
            {
                self.finalize_with_trace(
                    execution,
                    ExecutionStatus::Failed,
                    &tracker,
                    run_start,
                    None,
                    None,
                    &collector,
                    &context,
                )?;
                return Ok(true);
            }
        }
    }

    fn load_execution_context(
        &self,
        execution: &ExecutionRecord,
    ) -> Result<Option<ExecutionContext>, WorkerError> {
        let Some(session) = self
            .records
            .get_session(&execution.tenant_id, &execution.session_id)?
        else {
            return Ok(None);
        };
        let documents = self.records.list_documents(&execution.session_id)?;
        if documents.is_empty() {
            return Ok(None);
        }

        let models = resolve_models(execution, &session, &self.settings);
        let budgets = resolve_budgets(execution, &session, &self.settings);
        let Some(models) = models else {
            return Ok(None);
        };

        let mut manifest_docs = Vec::with_capacity(documents.len());
        for document in &documents {
            let (Some(text_s3_uri), Some(offsets_s3_uri)) =
                (&document.text_s3_uri, &document.offsets_s3_uri)
            else {
                return Ok(None);
            };
            manifest_docs.push(ContextDocument {
                doc_id: document.doc_id.clone(),
                doc_index: document.doc_index,
                text_s3_uri: text_s3_uri.clone(),
                meta_s3_uri: document.meta_s3_uri.clone(),
                offsets_s3_uri: offsets_s3_uri.clone(),
            });
        }
        let doc_indexes: Vec<u32> = documents.iter().map(|doc| doc.doc_index).collect();
        let doc_lengths = self.doc_lengths(&documents);
        let enable_search = session
            .options
            .as_ref()
            .and_then(|options| options.enable_search)
            .unwrap_or(self.settings.enable_search);

        Ok(Some(ExecutionContext {
            session,
            documents,
            manifest: ContextManifest { docs: manifest_docs },
            doc_indexes,
            doc_lengths,
            models,
            budgets,
            enable_search,
        }))
    }

    /// Character length per document: prefer the stored value, else the
    /// offsets blob, else decode the text blob.
    fn doc_lengths(&self, documents: &[DocumentRecord]) -> Vec<u64> {
        documents
            .iter()
            .map(|document| {
                if let Some(length) = document.char_length {
                    return length;
                }
                if let Some(uri) = &document.offsets_s3_uri
                    && let Ok((bucket, key)) = split_s3_uri(uri)
                    && let Ok(payload) = self.blobs.get_json(&bucket, &key)
                    && let Some(length) = payload.get("char_length").and_then(JsonValue::as_u64)
                {
                    return length;
                }
                if let Some(uri) = &document.text_s3_uri
                    && let Ok((bucket, key)) = split_s3_uri(uri)
                    && let Ok(bytes) = self.blobs.get_bytes(&bucket, &key)
                {
                    return String::from_utf8_lossy(&bytes).chars().count() as u64;
                }
                0
            })
            .collect()
    }

    fn persist_turn(
        &self,
        execution: &ExecutionRecord,
        context: &ExecutionContext,
        state: &JsonObject,
        turn_index: i64,
        result: &StepResult,
    ) -> Result<(), rlm_state::StateError> {
        let payload = JsonValue::Object(state.clone());
        let record = persist_state_payload(
            Some(&payload),
            &execution.tenant_id,
            &execution.execution_id,
            turn_index,
            self.settings.max_inline_state_bytes,
            Some(self.blobs.as_ref()),
            Some(&self.settings.bucket),
            &self.settings.state_prefix,
        )?;
        let row = rlm_core::records::ExecutionStateRecord {
            execution_id: execution.execution_id.clone(),
            turn_index,
            updated_at: utc_now_string(),
            ttl_epoch: context.session.ttl_epoch,
            state_json: record.state_json,
            state_s3_uri: record.state_s3_uri,
            checksum: Some(record.checksum),
            summary: Some(record.summary),
            success: Some(result.success),
            stdout: Some(result.stdout.clone()),
            span_log: Some(result.span_log.clone()),
            tool_requests: Some(result.tool_requests.clone().unwrap_or_default()),
            final_marker: result.final_marker.clone(),
            error: result.error.clone(),
        };
        self.records
            .put_execution_state(row)
            .map_err(|err| rlm_state::StateError::Offload(err.to_string()))?;
        Ok(())
    }

    /// Read every document's full text and project the span log to
    /// citations. Any failure yields an empty citation list rather than
    /// failing the completed execution.
    fn build_citations(
        &self,
        tenant_id: &str,
        session_id: &str,
        context: &ExecutionContext,
        span_log: &[SpanLogEntry],
    ) -> Vec<rlm_core::SpanRef> {
        let mut documents = Vec::with_capacity(context.documents.len());
        for document in &context.documents {
            let Some(uri) = &document.text_s3_uri else {
                return Vec::new();
            };
            let Ok((bucket, key)) = split_s3_uri(uri) else {
                return Vec::new();
            };
            let Ok(bytes) = self.blobs.get_bytes(&bucket, &key) else {
                return Vec::new();
            };
            let Ok(text) = String::from_utf8(bytes) else {
                return Vec::new();
            };
            documents.push(DocumentText {
                doc_id: document.doc_id.clone(),
                doc_index: document.doc_index,
                text,
            });
        }
        make_span_refs(span_log, &documents, tenant_id, session_id, 0).unwrap_or_default()
    }

    fn finalize(
        &self,
        execution: &ExecutionRecord,
        status: ExecutionStatus,
        tracker: Option<&BudgetTracker>,
        answer: Option<String>,
        citations: Option<Vec<rlm_core::SpanRef>>,
        trace_s3_uri: Option<String>,
    ) -> Result<bool, WorkerError> {
        let updated = self.records.update_execution_status(
            &execution.session_id,
            &execution.execution_id,
            ExecutionStatus::Running,
            status,
            ExecutionFinalization {
                answer,
                citations,
                budgets_consumed: tracker.map(BudgetTracker::consumed),
                completed_at: Some(utc_now_string()),
                duration_ms: None,
                trace_s3_uri,
            },
        )?;
        info!(
            target: "rlm.orchestrator",
            execution_id = %execution.execution_id,
            status = ?status,
            updated,
            "finalized execution"
        );
        Ok(updated)
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize_with_trace(
        &self,
        execution: &ExecutionRecord,
        status: ExecutionStatus,
        tracker: &BudgetTracker,
        run_start: Instant,
        answer: Option<String>,
        citations: Option<Vec<rlm_core::SpanRef>>,
        collector: &TraceCollector,
        context: &ExecutionContext,
    ) -> Result<bool, WorkerError> {
        let documents = json!(
            context
                .documents
                .iter()
                .map(|doc| json!({"doc_id": doc.doc_id, "doc_index": doc.doc_index}))
                .collect::<Vec<_>>()
        );
        // Trace export is best-effort; never fail the terminal transition.
        let trace_s3_uri = collector
            .persist(
                self.blobs.as_ref(),
                &self.settings.bucket,
                &self.settings.trace_prefix,
                &execution.tenant_id,
                &execution.execution_id,
                &execution.session_id,
                &documents,
            )
            .map_err(|err| {
                warn!(
                    target: "rlm.orchestrator",
                    execution_id = %execution.execution_id,
                    error = %err,
                    "trace persist failed"
                );
                err
            })
            .ok();
        let updated = self.records.update_execution_status(
            &execution.session_id,
            &execution.execution_id,
            ExecutionStatus::Running,
            status,
            ExecutionFinalization {
                answer,
                citations,
                budgets_consumed: Some(tracker.consumed()),
                completed_at: Some(utc_now_string()),
                duration_ms: Some(run_start.elapsed().as_millis() as u64),
                trace_s3_uri,
            },
        )?;
        info!(
            target: "rlm.orchestrator",
            execution_id = %execution.execution_id,
            status = ?status,
            turns = tracker.turns(),
            updated,
            "finalized execution"
        );
        Ok(updated)
    }
}

fn format_step_error(error: &StepError) -> String {
    format!("{}: {}", error.code.as_str(), error.message)
}

/// Models resolution order: execution row → session defaults → settings.
fn resolve_models(
    execution: &ExecutionRecord,
    session: &SessionRecord,
    settings: &Settings,
) -> Option<ModelsConfig> {
    if let Some(models) = &execution.models
        && models.root_model.is_some()
    {
        return Some(models.clone());
    }
    if let Some(models) = &session.models_default
        && models.root_model.is_some()
    {
        return Some(models.clone());
    }
    settings.default_models.clone()
}

/// Budgets resolution order: execution row → session defaults → settings.
fn resolve_budgets(
    execution: &ExecutionRecord,
    session: &SessionRecord,
    settings: &Settings,
) -> Option<Budgets> {
    execution
        .budgets_requested
        .clone()
        .or_else(|| session.budgets_default.clone())
        .or_else(|| settings.default_budgets.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_resolution_order() {
        let settings = Settings {
            default_models: Some(ModelsConfig {
                root_model: Some("settings-root".into()),
                sub_model: None,
            }),
            ..Settings::default()
        };
        let mut execution = ExecutionRecord {
            tenant_id: "t".into(),
            session_id: "s".into(),
            execution_id: "e".into(),
            status: ExecutionStatus::Running,
            mode: rlm_core::ExecutionMode::Answerer,
            question: None,
            budgets_requested: None,
            budgets_consumed: None,
            models: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            answer: None,
            citations: None,
            trace_s3_uri: None,
            lease_owner: None,
            lease_expires_at: None,
            lease_updated_at: None,
        };
        let mut session = SessionRecord {
            tenant_id: "t".into(),
            session_id: "s".into(),
            status: rlm_core::SessionStatus::Ready,
            created_at: String::new(),
            expires_at: String::new(),
            ttl_epoch: 0,
            doc_count: None,
            total_chars: None,
            options: None,
            models_default: None,
            budgets_default: None,
        };

        let resolved = resolve_models(&execution, &session, &settings).unwrap();
        assert_eq!(resolved.root_model.as_deref(), Some("settings-root"));

        session.models_default = Some(ModelsConfig {
            root_model: Some("session-root".into()),
            sub_model: None,
        });
        let resolved = resolve_models(&execution, &session, &settings).unwrap();
        assert_eq!(resolved.root_model.as_deref(), Some("session-root"));

        execution.models = Some(ModelsConfig {
            root_model: Some("execution-root".into()),
            sub_model: Some("execution-sub".into()),
        });
        let resolved = resolve_models(&execution, &session, &settings).unwrap();
        assert_eq!(resolved.root_model.as_deref(), Some("execution-root"));
    }
}
