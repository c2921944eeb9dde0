// SPDX-License-Identifier: MIT OR Apache-2.0
//! The single-step runtime API.
//!
//! External callers drive the loop themselves: they create a Runtime-mode
//! execution, submit one program per step, and resolve queued tools with a
//! separate call. The same step executor and persistence path as the
//! Answerer loop; the state row is initialized at `turn_index = -1` and
//! every step pre-increments, so the first step runs at turn 0.

use crate::budget::BudgetTracker;
use crate::resolve::{ResolveRequest, resolve_tool_requests};
use crate::state_ops::{
    apply_tool_results, ensure_tool_state, merge_reserved_state, tool_results_from_state,
};
use crate::Settings;
use rlm_core::readiness::compute_readiness;
use rlm_core::records::{DocumentRecord, ExecutionRecord, ExecutionStateRecord, SessionRecord};
use rlm_core::time::utc_now_string;
use rlm_core::{
    ContextDocument, ContextManifest, ExecutionMode, ExecutionStatus, JsonObject, JsonValue,
    SessionStatus, StepEvent, StepResult, ToolRequestStatus, ToolRequestsEnvelope,
    ToolResultsEnvelope,
};
use rlm_error::{ErrorCode, RlmError};
use rlm_provider::CompletionProvider;
use rlm_sandbox::execute_step;
use rlm_search::SearchBackend;
use rlm_state::persist_state_payload;
use rlm_store::{BlobStore, ExecutionFinalization, RecordStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Outcome of a tool-resolution call.
#[derive(Debug)]
pub struct ToolResolveOutcome {
    /// Resolved results by key.
    pub tool_results: ToolResultsEnvelope,
    /// Per-key statuses.
    pub statuses: BTreeMap<String, ToolRequestStatus>,
}

/// Single-step façade over the step executor and the stores.
pub struct RuntimeService {
    settings: Settings,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    provider: Arc<dyn CompletionProvider>,
    search: Arc<dyn SearchBackend>,
}

impl RuntimeService {
    /// Build the service.
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
        }
    }

    /// Create a Runtime-mode execution against a ready session.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`, `SESSION_EXPIRED`, or `SESSION_NOT_READY`.
    pub fn create_execution(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<ExecutionRecord, RlmError> {
        let (session, documents) = self.load_ready_session(tenant_id, session_id)?;

        let execution_id = Uuid::new_v4().simple().to_string();
        let started_at = utc_now_string();
        let execution = ExecutionRecord {
            tenant_id: tenant_id.to_string(),
            session_id: session_id.to_string(),
            execution_id: execution_id.clone(),
            status: ExecutionStatus::Running,
            mode: ExecutionMode::Runtime,
            question: None,
            budgets_requested: None,
            budgets_consumed: None,
            models: None,
            started_at: Some(started_at.clone()),
            completed_at: None,
            duration_ms: None,
            answer: None,
            citations: None,
            trace_s3_uri: None,
            lease_owner: None,
            lease_expires_at: None,
            lease_updated_at: None,
        };
        self.records
            .create_execution(execution.clone())
            .map_err(storage_error)?;

        // Pre-step state row at turn -1 with the reserved namespace seeded.
        let mut state = JsonObject::new();
        ensure_tool_state(&mut state)
            .map_err(|err| RlmError::new(ErrorCode::InternalError, err.to_string()))?;
        let payload = JsonValue::Object(state);
        let record = persist_state_payload(
            Some(&payload),
            tenant_id,
            &execution_id,
            -1,
            self.settings.max_inline_state_bytes,
            Some(self.blobs.as_ref()),
            Some(&self.settings.bucket),
            &self.settings.state_prefix,
        )
        .map_err(|err| RlmError::new(ErrorCode::InternalError, err.to_string()))?;
        self.records
            .put_execution_state(ExecutionStateRecord {
                execution_id: execution_id.clone(),
                turn_index: -1,
                updated_at: started_at,
                ttl_epoch: session.ttl_epoch,
                state_json: record.state_json,
                state_s3_uri: record.state_s3_uri,
                checksum: Some(record.checksum),
                summary: Some(record.summary),
                success: None,
                stdout: None,
                span_log: None,
                tool_requests: None,
                final_marker: None,
                error: None,
            })
            .map_err(storage_error)?;

        info!(
            target: "rlm.runtime",
            tenant_id,
            session_id,
            execution_id = %execution_id,
            documents = documents.len(),
            "created runtime execution"
        );
        Ok(execution)
    }

    /// Execute one step: bump the turn, run the program, persist state and
    /// the step snapshot, and complete the execution on `final`.
    ///
    /// # Errors
    ///
    /// Lookup/readiness errors, `STATE_INVALID_TYPE` on corrupt state, and
    /// `STATE_TOO_LARGE` when persistence fails.
    pub fn step(
        &self,
        tenant_id: &str,
        execution_id: &str,
        code: &str,
        state_override: Option<JsonValue>,
    ) -> Result<StepResult, RlmError> {
        let execution = self.load_runtime_execution(tenant_id, execution_id)?;
        let (session, documents) = self.load_ready_session(tenant_id, &execution.session_id)?;

        let state_row = self
            .records
            .get_execution_state(execution_id)
            .map_err(storage_error)?
            .ok_or_else(|| {
                RlmError::new(ErrorCode::ExecutionNotFound, "execution state not found")
            })?;
        let stored_state = rlm_state::load_state_payload(
            state_row.state_json.as_ref(),
            state_row.state_s3_uri.as_deref(),
            self.blobs.as_ref(),
        )
        .map_err(|err| RlmError::new(ErrorCode::StateInvalidType, err.to_string()))?;

        // The caller may override state; reserved keys always come from the
        // stored copy.
        let state_input = match (state_override, &stored_state) {
            (None, stored) => stored.clone(),
            (Some(JsonValue::Object(next)), Some(JsonValue::Object(stored))) => {
                Some(JsonValue::Object(merge_reserved_state(next, stored)))
            }
            (Some(other), _) => Some(other),
        };
        let state_input = match state_input {
            Some(JsonValue::Object(mut map)) => {
                ensure_tool_state(&mut map)
                    .map_err(|err| RlmError::new(ErrorCode::StateInvalidType, err.to_string()))?;
                Some(JsonValue::Object(map))
            }
            other => other,
        };

        let turn_index = state_row.turn_index + 1;
        let budgets = execution
            .budgets_requested
            .clone()
            .or_else(|| session.budgets_default.clone())
            .or_else(|| self.settings.default_budgets.clone());
        let limits = budgets.as_ref().map(|budgets| {
            let mut limits = budgets.limits_snapshot();
            limits.max_code_lines = self.settings.max_code_lines;
            limits
        });

        let event = StepEvent {
            tenant_id: tenant_id.to_string(),
            session_id: execution.session_id.clone(),
            execution_id: execution_id.to_string(),
            turn_index,
            code: code.to_string(),
            state: state_input.clone(),
            context_manifest: build_manifest(&documents)?,
            tool_results: tool_results_from_state(state_input.as_ref()),
            limits,
        };
        let result = execute_step(&event, Arc::clone(&self.blobs));

        let record = persist_state_payload(
            result.state.as_ref(),
            tenant_id,
            execution_id,
            turn_index,
            self.settings.max_inline_state_bytes,
            Some(self.blobs.as_ref()),
            Some(&self.settings.bucket),
            &self.settings.state_prefix,
        )
        .map_err(|err| match err {
            rlm_state::StateError::InvalidType(message) => {
                RlmError::new(ErrorCode::StateInvalidType, message)
            }
            rlm_state::StateError::Offload(message) => {
                RlmError::new(ErrorCode::StateTooLarge, message)
            }
        })?;
        self.records
            .put_execution_state(ExecutionStateRecord {
                execution_id: execution_id.to_string(),
                turn_index,
                updated_at: utc_now_string(),
                ttl_epoch: session.ttl_epoch,
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
            })
            .map_err(storage_error)?;

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
            let updated = self
                .records
                .update_execution_status(
                    &execution.session_id,
                    execution_id,
                    ExecutionStatus::Running,
                    ExecutionStatus::Completed,
                    ExecutionFinalization {
                        answer: Some(answer),
                        completed_at: Some(utc_now_string()),
                        ..ExecutionFinalization::default()
                    },
                )
                .map_err(storage_error)?;
            if !updated {
                return Err(RlmError::new(
                    ErrorCode::InternalError,
                    "failed to update execution status",
                ));
            }
        }

        info!(
            target: "rlm.runtime",
            tenant_id,
            execution_id,
            turn_index,
            success = result.success,
            "runtime step"
        );
        Ok(result)
    }

    /// Resolve a caller-supplied tool-request envelope and fold the results
    /// into the stored state at the current turn.
    ///
    /// # Errors
    ///
    /// Lookup errors, `STATE_INVALID_TYPE` on corrupt state, and
    /// `BUDGET_EXCEEDED` when resolution breaches the execution's budgets.
    pub async fn resolve_tools(
        &self,
        tenant_id: &str,
        execution_id: &str,
        requests: &ToolRequestsEnvelope,
        sub_model: &str,
    ) -> Result<ToolResolveOutcome, RlmError> {
        let execution = self.load_runtime_execution(tenant_id, execution_id)?;
        let (session, documents) = self.load_session(tenant_id, &execution.session_id)?;

        let state_row = self
            .records
            .get_execution_state(execution_id)
            .map_err(storage_error)?
            .ok_or_else(|| {
                RlmError::new(ErrorCode::ExecutionNotFound, "execution state not found")
            })?;
        let stored_state = rlm_state::load_state_payload(
            state_row.state_json.as_ref(),
            state_row.state_s3_uri.as_deref(),
            self.blobs.as_ref(),
        )
        .map_err(|err| RlmError::new(ErrorCode::StateInvalidType, err.to_string()))?;
        let Some(JsonValue::Object(mut state)) = stored_state else {
            return Err(RlmError::new(
                ErrorCode::StateInvalidType,
                "state must be a JSON object",
            ));
        };
        ensure_tool_state(&mut state)
            .map_err(|err| RlmError::new(ErrorCode::StateInvalidType, err.to_string()))?;

        let enable_search = session
            .options
            .as_ref()
            .and_then(|options| options.enable_search)
            .unwrap_or(self.settings.enable_search);
        let doc_indexes: Vec<u32> = documents.iter().map(|doc| doc.doc_index).collect();
        let doc_lengths: Vec<u64> = documents
            .iter()
            .map(|doc| doc.char_length.unwrap_or(0))
            .collect();

        let budgets = execution
            .budgets_requested
            .clone()
            .or_else(|| session.budgets_default.clone())
            .or_else(|| self.settings.default_budgets.clone());
        let mut tracker =
            BudgetTracker::from_state(Some(&JsonValue::Object(state.clone())), budgets);

        let outcome = resolve_tool_requests(
            ResolveRequest {
                requests,
                tenant_id,
                session_id: &execution.session_id,
                sub_model: Some(sub_model),
                enable_search,
                doc_indexes: &doc_indexes,
                doc_lengths: &doc_lengths,
                max_concurrency: self.settings.tool_resolution_max_concurrency,
            },
            self.provider.as_ref(),
            self.search.as_ref(),
            &mut tracker,
        )
        .await
        .map_err(|breach| RlmError::new(ErrorCode::BudgetExceeded, breach.message))?;

        apply_tool_results(&mut state, &outcome.results, &outcome.statuses)
            .map_err(|err| RlmError::new(ErrorCode::StateInvalidType, err.to_string()))?;
        if let Some(snapshot) = tracker.snapshot() {
            state.insert("_budgets".into(), snapshot);
        }

        // Re-persist at the same turn_index with the step snapshot intact.
        let payload = JsonValue::Object(state);
        let record = persist_state_payload(
            Some(&payload),
            tenant_id,
            execution_id,
            state_row.turn_index,
            self.settings.max_inline_state_bytes,
            Some(self.blobs.as_ref()),
            Some(&self.settings.bucket),
            &self.settings.state_prefix,
        )
        .map_err(|err| match err {
            rlm_state::StateError::InvalidType(message) => {
                RlmError::new(ErrorCode::StateInvalidType, message)
            }
            rlm_state::StateError::Offload(message) => {
                RlmError::new(ErrorCode::StateTooLarge, message)
            }
        })?;
        self.records
            .put_execution_state(ExecutionStateRecord {
                execution_id: execution_id.to_string(),
                turn_index: state_row.turn_index,
                updated_at: utc_now_string(),
                ttl_epoch: state_row.ttl_epoch,
                state_json: record.state_json,
                state_s3_uri: record.state_s3_uri,
                checksum: Some(record.checksum),
                summary: Some(record.summary),
                success: state_row.success,
                stdout: state_row.stdout.clone(),
                span_log: state_row.span_log.clone(),
                tool_requests: state_row.tool_requests.clone(),
                final_marker: state_row.final_marker.clone(),
                error: state_row.error.clone(),
            })
            .map_err(storage_error)?;

        info!(
            target: "rlm.runtime",
            tenant_id,
            execution_id,
            resolved = outcome.statuses.len(),
            "resolved runtime tools"
        );
        Ok(ToolResolveOutcome {
            tool_results: outcome.results,
            statuses: outcome.statuses,
        })
    }

    // --- lookups ---

    fn load_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<(SessionRecord, Vec<DocumentRecord>), RlmError> {
        let session = self
            .records
            .get_session(tenant_id, session_id)
            .map_err(storage_error)?
            .ok_or_else(|| RlmError::new(ErrorCode::SessionNotFound, "session not found"))?;
        if session.status == SessionStatus::Expired {
            return Err(RlmError::new(ErrorCode::SessionExpired, "session expired"));
        }
        let documents = self
            .records
            .list_documents(session_id)
            .map_err(storage_error)?;
        Ok((session, documents))
    }

    fn load_ready_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<(SessionRecord, Vec<DocumentRecord>), RlmError> {
        let (session, documents) = self.load_session(tenant_id, session_id)?;
        let options = session.options.clone().unwrap_or_default();
        let readiness = compute_readiness(
            &documents,
            options.readiness_mode.unwrap_or_default(),
            options.enable_search.unwrap_or(self.settings.enable_search),
        );
        if !readiness.ready || session.status != SessionStatus::Ready {
            return Err(RlmError::new(ErrorCode::SessionNotReady, "session not ready"));
        }
        Ok((session, documents))
    }

    fn load_runtime_execution(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<ExecutionRecord, RlmError> {
        let execution = self
            .records
            .find_execution(execution_id)
            .map_err(storage_error)?
            .ok_or_else(|| RlmError::new(ErrorCode::ExecutionNotFound, "execution not found"))?;
        if execution.tenant_id != tenant_id {
            return Err(RlmError::new(ErrorCode::Forbidden, "execution belongs to another tenant"));
        }
        if execution.mode != ExecutionMode::Runtime {
            return Err(RlmError::new(
                ErrorCode::ValidationError,
                "execution is not runtime mode",
            ));
        }
        if execution.status != ExecutionStatus::Running {
            return Err(RlmError::new(
                ErrorCode::ValidationError,
                "execution is not running",
            ));
        }
        Ok(execution)
    }
}

fn build_manifest(documents: &[DocumentRecord]) -> Result<ContextManifest, RlmError> {
    let mut docs = Vec::with_capacity(documents.len());
    for document in documents {
        let (Some(text_s3_uri), Some(offsets_s3_uri)) =
            (&document.text_s3_uri, &document.offsets_s3_uri)
        else {
            return Err(RlmError::new(ErrorCode::SessionNotReady, "session not ready"));
        };
        docs.push(ContextDocument {
            doc_id: document.doc_id.clone(),
            doc_index: document.doc_index,
            text_s3_uri: text_s3_uri.clone(),
            meta_s3_uri: document.meta_s3_uri.clone(),
            offsets_s3_uri: offsets_s3_uri.clone(),
        });
    }
    Ok(ContextManifest { docs })
}

fn storage_error(err: rlm_store::RecordError) -> RlmError {
    RlmError::new(ErrorCode::InternalError, err.to_string())
}
