// SPDX-License-Identifier: MIT OR Apache-2.0
//! Record store: typed rows with conditional-write discipline.
//!
//! Every status transition is guarded by an expected-status condition and
//! every lease mutation by an ownership/expiry condition. A failed condition
//! is `Ok(false)` — it means another replica holds the row.

use rlm_core::records::{
    CodeLogEntry, DocumentRecord, ExecutionRecord, ExecutionStateRecord, SessionRecord,
};
use rlm_core::{BudgetsConsumed, ExecutionMode, ExecutionStatus, SessionStatus, SpanRef};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Errors from record operations.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The row a conditional update targets does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
    /// Backend-specific failure.
    #[error("record backend error: {0}")]
    Backend(String),
}

/// Fields applied when an execution reaches a terminal status.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFinalization {
    /// Final answer (Completed only).
    pub answer: Option<String>,
    /// Citations backing the answer.
    pub citations: Option<Vec<SpanRef>>,
    /// Consumed-budget summary.
    pub budgets_consumed: Option<BudgetsConsumed>,
    /// Completion timestamp.
    pub completed_at: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Trace artifact URI.
    pub trace_s3_uri: Option<String>,
}

/// Typed row storage for sessions, documents, executions, execution state,
/// and the append-only code log.
pub trait RecordStore: Send + Sync {
    /// Upsert a session row.
    fn put_session(&self, session: SessionRecord) -> Result<(), RecordError>;

    /// Fetch a session row.
    fn get_session(&self, tenant_id: &str, session_id: &str)
    -> Result<Option<SessionRecord>, RecordError>;

    /// Conditionally transition a session's status. `Ok(false)` when the
    /// current status is not `expected`.
    fn update_session_status(
        &self,
        tenant_id: &str,
        session_id: &str,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, RecordError>;

    /// Upsert a document row.
    fn put_document(&self, document: DocumentRecord) -> Result<(), RecordError>;

    /// All documents of a session, sorted by `doc_index`.
    fn list_documents(&self, session_id: &str) -> Result<Vec<DocumentRecord>, RecordError>;

    /// Create an execution row. `Ok(false)` when the row already exists.
    fn create_execution(&self, execution: ExecutionRecord) -> Result<bool, RecordError>;

    /// Fetch an execution row.
    fn get_execution(
        &self,
        session_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, RecordError>;

    /// Look up an execution by id alone (the runtime step API addresses
    /// executions without their session).
    fn find_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, RecordError>;

    /// Scan for `RUNNING` executions in `ANSWERER` mode, sorted by
    /// `(session_id, execution_id)` for stable fairness.
    fn list_running_answerers(&self) -> Result<Vec<ExecutionRecord>, RecordError>;

    /// Conditionally transition an execution's status, applying the
    /// finalization fields. `Ok(false)` when the current status is not
    /// `expected`.
    fn update_execution_status(
        &self,
        session_id: &str,
        execution_id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
        finalization: ExecutionFinalization,
    ) -> Result<bool, RecordError>;

    /// Conditionally acquire (or re-acquire) the execution lease.
    ///
    /// Succeeds iff the lease is absent, expired at `now_epoch`, or already
    /// owned by `owner_id`. On success the lease fields are set to
    /// `(owner_id, now_epoch + lease_duration_seconds, now_epoch)`.
    fn acquire_lease(
        &self,
        session_id: &str,
        execution_id: &str,
        owner_id: &str,
        now_epoch: i64,
        lease_duration_seconds: i64,
    ) -> Result<bool, RecordError>;

    /// Conditionally release the lease. Succeeds iff `owner_id` holds it.
    fn release_lease(
        &self,
        session_id: &str,
        execution_id: &str,
        owner_id: &str,
    ) -> Result<bool, RecordError>;

    /// Write the (single) execution-state row, replacing any previous row.
    fn put_execution_state(&self, state: ExecutionStateRecord) -> Result<(), RecordError>;

    /// Fetch the execution-state row.
    fn get_execution_state(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStateRecord>, RecordError>;

    /// Append code-log entries, assigning monotone sequences. Returns the
    /// entries as stored.
    fn append_code_log(
        &self,
        execution_id: &str,
        entries: Vec<CodeLogEntry>,
    ) -> Result<Vec<CodeLogEntry>, RecordError>;

    /// All code-log entries of an execution, in sequence order.
    fn list_code_log(&self, execution_id: &str) -> Result<Vec<CodeLogEntry>, RecordError>;
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    sessions: BTreeMap<(String, String), SessionRecord>,
    documents: BTreeMap<(String, String), DocumentRecord>,
    executions: BTreeMap<(String, String), ExecutionRecord>,
    execution_state: BTreeMap<String, ExecutionStateRecord>,
    code_log: BTreeMap<(String, u64), CodeLogEntry>,
}

/// In-memory record store, used by tests, the demo binary, and local workers.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<Tables>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn put_session(&self, session: SessionRecord) -> Result<(), RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        tables
            .sessions
            .insert((session.tenant_id.clone(), session.session_id.clone()), session);
        Ok(())
    }

    fn get_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, RecordError> {
        let tables = self.tables.lock().expect("record store poisoned");
        Ok(tables
            .sessions
            .get(&(tenant_id.to_string(), session_id.to_string()))
            .cloned())
    }

    fn update_session_status(
        &self,
        tenant_id: &str,
        session_id: &str,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        let Some(session) = tables
            .sessions
            .get_mut(&(tenant_id.to_string(), session_id.to_string()))
        else {
            return Err(RecordError::NotFound(format!("session {session_id}")));
        };
        if session.status != expected {
            return Ok(false);
        }
        session.status = new;
        Ok(true)
    }

    fn put_document(&self, document: DocumentRecord) -> Result<(), RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        tables
            .documents
            .insert((document.session_id.clone(), document.doc_id.clone()), document);
        Ok(())
    }

    fn list_documents(&self, session_id: &str) -> Result<Vec<DocumentRecord>, RecordError> {
        let tables = self.tables.lock().expect("record store poisoned");
        let mut docs: Vec<DocumentRecord> = tables
            .documents
            .values()
            .filter(|doc| doc.session_id == session_id)
            .cloned()
            .collect();
        docs.sort_by_key(|doc| doc.doc_index);
        Ok(docs)
    }

    fn create_execution(&self, execution: ExecutionRecord) -> Result<bool, RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        let key = (execution.session_id.clone(), execution.execution_id.clone());
        if tables.executions.contains_key(&key) {
            return Ok(false);
        }
        tables.executions.insert(key, execution);
        Ok(true)
    }

    fn get_execution(
        &self,
        session_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, RecordError> {
        let tables = self.tables.lock().expect("record store poisoned");
        Ok(tables
            .executions
            .get(&(session_id.to_string(), execution_id.to_string()))
            .cloned())
    }

    fn find_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, RecordError> {
        let tables = self.tables.lock().expect("record store poisoned");
        Ok(tables
            .executions
            .values()
            .find(|row| row.execution_id == execution_id)
            .cloned())
    }

    fn list_running_answerers(&self) -> Result<Vec<ExecutionRecord>, RecordError> {
        let tables = self.tables.lock().expect("record store poisoned");
        // BTreeMap iteration is already (session_id, execution_id) ordered.
        Ok(tables
            .executions
            .values()
            .filter(|row| {
                row.status == ExecutionStatus::Running && row.mode == ExecutionMode::Answerer
            })
            .cloned()
            .collect())
    }

    fn update_execution_status(
        &self,
        session_id: &str,
        execution_id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
        finalization: ExecutionFinalization,
    ) -> Result<bool, RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        let Some(row) = tables
            .executions
            .get_mut(&(session_id.to_string(), execution_id.to_string()))
        else {
            return Err(RecordError::NotFound(format!("execution {execution_id}")));
        };
        if row.status != expected {
            return Ok(false);
        }
        row.status = new;
        if let Some(answer) = finalization.answer {
            row.answer = Some(answer);
        }
        if let Some(citations) = finalization.citations {
            row.citations = Some(citations);
        }
        if let Some(consumed) = finalization.budgets_consumed {
            row.budgets_consumed = Some(consumed);
        }
        if let Some(completed_at) = finalization.completed_at {
            row.completed_at = Some(completed_at);
        }
        if let Some(duration_ms) = finalization.duration_ms {
            row.duration_ms = Some(duration_ms);
        }
        if let Some(trace_s3_uri) = finalization.trace_s3_uri {
            row.trace_s3_uri = Some(trace_s3_uri);
        }
        Ok(true)
    }

    fn acquire_lease(
        &self,
        session_id: &str,
        execution_id: &str,
        owner_id: &str,
        now_epoch: i64,
        lease_duration_seconds: i64,
    ) -> Result<bool, RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        let Some(row) = tables
            .executions
            .get_mut(&(session_id.to_string(), execution_id.to_string()))
        else {
            return Err(RecordError::NotFound(format!("execution {execution_id}")));
        };
        let acquirable = match (&row.lease_owner, row.lease_expires_at) {
            (None, _) | (_, None) => true,
            (Some(owner), _) if owner == owner_id => true,
            (Some(_), Some(expires_at)) => expires_at < now_epoch,
        };
        if !acquirable {
            return Ok(false);
        }
        row.lease_owner = Some(owner_id.to_string());
        row.lease_expires_at = Some(now_epoch + lease_duration_seconds);
        row.lease_updated_at = Some(now_epoch);
        Ok(true)
    }

    fn release_lease(
        &self,
        session_id: &str,
        execution_id: &str,
        owner_id: &str,
    ) -> Result<bool, RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        let Some(row) = tables
            .executions
            .get_mut(&(session_id.to_string(), execution_id.to_string()))
        else {
            return Err(RecordError::NotFound(format!("execution {execution_id}")));
        };
        if row.lease_owner.as_deref() != Some(owner_id) {
            return Ok(false);
        }
        row.lease_owner = None;
        row.lease_expires_at = None;
        row.lease_updated_at = None;
        Ok(true)
    }

    fn put_execution_state(&self, state: ExecutionStateRecord) -> Result<(), RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        tables
            .execution_state
            .insert(state.execution_id.clone(), state);
        Ok(())
    }

    fn get_execution_state(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionStateRecord>, RecordError> {
        let tables = self.tables.lock().expect("record store poisoned");
        Ok(tables.execution_state.get(execution_id).cloned())
    }

    fn append_code_log(
        &self,
        execution_id: &str,
        entries: Vec<CodeLogEntry>,
    ) -> Result<Vec<CodeLogEntry>, RecordError> {
        let mut tables = self.tables.lock().expect("record store poisoned");
        let next = tables
            .code_log
            .range((execution_id.to_string(), 0)..=(execution_id.to_string(), u64::MAX))
            .next_back()
            .map_or(0, |((_, seq), _)| seq + 1);
        let mut stored = Vec::with_capacity(entries.len());
        for (offset, mut entry) in entries.into_iter().enumerate() {
            entry.execution_id = execution_id.to_string();
            entry.sequence = next + offset as u64;
            tables
                .code_log
                .insert((execution_id.to_string(), entry.sequence), entry.clone());
            stored.push(entry);
        }
        Ok(stored)
    }

    fn list_code_log(&self, execution_id: &str) -> Result<Vec<CodeLogEntry>, RecordError> {
        let tables = self.tables.lock().expect("record store poisoned");
        Ok(tables
            .code_log
            .range((execution_id.to_string(), 0)..=(execution_id.to_string(), u64::MAX))
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(session_id: &str, execution_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            tenant_id: "t1".into(),
            session_id: session_id.into(),
            execution_id: execution_id.into(),
            status: ExecutionStatus::Running,
            mode: ExecutionMode::Answerer,
            question: Some("what is alpha?".into()),
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
        }
    }

    #[test]
    fn create_execution_is_conditional_on_existence() {
        let store = MemoryRecordStore::new();
        assert!(store.create_execution(execution("s1", "e1")).unwrap());
        assert!(!store.create_execution(execution("s1", "e1")).unwrap());
    }

    #[test]
    fn status_update_guards_on_expected() {
        let store = MemoryRecordStore::new();
        store.create_execution(execution("s1", "e1")).unwrap();

        let updated = store
            .update_execution_status(
                "s1",
                "e1",
                ExecutionStatus::Running,
                ExecutionStatus::Completed,
                ExecutionFinalization {
                    answer: Some("ok".into()),
                    ..ExecutionFinalization::default()
                },
            )
            .unwrap();
        assert!(updated);

        // Second terminal transition fails the condition.
        let updated = store
            .update_execution_status(
                "s1",
                "e1",
                ExecutionStatus::Running,
                ExecutionStatus::Failed,
                ExecutionFinalization::default(),
            )
            .unwrap();
        assert!(!updated);

        let row = store.get_execution("s1", "e1").unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.answer.as_deref(), Some("ok"));
    }

    #[test]
    fn lease_acquire_steal_release() {
        let store = MemoryRecordStore::new();
        store.create_execution(execution("s1", "e1")).unwrap();

        // Fresh row: anyone can acquire.
        assert!(store.acquire_lease("s1", "e1", "worker-a", 100, 30).unwrap());
        // Held and unexpired: another worker is refused.
        assert!(!store.acquire_lease("s1", "e1", "worker-b", 110, 30).unwrap());
        // Same owner re-acquires (renewal).
        assert!(store.acquire_lease("s1", "e1", "worker-a", 120, 30).unwrap());
        // Expired: another worker steals.
        assert!(store.acquire_lease("s1", "e1", "worker-b", 151, 30).unwrap());
        // Non-owner release is refused; owner release succeeds.
        assert!(!store.release_lease("s1", "e1", "worker-a").unwrap());
        assert!(store.release_lease("s1", "e1", "worker-b").unwrap());

        let row = store.get_execution("s1", "e1").unwrap().unwrap();
        assert!(row.lease_owner.is_none());
        assert!(row.lease_expires_at.is_none());
    }

    #[test]
    fn answerer_scan_orders_by_session_then_execution() {
        let store = MemoryRecordStore::new();
        store.create_execution(execution("s2", "e1")).unwrap();
        store.create_execution(execution("s1", "e2")).unwrap();
        store.create_execution(execution("s1", "e1")).unwrap();
        let mut runtime = execution("s0", "e9");
        runtime.mode = ExecutionMode::Runtime;
        store.create_execution(runtime).unwrap();

        let keys: Vec<(String, String)> = store
            .list_running_answerers()
            .unwrap()
            .into_iter()
            .map(|row| (row.session_id, row.execution_id))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("s1".to_string(), "e1".to_string()),
                ("s1".to_string(), "e2".to_string()),
                ("s2".to_string(), "e1".to_string()),
            ]
        );
    }

    #[test]
    fn code_log_sequences_are_monotone() {
        let store = MemoryRecordStore::new();
        let entry = |kind: &str| CodeLogEntry {
            execution_id: String::new(),
            sequence: 0,
            created_at: "2026-01-01T00:00:00Z".into(),
            source: "ROOT".into(),
            kind: kind.into(),
            model_name: None,
            tool_type: None,
            content: json!("code"),
        };
        store.append_code_log("e1", vec![entry("REPL"), entry("REPL")]).unwrap();
        let stored = store.append_code_log("e1", vec![entry("REPL")]).unwrap();
        assert_eq!(stored[0].sequence, 2);
        let all = store.list_code_log("e1").unwrap();
        assert_eq!(
            all.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }
}
