// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixtures for the workspace-level scenario tests.

// Each scenario binary uses a different subset of these fixtures.
#![allow(dead_code)]

use rlm_context::offsets::build_offsets;
use rlm_core::records::{DocumentRecord, ExecutionRecord, ExecutionStateRecord, SessionRecord};
use rlm_core::time::{epoch_now, utc_now_string};
use rlm_core::{
    ExecutionMode, ExecutionStatus, IngestStatus, ModelsConfig, SessionOptions, SessionStatus,
};
use rlm_store::{BlobStore, MemoryBlobStore, MemoryRecordStore, RecordStore, join_s3_uri};
use std::sync::Arc;

pub const BUCKET: &str = "corpus";
pub const TENANT: &str = "t1";
pub const SESSION: &str = "s1";

pub struct Fixture {
    pub blobs: Arc<MemoryBlobStore>,
    pub records: Arc<MemoryRecordStore>,
}

/// Seed a ready session whose documents carry the given texts, with
/// checkpoint interval 4 so multi-window reads are exercised.
pub fn fixture(texts: &[&str], enable_search: bool) -> Fixture {
    let blobs = Arc::new(MemoryBlobStore::new());
    let records = Arc::new(MemoryRecordStore::new());
    let ttl_epoch = epoch_now() + 3600;

    records
        .put_session(SessionRecord {
            tenant_id: TENANT.into(),
            session_id: SESSION.into(),
            status: SessionStatus::Ready,
            created_at: utc_now_string(),
            expires_at: utc_now_string(),
            ttl_epoch,
            doc_count: Some(texts.len() as u32),
            total_chars: None,
            options: Some(SessionOptions {
                enable_search: Some(enable_search),
                readiness_mode: None,
            }),
            models_default: Some(ModelsConfig {
                root_model: Some("root-model".into()),
                sub_model: Some("sub-model".into()),
            }),
            budgets_default: None,
        })
        .unwrap();

    for (index, text) in texts.iter().enumerate() {
        let doc_id = format!("d{index}");
        let text_key = format!("parsed/{TENANT}/{SESSION}/{doc_id}/text.txt");
        let offsets_key = format!("parsed/{TENANT}/{SESSION}/{doc_id}/offsets.json");
        blobs.put_bytes(BUCKET, &text_key, text.as_bytes()).unwrap();
        let offsets = build_offsets(&doc_id, text, 4);
        blobs
            .put_json(BUCKET, &offsets_key, &serde_json::to_value(&offsets).unwrap())
            .unwrap();
        records
            .put_document(DocumentRecord {
                tenant_id: TENANT.into(),
                session_id: SESSION.into(),
                doc_id: doc_id.clone(),
                doc_index: index as u32,
                source_name: format!("{doc_id}.txt"),
                mime_type: "text/plain".into(),
                raw_s3_uri: join_s3_uri(BUCKET, &text_key),
                text_s3_uri: Some(join_s3_uri(BUCKET, &text_key)),
                meta_s3_uri: None,
                offsets_s3_uri: Some(join_s3_uri(BUCKET, &offsets_key)),
                search_index_s3_uri: None,
                char_length: Some(offsets.char_length),
                byte_length: Some(offsets.byte_length),
                text_checksum: None,
                parser_version: Some("parser-v1".into()),
                ingest_status: IngestStatus::Parsed,
                failure_reason: None,
            })
            .unwrap();
    }

    Fixture { blobs, records }
}

/// Create a Running Answerer execution with its pre-step state row.
pub fn seed_answerer_execution(
    fixture: &Fixture,
    execution_id: &str,
    question: &str,
    budgets: Option<rlm_core::Budgets>,
) {
    fixture
        .records
        .create_execution(ExecutionRecord {
            tenant_id: TENANT.into(),
            session_id: SESSION.into(),
            execution_id: execution_id.into(),
            status: ExecutionStatus::Running,
            mode: ExecutionMode::Answerer,
            question: Some(question.into()),
            budgets_requested: budgets,
            budgets_consumed: None,
            models: None,
            started_at: Some(utc_now_string()),
            completed_at: None,
            duration_ms: None,
            answer: None,
            citations: None,
            trace_s3_uri: None,
            lease_owner: None,
            lease_expires_at: None,
            lease_updated_at: None,
        })
        .unwrap();
    fixture
        .records
        .put_execution_state(ExecutionStateRecord {
            execution_id: execution_id.into(),
            turn_index: 0,
            updated_at: utc_now_string(),
            ttl_epoch: epoch_now() + 3600,
            state_json: Some(serde_json::json!({
                "_tool_results": {"llm": {}, "search": {}},
                "_tool_status": {},
            })),
            state_s3_uri: None,
            checksum: None,
            summary: None,
            success: None,
            stdout: None,
            span_log: None,
            tool_requests: None,
            final_marker: None,
            error: None,
        })
        .unwrap();
}

/// Settings pointed at the fixture's bucket.
pub fn settings() -> rlm_runtime::Settings {
    rlm_runtime::Settings {
        bucket: BUCKET.into(),
        ..rlm_runtime::Settings::default()
    }
}
