// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime-mode scenarios: an external caller drives the loop one step at a
//! time through the step API.

mod common;

use common::{SESSION, TENANT, fixture, settings};
use rlm_core::{ExecutionStatus, ToolRequestsEnvelope};
use rlm_error::ErrorCode;
use rlm_provider::StaticProvider;
use rlm_runtime::RuntimeService;
use rlm_search::StubSearchBackend;
use rlm_store::{BlobStore, RecordStore};
use std::sync::Arc;

fn service(fx: &common::Fixture) -> RuntimeService {
    RuntimeService::new(
        settings(),
        Arc::clone(&fx.records) as Arc<dyn RecordStore>,
        Arc::clone(&fx.blobs) as Arc<dyn BlobStore>,
        Arc::new(StaticProvider::new()),
        Arc::new(StubSearchBackend),
    )
}

#[tokio::test]
async fn create_initializes_pre_step_state_at_minus_one() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let service = service(&fx);

    let execution = service.create_execution(TENANT, SESSION).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);

    let state_row = fx
        .records
        .get_execution_state(&execution.execution_id)
        .unwrap()
        .unwrap();
    assert_eq!(state_row.turn_index, -1);
    assert!(state_row.is_pre_step());
    let state = state_row.state_json.unwrap();
    assert!(state["_tool_results"]["llm"].is_object());
    assert!(state["_tool_results"]["search"].is_object());
    assert!(state["_tool_status"].is_object());
}

#[tokio::test]
async fn steps_pre_increment_turns_and_persist_state() {
    let fx = fixture(&["Alpha beta gamma delta"], false);
    let service = service(&fx);
    let execution = service.create_execution(TENANT, SESSION).unwrap();
    let execution_id = execution.execution_id.as_str();

    let result = service
        .step(
            TENANT,
            execution_id,
            "state[\"work\"] = {\"note\": context[0][0:5]}\n",
            None,
        )
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);

    let state_row = fx.records.get_execution_state(execution_id).unwrap().unwrap();
    assert_eq!(state_row.turn_index, 0);
    assert!(!state_row.is_pre_step());
    assert_eq!(state_row.state_json.unwrap()["work"]["note"], "Alpha");

    let result = service
        .step(
            TENANT,
            execution_id,
            "print(state[\"work\"][\"note\"])\n",
            None,
        )
        .unwrap();
    assert_eq!(result.stdout, "Alpha\n");
    let state_row = fx.records.get_execution_state(execution_id).unwrap().unwrap();
    assert_eq!(state_row.turn_index, 1);
}

#[tokio::test]
async fn final_step_completes_the_execution() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let service = service(&fx);
    let execution = service.create_execution(TENANT, SESSION).unwrap();
    let execution_id = execution.execution_id.clone();

    let result = service
        .step(TENANT, &execution_id, "tool.final(\"runtime answer\")\n", None)
        .unwrap();
    assert!(result.final_marker.unwrap().is_final);

    let row = fx
        .records
        .get_execution(SESSION, &execution_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.answer.as_deref(), Some("runtime answer"));

    // Stepping a completed execution is rejected.
    let err = service
        .step(TENANT, &execution_id, "pass\n", None)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn state_override_preserves_reserved_namespace() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let service = service(&fx);
    let execution = service.create_execution(TENANT, SESSION).unwrap();
    let execution_id = execution.execution_id.as_str();

    // Queue a tool and resolve it so the reserved namespace is non-trivial.
    service
        .step(
            TENANT,
            execution_id,
            "tool.queue_llm(\"k1\", \"summarize\", max_tokens=50)\ntool.yield()\n",
            None,
        )
        .unwrap();
    let requests = ToolRequestsEnvelope {
        llm: vec![rlm_core::LlmToolRequest {
            key: "k1".into(),
            prompt: "summarize".into(),
            model_hint: Some("sub".into()),
            max_tokens: 50,
            temperature: Some(0.0),
            metadata: None,
        }],
        search: vec![],
    };
    service
        .resolve_tools(TENANT, execution_id, &requests, "sub-model")
        .await
        .unwrap();

    // Caller overrides state wholesale, even shadowing a reserved key; the
    // stored reserved namespace wins.
    let result = service
        .step(
            TENANT,
            execution_id,
            "tool.final(state[\"_tool_results\"][\"llm\"][\"k1\"][\"text\"])\n",
            Some(serde_json::json!({
                "fresh": true,
                "_tool_results": "shadowed",
            })),
        )
        .unwrap();
    assert_eq!(
        result.final_marker.unwrap().answer.as_deref(),
        Some("fake:summarize")
    );
}

#[tokio::test]
async fn resolve_tools_writes_results_at_current_turn() {
    let fx = fixture(&["Alpha beta gamma"], true);
    let service = service(&fx);
    let execution = service.create_execution(TENANT, SESSION).unwrap();
    let execution_id = execution.execution_id.as_str();

    service
        .step(TENANT, execution_id, "tool.yield(\"prepare\")\n", None)
        .unwrap();
    let before = fx.records.get_execution_state(execution_id).unwrap().unwrap();

    let requests = ToolRequestsEnvelope {
        llm: vec![],
        search: vec![rlm_core::SearchToolRequest {
            key: "s1".into(),
            query: "beta".into(),
            k: 2,
            filters: None,
        }],
    };
    let outcome = service
        .resolve_tools(TENANT, execution_id, &requests, "sub-model")
        .await
        .unwrap();
    assert_eq!(
        outcome.statuses["s1"],
        rlm_core::ToolRequestStatus::Resolved
    );
    assert_eq!(outcome.tool_results.search["s1"].hits.len(), 2);

    let after = fx.records.get_execution_state(execution_id).unwrap().unwrap();
    // Same turn, same step snapshot, enriched state.
    assert_eq!(after.turn_index, before.turn_index);
    assert_eq!(after.final_marker, before.final_marker);
    assert_eq!(
        after.state_json.unwrap()["_tool_status"]["s1"],
        serde_json::json!("resolved")
    );
}

#[tokio::test]
async fn unknown_execution_and_wrong_tenant_are_rejected() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let service = service(&fx);
    let execution = service.create_execution(TENANT, SESSION).unwrap();

    let err = service.step(TENANT, "nope", "pass\n", None).unwrap_err();
    assert_eq!(err.code, ErrorCode::ExecutionNotFound);

    let err = service
        .step("other-tenant", &execution.execution_id, "pass\n", None)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn failed_steps_keep_prior_state_and_record_error() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let service = service(&fx);
    let execution = service.create_execution(TENANT, SESSION).unwrap();
    let execution_id = execution.execution_id.as_str();

    service
        .step(TENANT, execution_id, "state[\"work\"] = {\"keep\": 1}\n", None)
        .unwrap();
    let result = service
        .step(TENANT, execution_id, "boom_undefined\n", None)
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::InternalError);

    let state_row = fx.records.get_execution_state(execution_id).unwrap().unwrap();
    // The failed turn was still recorded (turn advanced, error stored), but
    // state is the pre-step state.
    assert_eq!(state_row.turn_index, 1);
    assert_eq!(state_row.error.unwrap().code, ErrorCode::InternalError);
    assert_eq!(state_row.state_json.unwrap()["work"]["keep"], 1);
}

#[tokio::test]
async fn sandbox_rejection_surfaces_in_step_result() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let service = service(&fx);
    let execution = service.create_execution(TENANT, SESSION).unwrap();

    let result = service
        .step(TENANT, &execution.execution_id, "import os\n", None)
        .unwrap();
    assert!(!result.success);
    assert_eq!(
        result.error.unwrap().code,
        ErrorCode::SandboxAstRejected
    );
}
