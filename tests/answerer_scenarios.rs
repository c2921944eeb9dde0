// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end Answerer scenarios over in-memory stores, a scripted root
//! model, and the stub search backend.

mod common;

use common::{BUCKET, SESSION, TENANT, fixture, seed_answerer_execution, settings};
use rlm_citation::checksum_text;
use rlm_core::{Budgets, ExecutionStatus};
use rlm_provider::StaticProvider;
use rlm_runtime::OrchestratorWorker;
use rlm_search::StubSearchBackend;
use rlm_store::{BlobStore, RecordStore};
use std::sync::Arc;

fn worker(fixture: &common::Fixture, outputs: Vec<&str>) -> OrchestratorWorker {
    OrchestratorWorker::new(
        settings(),
        Arc::clone(&fixture.records) as Arc<dyn RecordStore>,
        Arc::clone(&fixture.blobs) as Arc<dyn BlobStore>,
        Arc::new(StaticProvider::with_outputs(
            outputs.into_iter().map(String::from).collect(),
        )),
        Arc::new(StubSearchBackend),
    )
}

#[tokio::test]
async fn single_turn_final() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "say ok", None);
    let worker = worker(&fx, vec!["```repl\ntool.final(\"ok\")\n```"]);

    assert_eq!(worker.run_once(None).await.unwrap(), 1);

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.answer.as_deref(), Some("ok"));
    assert_eq!(execution.citations.unwrap_or_default(), vec![]);
}

#[tokio::test]
async fn slice_then_final_produces_checksummed_citation() {
    let fx = fixture(&["Alpha beta gamma delta"], false);
    seed_answerer_execution(&fx, "e1", "first word?", None);
    let worker = worker(
        &fx,
        vec!["```repl\ns = context[0][0:5]\ntool.final(s)\n```"],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.answer.as_deref(), Some("Alpha"));
    let citations = execution.citations.unwrap();
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].doc_index, 0);
    assert_eq!(citations[0].start_char, 0);
    assert_eq!(citations[0].end_char, 5);
    assert_eq!(citations[0].checksum, checksum_text("Alpha"));
    assert_eq!(citations[0].tenant_id, TENANT);
    assert_eq!(citations[0].session_id, SESSION);
}

#[tokio::test]
async fn yield_then_resume_reads_subcall_result() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "summarize", None);
    let worker = worker(
        &fx,
        vec![
            "```repl\ntool.queue_llm(\"k1\", \"summarize the corpus\", max_tokens=200)\ntool.yield(\"waiting for k1\")\n```",
            "```repl\ntool.final(state[\"_tool_results\"][\"llm\"][\"k1\"][\"text\"])\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    // The stub provider echoes `fake:` + prompt.
    assert_eq!(
        execution.answer.as_deref(),
        Some("fake:summarize the corpus")
    );
    let consumed = execution.budgets_consumed.unwrap();
    assert_eq!(consumed.llm_subcalls, Some(1));
    assert_eq!(consumed.turns, Some(2));
}

#[tokio::test]
async fn scan_spans_are_excluded_from_citations() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "scan only", None);
    let worker = worker(
        &fx,
        vec!["```repl\nhits = context[0].find(\"beta\")\ntool.final(\"done\")\n```"],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.answer.as_deref(), Some("done"));
    assert_eq!(execution.citations.unwrap_or_default(), vec![]);
}

#[tokio::test]
async fn subcall_budget_breach_finalizes_budget_exceeded() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let budgets = Budgets {
        max_llm_subcalls: Some(1),
        ..Budgets::default()
    };
    seed_answerer_execution(&fx, "e1", "over budget", Some(budgets));
    let worker = worker(
        &fx,
        vec![
            "```repl\ntool.queue_llm(\"a\", \"first\", max_tokens=100)\ntool.queue_llm(\"b\", \"second\", max_tokens=100)\ntool.yield(\"waiting\")\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::BudgetExceeded);
    assert!(execution.answer.is_none());

    // The step's tool-request envelope is retained in the state row, but no
    // LLM results were written.
    let state_row = fx.records.get_execution_state("e1").unwrap().unwrap();
    let requests = state_row.tool_requests.unwrap();
    assert_eq!(requests.llm.len(), 2);
    let state = state_row.state_json.unwrap();
    assert_eq!(
        state["_tool_results"]["llm"],
        serde_json::json!({}),
        "no results may be written after a budget breach"
    );
}

#[tokio::test]
async fn max_turns_exceeded_terminates_loop() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let budgets = Budgets {
        max_turns: Some(2),
        ..Budgets::default()
    };
    seed_answerer_execution(&fx, "e1", "loop forever", Some(budgets));
    // Each output yields, so the loop would continue indefinitely without
    // the turn budget.
    let worker = worker(
        &fx,
        vec![
            "```repl\ntool.yield(\"turn 0\")\n```",
            "```repl\ntool.yield(\"turn 1\")\n```",
            "```repl\ntool.yield(\"turn 2\")\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::MaxTurnsExceeded);
    assert_eq!(execution.budgets_consumed.unwrap().turns, Some(2));
}

#[tokio::test]
async fn parse_errors_count_against_turns_and_retry() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let budgets = Budgets {
        max_turns: Some(5),
        ..Budgets::default()
    };
    seed_answerer_execution(&fx, "e1", "retry me", Some(budgets));
    let worker = worker(
        &fx,
        vec![
            "no code block at all",
            "```repl\ntool.final(\"recovered\")\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.answer.as_deref(), Some("recovered"));
    // The parse error consumed a turn.
    assert_eq!(execution.budgets_consumed.unwrap().turns, Some(2));
}

#[tokio::test]
async fn lease_stealing_exactly_one_replica_wins() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "contended", None);

    // Simulate an expired lease left behind by a dead replica.
    let past = rlm_core::time::epoch_now() - 120;
    assert!(
        fx.records
            .acquire_lease(SESSION, "e1", "dead-replica", past, 30)
            .unwrap()
    );

    let now = rlm_core::time::epoch_now();
    let replica_a = fx
        .records
        .acquire_lease(SESSION, "e1", "replica-a", now, 30)
        .unwrap();
    let replica_b = fx
        .records
        .acquire_lease(SESSION, "e1", "replica-b", now, 30)
        .unwrap();
    assert!(replica_a, "the expired lease must be stealable");
    assert!(!replica_b, "exactly one replica may hold the lease");

    // The loser observes the conditional-write failure and moves on; the
    // winner releases and the execution remains runnable.
    assert!(fx.records.release_lease(SESSION, "e1", "replica-a").unwrap());
    let worker = worker(&fx, vec!["```repl\ntool.final(\"ok\")\n```"]);
    worker.run_once(None).await.unwrap();
    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn terminal_transition_happens_exactly_once() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "once", None);
    let worker = worker(&fx, vec!["```repl\ntool.final(\"ok\")\n```"]);
    worker.run_once(None).await.unwrap();

    // A second conditional transition from Running must fail.
    let again = fx
        .records
        .update_execution_status(
            SESSION,
            "e1",
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            rlm_store::ExecutionFinalization::default(),
        )
        .unwrap();
    assert!(!again);
    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn search_results_flow_into_state() {
    let fx = fixture(&["Alpha beta gamma delta epsilon"], true);
    seed_answerer_execution(&fx, "e1", "search it", None);
    let worker = worker(
        &fx,
        vec![
            "```repl\ntool.queue_search(\"s1\", \"beta\", k=2)\ntool.yield(\"searching\")\n```",
            "```repl\nhits = state[\"_tool_results\"][\"search\"][\"s1\"][\"hits\"]\ntool.final(f\"{len(hits)} hits\")\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.answer.as_deref(), Some("2 hits"));
}

#[tokio::test]
async fn disabled_search_surfaces_error_status_without_failing() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "search denied", None);
    let worker = worker(
        &fx,
        vec![
            "```repl\ntool.queue_search(\"s1\", \"beta\")\ntool.yield(\"searching\")\n```",
            "```repl\ntool.final(state[\"_tool_status\"][\"s1\"])\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.answer.as_deref(), Some("error"));
}

#[tokio::test]
async fn trace_artifact_is_exported_on_completion() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "trace me", None);
    let worker = worker(
        &fx,
        vec!["```repl\ns = context[0][0:5]\ntool.final(s)\n```"],
    );

    worker.run_once(None).await.unwrap();

    let execution = fx.records.get_execution(SESSION, "e1").unwrap().unwrap();
    let trace_uri = execution.trace_s3_uri.unwrap();
    assert_eq!(trace_uri, format!("s3://{BUCKET}/traces/{TENANT}/e1/trace.json.gz"));
    let artifact = fx
        .blobs
        .get_gzip_json(BUCKET, &format!("traces/{TENANT}/e1/trace.json.gz"))
        .unwrap();
    assert_eq!(artifact["schema_version"], "rlm_trace_v1");
    assert_eq!(artifact["metrics"]["turns"], 1);
    assert_eq!(artifact["turns"][0]["span_log"][0]["end_char"], 5);
}

#[tokio::test]
async fn code_log_records_repl_and_tool_traffic() {
    let fx = fixture(&["Alpha beta gamma"], false);
    seed_answerer_execution(&fx, "e1", "log me", None);
    let worker = worker(
        &fx,
        vec![
            "```repl\ntool.queue_llm(\"k1\", \"p\", max_tokens=50)\ntool.yield()\n```",
            "```repl\ntool.final(\"ok\")\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let kinds: Vec<String> = fx
        .records
        .list_code_log("e1")
        .unwrap()
        .into_iter()
        .map(|entry| entry.kind)
        .collect();
    assert_eq!(kinds, vec!["REPL", "TOOL_REQUEST", "TOOL_RESULT", "REPL"]);
}

#[tokio::test]
async fn budgets_snapshot_survives_in_state() {
    let fx = fixture(&["Alpha beta gamma"], false);
    let budgets = Budgets {
        max_turns: Some(10),
        max_llm_subcalls: Some(5),
        ..Budgets::default()
    };
    seed_answerer_execution(&fx, "e1", "snapshot", Some(budgets));
    let worker = worker(
        &fx,
        vec![
            "```repl\ntool.yield(\"one turn\")\n```",
            "```repl\ntool.final(\"ok\")\n```",
        ],
    );

    worker.run_once(None).await.unwrap();

    let state_row = fx.records.get_execution_state("e1").unwrap().unwrap();
    let state = state_row.state_json.unwrap();
    assert_eq!(state["_budgets"]["limits"]["max_turns"], 10);
    assert_eq!(state["_budgets"]["consumed"]["turns"], 2);
    assert_eq!(state["_budgets"]["remaining"]["turns"], 8);
    // Reserved namespace shape holds at every persisted turn.
    assert!(state["_tool_results"]["llm"].is_object());
    assert!(state["_tool_results"]["search"].is_object());
    assert!(state["_tool_status"].is_object());
}
