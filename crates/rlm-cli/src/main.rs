// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local entrypoint: an end-to-end demo over in-memory stores and a
//! filesystem-rooted worker loop for smoke-running.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rlm_context::offsets::{DEFAULT_CHECKPOINT_INTERVAL, build_offsets, normalize_text};
use rlm_core::records::{DocumentRecord, ExecutionRecord, ExecutionStateRecord, SessionRecord};
use rlm_core::time::{epoch_now, utc_now_string};
use rlm_core::{
    ExecutionMode, ExecutionStatus, IngestStatus, ModelsConfig, SessionOptions, SessionStatus,
};
use rlm_provider::StaticProvider;
use rlm_runtime::{OrchestratorWorker, Settings};
use rlm_search::StubSearchBackend;
use rlm_state::sha256_hex;
use rlm_store::{BlobStore, FsBlobStore, MemoryBlobStore, MemoryRecordStore, RecordStore, join_s3_uri};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SAMPLE_TEXT: &str = "Alpha beta gamma delta. The agreement may be terminated \
with thirty days written notice by either party. Epsilon zeta eta theta.";

const DEFAULT_SCRIPT: &str = "```repl\nclause = context[0][24:104]\nstate[\"work\"] = {\"clause\": clause}\ntool.yield(\"read the termination clause\")\n```\n---\n```repl\ntool.final(state[\"work\"][\"clause\"])\n```";

#[derive(Parser)]
#[command(name = "rlm", about = "Recursive reasoning runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one execution end-to-end over in-memory stores with scripted
    /// root outputs, printing the answer and citations.
    Demo {
        /// Question recorded on the execution.
        #[arg(long, default_value = "What is the termination notice period?")]
        question: String,
        /// Plain-text document files; a built-in sample is used when empty.
        #[arg(long = "doc")]
        docs: Vec<PathBuf>,
        /// File of scripted root outputs separated by `---` lines.
        #[arg(long)]
        script: Option<PathBuf>,
    },
    /// Poll for runnable executions against a filesystem blob root. Intended
    /// for local smoke-running; rows live in an in-process record store.
    Worker {
        /// Blob store root directory.
        #[arg(long, default_value = "./rlm-data")]
        data_dir: PathBuf,
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 5)]
        poll_seconds: u64,
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Demo {
            question,
            docs,
            script,
        } => demo(question, docs, script).await,
        Command::Worker {
            data_dir,
            poll_seconds,
            once,
        } => worker(data_dir, poll_seconds, once).await,
    }
}

async fn demo(question: String, docs: Vec<PathBuf>, script: Option<PathBuf>) -> Result<()> {
    let blobs = Arc::new(MemoryBlobStore::new());
    let records = Arc::new(MemoryRecordStore::new());
    let settings = Settings {
        bucket: "demo".into(),
        ..Settings::default()
    };

    let mut texts = Vec::new();
    if docs.is_empty() {
        texts.push(("sample.txt".to_string(), SAMPLE_TEXT.to_string()));
    } else {
        for path in docs {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("read document {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "doc.txt".to_string());
            texts.push((name, text));
        }
    }
    seed_session(records.as_ref(), blobs.as_ref(), &settings.bucket, "t1", "s1", &texts)?;
    seed_execution(records.as_ref(), "t1", "s1", "e1", &question)?;

    let outputs = match script {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("read script {}", path.display()))?,
        None => DEFAULT_SCRIPT.to_string(),
    };
    let outputs: Vec<String> = outputs
        .split("\n---\n")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect();

    let provider = Arc::new(StaticProvider::with_outputs(outputs));
    let worker = OrchestratorWorker::new(
        settings,
        Arc::clone(&records) as Arc<dyn RecordStore>,
        Arc::clone(&blobs) as Arc<dyn BlobStore>,
        provider,
        Arc::new(StubSearchBackend),
    );
    let processed = worker.run_once(None).await?;
    anyhow::ensure!(processed == 1, "demo execution was not processed");

    let execution = records
        .get_execution("s1", "e1")?
        .context("execution row missing after run")?;
    println!("status:  {}", serde_json::to_string(&execution.status)?);
    println!("answer:  {}", execution.answer.as_deref().unwrap_or(""));
    for citation in execution.citations.unwrap_or_default() {
        println!(
            "cite:    doc {} [{}, {}) {}",
            citation.doc_index, citation.start_char, citation.end_char, citation.checksum
        );
    }
    Ok(())
}

async fn worker(data_dir: PathBuf, poll_seconds: u64, once: bool) -> Result<()> {
    let blobs = Arc::new(FsBlobStore::new(&data_dir));
    let records = Arc::new(MemoryRecordStore::new());
    let worker = OrchestratorWorker::new(
        Settings::default(),
        Arc::clone(&records) as Arc<dyn RecordStore>,
        blobs,
        Arc::new(StaticProvider::new()),
        Arc::new(StubSearchBackend),
    );
    tracing::info!(data_dir = %data_dir.display(), "worker started");
    loop {
        let processed = worker.run_once(None).await?;
        if processed > 0 {
            tracing::info!(processed, "tick complete");
        }
        if once {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(poll_seconds)).await;
    }
}

fn seed_session(
    records: &dyn RecordStore,
    blobs: &dyn BlobStore,
    bucket: &str,
    tenant_id: &str,
    session_id: &str,
    texts: &[(String, String)],
) -> Result<()> {
    let ttl_epoch = epoch_now() + 3600;
    records.put_session(SessionRecord {
        tenant_id: tenant_id.into(),
        session_id: session_id.into(),
        status: SessionStatus::Ready,
        created_at: utc_now_string(),
        expires_at: utc_now_string(),
        ttl_epoch,
        doc_count: Some(texts.len() as u32),
        total_chars: None,
        options: Some(SessionOptions {
            enable_search: Some(false),
            readiness_mode: None,
        }),
        models_default: Some(ModelsConfig {
            root_model: Some("demo-root".into()),
            sub_model: Some("demo-sub".into()),
        }),
        budgets_default: None,
    })?;

    for (index, (name, raw_text)) in texts.iter().enumerate() {
        let text = normalize_text(raw_text);
        let doc_id = format!("d{index}");
        let text_key = format!("parsed/{tenant_id}/{session_id}/{doc_id}/text.txt");
        let offsets_key = format!("parsed/{tenant_id}/{session_id}/{doc_id}/offsets.json");
        blobs.put_bytes(bucket, &text_key, text.as_bytes())?;
        let offsets = build_offsets(&doc_id, &text, DEFAULT_CHECKPOINT_INTERVAL);
        blobs.put_json(bucket, &offsets_key, &serde_json::to_value(&offsets)?)?;
        records.put_document(DocumentRecord {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
            doc_id: doc_id.clone(),
            doc_index: index as u32,
            source_name: name.clone(),
            mime_type: "text/plain".into(),
            raw_s3_uri: join_s3_uri(bucket, &text_key),
            text_s3_uri: Some(join_s3_uri(bucket, &text_key)),
            meta_s3_uri: None,
            offsets_s3_uri: Some(join_s3_uri(bucket, &offsets_key)),
            search_index_s3_uri: None,
            char_length: Some(offsets.char_length),
            byte_length: Some(offsets.byte_length),
            text_checksum: Some(format!("sha256:{}", sha256_hex(text.as_bytes()))),
            parser_version: Some("demo-parser-v1".into()),
            ingest_status: IngestStatus::Parsed,
            failure_reason: None,
        })?;
    }
    Ok(())
}

fn seed_execution(
    records: &dyn RecordStore,
    tenant_id: &str,
    session_id: &str,
    execution_id: &str,
    question: &str,
) -> Result<()> {
    records.create_execution(ExecutionRecord {
        tenant_id: tenant_id.into(),
        session_id: session_id.into(),
        execution_id: execution_id.into(),
        status: ExecutionStatus::Running,
        mode: ExecutionMode::Answerer,
        question: Some(question.into()),
        budgets_requested: None,
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
    })?;
    records.put_execution_state(ExecutionStateRecord {
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
    })?;
    Ok(())
}
