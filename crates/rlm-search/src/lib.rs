// SPDX-License-Identifier: MIT OR Apache-2.0
//! Search backend abstraction.
//!
//! [`SearchBackend`] is a pluggable black box producing character-range
//! hits. The shipped default is [`StubSearchBackend`], a deterministic
//! generator keyed on a hash of the query. [`CachedSearchBackend`] wraps any
//! backend with a content-addressed cache on the blob store: not-found reads
//! are misses and recomputed; any other read error propagates as a backend
//! error.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use rlm_core::time::utc_now_string;
use rlm_core::{JsonObject, SearchHit, SearchToolRequest};
use rlm_error::ErrorCode;
use rlm_state::{canonical_json_bytes, sha256_hex};
use rlm_store::BlobStore;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// Default key prefix for the search cache.
pub const DEFAULT_SEARCH_CACHE_PREFIX: &str = "cache";

/// Message used when search is disabled for the session.
pub const SEARCH_DISABLED_MESSAGE: &str = "Search is disabled";

/// Errors from search resolution.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The backend failed.
    #[error("search backend error: {0}")]
    Backend(String),
}

/// A pluggable search backend.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Name recorded in cache entries.
    fn name(&self) -> &'static str;

    /// Resolve a search request to character-range hits.
    async fn search(
        &self,
        tenant_id: &str,
        session_id: &str,
        request: &SearchToolRequest,
        doc_indexes: &[u32],
        doc_lengths: &[u64],
    ) -> Result<Vec<SearchHit>, SearchError>;
}

/// Error meta payload for a failed tool result.
#[must_use]
pub fn build_error_meta(code: ErrorCode, message: &str, details: Option<Value>) -> JsonObject {
    let mut error = serde_json::Map::new();
    error.insert("code".into(), json!(code));
    error.insert("message".into(), json!(message));
    if let Some(details) = details {
        error.insert("details".into(), details);
    }
    let mut meta = serde_json::Map::new();
    meta.insert("error".into(), Value::Object(error));
    meta
}

/// The meta payload attached to search results when search is disabled.
#[must_use]
pub fn search_disabled_error_meta() -> JsonObject {
    build_error_meta(
        ErrorCode::ValidationError,
        SEARCH_DISABLED_MESSAGE,
        Some(json!({"reason": "search_disabled"})),
    )
}

// ---------------------------------------------------------------------------
// StubSearchBackend
// ---------------------------------------------------------------------------

/// Deterministic stand-in backend: hit positions derive from a hash of the
/// query, so identical requests produce identical hits.
#[derive(Debug, Default)]
pub struct StubSearchBackend;

fn stable_seed(query: &str) -> u64 {
    let digest = sha256_hex(query.as_bytes());
    u64::from_str_radix(&digest[..8], 16).unwrap_or(0)
}

fn span_length(query: &str) -> u64 {
    (query.chars().count() as u64).clamp(1, 200)
}

#[async_trait]
impl SearchBackend for StubSearchBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn search(
        &self,
        _tenant_id: &str,
        _session_id: &str,
        request: &SearchToolRequest,
        doc_indexes: &[u32],
        doc_lengths: &[u64],
    ) -> Result<Vec<SearchHit>, SearchError> {
        let k = request.k as usize;
        if k == 0 || doc_indexes.is_empty() {
            return Ok(Vec::new());
        }
        let seed = stable_seed(&request.query);
        let span = span_length(&request.query);
        let mut hits = Vec::with_capacity(k);
        for position in 0..k as u64 {
            let slot = ((seed + position) % doc_indexes.len() as u64) as usize;
            let doc_index = doc_indexes[slot];
            let doc_length = doc_lengths.get(slot).copied().unwrap_or(0);
            let (start_char, end_char) = if doc_length == 0 {
                (0, 0)
            } else {
                let start = (seed + position * 97) % doc_length;
                let end = (start + span).min(doc_length);
                (start, end.max(start + 1).min(doc_length))
            };
            hits.push(SearchHit {
                doc_index,
                start_char,
                end_char,
                score: None,
                preview: None,
            });
        }
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Content-addressed cache key for a search request.
#[must_use]
pub fn build_search_cache_key(
    tenant_id: &str,
    session_id: &str,
    request: &SearchToolRequest,
    doc_indexes: &[u32],
    doc_lengths: &[u64],
    prefix: &str,
) -> String {
    let payload = json!({
        "session_id": session_id,
        "query": request.query,
        "k": request.k,
        "filters": request.filters,
        "doc_indexes": doc_indexes,
        "doc_lengths": doc_lengths,
    });
    let digest = sha256_hex(&canonical_json_bytes(&payload));
    let cleaned = prefix.trim().trim_matches('/');
    let cleaned = if cleaned.is_empty() {
        DEFAULT_SEARCH_CACHE_PREFIX
    } else {
        cleaned
    };
    format!("{cleaned}/{tenant_id}/search/{digest}.json")
}

/// A backend wrapped with the blob-store cache.
pub struct CachedSearchBackend<B> {
    inner: B,
    store: Arc<dyn BlobStore>,
    bucket: String,
    prefix: String,
}

impl<B: SearchBackend> CachedSearchBackend<B> {
    /// Wrap a backend with a cache at `bucket`/`prefix`.
    pub fn new(inner: B, store: Arc<dyn BlobStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn read_cached(&self, key: &str) -> Result<Option<Vec<SearchHit>>, SearchError> {
        let payload = match self.store.get_json(&self.bucket, key) {
            Ok(payload) => payload,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(SearchError::Backend(err.to_string())),
        };
        // A malformed entry is a miss; the inner backend recomputes it.
        Ok(payload
            .get("response")
            .and_then(|response| response.get("hits"))
            .and_then(|hits| serde_json::from_value(hits.clone()).ok()))
    }

    fn write_cached(&self, key: &str, request: &SearchToolRequest, doc_indexes: &[u32],
        doc_lengths: &[u64], hits: &[SearchHit]) {
        let record = json!({
            "created_at": utc_now_string(),
            "backend": self.inner.name(),
            "request": {
                "query": request.query,
                "k": request.k,
                "filters": request.filters,
                "doc_indexes": doc_indexes,
                "doc_lengths": doc_lengths,
            },
            "response": {"hits": hits},
        });
        if let Err(err) = self.store.put_json(&self.bucket, key, &record) {
            debug!(target: "rlm.search", error = %err, "search cache write failed");
        }
    }
}

#[async_trait]
impl<B: SearchBackend> SearchBackend for CachedSearchBackend<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn search(
        &self,
        tenant_id: &str,
        session_id: &str,
        request: &SearchToolRequest,
        doc_indexes: &[u32],
        doc_lengths: &[u64],
    ) -> Result<Vec<SearchHit>, SearchError> {
        let key = build_search_cache_key(
            tenant_id,
            session_id,
            request,
            doc_indexes,
            doc_lengths,
            &self.prefix,
        );
        if let Some(hits) = self.read_cached(&key)? {
            return Ok(hits);
        }
        let hits = self
            .inner
            .search(tenant_id, session_id, request, doc_indexes, doc_lengths)
            .await?;
        self.write_cached(&key, request, doc_indexes, doc_lengths, &hits);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_store::MemoryBlobStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(query: &str, k: u32) -> SearchToolRequest {
        SearchToolRequest {
            key: "s1".into(),
            query: query.into(),
            k,
            filters: None,
        }
    }

    #[tokio::test]
    async fn stub_is_deterministic() {
        let backend = StubSearchBackend;
        let a = backend
            .search("t", "s", &request("termination", 5), &[0, 1], &[100, 40])
            .await
            .unwrap();
        let b = backend
            .search("t", "s", &request("termination", 5), &[0, 1], &[100, 40])
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        for hit in &a {
            assert!(hit.start_char < hit.end_char);
            let length = if hit.doc_index == 0 { 100 } else { 40 };
            assert!(hit.end_char <= length);
        }
    }

    #[tokio::test]
    async fn k_zero_returns_empty() {
        let backend = StubSearchBackend;
        let hits = backend
            .search("t", "s", &request("q", 0), &[0], &[10])
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty() {
        let backend = StubSearchBackend;
        let hits = backend
            .search("t", "s", &request("q", 3), &[], &[])
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    struct CountingBackend {
        calls: AtomicUsize,
        hits: Mutex<Vec<SearchHit>>,
    }

    #[async_trait]
    impl SearchBackend for &CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn search(
            &self,
            _tenant_id: &str,
            _session_id: &str,
            _request: &SearchToolRequest,
            _doc_indexes: &[u32],
            _doc_lengths: &[u64],
        ) -> Result<Vec<SearchHit>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.hits.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn cache_serves_second_call_without_backend() {
        let backend = CountingBackend {
            calls: AtomicUsize::new(0),
            hits: Mutex::new(vec![SearchHit {
                doc_index: 0,
                start_char: 3,
                end_char: 9,
                score: Some(0.5),
                preview: None,
            }]),
        };
        let store = Arc::new(MemoryBlobStore::new());
        let cached = CachedSearchBackend::new(&backend, store, "bucket", "cache");

        let first = cached
            .search("t", "s", &request("alpha", 3), &[0], &[50])
            .await
            .unwrap();
        let second = cached
            .search("t", "s", &request("alpha", 3), &[0], &[50])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // A different request misses.
        cached
            .search("t", "s", &request("beta", 3), &[0], &[50])
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_key_is_stable_and_input_sensitive() {
        let base = build_search_cache_key("t", "s", &request("q", 5), &[0, 1], &[10, 20], "cache");
        let same = build_search_cache_key("t", "s", &request("q", 5), &[0, 1], &[10, 20], "cache");
        assert_eq!(base, same);
        assert!(base.starts_with("cache/t/search/"));
        assert!(base.ends_with(".json"));

        let different_k =
            build_search_cache_key("t", "s", &request("q", 6), &[0, 1], &[10, 20], "cache");
        assert_ne!(base, different_k);
        let different_docs =
            build_search_cache_key("t", "s", &request("q", 5), &[0], &[10], "cache");
        assert_ne!(base, different_docs);
    }

    #[test]
    fn disabled_meta_shape() {
        let meta = search_disabled_error_meta();
        let error = meta.get("error").unwrap();
        assert_eq!(error["code"], "VALIDATION_ERROR");
        assert_eq!(error["message"], SEARCH_DISABLED_MESSAGE);
    }
}
