// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed sub-call cache.
//!
//! Keys derive from `(provider, model, max_tokens, temperature,
//! sha256(prompt))`, so a second identical sub-call returns byte-identical
//! text without touching the upstream. Cache reads never fail a call: any
//! read error — not-found or otherwise — falls through to a miss, and the
//! entry is written only after a successful upstream completion.

use crate::{CompletionProvider, ProviderError};
use async_trait::async_trait;
use rlm_core::time::utc_now_string;
use rlm_state::{canonical_json_bytes, sha256_hex};
use rlm_store::BlobStore;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Default key prefix for the sub-call cache.
pub const DEFAULT_LLM_CACHE_PREFIX: &str = "cache";

/// Content-addressed cache key for a sub-call.
#[must_use]
pub fn build_llm_cache_key(
    tenant_id: &str,
    provider: &str,
    model: Option<&str>,
    max_tokens: u32,
    temperature: Option<f64>,
    prompt: &str,
    prefix: &str,
) -> String {
    let payload = json!({
        "provider": provider,
        "model": model,
        "temperature": temperature,
        "max_tokens": max_tokens,
        "prompt_sha256": sha256_hex(prompt.as_bytes()),
    });
    let digest = sha256_hex(&canonical_json_bytes(&payload));
    format!("{prefix}/{tenant_id}/llm/{digest}.json")
}

/// A provider wrapped with the sub-call cache. Root completions pass
/// through untouched.
pub struct CachedSubcalls<P> {
    inner: P,
    store: Arc<dyn BlobStore>,
    bucket: String,
    prefix: String,
}

impl<P: CompletionProvider> CachedSubcalls<P> {
    /// Wrap a provider with a cache at `bucket`/`prefix`.
    pub fn new(
        inner: P,
        store: Arc<dyn BlobStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn get_text(&self, key: &str) -> Option<String> {
        // Any read failure is a miss; the upstream call is the source of
        // truth.
        let payload = self.store.get_json(&self.bucket, key).ok()?;
        payload
            .get("response")?
            .get("text")?
            .as_str()
            .map(String::from)
    }

    fn put_text(
        &self,
        key: &str,
        model: Option<&str>,
        max_tokens: u32,
        temperature: Option<f64>,
        prompt: &str,
        text: &str,
    ) {
        let record = json!({
            "created_at": utc_now_string(),
            "provider": self.inner.name(),
            "model": model,
            "request": {
                "prompt_sha256": sha256_hex(prompt.as_bytes()),
                "max_tokens": max_tokens,
                "temperature": temperature,
            },
            "response": {"text": text, "raw": {}},
        });
        if let Err(err) = self.store.put_json(&self.bucket, key, &record) {
            debug!(target: "rlm.provider", error = %err, "llm cache write failed");
        }
    }
}

#[async_trait]
impl<P: CompletionProvider> CompletionProvider for CachedSubcalls<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn complete_root(
        &self,
        prompt: &str,
        model: Option<&str>,
        tenant_id: &str,
    ) -> Result<String, ProviderError> {
        self.inner.complete_root(prompt, model, tenant_id).await
    }

    async fn complete_subcall(
        &self,
        prompt: &str,
        model: Option<&str>,
        max_tokens: u32,
        temperature: Option<f64>,
        tenant_id: &str,
    ) -> Result<String, ProviderError> {
        let effective_temperature = temperature.or(Some(0.0));
        let key = build_llm_cache_key(
            tenant_id,
            self.inner.name(),
            model,
            max_tokens,
            effective_temperature,
            prompt,
            &self.prefix,
        );
        if let Some(text) = self.get_text(&key) {
            return Ok(text);
        }
        let text = self
            .inner
            .complete_subcall(prompt, model, max_tokens, effective_temperature, tenant_id)
            .await?;
        self.put_text(&key, model, max_tokens, effective_temperature, prompt, &text);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticProvider;
    use rlm_store::MemoryBlobStore;

    #[tokio::test]
    async fn second_identical_subcall_hits_cache() {
        let store = Arc::new(MemoryBlobStore::new());
        let provider = CachedSubcalls::new(StaticProvider::new(), store, "bucket", "cache");

        let first = provider
            .complete_subcall("summarize", Some("sub"), 100, Some(0.0), "t1")
            .await
            .unwrap();
        let second = provider
            .complete_subcall("summarize", Some("sub"), 100, Some(0.0), "t1")
            .await
            .unwrap();
        assert_eq!(first, second);
        // The inner provider was invoked exactly once.
        assert_eq!(provider.inner.calls().len(), 1);
    }

    #[tokio::test]
    async fn different_parameters_miss() {
        let store = Arc::new(MemoryBlobStore::new());
        let provider = CachedSubcalls::new(StaticProvider::new(), store, "bucket", "cache");

        provider
            .complete_subcall("summarize", Some("sub"), 100, Some(0.0), "t1")
            .await
            .unwrap();
        provider
            .complete_subcall("summarize", Some("sub"), 200, Some(0.0), "t1")
            .await
            .unwrap();
        provider
            .complete_subcall("summarize", Some("other"), 100, Some(0.0), "t1")
            .await
            .unwrap();
        assert_eq!(provider.inner.calls().len(), 3);
    }

    #[tokio::test]
    async fn absent_temperature_normalizes_to_zero() {
        let store = Arc::new(MemoryBlobStore::new());
        let provider = CachedSubcalls::new(StaticProvider::new(), store, "bucket", "cache");

        provider
            .complete_subcall("p", Some("sub"), 100, None, "t1")
            .await
            .unwrap();
        provider
            .complete_subcall("p", Some("sub"), 100, Some(0.0), "t1")
            .await
            .unwrap();
        assert_eq!(provider.inner.calls().len(), 1);
    }

    #[tokio::test]
    async fn root_completions_bypass_cache() {
        let store = Arc::new(MemoryBlobStore::new());
        let provider = CachedSubcalls::new(
            StaticProvider::with_outputs(vec!["a".into(), "b".into()]),
            Arc::clone(&store) as Arc<dyn BlobStore>,
            "bucket",
            "cache",
        );
        assert_eq!(provider.complete_root("p", None, "t").await.unwrap(), "a");
        assert_eq!(provider.complete_root("p", None, "t").await.unwrap(), "b");
        assert!(store.is_empty());
    }

    #[test]
    fn cache_key_layout() {
        let key = build_llm_cache_key("t1", "static", Some("sub"), 100, Some(0.0), "p", "cache");
        assert!(key.starts_with("cache/t1/llm/"));
        assert!(key.ends_with(".json"));
        // Stable across calls.
        assert_eq!(
            key,
            build_llm_cache_key("t1", "static", Some("sub"), 100, Some(0.0), "p", "cache")
        );
    }
}
