// SPDX-License-Identifier: MIT OR Apache-2.0
//! Completion providers.
//!
//! Two operations: root completions (never cached) and sub-call completions
//! (cacheable by content address). Transient upstream failures are retried
//! with exponential backoff; the narrowly-defined "wrong output-token
//! parameter name" and "only default temperature" error classes are retried
//! once with the alternate request shape.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod http;
pub mod retry;

pub use cache::{CachedSubcalls, build_llm_cache_key};
pub use http::{ChatTransport, HttpProvider, HttpProviderConfig, TransportError};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default root output emitted by [`StaticProvider`] when scripted outputs
/// run out.
pub const DEFAULT_STATIC_ROOT_OUTPUT: &str = "```repl\ntool.final(\"ok\")\n```";

/// Errors from completion providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Provider misconfiguration (missing model, bad base URL).
    #[error("provider configuration error: {0}")]
    Config(String),
    /// The upstream call failed after exhausting retries.
    #[error("provider call failed after {attempts} attempts: {message}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure description.
        message: String,
    },
    /// The upstream response had an unexpected shape.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Root and sub completions.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name recorded in cache keys and logs.
    fn name(&self) -> &'static str;

    /// Complete a root prompt. Never cached.
    async fn complete_root(
        &self,
        prompt: &str,
        model: Option<&str>,
        tenant_id: &str,
    ) -> Result<String, ProviderError>;

    /// Complete a queued sub-call.
    async fn complete_subcall(
        &self,
        prompt: &str,
        model: Option<&str>,
        max_tokens: u32,
        temperature: Option<f64>,
        tenant_id: &str,
    ) -> Result<String, ProviderError>;
}

/// One recorded call, for assertions against [`StaticProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Prompt text.
    pub prompt: String,
    /// Requested model.
    pub model: Option<String>,
    /// Output token cap (sub-calls only).
    pub max_tokens: Option<u32>,
    /// Temperature (sub-calls only).
    pub temperature: Option<f64>,
}

/// Scripted in-process provider for tests and the demo binary.
///
/// Root completions pop from a FIFO of scripted outputs, falling back to
/// [`DEFAULT_STATIC_ROOT_OUTPUT`]; sub-calls echo `fake:{prompt}`.
pub struct StaticProvider {
    root_outputs: Mutex<VecDeque<String>>,
    default_root_output: String,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StaticProvider {
    /// Provider with no scripted outputs.
    #[must_use]
    pub fn new() -> Self {
        Self::with_outputs(Vec::new())
    }

    /// Provider with scripted root outputs.
    #[must_use]
    pub fn with_outputs(outputs: Vec<String>) -> Self {
        Self {
            root_outputs: Mutex::new(outputs.into()),
            default_root_output: DEFAULT_STATIC_ROOT_OUTPUT.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the fallback root output.
    #[must_use]
    pub fn with_default_output(mut self, output: impl Into<String>) -> Self {
        self.default_root_output = output.into();
        self
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls poisoned").clone()
    }
}

impl Default for StaticProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn complete_root(
        &self,
        prompt: &str,
        model: Option<&str>,
        _tenant_id: &str,
    ) -> Result<String, ProviderError> {
        self.calls.lock().expect("calls poisoned").push(RecordedCall {
            prompt: prompt.to_string(),
            model: model.map(String::from),
            max_tokens: None,
            temperature: None,
        });
        let next = self.root_outputs.lock().expect("outputs poisoned").pop_front();
        Ok(next.unwrap_or_else(|| self.default_root_output.clone()))
    }

    async fn complete_subcall(
        &self,
        prompt: &str,
        model: Option<&str>,
        max_tokens: u32,
        temperature: Option<f64>,
        _tenant_id: &str,
    ) -> Result<String, ProviderError> {
        self.calls.lock().expect("calls poisoned").push(RecordedCall {
            prompt: prompt.to_string(),
            model: model.map(String::from),
            max_tokens: Some(max_tokens),
            temperature,
        });
        Ok(format!("fake:{prompt}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_scripts_then_falls_back() {
        let provider = StaticProvider::with_outputs(vec!["first".into(), "second".into()]);
        assert_eq!(provider.complete_root("p", None, "t").await.unwrap(), "first");
        assert_eq!(provider.complete_root("p", None, "t").await.unwrap(), "second");
        assert_eq!(
            provider.complete_root("p", None, "t").await.unwrap(),
            DEFAULT_STATIC_ROOT_OUTPUT
        );
    }

    #[tokio::test]
    async fn static_subcall_echoes_prompt() {
        let provider = StaticProvider::new();
        let text = provider
            .complete_subcall("summarize the clause", Some("sub-model"), 100, Some(0.0), "t")
            .await
            .unwrap();
        assert_eq!(text, "fake:summarize the clause");
        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].max_tokens, Some(100));
        assert_eq!(calls[0].model.as_deref(), Some("sub-model"));
    }
}
