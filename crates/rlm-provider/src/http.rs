// SPDX-License-Identifier: MIT OR Apache-2.0
//! OpenAI-compatible chat-completions provider.
//!
//! The HTTP layer sits behind the [`ChatTransport`] seam so the retry and
//! quirk handling can be exercised without a wire. Transient failures
//! (connect errors, timeouts, 429, 5xx) are retried with exponential
//! backoff; the "wrong output-token parameter name" and "only default
//! temperature" error classes get a single retry with the alternate request
//! shape.

use crate::retry::RetryPolicy;
use crate::{CompletionProvider, ProviderError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default per-call HTTP timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A transport failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct TransportError {
    /// HTTP status, absent for connect/timeout failures.
    pub status: Option<u16>,
    /// Failure description (response body for HTTP errors).
    pub message: String,
}

impl TransportError {
    /// Connect errors, timeouts, 429, and 5xx are transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status == 429 || status >= 500,
        }
    }
}

/// The wire seam: send a chat-completions payload, get the response JSON.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Perform one request.
    async fn send(&self, payload: &Value) -> Result<Value, TransportError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    /// Build a transport against an OpenAI-compatible base URL.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Config`] when the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Config(err.to_string()))?;
        let base_url = base_url.into();
        let base_url = if base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim().trim_end_matches('/').to_string()
        };
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, payload: &Value) -> Result<Value, TransportError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|err| TransportError {
            status: None,
            message: err.to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| TransportError {
            status: Some(status.as_u16()),
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(TransportError {
                status: Some(status.as_u16()),
                message: body,
            });
        }
        serde_json::from_str(&body).map_err(|err| TransportError {
            status: Some(status.as_u16()),
            message: format!("invalid JSON response: {err}"),
        })
    }
}

/// Configuration for [`HttpProvider`].
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
        }
    }
}

/// OpenAI-compatible completion provider.
pub struct HttpProvider {
    transport: Arc<dyn ChatTransport>,
    retry: RetryPolicy,
}

impl HttpProvider {
    /// Build a provider over a transport.
    pub fn new(transport: Arc<dyn ChatTransport>, config: HttpProviderConfig) -> Self {
        Self {
            transport,
            retry: config.retry,
        }
    }

    async fn chat_completion(
        &self,
        prompt: &str,
        model: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> Result<(String, Value), ProviderError> {
        let Some(model) = model else {
            return Err(ProviderError::Config(
                "model is required for the http provider".into(),
            ));
        };

        let mut payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(max_tokens) = max_tokens {
            let field = if uses_max_completion_tokens(model) {
                "max_completion_tokens"
            } else {
                "max_tokens"
            };
            payload[field] = json!(max_tokens);
        }
        if let Some(temperature) = temperature {
            payload["temperature"] = json!(temperature);
        }

        let response = match self.send_with_retries(&payload).await {
            Ok(response) => response,
            Err(err) => {
                // Model-family quirks: retry once with the alternate shape.
                let mut retry_payload = payload.clone();
                let mut retry = false;
                if max_tokens.is_some() && wants_max_completion_tokens(&err) {
                    if let Some(object) = retry_payload.as_object_mut()
                        && let Some(value) = object.remove("max_tokens")
                    {
                        object.insert("max_completion_tokens".into(), value);
                        retry = true;
                    }
                }
                if wants_default_temperature(&err)
                    && let Some(object) = retry_payload.as_object_mut()
                    && object.remove("temperature").is_some()
                {
                    retry = true;
                }
                if !retry {
                    return Err(ProviderError::Exhausted {
                        attempts: self.retry.max_attempts,
                        message: err.to_string(),
                    });
                }
                debug!(target: "rlm.provider", "retrying with alternate request shape");
                self.send_with_retries(&retry_payload)
                    .await
                    .map_err(|err| ProviderError::Exhausted {
                        attempts: self.retry.max_attempts,
                        message: err.to_string(),
                    })?
            }
        };

        let text = response
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing choices[0].message.content".into())
            })?
            .to_string();
        Ok((text, response))
    }

    async fn send_with_retries(&self, payload: &Value) -> Result<Value, TransportError> {
        self.retry
            .run(|| self.transport.send(payload), TransportError::is_transient)
            .await
    }

    fn log_completion(&self, call_kind: &str, model: Option<&str>, text: &str, raw: &Value,
        tenant_id: &str) {
        let finish_reason = raw
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("finish_reason"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(
            target: "rlm.provider",
            call_kind,
            model = model.unwrap_or_default(),
            output_chars = text.chars().count(),
            finish_reason,
            tenant_id,
            "llm completion"
        );
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete_root(
        &self,
        prompt: &str,
        model: Option<&str>,
        tenant_id: &str,
    ) -> Result<String, ProviderError> {
        let (text, raw) = self.chat_completion(prompt, model, None, None).await?;
        self.log_completion("root", model, &text, &raw, tenant_id);
        Ok(text)
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
        let (text, raw) = self
            .chat_completion(prompt, model, Some(max_tokens), effective_temperature)
            .await?;
        self.log_completion("subcall", model, &text, &raw, tenant_id);
        Ok(text)
    }
}

/// Model families whose chat endpoint takes `max_completion_tokens` instead
/// of `max_tokens`.
#[must_use]
pub fn uses_max_completion_tokens(model: &str) -> bool {
    let normalized = model.to_lowercase();
    if normalized.starts_with("gpt-5") {
        return true;
    }
    let mut chars = normalized.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn wants_max_completion_tokens(err: &TransportError) -> bool {
    err.message.contains("max_completion_tokens") && err.message.contains("max_tokens")
}

fn wants_default_temperature(err: &TransportError) -> bool {
    let message = err.message.to_lowercase();
    message.contains("temperature") && message.contains("only the default")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedTransport {
        /// Error to return while attempts remain, then success.
        failures: Mutex<Vec<TransportError>>,
        payloads: Mutex<Vec<Value>>,
        response_text: String,
    }

    impl ScriptedTransport {
        fn new(failures: Vec<TransportError>, response_text: &str) -> Self {
            Self {
                failures: Mutex::new(failures),
                payloads: Mutex::new(Vec::new()),
                response_text: response_text.to_string(),
            }
        }

        fn sent(&self) -> Vec<Value> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for Arc<ScriptedTransport> {
        async fn send(&self, payload: &Value) -> Result<Value, TransportError> {
            self.payloads.lock().unwrap().push(payload.clone());
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(json!({
                    "id": "resp-1",
                    "choices": [{
                        "finish_reason": "stop",
                        "message": {"role": "assistant", "content": self.response_text},
                    }],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5},
                }))
            } else {
                Err(failures.remove(0))
            }
        }
    }

    fn fast_retry() -> HttpProviderConfig {
        HttpProviderConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    fn provider(transport: Arc<ScriptedTransport>) -> HttpProvider {
        HttpProvider::new(Arc::new(transport), fast_retry())
    }

    fn transient(status: u16) -> TransportError {
        TransportError {
            status: Some(status),
            message: "upstream unavailable".into(),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![transient(503), transient(429)],
            "answer",
        ));
        let provider = provider(Arc::clone(&transport));
        let text = provider
            .complete_root("p", Some("root-model"), "t")
            .await
            .unwrap();
        assert_eq!(text, "answer");
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn non_transient_error_fails_without_retry() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![TransportError {
                status: Some(401),
                message: "bad key".into(),
            }],
            "answer",
        ));
        let provider = provider(Arc::clone(&transport));
        let err = provider
            .complete_root("p", Some("root-model"), "t")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted { .. }));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn wrong_parameter_name_is_retried_with_alternate_spelling() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![TransportError {
                status: Some(400),
                message: "Unsupported parameter: 'max_tokens'. Use 'max_completion_tokens' instead."
                    .into(),
            }],
            "answer",
        ));
        let provider = provider(Arc::clone(&transport));
        let text = provider
            .complete_subcall("p", Some("gpt-4.1-mini"), 100, Some(0.0), "t")
            .await
            .unwrap();
        assert_eq!(text, "answer");
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].get("max_tokens").is_some());
        assert!(sent[1].get("max_tokens").is_none());
        assert_eq!(sent[1]["max_completion_tokens"], json!(100));
    }

    #[tokio::test]
    async fn unsupported_temperature_is_dropped_on_retry() {
        let transport = Arc::new(ScriptedTransport::new(
            vec![TransportError {
                status: Some(400),
                message: "temperature does not support 0.0; only the default (1) value is supported"
                    .into(),
            }],
            "answer",
        ));
        let provider = provider(Arc::clone(&transport));
        provider
            .complete_subcall("p", Some("o3-mini"), 100, Some(0.0), "t")
            .await
            .unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].get("temperature").is_some());
        assert!(sent[1].get("temperature").is_none());
    }

    #[tokio::test]
    async fn reasoning_models_use_max_completion_tokens_up_front() {
        let transport = Arc::new(ScriptedTransport::new(vec![], "answer"));
        let provider = provider(Arc::clone(&transport));
        provider
            .complete_subcall("p", Some("o3-mini"), 64, Some(0.0), "t")
            .await
            .unwrap();
        let sent = transport.sent();
        assert!(sent[0].get("max_tokens").is_none());
        assert_eq!(sent[0]["max_completion_tokens"], json!(64));
    }

    #[tokio::test]
    async fn missing_model_is_a_config_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![], "answer"));
        let provider = provider(transport);
        let err = provider.complete_root("p", None, "t").await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn model_family_detection() {
        assert!(uses_max_completion_tokens("gpt-5"));
        assert!(uses_max_completion_tokens("GPT-5-turbo"));
        assert!(uses_max_completion_tokens("o1"));
        assert!(uses_max_completion_tokens("o3-mini"));
        assert!(!uses_max_completion_tokens("gpt-4o"));
        assert!(!uses_max_completion_tokens("omega"));
    }
}
