// SPDX-License-Identifier: MIT OR Apache-2.0
//! The in-step tool capability.
//!
//! Exposes exactly four primitives to programs: `queue_llm`, `queue_search`,
//! `yield`, and `final`. Queueing is capacity-checked against the per-step
//! tool-request limit; `queue_llm` additionally enforces the
//! `requires_llm_keys` precondition against prior tool results. `yield` and
//! `final` unwind the interpreter with non-recoverable terminations.

use rlm_core::{
    JsonObject, LimitsSnapshot, LlmToolRequest, SearchToolRequest, ToolRequestsEnvelope,
    ToolResultsEnvelope,
};
use rlm_repl::{CallArgs, RunError, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Default `k` for `queue_search`.
const DEFAULT_SEARCH_K: i64 = 10;

/// The tool capability for one step.
pub struct ToolApi {
    limits: Option<LimitsSnapshot>,
    /// Prior sub-LLM result texts by key, for precondition checks.
    llm_results: BTreeMap<String, String>,
    llm: RefCell<Vec<LlmToolRequest>>,
    search: RefCell<Vec<SearchToolRequest>>,
}

impl ToolApi {
    /// Build the capability from the step limits and prior tool results.
    #[must_use]
    pub fn new(limits: Option<LimitsSnapshot>, tool_results: Option<&ToolResultsEnvelope>) -> Self {
        let llm_results = tool_results
            .map(|envelope| {
                envelope
                    .llm
                    .iter()
                    .map(|(key, result)| (key.clone(), result.text.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            limits,
            llm_results,
            llm: RefCell::new(Vec::new()),
            search: RefCell::new(Vec::new()),
        }
    }

    /// Everything queued so far, or `None` when nothing was queued.
    #[must_use]
    pub fn tool_requests(&self) -> Option<ToolRequestsEnvelope> {
        let envelope = ToolRequestsEnvelope {
            llm: self.llm.borrow().clone(),
            search: self.search.borrow().clone(),
        };
        if envelope.is_empty() {
            None
        } else {
            Some(envelope)
        }
    }

    /// Count of queued requests across both kinds.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.llm.borrow().len() + self.search.borrow().len()
    }

    pub(crate) fn queue_llm(&self, args: &CallArgs) -> Result<Value, RunError> {
        let key = args.require_str(0, "key")?;
        let prompt = args.require_str(1, "prompt")?;
        let metadata = convert_metadata(args.keyword("metadata"))?;

        // Read-results-first discipline: declared prerequisites must already
        // be resolved with non-empty text.
        let missing = self.missing_required_llm_keys(metadata.as_ref());
        if !missing.is_empty() {
            return Err(RunError::Precondition {
                message: format!(
                    "queue_llm blocked: missing required tool results for keys: {}",
                    missing.join(", ")
                ),
                missing,
            });
        }

        let max_tokens = args.keyword("max_tokens");
        let max_output_tokens = args.keyword("max_output_tokens");
        let max_output_chars = args.keyword("max_output_chars");
        let provided: Vec<&Value> = [max_tokens, max_output_tokens, max_output_chars]
            .into_iter()
            .flatten()
            .filter(|value| !matches!(value, Value::None))
            .collect();
        if provided.len() != 1 {
            return Err(RunError::exception(
                "ToolAPIError",
                "queue_llm requires exactly one of max_tokens, max_output_tokens, max_output_chars",
            ));
        }
        let resolved_max_tokens = match provided[0] {
            Value::Int(value) if *value > 0 => *value as u32,
            _ => {
                return Err(RunError::exception(
                    "ToolAPIError",
                    "max_tokens must be a positive integer",
                ));
            }
        };

        let model_hint = match args.keyword("model_hint") {
            None => Some("sub".to_string()),
            Some(Value::None) => None,
            Some(Value::Str(hint)) => Some(hint.to_string()),
            Some(other) => {
                return Err(RunError::type_error(format!(
                    "model_hint must be a string, got {}",
                    other.type_name()
                )));
            }
        };
        let temperature = match args.keyword("temperature") {
            None => Some(0.0),
            Some(Value::None) => None,
            Some(Value::Int(value)) => Some(*value as f64),
            Some(Value::Float(value)) => Some(*value),
            Some(other) => {
                return Err(RunError::type_error(format!(
                    "temperature must be a number, got {}",
                    other.type_name()
                )));
            }
        };

        self.ensure_capacity()?;
        self.llm.borrow_mut().push(LlmToolRequest {
            key,
            prompt,
            model_hint,
            max_tokens: resolved_max_tokens,
            temperature,
            metadata,
        });
        Ok(Value::None)
    }

    pub(crate) fn queue_search(&self, args: &CallArgs) -> Result<Value, RunError> {
        let key = args.require_str(0, "key")?;
        let query = args.require_str(1, "query")?;
        let k = match args.keyword("k") {
            None | Some(Value::None) => DEFAULT_SEARCH_K,
            Some(Value::Int(value)) if *value >= 0 => *value,
            Some(_) => {
                return Err(RunError::exception(
                    "ToolAPIError",
                    "k must be a non-negative integer",
                ));
            }
        };
        let filters = convert_metadata(args.keyword("filters"))?;

        self.ensure_capacity()?;
        self.search.borrow_mut().push(SearchToolRequest {
            key,
            query,
            k: k as u32,
            filters,
        });
        Ok(Value::None)
    }

    pub(crate) fn yield_step(&self, args: &CallArgs) -> Result<Value, RunError> {
        let reason = args.opt_str(0, "reason")?;
        Err(RunError::Yield(reason))
    }

    pub(crate) fn final_answer(&self, args: &CallArgs) -> Result<Value, RunError> {
        let answer = args.require_str(0, "answer")?;
        Err(RunError::Final(answer))
    }

    fn ensure_capacity(&self) -> Result<(), RunError> {
        let Some(limit) = self.limits.as_ref().and_then(|l| l.max_tool_requests_per_step) else {
            return Ok(());
        };
        if self.queued_len() as u32 >= limit {
            return Err(RunError::ToolLimit { limit });
        }
        Ok(())
    }

    fn missing_required_llm_keys(&self, metadata: Option<&JsonObject>) -> Vec<String> {
        let Some(required) = metadata
            .and_then(|meta| meta.get("requires_llm_keys"))
            .and_then(|value| value.as_array())
        else {
            return Vec::new();
        };
        required
            .iter()
            .filter_map(|value| value.as_str())
            .filter(|key| !key.trim().is_empty())
            .filter(|key| {
                self.llm_results
                    .get(*key)
                    .is_none_or(|text| text.trim().is_empty())
            })
            .map(String::from)
            .collect()
    }
}

/// Convert an optional dict argument into a JSON object.
fn convert_metadata(value: Option<&Value>) -> Result<Option<JsonObject>, RunError> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(dict @ Value::Dict(_)) => match dict.to_json()? {
            serde_json::Value::Object(map) => Ok(Some(map)),
            _ => unreachable!("dict converts to an object"),
        },
        Some(other) => Err(RunError::type_error(format!(
            "metadata must be a dict, got {}",
            other.type_name()
        ))),
    }
}
