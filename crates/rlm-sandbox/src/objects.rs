// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability objects injected into the program environment.
//!
//! Bridges the document views and the tool API onto the language's
//! [`NativeObject`] seam. Blob-read failures surface as `S3ReadError`-kinded
//! exceptions so the executor can classify them.

use rlm_context::{ContextError, ContextView, DocView, ScanHit};
use rlm_repl::{CallArgs, NativeObject, RunError, Value};
use crate::tool::ToolApi;
use std::collections::BTreeMap;
use std::rc::Rc;

const DEFAULT_SCAN_MAX_HITS: i64 = 20;

fn context_error(err: ContextError) -> RunError {
    match err {
        ContextError::Read(_) | ContextError::Decode(_) => {
            RunError::exception("S3ReadError", err.to_string())
        }
        ContextError::IndexOutOfRange { .. } => {
            RunError::exception("IndexError", err.to_string())
        }
        ContextError::InvalidRange { .. } => RunError::exception("ValueError", err.to_string()),
        other => RunError::exception("ValueError", other.to_string()),
    }
}

/// Keyword-only optional integer (`start`, `end`, `max_hits`).
fn opt_int_kw(args: &CallArgs, name: &str) -> Result<Option<i64>, RunError> {
    match args.keyword(name) {
        None | Some(Value::None) => Ok(None),
        Some(Value::Int(value)) => Ok(Some(*value)),
        Some(other) => Err(RunError::type_error(format!(
            "{name} must be an integer, got {}",
            other.type_name()
        ))),
    }
}

fn hits_to_value(hits: Vec<ScanHit>) -> Value {
    Value::list(
        hits.into_iter()
            .map(|hit| {
                let mut map = BTreeMap::new();
                map.insert("start_char".to_string(), Value::Int(hit.start_char as i64));
                map.insert("end_char".to_string(), Value::Int(hit.end_char as i64));
                Value::dict(map)
            })
            .collect(),
    )
}

/// `context` — the ordered document set.
pub struct ContextObject {
    view: Rc<ContextView>,
}

impl ContextObject {
    /// Wrap a context view.
    #[must_use]
    pub fn new(view: Rc<ContextView>) -> Self {
        Self { view }
    }
}

impl NativeObject for ContextObject {
    fn type_name(&self) -> &'static str {
        "ContextView"
    }

    fn call_method(&self, name: &str, _args: CallArgs) -> Result<Value, RunError> {
        Err(RunError::exception(
            "AttributeError",
            format!("ContextView has no method '{name}'"),
        ))
    }

    fn length(&self) -> Result<Option<i64>, RunError> {
        Ok(Some(self.view.len() as i64))
    }

    fn get_index(&self, index: i64) -> Result<Option<Value>, RunError> {
        let doc = self.view.get(index).map_err(context_error)?;
        Ok(Some(Value::Native(Rc::new(DocObject { doc }))))
    }
}

/// A single document view.
pub struct DocObject {
    doc: Rc<DocView>,
}

impl NativeObject for DocObject {
    fn type_name(&self) -> &'static str {
        "DocView"
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RunError> {
        match name {
            "find" => {
                let term = args.require_str(0, "term")?;
                let start = opt_int_kw(&args, "start")?;
                let end = opt_int_kw(&args, "end")?;
                let max_hits = opt_int_kw(&args, "max_hits")?.unwrap_or(DEFAULT_SCAN_MAX_HITS);
                if max_hits <= 0 {
                    return Ok(Value::list(Vec::new()));
                }
                let hits = self
                    .doc
                    .find(&term, start, end, max_hits as usize)
                    .map_err(context_error)?;
                Ok(hits_to_value(hits))
            }
            "regex" => {
                let pattern = args.require_str(0, "pattern")?;
                let start = opt_int_kw(&args, "start")?;
                let end = opt_int_kw(&args, "end")?;
                let max_hits = opt_int_kw(&args, "max_hits")?.unwrap_or(DEFAULT_SCAN_MAX_HITS);
                if max_hits <= 0 {
                    return Ok(Value::list(Vec::new()));
                }
                let hits = self
                    .doc
                    .regex(&pattern, start, end, max_hits as usize)
                    .map_err(context_error)?;
                Ok(hits_to_value(hits))
            }
            "slice" => {
                let start = args.opt_int(0, "start")?;
                let end = args.opt_int(1, "end")?;
                let tag = args.opt_str(2, "tag")?;
                let text = self
                    .doc
                    .slice(start, end, tag.as_deref())
                    .map_err(context_error)?;
                Ok(Value::str(text))
            }
            "sections" => Ok(Value::list(
                self.doc
                    .sections()
                    .iter()
                    .map(Value::from_json)
                    .collect(),
            )),
            "page_spans" => Ok(Value::list(
                self.doc
                    .page_spans()
                    .iter()
                    .map(Value::from_json)
                    .collect(),
            )),
            other => Err(RunError::exception(
                "AttributeError",
                format!("DocView has no method '{other}'"),
            )),
        }
    }

    fn length(&self) -> Result<Option<i64>, RunError> {
        Ok(Some(self.doc.char_length().map_err(context_error)? as i64))
    }

    fn get_index(&self, index: i64) -> Result<Option<Value>, RunError> {
        let text = self.doc.index(index).map_err(context_error)?;
        Ok(Some(Value::str(text)))
    }

    fn get_slice(&self, start: Option<i64>, end: Option<i64>) -> Result<Option<Value>, RunError> {
        let text = self.doc.slice(start, end, None).map_err(context_error)?;
        Ok(Some(Value::str(text)))
    }
}

/// `tool` — the tool capability.
pub struct ToolObject {
    api: Rc<ToolApi>,
}

impl ToolObject {
    /// Wrap the step's tool API.
    #[must_use]
    pub fn new(api: Rc<ToolApi>) -> Self {
        Self { api }
    }
}

impl NativeObject for ToolObject {
    fn type_name(&self) -> &'static str {
        "ToolAPI"
    }

    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RunError> {
        match name {
            "queue_llm" => self.api.queue_llm(&args),
            "queue_search" => self.api.queue_search(&args),
            "yield" => self.api.yield_step(&args),
            "final" => self.api.final_answer(&args),
            other => Err(RunError::exception(
                "AttributeError",
                format!("ToolAPI has no method '{other}'"),
            )),
        }
    }
}
