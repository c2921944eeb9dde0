// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime values and the capability-object seam.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// How program execution can unwind.
///
/// `Yield` and `Final` are not failures: they are the non-recoverable
/// terminations raised by the tool capability. The step executor maps each
/// variant onto the step-result contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    /// An ordinary in-program exception (name errors, type errors, ...).
    #[error("{kind}: {message}")]
    Exception {
        /// Exception class name.
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// The monotonic deadline tripped.
    #[error("step exceeded max_step_seconds")]
    Timeout,
    /// `tool.yield(reason)` was called.
    #[error("step yielded")]
    Yield(Option<String>),
    /// `tool.final(answer)` was called.
    #[error("execution finalized")]
    Final(String),
    /// A `queue_*` call exceeded the per-step tool-request capacity.
    #[error("tool request limit exceeded: {limit}")]
    ToolLimit {
        /// The configured capacity.
        limit: u32,
    },
    /// A `queue_llm` precondition failed (required prior results missing).
    #[error("{message}")]
    Precondition {
        /// Human-readable message.
        message: String,
        /// The missing result keys.
        missing: Vec<String>,
    },
}

impl RunError {
    /// Build an ordinary exception.
    pub fn exception(kind: &str, message: impl Into<String>) -> Self {
        Self::Exception {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::exception("TypeError", message)
    }
}

/// Evaluated call arguments: positionals in order plus keywords.
#[derive(Debug, Default)]
pub struct CallArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments in source order.
    pub kwargs: Vec<(String, Value)>,
}

impl CallArgs {
    /// Positional argument at `index`, if present.
    #[must_use]
    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument by name, if present.
    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Positional-or-keyword lookup (positional wins).
    #[must_use]
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional(index).or_else(|| self.keyword(name))
    }

    /// Required string argument.
    ///
    /// # Errors
    ///
    /// `TypeError` when absent or not a string.
    pub fn require_str(&self, index: usize, name: &str) -> Result<String, RunError> {
        match self.get(index, name) {
            Some(Value::Str(text)) => Ok(text.to_string()),
            Some(other) => Err(RunError::type_error(format!(
                "{name} must be a string, got {}",
                other.type_name()
            ))),
            None => Err(RunError::type_error(format!("missing argument: {name}"))),
        }
    }

    /// Optional integer argument.
    ///
    /// # Errors
    ///
    /// `TypeError` when present but not an integer.
    pub fn opt_int(&self, index: usize, name: &str) -> Result<Option<i64>, RunError> {
        match self.get(index, name) {
            None | Some(Value::None) => Ok(None),
            Some(Value::Int(value)) => Ok(Some(*value)),
            Some(other) => Err(RunError::type_error(format!(
                "{name} must be an integer, got {}",
                other.type_name()
            ))),
        }
    }

    /// Optional number argument widened to f64.
    ///
    /// # Errors
    ///
    /// `TypeError` when present but not a number.
    pub fn opt_number(&self, index: usize, name: &str) -> Result<Option<f64>, RunError> {
        match self.get(index, name) {
            None | Some(Value::None) => Ok(None),
            Some(Value::Int(value)) => Ok(Some(*value as f64)),
            Some(Value::Float(value)) => Ok(Some(*value)),
            Some(other) => Err(RunError::type_error(format!(
                "{name} must be a number, got {}",
                other.type_name()
            ))),
        }
    }

    /// Optional string argument.
    ///
    /// # Errors
    ///
    /// `TypeError` when present but not a string.
    pub fn opt_str(&self, index: usize, name: &str) -> Result<Option<String>, RunError> {
        match self.get(index, name) {
            None | Some(Value::None) => Ok(None),
            Some(Value::Str(text)) => Ok(Some(text.to_string())),
            Some(other) => Err(RunError::type_error(format!(
                "{name} must be a string, got {}",
                other.type_name()
            ))),
        }
    }
}

/// A capability object injected by the sandbox (`context`, a document view,
/// `tool`).
pub trait NativeObject {
    /// Type name shown in error messages.
    fn type_name(&self) -> &'static str;

    /// Invoke a method with evaluated arguments.
    ///
    /// # Errors
    ///
    /// Any [`RunError`], including the non-recoverable tool terminations.
    fn call_method(&self, name: &str, args: CallArgs) -> Result<Value, RunError>;

    /// `len(obj)`, when the object has a length.
    ///
    /// # Errors
    ///
    /// Propagates lazy-I/O failures as exceptions.
    fn length(&self) -> Result<Option<i64>, RunError> {
        Ok(None)
    }

    /// `obj[index]` with an integer index, when supported.
    ///
    /// # Errors
    ///
    /// Index errors and lazy-I/O failures.
    fn get_index(&self, _index: i64) -> Result<Option<Value>, RunError> {
        Ok(None)
    }

    /// `obj[start:end]`, when supported.
    ///
    /// # Errors
    ///
    /// Range errors and lazy-I/O failures.
    fn get_slice(&self, _start: Option<i64>, _end: Option<i64>) -> Result<Option<Value>, RunError> {
        Ok(None)
    }
}

/// Shared-reference list.
pub type ListRef = Rc<RefCell<Vec<Value>>>;
/// Shared-reference string-keyed map.
pub type DictRef = Rc<RefCell<BTreeMap<String, Value>>>;
/// Shared-reference set; elements kept sorted and unique.
pub type SetRef = Rc<RefCell<Vec<Value>>>;

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    /// `None`
    None,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(Rc<str>),
    /// List with shared-reference semantics.
    List(ListRef),
    /// Immutable tuple.
    Tuple(Rc<Vec<Value>>),
    /// Dict with shared-reference semantics and string keys.
    Dict(DictRef),
    /// Set of scalar values, iterated in sorted order for determinism.
    /// Sets (like tuples) are transient: they cannot be persisted in state.
    Set(SetRef),
    /// A capability object.
    Native(Rc<dyn NativeObject>),
}

impl Value {
    /// Build a string value.
    pub fn str(text: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(text.as_ref()))
    }

    /// Build a list value.
    #[must_use]
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Build a tuple value.
    #[must_use]
    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    /// Build a dict value.
    #[must_use]
    pub fn dict(map: BTreeMap<String, Value>) -> Self {
        Value::Dict(Rc::new(RefCell::new(map)))
    }

    /// Type name shown in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Native(object) => object.type_name(),
        }
    }

    /// Truthiness: empty containers, zero numbers, empty strings and `None`
    /// are false; capability objects are always truthy.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Float(value) => *value != 0.0,
            Value::Str(text) => !text.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(map) => !map.borrow().is_empty(),
            Value::Set(items) => !items.borrow().is_empty(),
            Value::Native(_) => true,
        }
    }

    /// Deep structural equality (numbers compare across int/float).
    #[must_use]
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
            }
            // Set elements are kept sorted, so elementwise compare suffices.
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.eq_value(vb))
            }
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Display form, as `print` and f-strings render it.
    #[must_use]
    pub fn display_string(&self) -> String {
        match self {
            Value::Str(text) => text.to_string(),
            other => other.repr_string(),
        }
    }

    /// Repr form: strings quoted, containers rendered recursively.
    #[must_use]
    pub fn repr_string(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(value) => value.to_string(),
            Value::Float(value) => format_float(*value),
            Value::Str(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let rendered: Vec<String> =
                    items.borrow().iter().map(Value::repr_string).collect();
                format!("[{}]", rendered.join(", "))
            }
            Value::Tuple(items) => {
                let rendered: Vec<String> = items.iter().map(Value::repr_string).collect();
                if rendered.len() == 1 {
                    format!("({},)", rendered[0])
                } else {
                    format!("({})", rendered.join(", "))
                }
            }
            Value::Set(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    "set()".to_string()
                } else {
                    let rendered: Vec<String> = items.iter().map(Value::repr_string).collect();
                    format!("{{{}}}", rendered.join(", "))
                }
            }
            Value::Dict(map) => {
                let rendered: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(key, value)| format!("'{key}': {}", value.repr_string()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Value::Native(object) => format!("<{}>", object.type_name()),
        }
    }

    /// Convert a JSON value into a runtime value.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(value) => Value::Bool(*value),
            serde_json::Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Value::Int(value)
                } else {
                    Value::Float(number.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(text) => Value::str(text),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::dict(
                map.iter()
                    .map(|(key, value)| (key.clone(), Value::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Convert a runtime value back to JSON.
    ///
    /// # Errors
    ///
    /// `TypeError` for capability objects and non-finite floats — values
    /// outside the JSON tree discipline.
    pub fn to_json(&self) -> Result<serde_json::Value, RunError> {
        match self {
            Value::None => Ok(serde_json::Value::Null),
            Value::Bool(value) => Ok(serde_json::Value::Bool(*value)),
            Value::Int(value) => Ok(serde_json::Value::from(*value)),
            Value::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .ok_or_else(|| RunError::type_error("non-finite float is not JSON-serializable")),
            Value::Str(text) => Ok(serde_json::Value::from(text.to_string())),
            Value::List(items) => items
                .borrow()
                .iter()
                .map(Value::to_json)
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            // Tuples and sets are transient values; state must be a JSON
            // tree of null/bool/number/string/list/object.
            Value::Tuple(_) | Value::Set(_) => Err(RunError::type_error(format!(
                "{} is not JSON-serializable",
                self.type_name()
            ))),
            Value::Dict(map) => {
                let mut object = serde_json::Map::new();
                for (key, value) in map.borrow().iter() {
                    object.insert(key.clone(), value.to_json()?);
                }
                Ok(serde_json::Value::Object(object))
            }
            Value::Native(object) => Err(RunError::type_error(format!(
                "{} is not JSON-serializable",
                object.type_name()
            ))),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr_string())
    }
}

/// Float rendering: integral floats keep a trailing `.0`.
fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}
