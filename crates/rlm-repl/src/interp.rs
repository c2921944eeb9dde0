// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tree-walking interpreter.
//!
//! Deterministic by construction: no clock access, no randomness, sorted
//! dict iteration. The only time-dependent behavior is the deadline hook,
//! which checks the monotonic clock every [`TICK_INTERVAL`] evaluation
//! events and unwinds with [`RunError::Timeout`] when the configured
//! deadline has passed.

use crate::ast::{
    BinOp, BoolOp, CmpOp, Expr, ExprKind, ForTarget, FStringPart, Program, Stmt, StmtKind, Target,
    UnaryOp,
};
use crate::value::{CallArgs, RunError, Value};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

/// Evaluation events between deadline checks.
const TICK_INTERVAL: u64 = 256;

/// Hard cap on materialized `range(...)` lengths.
const MAX_RANGE_LEN: i64 = 5_000_000;

/// The curated builtin allow-list exposed to programs.
const BUILTIN_NAMES: &[&str] = &[
    "len", "range", "enumerate", "zip", "map", "filter", "sorted", "reversed", "min", "max",
    "sum", "abs", "round", "int", "float", "str", "bool", "list", "dict", "set", "tuple",
    "isinstance", "print",
];

const TYPE_NAMES: &[&str] = &["int", "float", "str", "bool", "list", "tuple", "dict", "set"];

/// Interpreter configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpConfig {
    /// Monotonic deadline; `None` disables the timeout hook.
    pub deadline: Option<Instant>,
}

/// What a program run produced.
#[derive(Debug)]
pub struct InterpOutcome {
    /// Captured standard output, untruncated.
    pub stdout: String,
    /// `Ok` when the program ran to completion without unwinding.
    pub result: Result<(), RunError>,
}

enum Flow {
    Normal,
    Break,
    Continue,
}

/// The interpreter. Holds the program's global scope so the caller can read
/// values (notably `state`) back out after the run.
pub struct Interp {
    globals: BTreeMap<String, Value>,
    stdout: String,
    deadline: Option<Instant>,
    ops: u64,
}

impl Interp {
    /// Create an interpreter.
    #[must_use]
    pub fn new(config: InterpConfig) -> Self {
        Self {
            globals: BTreeMap::new(),
            stdout: String::new(),
            deadline: config.deadline,
            ops: 0,
        }
    }

    /// Run a program with the given initial globals.
    pub fn run(&mut self, program: &Program, globals: BTreeMap<String, Value>) -> InterpOutcome {
        self.globals = globals;
        self.stdout.clear();
        let result = match self.exec_block(&program.body) {
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        InterpOutcome {
            stdout: self.stdout.clone(),
            result,
        }
    }

    /// Read a global after the run (e.g. the program's `state` rebinding).
    #[must_use]
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    fn tick(&mut self) -> Result<(), RunError> {
        self.ops += 1;
        if self.ops % TICK_INTERVAL == 0
            && let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(RunError::Timeout);
        }
        Ok(())
    }

    // --- statements ---

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, RunError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, RunError> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = self.read_target(target)?;
                let rhs = self.eval(value)?;
                let updated = binary_op(*op, &current, &rhs)?;
                self.assign(target, updated)?;
                Ok(Flow::Normal)
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(orelse)
            }
            StmtKind::For { target, iter, body } => {
                let iter_value = self.eval(iter)?;
                let items = self.iterate(&iter_value)?;
                for item in items {
                    self.tick()?;
                    self.bind_for_target(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::While { test, body } => {
                while self.eval(test)?.truthy() {
                    self.tick()?;
                    match self.exec_block(body)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Pass => Ok(Flow::Normal),
            // The policy validator rejects these before execution; reaching
            // one here is still a hard error.
            StmtKind::Import { module } => Err(RunError::exception(
                "ImportError",
                format!("import is not allowed: {module}"),
            )),
            StmtKind::Global { .. } | StmtKind::Nonlocal { .. } => Err(RunError::exception(
                "SyntaxError",
                "scope declarations are not allowed",
            )),
        }
    }

    fn bind_for_target(&mut self, target: &ForTarget, item: Value) -> Result<(), RunError> {
        match target {
            ForTarget::Name(name) => {
                self.globals.insert(name.clone(), item);
                Ok(())
            }
            ForTarget::Pair(first, second) => {
                let items: Vec<Value> = match item {
                    Value::List(items) => items.borrow().clone(),
                    Value::Tuple(items) => items.as_ref().clone(),
                    other => {
                        return Err(RunError::type_error(format!(
                            "cannot unpack {}",
                            other.type_name()
                        )));
                    }
                };
                if items.len() != 2 {
                    return Err(RunError::exception(
                        "ValueError",
                        format!("cannot unpack {} values into 2 names", items.len()),
                    ));
                }
                self.globals.insert(first.clone(), items[0].clone());
                self.globals.insert(second.clone(), items[1].clone());
                Ok(())
            }
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), RunError> {
        match target {
            Target::Name(name) => {
                self.globals.insert(name.clone(), value);
                Ok(())
            }
            Target::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                match (&object, &index) {
                    (Value::List(items), Value::Int(position)) => {
                        let mut items = items.borrow_mut();
                        let resolved = normalize_index(*position, items.len())?;
                        items[resolved] = value;
                        Ok(())
                    }
                    (Value::Dict(map), Value::Str(key)) => {
                        map.borrow_mut().insert(key.to_string(), value);
                        Ok(())
                    }
                    (Value::Dict(_), other) => Err(RunError::type_error(format!(
                        "dict keys must be strings, got {}",
                        other.type_name()
                    ))),
                    (other, _) => Err(RunError::type_error(format!(
                        "{} does not support item assignment",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    fn read_target(&mut self, target: &Target) -> Result<Value, RunError> {
        match target {
            Target::Name(name) => self
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| RunError::exception("NameError", format!("name '{name}' is not defined"))),
            Target::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                index_value(&object, &index)
            }
        }
    }

    // --- expressions ---

    fn eval(&mut self, expr: &Expr) -> Result<Value, RunError> {
        self.tick()?;
        match &expr.kind {
            ExprKind::NoneLit => Ok(Value::None),
            ExprKind::Bool(value) => Ok(Value::Bool(*value)),
            ExprKind::Int(value) => Ok(Value::Int(*value)),
            ExprKind::Float(value) => Ok(Value::Float(*value)),
            ExprKind::Str(text) => Ok(Value::str(text)),
            ExprKind::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Expr(inner) => {
                            out.push_str(&self.eval(inner)?.display_string());
                        }
                    }
                }
                Ok(Value::str(out))
            }
            ExprKind::Name(name) => {
                if let Some(value) = self.globals.get(name) {
                    return Ok(value.clone());
                }
                Err(RunError::exception(
                    "NameError",
                    format!("name '{name}' is not defined"),
                ))
            }
            ExprKind::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::list(values))
            }
            ExprKind::Dict(items) => {
                let mut map = BTreeMap::new();
                for (key, value) in items {
                    let key = match self.eval(key)? {
                        Value::Str(text) => text.to_string(),
                        other => {
                            return Err(RunError::type_error(format!(
                                "dict keys must be strings, got {}",
                                other.type_name()
                            )));
                        }
                    };
                    map.insert(key, self.eval(value)?);
                }
                Ok(Value::dict(map))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(value) => value
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| RunError::exception("OverflowError", "integer overflow")),
                        Value::Float(value) => Ok(Value::Float(-value)),
                        other => Err(RunError::type_error(format!(
                            "bad operand type for unary -: {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary_op(*op, &left, &right)
            }
            ExprKind::BoolChain { op, values } => {
                let mut last = Value::None;
                for (position, value) in values.iter().enumerate() {
                    last = self.eval(value)?;
                    let truthy = last.truthy();
                    let short_circuit = match op {
                        BoolOp::And => !truthy,
                        BoolOp::Or => truthy,
                    };
                    if short_circuit && position < values.len() - 1 {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            ExprKind::Compare { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                compare(*op, &left, &right)
            }
            ExprKind::Call { func, args, kwargs } => self.eval_call(func, args, kwargs),
            ExprKind::Attribute { object, .. } => {
                let value = self.eval(object)?;
                Err(RunError::type_error(format!(
                    "attributes of {} can only be called",
                    value.type_name()
                )))
            }
            ExprKind::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                index_value(&object, &index)
            }
            ExprKind::Slice { object, start, end } => {
                let object = self.eval(object)?;
                let start = self.eval_opt_bound(start.as_deref())?;
                let end = self.eval_opt_bound(end.as_deref())?;
                slice_value(&object, start, end)
            }
        }
    }

    fn eval_opt_bound(&mut self, bound: Option<&Expr>) -> Result<Option<i64>, RunError> {
        match bound {
            None => Ok(None),
            Some(expr) => match self.eval(expr)? {
                Value::None => Ok(None),
                Value::Int(value) => Ok(Some(value)),
                other => Err(RunError::type_error(format!(
                    "slice bounds must be integers, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Value, RunError> {
        // Method call: dispatch on the receiver without materializing a
        // bound-method value.
        if let ExprKind::Attribute { object, attr } = &func.kind {
            let receiver = self.eval(object)?;
            let call_args = self.eval_args(args, kwargs)?;
            return self.call_method(&receiver, attr, call_args);
        }

        if let ExprKind::Name(name) = &func.kind {
            if let Some(value) = self.globals.get(name) {
                return Err(RunError::type_error(format!(
                    "{} object is not callable",
                    value.type_name()
                )));
            }
            // `isinstance`, `map`, and `filter` take their type/function
            // argument syntactically: types and functions are not
            // first-class values in this language.
            if name == "isinstance" {
                return self.eval_isinstance(args, kwargs);
            }
            if name == "map" || name == "filter" {
                return self.eval_map_filter(name == "map", args, kwargs);
            }
            if BUILTIN_NAMES.contains(&name.as_str()) {
                let call_args = self.eval_args(args, kwargs)?;
                return self.call_builtin(name, call_args);
            }
            return Err(RunError::exception(
                "NameError",
                format!("name '{name}' is not defined"),
            ));
        }

        Err(RunError::type_error("expression is not callable"))
    }

    fn eval_args(&mut self, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<CallArgs, RunError> {
        let mut call_args = CallArgs::default();
        for arg in args {
            call_args.args.push(self.eval(arg)?);
        }
        for (name, value) in kwargs {
            call_args.kwargs.push((name.clone(), self.eval(value)?));
        }
        Ok(call_args)
    }

    fn eval_isinstance(
        &mut self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Value, RunError> {
        if args.len() != 2 || !kwargs.is_empty() {
            return Err(RunError::type_error("isinstance takes exactly 2 arguments"));
        }
        let value = self.eval(&args[0])?;
        let ExprKind::Name(type_name) = &args[1].kind else {
            return Err(RunError::type_error(
                "isinstance second argument must be a type name",
            ));
        };
        if !TYPE_NAMES.contains(&type_name.as_str()) {
            return Err(RunError::type_error(format!(
                "unknown type name: {type_name}"
            )));
        }
        let matches = match type_name.as_str() {
            "int" => matches!(value, Value::Int(_)),
            "float" => matches!(value, Value::Float(_)),
            "str" => matches!(value, Value::Str(_)),
            "bool" => matches!(value, Value::Bool(_)),
            "list" => matches!(value, Value::List(_)),
            "tuple" => matches!(value, Value::Tuple(_)),
            "dict" => matches!(value, Value::Dict(_)),
            "set" => matches!(value, Value::Set(_)),
            _ => false,
        };
        Ok(Value::Bool(matches))
    }

    /// `map(f, iterable)` / `filter(f, iterable)` where `f` names a builtin
    /// (`filter` also accepts `None` for truthiness filtering).
    fn eval_map_filter(
        &mut self,
        is_map: bool,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Value, RunError> {
        let which = if is_map { "map" } else { "filter" };
        if args.len() != 2 || !kwargs.is_empty() {
            return Err(RunError::type_error(format!(
                "{which} takes exactly 2 arguments"
            )));
        }
        let func = match &args[0].kind {
            ExprKind::NoneLit if !is_map => None,
            ExprKind::Name(name)
                if BUILTIN_NAMES.contains(&name.as_str())
                    && !matches!(name.as_str(), "map" | "filter" | "isinstance") =>
            {
                Some(name.clone())
            }
            _ => {
                return Err(RunError::type_error(format!(
                    "{which} first argument must name a builtin function"
                )));
            }
        };
        let iter_value = self.eval(&args[1])?;
        let items = self.iterate(&iter_value)?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            self.tick()?;
            if is_map {
                let func = func.as_deref().expect("map always has a function");
                out.push(self.call_builtin(
                    func,
                    CallArgs {
                        args: vec![item],
                        kwargs: Vec::new(),
                    },
                )?);
            } else {
                let keep = match &func {
                    None => item.truthy(),
                    Some(func) => self
                        .call_builtin(
                            func,
                            CallArgs {
                                args: vec![item.clone()],
                                kwargs: Vec::new(),
                            },
                        )?
                        .truthy(),
                };
                if keep {
                    out.push(item);
                }
            }
        }
        Ok(Value::list(out))
    }

    fn iterate(&self, value: &Value) -> Result<Vec<Value>, RunError> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.as_ref().clone()),
            // Set elements are stored sorted, so iteration is deterministic.
            Value::Set(items) => Ok(items.borrow().clone()),
            Value::Str(text) => Ok(text.chars().map(|c| Value::str(c.to_string())).collect()),
            // Dict iteration yields keys, sorted (BTreeMap order).
            Value::Dict(map) => Ok(map.borrow().keys().map(Value::str).collect()),
            other => Err(RunError::type_error(format!(
                "{} is not iterable",
                other.type_name()
            ))),
        }
    }

    fn call_method(&mut self, receiver: &Value, name: &str, args: CallArgs)
    -> Result<Value, RunError> {
        match receiver {
            Value::Str(text) => str_method(text, name, &args),
            Value::List(items) => {
                match name {
                    "append" => {
                        let Some(value) = args.positional(0) else {
                            return Err(RunError::type_error("append takes one argument"));
                        };
                        items.borrow_mut().push(value.clone());
                        Ok(Value::None)
                    }
                    "extend" => {
                        let Some(value) = args.positional(0) else {
                            return Err(RunError::type_error("extend takes one argument"));
                        };
                        let extra = self.iterate(value)?;
                        items.borrow_mut().extend(extra);
                        Ok(Value::None)
                    }
                    other => Err(RunError::exception(
                        "AttributeError",
                        format!("list has no method '{other}'"),
                    )),
                }
            }
            Value::Dict(map) => dict_method(map, name, &args),
            Value::Set(items) => match name {
                "add" => {
                    let Some(value) = args.positional(0) else {
                        return Err(RunError::type_error("add takes one argument"));
                    };
                    set_insert(&mut items.borrow_mut(), value.clone())?;
                    Ok(Value::None)
                }
                other => Err(RunError::exception(
                    "AttributeError",
                    format!("set has no method '{other}'"),
                )),
            },
            Value::Native(object) => object.call_method(name, args),
            other => Err(RunError::exception(
                "AttributeError",
                format!("{} has no method '{name}'", other.type_name()),
            )),
        }
    }

    fn call_builtin(&mut self, name: &str, args: CallArgs) -> Result<Value, RunError> {
        match name {
            "print" => {
                let rendered: Vec<String> =
                    args.args.iter().map(Value::display_string).collect();
                self.stdout.push_str(&rendered.join(" "));
                self.stdout.push('\n');
                Ok(Value::None)
            }
            "len" => {
                let Some(value) = args.positional(0) else {
                    return Err(RunError::type_error("len takes one argument"));
                };
                let length = match value {
                    Value::Str(text) => text.chars().count() as i64,
                    Value::List(items) => items.borrow().len() as i64,
                    Value::Tuple(items) => items.len() as i64,
                    Value::Dict(map) => map.borrow().len() as i64,
                    Value::Set(items) => items.borrow().len() as i64,
                    Value::Native(object) => object.length()?.ok_or_else(|| {
                        RunError::type_error(format!("{} has no length", object.type_name()))
                    })?,
                    other => {
                        return Err(RunError::type_error(format!(
                            "{} has no length",
                            other.type_name()
                        )));
                    }
                };
                Ok(Value::Int(length))
            }
            "range" => {
                let (start, stop, step) = match args.args.len() {
                    1 => (0, require_int(args.positional(0), "stop")?, 1),
                    2 => (
                        require_int(args.positional(0), "start")?,
                        require_int(args.positional(1), "stop")?,
                        1,
                    ),
                    3 => (
                        require_int(args.positional(0), "start")?,
                        require_int(args.positional(1), "stop")?,
                        require_int(args.positional(2), "step")?,
                    ),
                    n => {
                        return Err(RunError::type_error(format!(
                            "range takes 1 to 3 arguments, got {n}"
                        )));
                    }
                };
                if step == 0 {
                    return Err(RunError::exception("ValueError", "range step must not be zero"));
                }
                let span = if step > 0 {
                    (stop.saturating_sub(start)).max(0)
                } else {
                    (start.saturating_sub(stop)).max(0)
                };
                let count = (span + step.abs() - 1) / step.abs();
                if count > MAX_RANGE_LEN {
                    return Err(RunError::exception("OverflowError", "range too large"));
                }
                let mut items = Vec::with_capacity(count as usize);
                let mut current = start;
                for _ in 0..count {
                    items.push(Value::Int(current));
                    current += step;
                }
                Ok(Value::list(items))
            }
            "enumerate" => {
                let Some(value) = args.positional(0) else {
                    return Err(RunError::type_error("enumerate takes an iterable"));
                };
                let start = match args.get(1, "start") {
                    None => 0,
                    Some(Value::Int(value)) => *value,
                    Some(other) => {
                        return Err(RunError::type_error(format!(
                            "start must be an integer, got {}",
                            other.type_name()
                        )));
                    }
                };
                let items = self.iterate(value)?;
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(position, item)| {
                            Value::tuple(vec![Value::Int(start + position as i64), item])
                        })
                        .collect(),
                ))
            }
            "zip" => {
                let sequences = args
                    .args
                    .iter()
                    .map(|value| self.iterate(value))
                    .collect::<Result<Vec<_>, _>>()?;
                let shortest = sequences.iter().map(Vec::len).min().unwrap_or(0);
                let rows = (0..shortest)
                    .map(|row| {
                        Value::tuple(sequences.iter().map(|seq| seq[row].clone()).collect())
                    })
                    .collect();
                Ok(Value::list(rows))
            }
            "reversed" => {
                let Some(value) = args.positional(0) else {
                    return Err(RunError::type_error("reversed takes an iterable"));
                };
                let mut items = self.iterate(value)?;
                items.reverse();
                Ok(Value::list(items))
            }
            "sorted" => {
                let Some(value) = args.positional(0) else {
                    return Err(RunError::type_error("sorted takes an iterable"));
                };
                let mut items = self.iterate(value)?;
                sort_values(&mut items)?;
                Ok(Value::list(items))
            }
            "min" | "max" => {
                let candidates = if args.args.len() == 1 {
                    self.iterate(&args.args[0])?
                } else {
                    args.args.clone()
                };
                if candidates.is_empty() {
                    return Err(RunError::exception("ValueError", format!("{name}() of empty sequence")));
                }
                let mut best = candidates[0].clone();
                for candidate in &candidates[1..] {
                    let ordering = order_values(candidate, &best)?;
                    let better = if name == "min" {
                        ordering == Ordering::Less
                    } else {
                        ordering == Ordering::Greater
                    };
                    if better {
                        best = candidate.clone();
                    }
                }
                Ok(best)
            }
            "sum" => {
                let Some(value) = args.positional(0) else {
                    return Err(RunError::type_error("sum takes an iterable"));
                };
                let mut int_total = 0i64;
                let mut float_total = 0f64;
                let mut is_float = false;
                for item in self.iterate(value)? {
                    match item {
                        Value::Int(value) => {
                            int_total = int_total.checked_add(value).ok_or_else(|| {
                                RunError::exception("OverflowError", "integer overflow in sum")
                            })?;
                        }
                        Value::Float(value) => {
                            is_float = true;
                            float_total += value;
                        }
                        other => {
                            return Err(RunError::type_error(format!(
                                "cannot sum {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                if is_float {
                    Ok(Value::Float(float_total + int_total as f64))
                } else {
                    Ok(Value::Int(int_total))
                }
            }
            "abs" => match args.positional(0) {
                Some(Value::Int(value)) => Ok(Value::Int(value.abs())),
                Some(Value::Float(value)) => Ok(Value::Float(value.abs())),
                Some(other) => Err(RunError::type_error(format!(
                    "bad operand for abs: {}",
                    other.type_name()
                ))),
                None => Err(RunError::type_error("abs takes one argument")),
            },
            "round" => {
                let number = match args.positional(0) {
                    Some(Value::Int(value)) => *value as f64,
                    Some(Value::Float(value)) => *value,
                    Some(other) => {
                        return Err(RunError::type_error(format!(
                            "bad operand for round: {}",
                            other.type_name()
                        )));
                    }
                    None => return Err(RunError::type_error("round takes a number")),
                };
                match args.get(1, "ndigits") {
                    None | Some(Value::None) => Ok(Value::Int(number.round() as i64)),
                    Some(Value::Int(digits)) => {
                        let factor = 10f64.powi(*digits as i32);
                        Ok(Value::Float((number * factor).round() / factor))
                    }
                    Some(other) => Err(RunError::type_error(format!(
                        "ndigits must be an integer, got {}",
                        other.type_name()
                    ))),
                }
            }
            "int" => match args.positional(0) {
                None => Ok(Value::Int(0)),
                Some(Value::Int(value)) => Ok(Value::Int(*value)),
                Some(Value::Float(value)) => Ok(Value::Int(value.trunc() as i64)),
                Some(Value::Bool(value)) => Ok(Value::Int(i64::from(*value))),
                Some(Value::Str(text)) => text.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    RunError::exception(
                        "ValueError",
                        format!("invalid literal for int(): {}", text.trim()),
                    )
                }),
                Some(other) => Err(RunError::type_error(format!(
                    "cannot convert {} to int",
                    other.type_name()
                ))),
            },
            "float" => match args.positional(0) {
                None => Ok(Value::Float(0.0)),
                Some(Value::Int(value)) => Ok(Value::Float(*value as f64)),
                Some(Value::Float(value)) => Ok(Value::Float(*value)),
                Some(Value::Bool(value)) => Ok(Value::Float(f64::from(u8::from(*value)))),
                Some(Value::Str(text)) => {
                    text.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        RunError::exception(
                            "ValueError",
                            format!("could not convert string to float: {}", text.trim()),
                        )
                    })
                }
                Some(other) => Err(RunError::type_error(format!(
                    "cannot convert {} to float",
                    other.type_name()
                ))),
            },
            "str" => Ok(Value::str(
                args.positional(0).map_or(String::new(), Value::display_string),
            )),
            "bool" => Ok(Value::Bool(args.positional(0).is_some_and(Value::truthy))),
            "list" => match args.positional(0) {
                None => Ok(Value::list(Vec::new())),
                Some(value) => Ok(Value::list(self.iterate(value)?)),
            },
            "dict" => match args.positional(0) {
                None => Ok(Value::dict(BTreeMap::new())),
                Some(Value::Dict(map)) => Ok(Value::dict(map.borrow().clone())),
                Some(other) => Err(RunError::type_error(format!(
                    "cannot convert {} to dict",
                    other.type_name()
                ))),
            },
            "tuple" => match args.positional(0) {
                None => Ok(Value::tuple(Vec::new())),
                Some(value) => Ok(Value::tuple(self.iterate(value)?)),
            },
            "set" => match args.positional(0) {
                None => Ok(Value::Set(Rc::new(RefCell::new(Vec::new())))),
                Some(value) => build_set(self.iterate(value)?),
            },
            other => Err(RunError::exception(
                "NameError",
                format!("name '{other}' is not defined"),
            )),
        }
    }
}

/// Insert an element into a set's sorted-unique backing vector.
///
/// Only scalar values are hashable; numeric elements dedupe across
/// int/float, as in the source language.
fn set_insert(elements: &mut Vec<Value>, item: Value) -> Result<(), RunError> {
    if !matches!(
        item,
        Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
    ) {
        return Err(RunError::type_error(format!(
            "unhashable type: {}",
            item.type_name()
        )));
    }
    if elements.iter().any(|existing| existing.eq_value(&item)) {
        return Ok(());
    }
    let position =
        elements.partition_point(|existing| set_element_cmp(existing, &item) == Ordering::Less);
    elements.insert(position, item);
    Ok(())
}

/// Total order over set elements: None < bool < numbers < strings.
fn set_element_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::None => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Str(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        _ => match (as_number(a), as_number(b)) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

fn build_set(items: Vec<Value>) -> Result<Value, RunError> {
    let mut elements = Vec::with_capacity(items.len());
    for item in items {
        set_insert(&mut elements, item)?;
    }
    Ok(Value::Set(Rc::new(RefCell::new(elements))))
}

fn require_int(value: Option<&Value>, name: &str) -> Result<i64, RunError> {
    match value {
        Some(Value::Int(value)) => Ok(*value),
        Some(other) => Err(RunError::type_error(format!(
            "{name} must be an integer, got {}",
            other.type_name()
        ))),
        None => Err(RunError::type_error(format!("missing argument: {name}"))),
    }
}

fn normalize_index(index: i64, length: usize) -> Result<usize, RunError> {
    let resolved = if index < 0 {
        index + length as i64
    } else {
        index
    };
    if resolved < 0 || resolved >= length as i64 {
        return Err(RunError::exception("IndexError", "index out of range"));
    }
    Ok(resolved as usize)
}

/// Clamp a slice bound the way the source language does.
fn clamp_bound(bound: Option<i64>, default: i64, length: i64) -> i64 {
    let resolved = match bound {
        None => default,
        Some(value) if value < 0 => value + length,
        Some(value) => value,
    };
    resolved.clamp(0, length)
}

fn index_value(object: &Value, index: &Value) -> Result<Value, RunError> {
    match (object, index) {
        (Value::Str(text), Value::Int(position)) => {
            let chars: Vec<char> = text.chars().collect();
            let resolved = normalize_index(*position, chars.len())?;
            Ok(Value::str(chars[resolved].to_string()))
        }
        (Value::List(items), Value::Int(position)) => {
            let items = items.borrow();
            let resolved = normalize_index(*position, items.len())?;
            Ok(items[resolved].clone())
        }
        (Value::Tuple(items), Value::Int(position)) => {
            let resolved = normalize_index(*position, items.len())?;
            Ok(items[resolved].clone())
        }
        (Value::Dict(map), Value::Str(key)) => map
            .borrow()
            .get(key.as_ref())
            .cloned()
            .ok_or_else(|| RunError::exception("KeyError", format!("'{key}'"))),
        (Value::Dict(_), other) => Err(RunError::type_error(format!(
            "dict keys must be strings, got {}",
            other.type_name()
        ))),
        (Value::Native(native), Value::Int(position)) =>

            native.get_index(*position)?.ok_or_else(|| {
                RunError::type_error(format!("{} is not indexable", native.type_name()))
            }),
        (other, _) => Err(RunError::type_error(format!(
            "{} is not indexable",
            other.type_name()
        ))),
    }
}

fn slice_value(object: &Value, start: Option<i64>, end: Option<i64>) -> Result<Value, RunError> {
    match object {
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let length = chars.len() as i64;
            let from = clamp_bound(start, 0, length);
            let to = clamp_bound(end, length, length).max(from);
            Ok(Value::str(
                chars[from as usize..to as usize].iter().collect::<String>(),
            ))
        }
        Value::List(items) => {
            let items = items.borrow();
            let length = items.len() as i64;
            let from = clamp_bound(start, 0, length);
            let to = clamp_bound(end, length, length).max(from);
            Ok(Value::list(items[from as usize..to as usize].to_vec()))
        }
        Value::Tuple(items) => {
            let length = items.len() as i64;
            let from = clamp_bound(start, 0, length);
            let to = clamp_bound(end, length, length).max(from);
            Ok(Value::tuple(items[from as usize..to as usize].to_vec()))
        }
        Value::Native(native) => native.get_slice(start, end)?.ok_or_else(|| {
            RunError::type_error(format!("{} is not sliceable", native.type_name()))
        }),
        other => Err(RunError::type_error(format!(
            "{} is not sliceable",
            other.type_name()
        ))),
    }
}

fn binary_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, RunError> {
    use Value::{Float, Int, List, Str};
    match (op, left, right) {
        (BinOp::Add, Int(a), Int(b)) => a
            .checked_add(*b)
            .map(Int)
            .ok_or_else(|| RunError::exception("OverflowError", "integer overflow")),
        (BinOp::Sub, Int(a), Int(b)) => a
            .checked_sub(*b)
            .map(Int)
            .ok_or_else(|| RunError::exception("OverflowError", "integer overflow")),
        (BinOp::Mul, Int(a), Int(b)) => a
            .checked_mul(*b)
            .map(Int)
            .ok_or_else(|| RunError::exception("OverflowError", "integer overflow")),
        (BinOp::FloorDiv, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(RunError::exception("ZeroDivisionError", "integer division by zero"));
            }
            let quotient = a / b;
            let adjusted = if a % b != 0 && (a < &0) != (b < &0) {
                quotient - 1
            } else {
                quotient
            };
            Ok(Int(adjusted))
        }
        (BinOp::Mod, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(RunError::exception("ZeroDivisionError", "integer modulo by zero"));
            }
            let remainder = a % b;
            let adjusted = if remainder != 0 && (remainder < 0) != (b < &0) {
                remainder + b
            } else {
                remainder
            };
            Ok(Int(adjusted))
        }
        (BinOp::Div, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(RunError::exception("ZeroDivisionError", "division by zero"));
            }
            Ok(Float(*a as f64 / *b as f64))
        }
        (BinOp::Add, Str(a), Str(b)) => Ok(Value::str(format!("{a}{b}"))),
        (BinOp::Add, List(a), List(b)) => {
            let mut combined = a.borrow().clone();
            combined.extend(b.borrow().iter().cloned());
            Ok(Value::list(combined))
        }
        (op, left, right) => {
            // Mixed numeric falls through to float arithmetic.
            let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
                return Err(RunError::type_error(format!(
                    "unsupported operand types: {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            };
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(RunError::exception("ZeroDivisionError", "division by zero"));
                    }
                    a / b
                }
                BinOp::FloorDiv => {
                    if b == 0.0 {
                        return Err(RunError::exception("ZeroDivisionError", "division by zero"));
                    }
                    (a / b).floor()
                }
                BinOp::Mod => {
                    if b == 0.0 {
                        return Err(RunError::exception("ZeroDivisionError", "modulo by zero"));
                    }
                    a - b * (a / b).floor()
                }
            };
            Ok(Float(result))
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(value) => Some(*value as f64),
        Value::Float(value) => Some(*value),
        _ => None,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value, RunError> {
    match op {
        CmpOp::Eq => Ok(Value::Bool(left.eq_value(right))),
        CmpOp::NotEq => Ok(Value::Bool(!left.eq_value(right))),
        CmpOp::In | CmpOp::NotIn => {
            let contained = membership(left, right)?;
            Ok(Value::Bool(if op == CmpOp::In {
                contained
            } else {
                !contained
            }))
        }
        ordering_op => {
            let ordering = order_values(left, right)?;
            let result = match ordering_op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::LtEq => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::GtEq => ordering != Ordering::Less,
                _ => unreachable!("handled above"),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, RunError> {
    match haystack {
        Value::Str(text) => match needle {
            Value::Str(sub) => Ok(text.contains(sub.as_ref())),
            other => Err(RunError::type_error(format!(
                "'in <str>' requires string, got {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|item| item.eq_value(needle))),
        Value::Tuple(items) => Ok(items.iter().any(|item| item.eq_value(needle))),
        Value::Set(items) => Ok(items.borrow().iter().any(|item| item.eq_value(needle))),
        Value::Dict(map) => match needle {
            Value::Str(key) => Ok(map.borrow().contains_key(key.as_ref())),
            _ => Ok(false),
        },
        other => Err(RunError::type_error(format!(
            "{} does not support membership tests",
            other.type_name()
        ))),
    }
}

fn order_values(left: &Value, right: &Value) -> Result<Ordering, RunError> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| RunError::type_error("cannot order NaN"));
    }
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Ok(a.cmp(b));
    }
    Err(RunError::type_error(format!(
        "cannot order {} and {}",
        left.type_name(),
        right.type_name()
    )))
}

fn sort_values(items: &mut [Value]) -> Result<(), RunError> {
    let mut failure = None;
    items.sort_by(|a, b| match order_values(a, b) {
        Ok(ordering) => ordering,
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn str_method(text: &str, name: &str, args: &CallArgs) -> Result<Value, RunError> {
    match name {
        "lower" => Ok(Value::str(text.to_lowercase())),
        "upper" => Ok(Value::str(text.to_uppercase())),
        "strip" => Ok(Value::str(text.trim())),
        "lstrip" => Ok(Value::str(text.trim_start())),
        "rstrip" => Ok(Value::str(text.trim_end())),
        "split" => match args.positional(0) {
            None | Some(Value::None) => Ok(Value::list(
                text.split_whitespace().map(Value::str).collect(),
            )),
            Some(Value::Str(sep)) => {
                if sep.is_empty() {
                    return Err(RunError::exception("ValueError", "empty separator"));
                }
                Ok(Value::list(text.split(sep.as_ref()).map(Value::str).collect()))
            }
            Some(other) => Err(RunError::type_error(format!(
                "separator must be a string, got {}",
                other.type_name()
            ))),
        },
        "join" => {
            let Some(value) = args.positional(0) else {
                return Err(RunError::type_error("join takes an iterable"));
            };
            let items: Vec<Value> = match value {
                Value::List(items) => items.borrow().clone(),
                Value::Tuple(items) => items.as_ref().clone(),
                Value::Set(items) => items.borrow().clone(),
                _ => return Err(RunError::type_error("join takes an iterable of strings")),
            };
            let mut parts = Vec::new();
            for item in &items {
                match item {
                    Value::Str(part) => parts.push(part.to_string()),
                    other => {
                        return Err(RunError::type_error(format!(
                            "join requires strings, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(Value::str(parts.join(text)))
        }
        "startswith" => {
            let prefix = args.require_str(0, "prefix")?;
            Ok(Value::Bool(text.starts_with(&prefix)))
        }
        "endswith" => {
            let suffix = args.require_str(0, "suffix")?;
            Ok(Value::Bool(text.ends_with(&suffix)))
        }
        "find" => {
            let needle = args.require_str(0, "sub")?;
            let haystack: Vec<char> = text.chars().collect();
            let needle_chars: Vec<char> = needle.chars().collect();
            if needle_chars.is_empty() {
                return Ok(Value::Int(0));
            }
            if haystack.len() < needle_chars.len() {
                return Ok(Value::Int(-1));
            }
            for position in 0..=haystack.len() - needle_chars.len() {
                if haystack[position..position + needle_chars.len()] == needle_chars[..] {
                    return Ok(Value::Int(position as i64));
                }
            }
            Ok(Value::Int(-1))
        }
        "replace" => {
            let from = args.require_str(0, "old")?;
            let to = args.require_str(1, "new")?;
            if from.is_empty() {
                return Err(RunError::exception("ValueError", "empty pattern"));
            }
            Ok(Value::str(text.replace(&from, &to)))
        }
        "count" => {
            let needle = args.require_str(0, "sub")?;
            if needle.is_empty() {
                return Ok(Value::Int(text.chars().count() as i64 + 1));
            }
            Ok(Value::Int(text.matches(&needle).count() as i64))
        }
        other => Err(RunError::exception(
            "AttributeError",
            format!("str has no method '{other}'"),
        )),
    }
}

fn dict_method(
    map: &crate::value::DictRef,
    name: &str,
    args: &CallArgs,
) -> Result<Value, RunError> {
    match name {
        "get" => {
            let key = args.require_str(0, "key")?;
            Ok(map
                .borrow()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| args.positional(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => Ok(Value::list(map.borrow().keys().map(Value::str).collect())),
        "values" => Ok(Value::list(map.borrow().values().cloned().collect())),
        "items" => Ok(Value::list(
            map.borrow()
                .iter()
                .map(|(key, value)| Value::tuple(vec![Value::str(key), value.clone()]))
                .collect(),
        )),
        "setdefault" => {
            let key = args.require_str(0, "key")?;
            let default = args.positional(1).cloned().unwrap_or(Value::None);
            let mut map = map.borrow_mut();
            Ok(map.entry(key).or_insert(default).clone())
        }
        other => Err(RunError::exception(
            "AttributeError",
            format!("dict has no method '{other}'"),
        )),
    }
}
