// SPDX-License-Identifier: MIT OR Apache-2.0
//! Syntactic policy validation.
//!
//! Runs over the parsed AST before execution and collects every violation,
//! so a rejected program reports all of its problems at once.

use rlm_repl::{Expr, ExprKind, FStringPart, Program, Stmt, StmtKind, Target};
use serde::Serialize;

/// Names that may never be referenced.
pub const BANNED_NAMES: &[&str] = &[
    "eval", "exec", "compile", "open", "input", "__import__", "globals", "locals", "vars", "dir",
    "help",
];

/// System-library names that may never be referenced.
pub const BANNED_MODULE_NAMES: &[&str] = &[
    "os", "sys", "subprocess", "socket", "pathlib", "shutil", "urllib", "requests", "http",
];

/// One policy violation with its source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyViolation {
    /// Rule identifier (`import`, `banned_name`, ...).
    pub rule: &'static str,
    /// Human-readable description.
    pub message: String,
    /// 1-based source line.
    pub line: u32,
    /// 0-based source column.
    pub col: u32,
}

/// Collect every violation in a program.
#[must_use]
pub fn collect_violations(program: &Program) -> Vec<PolicyViolation> {
    let mut violations = Vec::new();
    for stmt in &program.body {
        walk_stmt(stmt, &mut violations);
    }
    violations
}

/// Validate a program, returning all violations on failure.
///
/// # Errors
///
/// The violation list, never empty.
pub fn validate_program(program: &Program) -> Result<(), Vec<PolicyViolation>> {
    let violations = collect_violations(program);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn walk_stmt(stmt: &Stmt, violations: &mut Vec<PolicyViolation>) {
    match &stmt.kind {
        StmtKind::Import { module } => violations.push(PolicyViolation {
            rule: "import",
            message: format!("import statements are not allowed: {module}"),
            line: stmt.line,
            col: stmt.col,
        }),
        StmtKind::Global { names } => violations.push(PolicyViolation {
            rule: "global",
            message: format!("global declarations are not allowed: {}", names.join(", ")),
            line: stmt.line,
            col: stmt.col,
        }),
        StmtKind::Nonlocal { names } => violations.push(PolicyViolation {
            rule: "nonlocal",
            message: format!("nonlocal declarations are not allowed: {}", names.join(", ")),
            line: stmt.line,
            col: stmt.col,
        }),
        StmtKind::Expr(expr) => walk_expr(expr, violations),
        StmtKind::Assign { target, value } => {
            walk_target(target, violations);
            walk_expr(value, violations);
        }
        StmtKind::AugAssign { target, value, .. } => {
            walk_target(target, violations);
            walk_expr(value, violations);
        }
        StmtKind::If { branches, orelse } => {
            for (test, body) in branches {
                walk_expr(test, violations);
                for inner in body {
                    walk_stmt(inner, violations);
                }
            }
            for inner in orelse {
                walk_stmt(inner, violations);
            }
        }
        StmtKind::For { iter, body, .. } => {
            walk_expr(iter, violations);
            for inner in body {
                walk_stmt(inner, violations);
            }
        }
        StmtKind::While { test, body } => {
            walk_expr(test, violations);
            for inner in body {
                walk_stmt(inner, violations);
            }
        }
        StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
    }
}

fn walk_target(target: &Target, violations: &mut Vec<PolicyViolation>) {
    match target {
        Target::Name(name) => check_name(name, 0, 0, violations),
        Target::Index { object, index } => {
            walk_expr(object, violations);
            walk_expr(index, violations);
        }
    }
}

fn walk_expr(expr: &Expr, violations: &mut Vec<PolicyViolation>) {
    match &expr.kind {
        ExprKind::Name(name) => check_name(name, expr.line, expr.col, violations),
        ExprKind::Attribute { object, attr } => {
            if attr.contains("__") {
                violations.push(PolicyViolation {
                    rule: "dunder_attribute",
                    message: format!("dunder attribute access is not allowed: {attr}"),
                    line: expr.line,
                    col: expr.col,
                });
            }
            walk_expr(object, violations);
        }
        ExprKind::FString(parts) => {
            for part in parts {
                if let FStringPart::Expr(inner) = part {
                    walk_expr(inner, violations);
                }
            }
        }
        ExprKind::List(items) => {
            for item in items {
                walk_expr(item, violations);
            }
        }
        ExprKind::Dict(items) => {
            for (key, value) in items {
                walk_expr(key, violations);
                walk_expr(value, violations);
            }
        }
        ExprKind::Unary { operand, .. } => walk_expr(operand, violations),
        ExprKind::Binary { left, right, .. } => {
            walk_expr(left, violations);
            walk_expr(right, violations);
        }
        ExprKind::BoolChain { values, .. } => {
            for value in values {
                walk_expr(value, violations);
            }
        }
        ExprKind::Compare { left, right, .. } => {
            walk_expr(left, violations);
            walk_expr(right, violations);
        }
        ExprKind::Call { func, args, kwargs } => {
            walk_expr(func, violations);
            for arg in args {
                walk_expr(arg, violations);
            }
            for (_, value) in kwargs {
                walk_expr(value, violations);
            }
        }
        ExprKind::Index { object, index } => {
            walk_expr(object, violations);
            walk_expr(index, violations);
        }
        ExprKind::Slice { object, start, end } => {
            walk_expr(object, violations);
            if let Some(start) = start {
                walk_expr(start, violations);
            }
            if let Some(end) = end {
                walk_expr(end, violations);
            }
        }
        ExprKind::NoneLit
        | ExprKind::Bool(_)
        | ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_) => {}
    }
}

fn check_name(name: &str, line: u32, col: u32, violations: &mut Vec<PolicyViolation>) {
    if BANNED_NAMES.contains(&name) {
        violations.push(PolicyViolation {
            rule: "banned_name",
            message: format!("banned name is not allowed: {name}"),
            line,
            col,
        });
    } else if BANNED_MODULE_NAMES.contains(&name) {
        violations.push(PolicyViolation {
            rule: "banned_module",
            message: format!("banned module name is not allowed: {name}"),
            line,
            col,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_repl::parse_program;

    fn violations_for(source: &str) -> Vec<PolicyViolation> {
        collect_violations(&parse_program(source).unwrap())
    }

    #[test]
    fn clean_program_passes() {
        let program = parse_program("x = 1\nif x:\n    print(x)\n").unwrap();
        assert!(validate_program(&program).is_ok());
    }

    #[test]
    fn import_is_rejected_with_position() {
        let violations = violations_for("import os\n");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "import");
        assert_eq!(violations[0].line, 1);
    }

    #[test]
    fn from_import_is_rejected() {
        let violations = violations_for("from sys import path\n");
        assert_eq!(violations[0].rule, "import");
    }

    #[test]
    fn global_and_nonlocal_are_rejected() {
        let violations = violations_for("global a\nnonlocal b\n");
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].rule, "global");
        assert_eq!(violations[1].rule, "nonlocal");
    }

    #[test]
    fn banned_names_are_rejected_everywhere() {
        let violations = violations_for("x = eval\n");
        assert_eq!(violations[0].rule, "banned_name");
        let violations = violations_for("print(compile)\n");
        assert_eq!(violations[0].rule, "banned_name");
        let violations = violations_for("xs = [open]\n");
        assert_eq!(violations[0].rule, "banned_name");
    }

    #[test]
    fn banned_module_names_are_rejected() {
        let violations = violations_for("x = os\n");
        assert_eq!(violations[0].rule, "banned_module");
    }

    #[test]
    fn dunder_attribute_is_rejected() {
        let violations = violations_for("x = tool.__class__\n");
        assert_eq!(violations[0].rule, "dunder_attribute");
    }

    #[test]
    fn multiple_violations_are_all_reported() {
        let violations = violations_for("import os\nx = eval\n");
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn violations_reach_into_nested_blocks() {
        let violations = violations_for("if True:\n    for i in range(2):\n        x = exec\n");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "banned_name");
        assert_eq!(violations[0].line, 3);
    }

    #[test]
    fn fstring_expressions_are_walked() {
        let violations = violations_for("s = f\"{eval}\"\n");
        assert_eq!(violations[0].rule, "banned_name");
    }
}
