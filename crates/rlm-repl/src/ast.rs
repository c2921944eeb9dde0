// SPDX-License-Identifier: MIT OR Apache-2.0
//! Abstract syntax tree with source positions.
//!
//! Positions are carried on every statement and expression so the policy
//! validator can report structured `{rule, message, line, col}` violations.

/// A parsed program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Top-level statements.
    pub body: Vec<Stmt>,
}

/// A statement with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// Statement payload.
    pub kind: StmtKind,
    /// 1-based source line.
    pub line: u32,
    /// 0-based source column.
    pub col: u32,
}

/// Statement kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Bare expression evaluated for effect.
    Expr(Expr),
    /// `target = value`
    Assign {
        /// Assignment target.
        target: Target,
        /// Right-hand side.
        value: Expr,
    },
    /// `target += value` / `target -= value`
    AugAssign {
        /// Assignment target.
        target: Target,
        /// `+` or `-`.
        op: BinOp,
        /// Right-hand side.
        value: Expr,
    },
    /// `if`/`elif`/`else` chain.
    If {
        /// `(condition, body)` per `if`/`elif` arm, in order.
        branches: Vec<(Expr, Vec<Stmt>)>,
        /// `else` body, possibly empty.
        orelse: Vec<Stmt>,
    },
    /// `for target in iter:` loop.
    For {
        /// Loop target.
        target: ForTarget,
        /// Iterated expression.
        iter: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `while test:` loop.
    While {
        /// Loop condition.
        test: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `pass`
    Pass,
    /// `import x` / `from x import y` — parsed only so the policy validator
    /// can reject it with a position.
    Import {
        /// Module named by the statement.
        module: String,
    },
    /// `global a, b` — parsed only for policy rejection.
    Global {
        /// Declared names.
        names: Vec<String>,
    },
    /// `nonlocal a, b` — parsed only for policy rejection.
    Nonlocal {
        /// Declared names.
        names: Vec<String>,
    },
}

/// Assignment target.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A plain name.
    Name(String),
    /// `object[index] = ...`
    Index {
        /// Indexed object.
        object: Expr,
        /// Index expression.
        index: Expr,
    },
}

/// `for` loop target: a single name or a 2-tuple unpack.
#[derive(Debug, Clone, PartialEq)]
pub enum ForTarget {
    /// `for x in ...`
    Name(String),
    /// `for k, v in ...`
    Pair(String, String),
}

/// An expression with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// Expression payload.
    pub kind: ExprKind,
    /// 1-based source line.
    pub line: u32,
    /// 0-based source column.
    pub col: u32,
}

/// One piece of an f-string after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum FStringPart {
    /// Literal text.
    Literal(String),
    /// Interpolated expression.
    Expr(Box<Expr>),
}

/// Expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// `None`
    NoneLit,
    /// `True` / `False`
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
    /// f-string with interpolations.
    FString(Vec<FStringPart>),
    /// Name reference.
    Name(String),
    /// List display.
    List(Vec<Expr>),
    /// Dict display.
    Dict(Vec<(Expr, Expr)>),
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Binary arithmetic operation.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Short-circuit `and`/`or` chain.
    BoolChain {
        /// Operator.
        op: BoolOp,
        /// Operands in order.
        values: Vec<Expr>,
    },
    /// A single comparison.
    Compare {
        /// Operator.
        op: CmpOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Call with positional and keyword arguments.
    Call {
        /// Called expression.
        func: Box<Expr>,
        /// Positional arguments.
        args: Vec<Expr>,
        /// Keyword arguments in source order.
        kwargs: Vec<(String, Expr)>,
    },
    /// Attribute access `object.attr`.
    Attribute {
        /// Receiver.
        object: Box<Expr>,
        /// Attribute name.
        attr: String,
    },
    /// Indexing `object[index]`.
    Index {
        /// Indexed object.
        object: Box<Expr>,
        /// Index expression.
        index: Box<Expr>,
    },
    /// Slicing `object[start:end]` (step is always 1).
    Slice {
        /// Sliced object.
        object: Box<Expr>,
        /// Start bound.
        start: Option<Box<Expr>>,
        /// End bound.
        end: Option<Box<Expr>>,
    },
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Numeric negation.
    Neg,
    /// Logical `not`.
    Not,
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/` (always float division)
    Div,
    /// `//` (floor division)
    FloorDiv,
    /// `%` (sign follows the divisor, as in the source language)
    Mod,
}

/// Short-circuit boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    /// `and`
    And,
    /// `or`
    Or,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `in`
    In,
    /// `not in`
    NotIn,
}
