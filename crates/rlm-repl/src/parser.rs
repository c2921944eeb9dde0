// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recursive-descent parser over the lexer's token stream.

use crate::ast::{
    BinOp, BoolOp, CmpOp, Expr, ExprKind, ForTarget, FStringPart, Program, Stmt, StmtKind, Target,
    UnaryOp,
};
use crate::lexer::lex;
use crate::token::{FStringPiece, Token, TokenKind};

/// A syntax error with its source position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at {line}:{col}")]
pub struct ParseError {
    /// What went wrong.
    pub message: String,
    /// 1-based source line.
    pub line: u32,
    /// 0-based source column.
    pub col: u32,
}

/// Parse a program from source.
///
/// # Errors
///
/// Returns a [`ParseError`] with the position of the first syntax error.
pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.bump())
        } else {
            Err(self.error_here(format!("expected {what}")))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let token = self.peek();
        ParseError {
            message: message.into(),
            line: token.line,
            col: token.col,
        }
    }

    fn program(&mut self) -> Result<Program, ParseError> {
        let mut body = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            body.extend(self.statement_line()?);
        }
        Ok(Program { body })
    }

    /// One logical line: a compound statement or `;`-separated simple
    /// statements terminated by a newline.
    fn statement_line(&mut self) -> Result<Vec<Stmt>, ParseError> {
        match self.peek_kind() {
            TokenKind::If => Ok(vec![self.if_stmt()?]),
            TokenKind::For => Ok(vec![self.for_stmt()?]),
            TokenKind::While => Ok(vec![self.while_stmt()?]),
            _ => self.simple_stmt_list(),
        }
    }

    fn simple_stmt_list(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.simple_stmt()?];
        while self.eat(&TokenKind::Semicolon) {
            if self.check(&TokenKind::Newline) || self.check(&TokenKind::Eof) {
                break;
            }
            stmts.push(self.simple_stmt()?);
        }
        if !self.eat(&TokenKind::Newline) && !self.check(&TokenKind::Eof) {
            return Err(self.error_here("expected end of line"));
        }
        Ok(stmts)
    }

    fn simple_stmt(&mut self) -> Result<Stmt, ParseError> {
        let token = self.peek().clone();
        let (line, col) = (token.line, token.col);
        match token.kind {
            TokenKind::Pass => {
                self.bump();
                Ok(Stmt { kind: StmtKind::Pass, line, col })
            }
            TokenKind::Break => {
                self.bump();
                Ok(Stmt { kind: StmtKind::Break, line, col })
            }
            TokenKind::Continue => {
                self.bump();
                Ok(Stmt { kind: StmtKind::Continue, line, col })
            }
            TokenKind::Import => {
                self.bump();
                let module = self.module_name()?;
                self.skip_to_line_end();
                Ok(Stmt { kind: StmtKind::Import { module }, line, col })
            }
            TokenKind::From => {
                self.bump();
                let module = self.module_name()?;
                self.skip_to_line_end();
                Ok(Stmt { kind: StmtKind::Import { module }, line, col })
            }
            TokenKind::Global => {
                self.bump();
                let names = self.name_list()?;
                Ok(Stmt { kind: StmtKind::Global { names }, line, col })
            }
            TokenKind::Nonlocal => {
                self.bump();
                let names = self.name_list()?;
                Ok(Stmt { kind: StmtKind::Nonlocal { names }, line, col })
            }
            _ => self.expr_or_assign(),
        }
    }

    fn module_name(&mut self) -> Result<String, ParseError> {
        let mut name = match self.peek_kind().clone() {
            TokenKind::Ident(ident) => {
                self.bump();
                ident
            }
            _ => return Err(self.error_here("expected module name")),
        };
        while self.eat(&TokenKind::Dot) {
            if let TokenKind::Ident(part) = self.peek_kind().clone() {
                self.bump();
                name.push('.');
                name.push_str(&part);
            } else {
                break;
            }
        }
        Ok(name)
    }

    /// Consume the remainder of an import statement (alias lists, names).
    fn skip_to_line_end(&mut self) {
        while !matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof
        ) {
            self.bump();
        }
    }

    fn name_list(&mut self) -> Result<Vec<String>, ParseError> {
        let mut names = Vec::new();
        loop {
            match self.peek_kind().clone() {
                TokenKind::Ident(ident) => {
                    self.bump();
                    names.push(ident);
                }
                _ => return Err(self.error_here("expected name")),
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(names)
    }

    fn expr_or_assign(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.expression()?;
        let (line, col) = (expr.line, expr.col);
        match self.peek_kind() {
            TokenKind::Assign => {
                self.bump();
                let value = self.expression()?;
                let target = self.to_target(expr)?;
                Ok(Stmt { kind: StmtKind::Assign { target, value }, line, col })
            }
            TokenKind::PlusAssign | TokenKind::MinusAssign => {
                let op = if self.check(&TokenKind::PlusAssign) {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                self.bump();
                let value = self.expression()?;
                let target = self.to_target(expr)?;
                Ok(Stmt { kind: StmtKind::AugAssign { target, op, value }, line, col })
            }
            _ => Ok(Stmt { kind: StmtKind::Expr(expr), line, col }),
        }
    }

    fn to_target(&self, expr: Expr) -> Result<Target, ParseError> {
        match expr.kind {
            ExprKind::Name(name) => Ok(Target::Name(name)),
            ExprKind::Index { object, index } => Ok(Target::Index {
                object: *object,
                index: *index,
            }),
            _ => Err(ParseError {
                message: "invalid assignment target".into(),
                line: expr.line,
                col: expr.col,
            }),
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, ParseError> {
        let token = self.expect(&TokenKind::If, "'if'")?;
        let mut branches = Vec::new();
        let test = self.expression()?;
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.block()?;
        branches.push((test, body));
        let mut orelse = Vec::new();
        loop {
            if self.check(&TokenKind::Elif) {
                self.bump();
                let test = self.expression()?;
                self.expect(&TokenKind::Colon, "':'")?;
                let body = self.block()?;
                branches.push((test, body));
            } else if self.check(&TokenKind::Else) {
                self.bump();
                self.expect(&TokenKind::Colon, "':'")?;
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            line: token.line,
            col: token.col,
        })
    }

    fn for_stmt(&mut self) -> Result<Stmt, ParseError> {
        let token = self.expect(&TokenKind::For, "'for'")?;
        let first = match self.peek_kind().clone() {
            TokenKind::Ident(ident) => {
                self.bump();
                ident
            }
            _ => return Err(self.error_here("expected loop variable")),
        };
        let target = if self.eat(&TokenKind::Comma) {
            match self.peek_kind().clone() {
                TokenKind::Ident(second) => {
                    self.bump();
                    ForTarget::Pair(first, second)
                }
                _ => return Err(self.error_here("expected second loop variable")),
            }
        } else {
            ForTarget::Name(first)
        };
        self.expect(&TokenKind::In, "'in'")?;
        let iter = self.expression()?;
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.block()?;
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            line: token.line,
            col: token.col,
        })
    }

    fn while_stmt(&mut self) -> Result<Stmt, ParseError> {
        let token = self.expect(&TokenKind::While, "'while'")?;
        let test = self.expression()?;
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.block()?;
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            line: token.line,
            col: token.col,
        })
    }

    /// A suite: inline simple statements, or an indented block.
    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.eat(&TokenKind::Newline) {
            self.expect(&TokenKind::Indent, "an indented block")?;
            let mut body = Vec::new();
            while !self.check(&TokenKind::Dedent) && !self.check(&TokenKind::Eof) {
                if self.eat(&TokenKind::Newline) {
                    continue;
                }
                body.extend(self.statement_line()?);
            }
            self.expect(&TokenKind::Dedent, "dedent")?;
            if body.is_empty() {
                return Err(self.error_here("empty block"));
            }
            Ok(body)
        } else {
            self.simple_stmt_list()
        }
    }

    // --- expressions ---

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.and_expr()?;
        if !self.check(&TokenKind::Or) {
            return Ok(first);
        }
        let (line, col) = (first.line, first.col);
        let mut values = vec![first];
        while self.eat(&TokenKind::Or) {
            values.push(self.and_expr()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolChain { op: BoolOp::Or, values },
            line,
            col,
        })
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.not_expr()?;
        if !self.check(&TokenKind::And) {
            return Ok(first);
        }
        let (line, col) = (first.line, first.col);
        let mut values = vec![first];
        while self.eat(&TokenKind::And) {
            values.push(self.not_expr()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolChain { op: BoolOp::And, values },
            line,
            col,
        })
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Not) {
            let token = self.bump();
            let operand = self.not_expr()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line: token.line,
                col: token.col,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.arith()?;
        let op = match self.peek_kind() {
            TokenKind::EqEq => Some(CmpOp::Eq),
            TokenKind::NotEq => Some(CmpOp::NotEq),
            TokenKind::Lt => Some(CmpOp::Lt),
            TokenKind::LtEq => Some(CmpOp::LtEq),
            TokenKind::Gt => Some(CmpOp::Gt),
            TokenKind::GtEq => Some(CmpOp::GtEq),
            TokenKind::In => Some(CmpOp::In),
            TokenKind::Not => Some(CmpOp::NotIn),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        if op == CmpOp::NotIn {
            // Only `not in` continues a comparison; bare `not` here is a
            // syntax error.
            self.bump();
            self.expect(&TokenKind::In, "'in' after 'not'")?;
        } else {
            self.bump();
        }
        let right = self.arith()?;
        let (line, col) = (left.line, left.col);
        Ok(Expr {
            kind: ExprKind::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            line,
            col,
        })
    }

    fn arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.term()?;
            let (line, col) = (left.line, left.col);
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
                col,
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::DoubleSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let right = self.unary()?;
            let (line, col) = (left.line, left.col);
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
                col,
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Minus) {
            let token = self.bump();
            let operand = self.unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                line: token.line,
                col: token.col,
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.atom()?;
        loop {
            let (line, col) = (expr.line, expr.col);
            match self.peek_kind() {
                TokenKind::LParen => {
                    self.bump();
                    let (args, kwargs) = self.arguments()?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            func: Box::new(expr),
                            args,
                            kwargs,
                        },
                        line,
                        col,
                    };
                }
                TokenKind::Dot => {
                    self.bump();
                    let attr = match self.peek_kind().clone() {
                        TokenKind::Ident(attr) => {
                            self.bump();
                            attr
                        }
                        _ => return Err(self.error_here("expected attribute name")),
                    };
                    expr = Expr {
                        kind: ExprKind::Attribute {
                            object: Box::new(expr),
                            attr,
                        },
                        line,
                        col,
                    };
                }
                TokenKind::LBracket => {
                    self.bump();
                    expr = self.subscript(expr)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Parse `expr]`, `start:end]`, `:end]`, `start:]`, `:]` after `[`.
    fn subscript(&mut self, object: Expr) -> Result<Expr, ParseError> {
        let (line, col) = (object.line, object.col);
        if self.eat(&TokenKind::Colon) {
            let end = if self.check(&TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.expression()?))
            };
            self.expect(&TokenKind::RBracket, "']'")?;
            return Ok(Expr {
                kind: ExprKind::Slice {
                    object: Box::new(object),
                    start: None,
                    end,
                },
                line,
                col,
            });
        }
        let first = self.expression()?;
        if self.eat(&TokenKind::Colon) {
            let end = if self.check(&TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.expression()?))
            };
            self.expect(&TokenKind::RBracket, "']'")?;
            return Ok(Expr {
                kind: ExprKind::Slice {
                    object: Box::new(object),
                    start: Some(Box::new(first)),
                    end,
                },
                line,
                col,
            });
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Expr {
            kind: ExprKind::Index {
                object: Box::new(object),
                index: Box::new(first),
            },
            line,
            col,
        })
    }

    fn arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok((args, kwargs));
        }
        loop {
            // A keyword argument is `ident = expr`; look ahead one token.
            let is_kwarg = matches!(self.peek_kind(), TokenKind::Ident(_))
                && matches!(
                    self.tokens.get(self.pos + 1).map(|t| &t.kind),
                    Some(TokenKind::Assign)
                );
            if is_kwarg {
                let TokenKind::Ident(name) = self.bump().kind else {
                    unreachable!("checked above");
                };
                self.bump(); // '='
                let value = self.expression()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error_here("positional argument after keyword argument"));
                }
                args.push(self.expression()?);
            }
            if self.eat(&TokenKind::Comma) {
                if self.eat(&TokenKind::RParen) {
                    break;
                }
                continue;
            }
            self.expect(&TokenKind::RParen, "')'")?;
            break;
        }
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();
        let (line, col) = (token.line, token.col);
        let kind = match token.kind {
            TokenKind::None => {
                self.bump();
                ExprKind::NoneLit
            }
            TokenKind::True => {
                self.bump();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.bump();
                ExprKind::Bool(false)
            }
            TokenKind::Int(value) => {
                self.bump();
                ExprKind::Int(value)
            }
            TokenKind::Float(value) => {
                self.bump();
                ExprKind::Float(value)
            }
            TokenKind::Str(text) => {
                self.bump();
                ExprKind::Str(text)
            }
            TokenKind::FString(pieces) => {
                self.bump();
                ExprKind::FString(self.fstring_parts(pieces, line, col)?)
            }
            TokenKind::Ident(name) => {
                self.bump();
                ExprKind::Name(name)
            }
            TokenKind::LParen => {
                self.bump();
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                self.bump();
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.eat(&TokenKind::Comma) {
                            if self.eat(&TokenKind::RBracket) {
                                break;
                            }
                            continue;
                        }
                        self.expect(&TokenKind::RBracket, "']'")?;
                        break;
                    }
                }
                ExprKind::List(items)
            }
            TokenKind::LBrace => {
                self.bump();
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBrace) {
                    loop {
                        let key = self.expression()?;
                        self.expect(&TokenKind::Colon, "':'")?;
                        let value = self.expression()?;
                        items.push((key, value));
                        if self.eat(&TokenKind::Comma) {
                            if self.eat(&TokenKind::RBrace) {
                                break;
                            }
                            continue;
                        }
                        self.expect(&TokenKind::RBrace, "'}'")?;
                        break;
                    }
                }
                ExprKind::Dict(items)
            }
            _ => return Err(self.error_here("expected an expression")),
        };
        Ok(Expr { kind, line, col })
    }

    /// Sub-parse the expression pieces of an f-string.
    fn fstring_parts(
        &self,
        pieces: Vec<FStringPiece>,
        line: u32,
        col: u32,
    ) -> Result<Vec<FStringPart>, ParseError> {
        pieces
            .into_iter()
            .map(|piece| match piece {
                FStringPiece::Literal(text) => Ok(FStringPart::Literal(text)),
                FStringPiece::Expr(source) => {
                    let expr = parse_embedded_expression(&source).map_err(|err| ParseError {
                        message: format!("in f-string expression: {}", err.message),
                        line,
                        col,
                    })?;
                    Ok(FStringPart::Expr(Box::new(expr)))
                }
            })
            .collect()
    }
}

/// Parse a standalone expression (f-string interpolations).
fn parse_embedded_expression(source: &str) -> Result<Expr, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    if !matches!(parser.peek_kind(), TokenKind::Newline | TokenKind::Eof) {
        return Err(parser.error_here("unexpected trailing tokens"));
    }
    Ok(expr)
}
