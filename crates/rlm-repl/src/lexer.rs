// SPDX-License-Identifier: MIT OR Apache-2.0
//! Indentation-sensitive lexer.
//!
//! Logical lines produce `Newline`; block structure produces paired
//! `Indent`/`Dedent` tokens driven by an indentation stack. Newlines inside
//! brackets are implicit line joins. Tabs advance to the next multiple of 8.

use crate::parser::ParseError;
use crate::token::{FStringPiece, Token, TokenKind};

const TAB_STOP: u32 = 8;

pub(crate) struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    bracket_depth: u32,
    indents: Vec<u32>,
    tokens: Vec<Token>,
    line_has_tokens: bool,
    at_line_start: bool,
}

/// Lex source into a token stream ending with `Eof`.
pub(crate) fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        col: 0,
        bracket_depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
        line_has_tokens: false,
        at_line_start: true,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn push(&mut self, kind: TokenKind, line: u32, col: u32) {
        self.tokens.push(Token { kind, line, col });
        self.line_has_tokens = true;
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.line,
            col: self.col,
        }
    }

    fn run(&mut self) -> Result<(), ParseError> {
        loop {
            if self.bracket_depth == 0 && self.at_line_start {
                if !self.handle_line_start()? {
                    break;
                }
                self.at_line_start = false;
            }
            let Some(ch) = self.peek() else {
                break;
            };
            match ch {
                '\n' => {
                    self.bump();
                    if self.bracket_depth == 0 {
                        if self.line_has_tokens {
                            self.tokens.push(Token {
                                kind: TokenKind::Newline,
                                line: self.line - 1,
                                col: self.col,
                            });
                            self.line_has_tokens = false;
                        }
                        self.at_line_start = true;
                    }
                }
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => self.lex_token()?,
            }
        }
        // Close the final logical line and any open blocks.
        if self.line_has_tokens {
            self.tokens.push(Token {
                kind: TokenKind::Newline,
                line: self.line,
                col: self.col,
            });
            self.line_has_tokens = false;
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.tokens.push(Token {
                kind: TokenKind::Dedent,
                line: self.line,
                col: 0,
            });
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            line: self.line,
            col: self.col,
        });
        Ok(())
    }

    /// Measure indentation at the start of a logical line; emit
    /// Indent/Dedent tokens. Returns `false` at end of input.
    fn handle_line_start(&mut self) -> Result<bool, ParseError> {
        loop {
            let mut width = 0u32;
            loop {
                match self.peek() {
                    Some(' ') => {
                        width += 1;
                        self.bump();
                    }
                    Some('\t') => {
                        width = (width / TAB_STOP + 1) * TAB_STOP;
                        self.bump();
                    }
                    _ => break,
                }
            }
            match self.peek() {
                None => return Ok(false),
                // Blank or comment-only lines carry no block structure.
                Some('\n') => {
                    self.bump();
                    continue;
                }
                Some('\r') => {
                    self.bump();
                    continue;
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                Some(_) => {
                    let current = *self.indents.last().expect("indent stack never empty");
                    if width > current {
                        self.indents.push(width);
                        self.tokens.push(Token {
                            kind: TokenKind::Indent,
                            line: self.line,
                            col: 0,
                        });
                    } else if width < current {
                        while width < *self.indents.last().expect("indent stack never empty") {
                            self.indents.pop();
                            self.tokens.push(Token {
                                kind: TokenKind::Dedent,
                                line: self.line,
                                col: 0,
                            });
                        }
                        if width != *self.indents.last().expect("indent stack never empty") {
                            return Err(self.error("unindent does not match any outer level"));
                        }
                    }
                    return Ok(true);
                }
            }
        }
    }

    fn lex_token(&mut self) -> Result<(), ParseError> {
        let line = self.line;
        let col = self.col;
        let ch = self.peek().expect("caller checked");

        if ch == 'f' && matches!(self.peek_at(1), Some('"') | Some('\'')) {
            self.bump();
            let quote = self.bump().expect("peeked");
            let pieces = self.lex_fstring(quote)?;
            self.push(TokenKind::FString(pieces), line, col);
            return Ok(());
        }
        if ch.is_ascii_alphabetic() || ch == '_' {
            let mut ident = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    ident.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            let kind = TokenKind::keyword(&ident).unwrap_or(TokenKind::Ident(ident));
            self.push(kind, line, col);
            return Ok(());
        }
        if ch.is_ascii_digit() {
            return self.lex_number(line, col);
        }
        if ch == '"' || ch == '\'' {
            self.bump();
            let text = self.lex_string_body(ch)?;
            self.push(TokenKind::Str(text), line, col);
            return Ok(());
        }

        self.bump();
        let next = self.peek();
        let kind = match (ch, next) {
            ('=', Some('=')) => {
                self.bump();
                TokenKind::EqEq
            }
            ('=', _) => TokenKind::Assign,
            ('!', Some('=')) => {
                self.bump();
                TokenKind::NotEq
            }
            ('<', Some('=')) => {
                self.bump();
                TokenKind::LtEq
            }
            ('<', _) => TokenKind::Lt,
            ('>', Some('=')) => {
                self.bump();
                TokenKind::GtEq
            }
            ('>', _) => TokenKind::Gt,
            ('+', Some('=')) => {
                self.bump();
                TokenKind::PlusAssign
            }
            ('+', _) => TokenKind::Plus,
            ('-', Some('=')) => {
                self.bump();
                TokenKind::MinusAssign
            }
            ('-', _) => TokenKind::Minus,
            ('*', _) => TokenKind::Star,
            ('/', Some('/')) => {
                self.bump();
                TokenKind::DoubleSlash
            }
            ('/', _) => TokenKind::Slash,
            ('%', _) => TokenKind::Percent,
            ('(', _) => {
                self.bracket_depth += 1;
                TokenKind::LParen
            }
            (')', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RParen
            }
            ('[', _) => {
                self.bracket_depth += 1;
                TokenKind::LBracket
            }
            (']', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBracket
            }
            ('{', _) => {
                self.bracket_depth += 1;
                TokenKind::LBrace
            }
            ('}', _) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            (',', _) => TokenKind::Comma,
            (':', _) => TokenKind::Colon,
            (';', _) => TokenKind::Semicolon,
            ('.', _) => TokenKind::Dot,
            (other, _) => {
                return Err(ParseError {
                    message: format!("unexpected character {other:?}"),
                    line,
                    col,
                });
            }
        };
        self.push(kind, line, col);
        Ok(())
    }

    fn lex_number(&mut self, line: u32, col: u32) -> Result<(), ParseError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mut lookahead = 1;
            if matches!(self.peek_at(1), Some('+') | Some('-')) {
                lookahead = 2;
            }
            if self.peek_at(lookahead).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                for _ in 0..lookahead {
                    text.push(self.bump().expect("peeked"));
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        let kind = if is_float {
            let value: f64 = text.parse().map_err(|_| ParseError {
                message: format!("invalid float literal {text}"),
                line,
                col,
            })?;
            TokenKind::Float(value)
        } else {
            let value: i64 = text.parse().map_err(|_| ParseError {
                message: format!("integer literal out of range: {text}"),
                line,
                col,
            })?;
            TokenKind::Int(value)
        };
        self.push(kind, line, col);
        Ok(())
    }

    /// Body of a quoted string after the opening quote, escapes resolved.
    fn lex_string_body(&mut self, quote: char) -> Result<String, ParseError> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(self.error("unterminated string literal"));
                }
                Some('\\') => match self.bump() {
                    None => return Err(self.error("unterminated string literal")),
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some(other) => text.push(other),
                },
                Some(c) if c == quote => return Ok(text),
                Some(c) => text.push(c),
            }
        }
    }

    /// Pieces of an f-string after the opening quote. `{{`/`}}` escape to
    /// literal braces; `{expr}` captures the raw expression source.
    fn lex_fstring(&mut self, quote: char) -> Result<Vec<FStringPiece>, ParseError> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(self.error("unterminated f-string literal"));
                }
                Some('\\') => match self.bump() {
                    None => return Err(self.error("unterminated f-string literal")),
                    Some('n') => literal.push('\n'),
                    Some('t') => literal.push('\t'),
                    Some('r') => literal.push('\r'),
                    Some(other) => literal.push(other),
                },
                Some('{') if self.peek() == Some('{') => {
                    self.bump();
                    literal.push('{');
                }
                Some('}') if self.peek() == Some('}') => {
                    self.bump();
                    literal.push('}');
                }
                Some('{') => {
                    if !literal.is_empty() {
                        pieces.push(FStringPiece::Literal(std::mem::take(&mut literal)));
                    }
                    let mut expr = String::new();
                    let mut depth = 0u32;
                    loop {
                        match self.bump() {
                            None | Some('\n') => {
                                return Err(self.error("unterminated f-string expression"));
                            }
                            Some('}') if depth == 0 => break,
                            Some(c) => {
                                match c {
                                    '(' | '[' | '{' => depth += 1,
                                    ')' | ']' | '}' => depth = depth.saturating_sub(1),
                                    _ => {}
                                }
                                expr.push(c);
                            }
                        }
                    }
                    if expr.trim().is_empty() {
                        return Err(self.error("empty f-string expression"));
                    }
                    pieces.push(FStringPiece::Expr(expr));
                }
                Some('}') => {
                    return Err(self.error("single '}' in f-string"));
                }
                Some(c) if c == quote => {
                    if !literal.is_empty() {
                        pieces.push(FStringPiece::Literal(literal));
                    }
                    return Ok(pieces);
                }
                Some(c) => literal.push(c),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenKind::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn simple_line() {
        assert_eq!(
            kinds("a = 1\n"),
            vec![Ident("a".into()), Assign, Int(1), Newline, Eof]
        );
    }

    #[test]
    fn indentation_produces_block_tokens() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert_eq!(
            toks,
            vec![
                If,
                Ident("x".into()),
                Colon,
                Newline,
                Indent,
                Ident("y".into()),
                Assign,
                Int(1),
                Newline,
                Dedent,
                Ident("z".into()),
                Assign,
                Int(2),
                Newline,
                Eof
            ]
        );
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let toks = kinds("a = 1\n\n# comment\n  # indented comment\nb = 2\n");
        assert_eq!(
            toks,
            vec![
                Ident("a".into()),
                Assign,
                Int(1),
                Newline,
                Ident("b".into()),
                Assign,
                Int(2),
                Newline,
                Eof
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_joined() {
        let toks = kinds("xs = [\n    1,\n    2,\n]\n");
        assert_eq!(
            toks,
            vec![
                Ident("xs".into()),
                Assign,
                LBracket,
                Int(1),
                Comma,
                Int(2),
                Comma,
                RBracket,
                Newline,
                Eof
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(
            kinds(r#"s = "a\nb""#),
            vec![Ident("s".into()), Assign, Str("a\nb".into()), Newline, Eof]
        );
        assert_eq!(kinds("s = 'x'"), vec![Ident("s".into()), Assign, Str("x".into()), Newline, Eof]);
    }

    #[test]
    fn fstring_pieces() {
        use crate::token::FStringPiece;
        let toks = lex("f\"got {n} hits\"").unwrap();
        match &toks[0].kind {
            FString(pieces) => assert_eq!(
                pieces,
                &vec![
                    FStringPiece::Literal("got ".into()),
                    FStringPiece::Expr("n".into()),
                    FStringPiece::Literal(" hits".into()),
                ]
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("1 2.5 3e2"), vec![Int(1), Float(2.5), Float(300.0), Newline, Eof]);
    }

    #[test]
    fn missing_final_newline_is_tolerated() {
        assert_eq!(kinds("a = 1"), vec![Ident("a".into()), Assign, Int(1), Newline, Eof]);
    }

    #[test]
    fn bad_dedent_is_an_error() {
        let err = lex("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(lex("s = \"abc\n").is_err());
    }
}
