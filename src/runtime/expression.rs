// src/runtime/expression.rs
//! Compiled expression language
//!
//! The external compiler turns raw job source into a module-shaped pipeline
//! the sandbox can run directly: one operation invocation per statement.
//! This module parses that pipeline into an AST. Every token carries a
//! 1-based line/column so runtime faults can point back into the source.
//!
//! Grammar:
//!
//! ```text
//! pipeline   := statement*
//! statement  := expr (newline | ';')
//! expr       := IDENT '=' expr
//!             | IDENT '=>' expr
//!             | '(' params ')' '=>' expr
//!             | postfix
//! postfix    := primary ( '.' IDENT | '(' args ')' )*
//! primary    := literal | IDENT | '(' expr ')'
//! ```
//!
//! Newlines inside parentheses do not terminate statements. `//` comments
//! run to end of line.

use crate::model::error::{ErrorPosition, RunFault};

/// 1-based source position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    /// Attach the offending source line for error reporting
    pub fn to_error_position(self, source: &str) -> ErrorPosition {
        let src = source
            .lines()
            .nth(self.line as usize - 1)
            .map(|l| l.to_string());
        ErrorPosition {
            line: self.line,
            column: self.column,
            src,
        }
    }
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Ident(String),
    /// `object.property`
    Member {
        object: Box<Expr>,
        property: String,
        property_pos: Position,
    },
    /// `callee(args...)`; the node position is the callee's position
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `(params) => body`
    Arrow {
        params: Vec<String>,
        body: Box<Expr>,
    },
    /// `name = value`, run-scope assignment
    Assign {
        name: String,
        value: Box<Expr>,
    },
}

/// A parsed compiled expression: an ordered pipeline of operation
/// invocations
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub statements: Vec<Expr>,
}

/// Parse a compiled expression into a pipeline
///
/// Parse failures are always fatal to the run (`CompileError`, severity
/// `crash`) and carry the position of the offending token.
pub fn parse(source: &str) -> Result<Pipeline, RunFault> {
    let tokens = lex(source).map_err(|(message, pos)| {
        RunFault::compile_error(message, pos.to_error_position(source))
    })?;

    Parser { tokens, idx: 0 }
        .parse_pipeline()
        .map_err(|(message, pos)| {
            RunFault::compile_error(message, pos.to_error_position(source))
        })
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokKind {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    Dot,
    Comma,
    Assign,
    Arrow,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokKind,
    pos: Position,
}

type LexError = (String, Position);

fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut line: u32 = 1;
    let mut column: u32 = 1;
    let mut paren_depth: usize = 0;

    macro_rules! pos {
        () => {
            Position { line, column }
        };
    }

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                // Newlines only separate statements at the top level
                if paren_depth == 0 {
                    tokens.push(Token { kind: TokKind::Newline, pos: pos!() });
                }
                i += 1;
                line += 1;
                column = 1;
            }
            ' ' | '\t' | '\r' => {
                i += 1;
                column += 1;
            }
            ';' => {
                tokens.push(Token { kind: TokKind::Newline, pos: pos!() });
                i += 1;
                column += 1;
            }
            '/' if i + 1 < chars.len() && chars[i + 1] == '/' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                    column += 1;
                }
            }
            '(' => {
                tokens.push(Token { kind: TokKind::LParen, pos: pos!() });
                paren_depth += 1;
                i += 1;
                column += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokKind::RParen, pos: pos!() });
                paren_depth = paren_depth.saturating_sub(1);
                i += 1;
                column += 1;
            }
            '.' => {
                tokens.push(Token { kind: TokKind::Dot, pos: pos!() });
                i += 1;
                column += 1;
            }
            ',' => {
                tokens.push(Token { kind: TokKind::Comma, pos: pos!() });
                i += 1;
                column += 1;
            }
            '=' => {
                if i + 1 < chars.len() && chars[i + 1] == '>' {
                    tokens.push(Token { kind: TokKind::Arrow, pos: pos!() });
                    i += 2;
                    column += 2;
                } else {
                    tokens.push(Token { kind: TokKind::Assign, pos: pos!() });
                    i += 1;
                    column += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = pos!();
                i += 1;
                column += 1;
                let mut value = String::new();
                loop {
                    if i >= chars.len() || chars[i] == '\n' {
                        return Err(("unterminated string literal".to_string(), start));
                    }
                    let ch = chars[i];
                    if ch == quote {
                        i += 1;
                        column += 1;
                        break;
                    }
                    if ch == '\\' && i + 1 < chars.len() {
                        let esc = chars[i + 1];
                        value.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                        column += 2;
                    } else {
                        value.push(ch);
                        i += 1;
                        column += 1;
                    }
                }
                tokens.push(Token { kind: TokKind::Str(value), pos: start });
            }
            c if c.is_ascii_digit() => {
                let start = pos!();
                let mut text = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    text.push(chars[i]);
                    i += 1;
                    column += 1;
                }
                let value: f64 = text
                    .parse()
                    .map_err(|_| (format!("invalid number literal '{}'", text), start))?;
                tokens.push(Token { kind: TokKind::Number(value), pos: start });
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = pos!();
                let mut text = String::new();
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    text.push(chars[i]);
                    i += 1;
                    column += 1;
                }
                let kind = match text.as_str() {
                    "true" => TokKind::True,
                    "false" => TokKind::False,
                    "null" => TokKind::Null,
                    _ => TokKind::Ident(text),
                };
                tokens.push(Token { kind, pos: start });
            }
            other => {
                return Err((format!("unexpected character '{}'", other), pos!()));
            }
        }
    }

    tokens.push(Token { kind: TokKind::Eof, pos: pos!() });
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

type ParseError = (String, Position);

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn cur(&self) -> &Token {
        &self.tokens[self.idx]
    }

    fn peek(&self, offset: usize) -> &Token {
        let idx = (self.idx + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.idx].clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        tok
    }

    fn expect(&mut self, kind: &TokKind, what: &str) -> Result<Token, ParseError> {
        if std::mem::discriminant(&self.cur().kind) == std::mem::discriminant(kind) {
            Ok(self.advance())
        } else {
            Err((format!("expected {}", what), self.cur().pos))
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.cur().kind, TokKind::Newline) {
            self.advance();
        }
    }

    fn parse_pipeline(&mut self) -> Result<Pipeline, ParseError> {
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            if matches!(self.cur().kind, TokKind::Eof) {
                break;
            }
            statements.push(self.parse_expr()?);
            match self.cur().kind {
                TokKind::Newline => {
                    self.advance();
                }
                TokKind::Eof => break,
                _ => {
                    return Err(("expected end of statement".to_string(), self.cur().pos));
                }
            }
        }
        Ok(Pipeline { statements })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        // Assignment: IDENT '=' expr
        if let TokKind::Ident(name) = &self.cur().kind {
            if matches!(self.peek(1).kind, TokKind::Assign) {
                let name = name.clone();
                let pos = self.cur().pos;
                self.advance(); // ident
                self.advance(); // '='
                let value = self.parse_expr()?;
                return Ok(Expr {
                    kind: ExprKind::Assign { name, value: Box::new(value) },
                    pos,
                });
            }
            // Single-parameter arrow: IDENT '=>' expr
            if matches!(self.peek(1).kind, TokKind::Arrow) {
                let param = name.clone();
                let pos = self.cur().pos;
                self.advance(); // ident
                self.advance(); // '=>'
                let body = self.parse_expr()?;
                return Ok(Expr {
                    kind: ExprKind::Arrow { params: vec![param], body: Box::new(body) },
                    pos,
                });
            }
        }

        // Parenthesized arrow: '(' params ')' '=>' expr
        if matches!(self.cur().kind, TokKind::LParen) && self.arrow_ahead() {
            let pos = self.cur().pos;
            self.advance(); // '('
            let mut params = Vec::new();
            while let TokKind::Ident(name) = &self.cur().kind {
                params.push(name.clone());
                self.advance();
                if matches!(self.cur().kind, TokKind::Comma) {
                    self.advance();
                }
            }
            self.expect(&TokKind::RParen, "')'")?;
            self.expect(&TokKind::Arrow, "'=>'")?;
            let body = self.parse_expr()?;
            return Ok(Expr {
                kind: ExprKind::Arrow { params, body: Box::new(body) },
                pos,
            });
        }

        self.parse_postfix()
    }

    /// Lookahead from a '(' for `(ident, ...) =>`
    fn arrow_ahead(&self) -> bool {
        let mut i = 1;
        loop {
            match &self.peek(i).kind {
                TokKind::Ident(_) => {
                    i += 1;
                    if matches!(self.peek(i).kind, TokKind::Comma) {
                        i += 1;
                    }
                }
                TokKind::RParen => {
                    return matches!(self.peek(i + 1).kind, TokKind::Arrow);
                }
                _ => return false,
            }
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.cur().kind {
                TokKind::Dot => {
                    self.advance();
                    let tok = self.cur().clone();
                    let property = match tok.kind {
                        TokKind::Ident(name) => name,
                        _ => return Err(("expected property name after '.'".to_string(), tok.pos)),
                    };
                    self.advance();
                    let pos = expr.pos;
                    expr = Expr {
                        kind: ExprKind::Member {
                            object: Box::new(expr),
                            property,
                            property_pos: tok.pos,
                        },
                        pos,
                    };
                }
                TokKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    while !matches!(self.cur().kind, TokKind::RParen) {
                        args.push(self.parse_expr()?);
                        if matches!(self.cur().kind, TokKind::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    self.expect(&TokKind::RParen, "')'")?;
                    let pos = expr.pos;
                    expr = Expr {
                        kind: ExprKind::Call { callee: Box::new(expr), args },
                        pos,
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let tok = self.cur().clone();
        match tok.kind {
            TokKind::Null => {
                self.advance();
                Ok(Expr { kind: ExprKind::Null, pos: tok.pos })
            }
            TokKind::True => {
                self.advance();
                Ok(Expr { kind: ExprKind::Bool(true), pos: tok.pos })
            }
            TokKind::False => {
                self.advance();
                Ok(Expr { kind: ExprKind::Bool(false), pos: tok.pos })
            }
            TokKind::Number(value) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Number(value), pos: tok.pos })
            }
            TokKind::Str(value) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Str(value), pos: tok.pos })
            }
            TokKind::Ident(name) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Ident(name), pos: tok.pos })
            }
            TokKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&TokKind::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(("unexpected token".to_string(), tok.pos)),
        }
    }
}
