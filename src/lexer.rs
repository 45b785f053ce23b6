//! Tokenizer for the infix expression language and the DSL's expression
//! positions (§4.1).

use crate::error::{CompileError, SourcePos};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    IntLit(i64),
    FloatLit(f64),
    /// A numeric literal written with no decimal point/exponent and no
    /// explicit suffix; carries the parsed value so the analyzer can pick
    /// `Int32`/`Int64` sizing, and whether the source spelling had a
    /// fractional part is tracked separately via `FloatLit` vs `IntLit`.
    StringLit(String),
    Ident(String),

    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    Amp,
    Caret,
    Pipe,
    Tilde,
    Comma,
    LParen,
    RParen,
    Colon,
    Newline,
    Indent,
    Dedent,
    Eof,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer { src: src.as_bytes(), pos: 0, line: 1, col: 1 }
    }

    fn here(&self) -> SourcePos {
        SourcePos { offset: self.pos, line: self.line, column: self.col }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    /// Skip horizontal whitespace and `#`-comments, but stop at a newline
    /// so callers that care about line structure (the DSL parser) can see
    /// it. Infix-only callers should call [`Self::skip_ws_and_newlines`].
    fn skip_ws_same_line(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' => {
                    self.bump();
                }
                b'#' => {
                    while self.peek().map(|c| c != b'\n').unwrap_or(false) {
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    /// Tokenize a single next token, treating newlines as plain
    /// whitespace (used by the infix-only parser, which has no line
    /// structure).
    pub fn next_token_flat(&mut self) -> Result<(Token, SourcePos), CompileError> {
        loop {
            self.skip_ws_same_line();
            if self.peek() == Some(b'\n') {
                self.bump();
                continue;
            }
            break;
        }
        self.next_token_raw()
    }

    /// Tokenize a single token without collapsing newlines; used by the
    /// DSL parser which needs `Newline`/`Indent`/`Dedent` structure. The
    /// indentation bookkeeping itself lives in `dsl::parser`.
    pub fn next_token_raw(&mut self) -> Result<(Token, SourcePos), CompileError> {
        self.skip_ws_same_line();
        let pos = self.here();
        let Some(c) = self.peek() else {
            return Ok((Token::Eof, pos));
        };

        if c == b'\n' {
            self.bump();
            return Ok((Token::Newline, pos));
        }

        if c.is_ascii_digit() {
            return self.lex_number(pos);
        }

        if c == b'"' {
            return self.lex_string(pos);
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            return self.lex_ident(pos);
        }

        self.bump();
        let tok = match c {
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => {
                if self.peek() == Some(b'*') {
                    self.bump();
                    Token::StarStar
                } else {
                    Token::Star
                }
            }
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'<' => {
                if self.peek() == Some(b'<') {
                    self.bump();
                    Token::Shl
                } else if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            b'>' => {
                if self.peek() == Some(b'>') {
                    self.bump();
                    Token::Shr
                } else if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            b'=' => {
                if self.peek() == Some(b'=') {
                    self.bump();
                    Token::EqEq
                } else {
                    return Err(CompileError::Parse { pos, message: "unexpected '='".into() });
                }
            }
            b'!' => {
                if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Ne
                } else {
                    return Err(CompileError::Parse { pos, message: "unexpected '!'".into() });
                }
            }
            b'&' => Token::Amp,
            b'^' => Token::Caret,
            b'|' => Token::Pipe,
            b'~' => Token::Tilde,
            b',' => Token::Comma,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b':' => Token::Colon,
            other => {
                return Err(CompileError::Parse {
                    pos,
                    message: format!("unexpected character '{}'", other as char),
                })
            }
        };
        Ok((tok, pos))
    }

    fn lex_number(&mut self, pos: SourcePos) -> Result<(Token, SourcePos), CompileError> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek2(), Some(b'x') | Some(b'X')) {
            self.bump();
            self.bump();
            while self.peek().map(|c| c.is_ascii_hexdigit()).unwrap_or(false) {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[start + 2..self.pos]).unwrap();
            let value = i64::from_str_radix(text, 16)
                .map_err(|e| CompileError::Parse { pos, message: format!("bad hex literal: {e}") })?;
            return Ok((Token::IntLit(value), pos));
        }

        let mut is_float = false;
        while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.bump();
        }
        if self.peek() == Some(b'.') && self.peek2().map(|c| c.is_ascii_digit()).unwrap_or(true) {
            is_float = true;
            self.bump();
            while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                self.bump();
            }
        }

        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| CompileError::Parse { pos, message: format!("bad float literal '{text}'") })?;
            Ok((Token::FloatLit(value), pos))
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| CompileError::Parse { pos, message: format!("bad integer literal '{text}'") })?;
            Ok((Token::IntLit(value), pos))
        }
    }

    fn lex_string(&mut self, pos: SourcePos) -> Result<(Token, SourcePos), CompileError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(CompileError::Parse { pos, message: "unterminated string literal".into() }),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(other) => out.push(other as char),
                    None => return Err(CompileError::Parse { pos, message: "unterminated escape".into() }),
                },
                Some(c) => out.push(c as char),
            }
        }
        Ok((Token::StringLit(out), pos))
    }

    fn lex_ident(&mut self, pos: SourcePos) -> Result<(Token, SourcePos), CompileError> {
        let start = self.pos;
        while self.peek().map(|c| c.is_ascii_alphanumeric() || c == b'_').unwrap_or(false) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap().to_string();
        let tok = match text.as_str() {
            "and" => Token::Ident("and".into()),
            "or" => Token::Ident("or".into()),
            "not" => Token::Ident("not".into()),
            _ => Token::Ident(text),
        };
        Ok((tok, pos))
    }

    pub fn remaining_offset(&self) -> usize {
        self.pos
    }
}
