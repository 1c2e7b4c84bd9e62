//! Lexer for the `.sc` scripting language.
//!
//! Produces a flat token stream with one-based line/column positions and
//! collects the lines marked `# nocov`, which the coverage collector treats
//! as excluded.

use std::collections::BTreeSet;

use crate::parser::{ParseError, ParseErrorCode, ParseResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // keywords
    Import,
    From,
    As,
    Fn,
    Class,
    Let,
    Return,
    If,
    Else,
    While,
    Pass,
    True,
    False,
    Null,
    // punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,
    Pipe,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(name) => format!("identifier `{name}`"),
            Self::Int(v) => format!("integer literal `{v}`"),
            Self::Float(v) => format!("float literal `{v:?}`"),
            Self::Str(_) => "string literal".to_string(),
            Self::Eof => "end of input".to_string(),
            other => format!("{other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenStream {
    pub tokens: Vec<Token>,
    /// Lines whose trailing comment is exactly `nocov`.
    pub excluded_lines: BTreeSet<u32>,
}

pub fn tokenize(source: &str) -> ParseResult<TokenStream> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    excluded_lines: BTreeSet<u32>,
    source_label: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            excluded_lines: BTreeSet::new(),
            source_label: "<inline>",
        }
    }

    fn run(mut self) -> ParseResult<TokenStream> {
        while let Some(ch) = self.peek() {
            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                '#' => self.consume_comment(),
                '"' => self.consume_string()?,
                c if c.is_ascii_digit() => self.consume_number()?,
                c if c.is_ascii_alphabetic() || c == '_' => self.consume_word(),
                _ => self.consume_punct()?,
            }
        }
        self.push(TokenKind::Eof);
        Ok(TokenStream {
            tokens: self.tokens,
            excluded_lines: self.excluded_lines,
        })
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
            self.column += 1;
        }
        ch
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            line: self.line,
            column: self.column,
        });
    }

    fn push_at(&mut self, kind: TokenKind, line: u32, column: u32) {
        self.tokens.push(Token { kind, line, column });
    }

    fn error(&self, code: ParseErrorCode, message: impl Into<String>) -> ParseError {
        ParseError::new(code, message, self.source_label, self.line, self.column)
    }

    fn consume_comment(&mut self) {
        let line = self.line;
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            text.push(ch);
            self.advance();
        }
        let body = text.trim_start_matches('#').trim();
        if body == "nocov" {
            self.excluded_lines.insert(line);
        }
    }

    fn consume_string(&mut self) -> ParseResult<()> {
        let (line, column) = (self.line, self.column);
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.advance() {
                None | Some('\n') => {
                    return Err(self.error(
                        ParseErrorCode::UnterminatedString,
                        "string literal is not terminated",
                    ));
                }
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    other => {
                        return Err(self.error(
                            ParseErrorCode::InvalidEscape,
                            format!("invalid escape sequence `\\{}`", other.unwrap_or(' ')),
                        ));
                    }
                },
                Some(ch) => value.push(ch),
            }
        }
        self.push_at(TokenKind::Str(value), line, column);
        Ok(())
    }

    fn consume_number(&mut self) -> ParseResult<()> {
        let (line, column) = (self.line, self.column);
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.advance();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if is_float {
            let value: f64 = text.parse().map_err(|_| {
                self.error(
                    ParseErrorCode::InvalidNumber,
                    format!("invalid float literal `{text}`"),
                )
            })?;
            self.push_at(TokenKind::Float(value), line, column);
        } else {
            let value: i64 = text.parse().map_err(|_| {
                self.error(
                    ParseErrorCode::InvalidNumber,
                    format!("integer literal `{text}` is out of range"),
                )
            })?;
            self.push_at(TokenKind::Int(value), line, column);
        }
        Ok(())
    }

    fn consume_word(&mut self) {
        let (line, column) = (self.line, self.column);
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let kind = match text.as_str() {
            "import" => TokenKind::Import,
            "from" => TokenKind::From,
            "as" => TokenKind::As,
            "fn" => TokenKind::Fn,
            "class" => TokenKind::Class,
            "let" => TokenKind::Let,
            "return" => TokenKind::Return,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "pass" => TokenKind::Pass,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Ident(text),
        };
        self.push_at(kind, line, column);
    }

    fn consume_punct(&mut self) -> ParseResult<()> {
        let (line, column) = (self.line, self.column);
        let ch = match self.advance() {
            Some(ch) => ch,
            None => return Ok(()),
        };
        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.advance();
                    TokenKind::AndAnd
                } else {
                    return Err(self.error(
                        ParseErrorCode::UnexpectedCharacter,
                        "expected `&&`, found a single `&`",
                    ));
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.advance();
                    TokenKind::OrOr
                } else {
                    TokenKind::Pipe
                }
            }
            other => {
                return Err(self.error(
                    ParseErrorCode::UnexpectedCharacter,
                    format!("unexpected character `{other}`"),
                ));
            }
        };
        self.push_at(kind, line, column);
        Ok(())
    }
}
