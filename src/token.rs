//! Token definitions for Evy
//!
//! This module defines all the tokens that the lexer can produce. Newlines
//! terminate statements in Evy, so `NewLine` is a real token rather than
//! skipped whitespace; the lexer drops it inside bracketed expressions.

use crate::span::{Position, Span};
use logos::Logos;
use std::fmt;

/// A token produced by the lexer
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub pos: Position,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span, pos: Position) -> Self {
        Self { kind, span, pos }
    }

    /// Get the text of this token from source
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        self.span.text(source)
    }

    /// Render this token for an error message: numbers print bare, newline
    /// and EOF print as words, everything else is quoted. String literals
    /// already carry their quotes in the lexeme.
    pub fn describe(&self, source: &str) -> String {
        match self.kind {
            TokenKind::NumLiteral | TokenKind::StringLiteral => self.text(source).to_string(),
            TokenKind::NewLine => "end of line".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            _ => format!("{:?}", self.text(source)),
        }
    }
}

/// All possible token types in Evy
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\f]+")]
pub enum TokenKind {
    // ============ Literals ============
    /// Number literal: 42, 3.14 (one numeric type, always a num)
    #[regex(r"[0-9]+(\.[0-9]+)?")]
    NumLiteral,

    /// String literal: "hello", "with \"escapes\""
    #[regex(r#""([^"\\\n]|\\.)*""#, priority = 10)]
    StringLiteral,

    /// String literal missing its closing quote; reported as a lexical error
    #[regex(r#""([^"\\\n]|\\.)*"#, priority = 1)]
    UnterminatedString,

    /// Boolean literals
    #[token("true")]
    True,
    #[token("false")]
    False,

    // ============ Keywords ============
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("end")]
    End,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("range")]
    Range,
    #[token("break")]
    Break,
    #[token("return")]
    Return,
    #[token("func")]
    Func,
    #[token("on")]
    On,
    #[token("and")]
    And,
    #[token("or")]
    Or,

    // ============ Type keywords ============
    #[token("num")]
    Num,
    #[token("string")]
    String,
    #[token("bool")]
    Bool,
    #[token("any")]
    Any,

    // ============ Operators ============
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,
    #[token("!")]
    Bang,
    #[token("=")]
    Eq,
    #[token(":=")]
    Declare,
    #[token("...")]
    DotDotDot,

    // ============ Delimiters and punctuation ============
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,

    /// Line comment, kept as a token so comment-only lines survive as
    /// empty statements in the canonical program dump
    #[regex(r"//[^\n]*")]
    Comment,

    /// Statement terminator
    #[token("\n")]
    NewLine,

    // ============ Identifiers ============
    /// Identifier: foo, has_more, _
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // ============ Special ============
    /// End of file
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::NumLiteral => "number",
            TokenKind::StringLiteral => "string",
            TokenKind::UnterminatedString => "unterminated string",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::End => "end",
            TokenKind::While => "while",
            TokenKind::For => "for",
            TokenKind::Range => "range",
            TokenKind::Break => "break",
            TokenKind::Return => "return",
            TokenKind::Func => "func",
            TokenKind::On => "on",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Num => "num",
            TokenKind::String => "string",
            TokenKind::Bool => "bool",
            TokenKind::Any => "any",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::Bang => "!",
            TokenKind::Eq => "=",
            TokenKind::Declare => ":=",
            TokenKind::DotDotDot => "...",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Dot => ".",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Comment => "comment",
            TokenKind::NewLine => "end of line",
            TokenKind::Ident => "identifier",
            TokenKind::Eof => "end of input",
        };
        write!(f, "{}", s)
    }
}
