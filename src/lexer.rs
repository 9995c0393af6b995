//! Lexer for Evy
//!
//! The lexer converts source code into a stream of tokens. It uses the
//! `logos` crate for the token rules and adds the pieces logos cannot
//! express on its own: line/column tracking, accumulation of lexical
//! errors (the stream continues after an offending token), and newline
//! suppression inside brackets - a newline between an unmatched `(`, `[`
//! or `{` and its closer is whitespace, not a statement terminator.

use crate::span::{Position, Span};
use crate::token::{Token, TokenKind};
use logos::Logos;
use thiserror::Error;

/// Lexer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("{pos}: unexpected character {ch:?}")]
    UnexpectedChar { ch: char, pos: Position },

    #[error("{pos}: unterminated string")]
    UnterminatedString { pos: Position },
}

/// The lexer for Evy
pub struct Lexer<'src> {
    source: &'src str,
    inner: logos::Lexer<'src, TokenKind>,
    errors: Vec<LexError>,
    /// Nesting depth of `(`/`[`/`{`; newlines are dropped while > 0
    bracket_depth: usize,
    line: u32,
    /// Byte offset of the start of the current line
    line_start: usize,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source code
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            inner: TokenKind::lexer(source),
            errors: Vec::new(),
            bracket_depth: 0,
            line: 1,
            line_start: 0,
        }
    }

    /// Get the source code
    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Get any errors that occurred during lexing
    pub fn errors(&self) -> &[LexError] {
        &self.errors
    }

    fn pos_at(&self, offset: usize) -> Position {
        let column = self.source[self.line_start..offset].chars().count() as u32 + 1;
        Position::new(self.line, column)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Token {
        loop {
            let kind = match self.inner.next() {
                Some(Ok(kind)) => kind,
                Some(Err(())) => {
                    let span = self.inner.span();
                    let ch = self.source[span.start..].chars().next().unwrap_or('\u{fffd}');
                    self.errors.push(LexError::UnexpectedChar {
                        ch,
                        pos: self.pos_at(span.start),
                    });
                    continue;
                }
                None => {
                    let pos = self.source.len();
                    return Token::new(TokenKind::Eof, Span::new(pos, pos), self.pos_at(pos));
                }
            };
            let span = self.inner.span();
            let span = Span::new(span.start, span.end);
            match kind {
                TokenKind::NewLine => {
                    let token = Token::new(kind, span, self.pos_at(span.start));
                    self.line += 1;
                    self.line_start = span.end;
                    if self.bracket_depth > 0 {
                        continue;
                    }
                    return token;
                }
                TokenKind::UnterminatedString => {
                    self.errors.push(LexError::UnterminatedString {
                        pos: self.pos_at(span.start),
                    });
                    continue;
                }
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => {
                    self.bracket_depth += 1;
                }
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    self.bracket_depth = self.bracket_depth.saturating_sub(1);
                }
                _ => {}
            }
            return Token::new(kind, span, self.pos_at(span.start));
        }
    }

    /// Collect all tokens (ending in an Eof token) and the lexical errors
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<LexError>) {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        (tokens, self.errors)
    }
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Token;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token)
        }
    }
}

/// Helper function to lex source code
pub fn lex(source: &str) -> (Vec<Token>, Vec<LexError>) {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, _) = lex(source);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_source() {
        let kinds = token_kinds("");
        assert_eq!(kinds, vec![TokenKind::Eof]);
    }

    #[test]
    fn test_declaration() {
        let kinds = token_kinds("x := 1");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Declare,
                TokenKind::NumLiteral,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_newline_is_a_token() {
        let kinds = token_kinds("x := 1\ny := 2");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Declare,
                TokenKind::NumLiteral,
                TokenKind::NewLine,
                TokenKind::Ident,
                TokenKind::Declare,
                TokenKind::NumLiteral,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_newline_suppressed_in_brackets() {
        let kinds = token_kinds("x := [1\n2]\ny := 1");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Declare,
                TokenKind::LBracket,
                TokenKind::NumLiteral,
                TokenKind::NumLiteral,
                TokenKind::RBracket,
                TokenKind::NewLine,
                TokenKind::Ident,
                TokenKind::Declare,
                TokenKind::NumLiteral,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let kinds = token_kinds("42 3.14 0");
        assert_eq!(
            kinds,
            vec![
                TokenKind::NumLiteral,
                TokenKind::NumLiteral,
                TokenKind::NumLiteral,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_strings() {
        let kinds = token_kinds(r#""hello" "with \"escape\"""#);
        assert_eq!(
            kinds,
            vec![TokenKind::StringLiteral, TokenKind::StringLiteral, TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let (tokens, errors) = lex("x := \"abc");
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![TokenKind::Ident, TokenKind::Declare, TokenKind::Eof]
        );
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], LexError::UnterminatedString { .. }));
    }

    #[test]
    fn test_keywords() {
        let kinds = token_kinds("if else end while for range break return func on true false and or");
        assert_eq!(
            kinds,
            vec![
                TokenKind::If,
                TokenKind::Else,
                TokenKind::End,
                TokenKind::While,
                TokenKind::For,
                TokenKind::Range,
                TokenKind::Break,
                TokenKind::Return,
                TokenKind::Func,
                TokenKind::On,
                TokenKind::True,
                TokenKind::False,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_type_keywords() {
        let kinds = token_kinds("num string bool any");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Num,
                TokenKind::String,
                TokenKind::Bool,
                TokenKind::Any,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        let kinds = token_kinds("+ - * / % == != < <= > >= ! = := ...");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Lt,
                TokenKind::LtEq,
                TokenKind::Gt,
                TokenKind::GtEq,
                TokenKind::Bang,
                TokenKind::Eq,
                TokenKind::Declare,
                TokenKind::DotDotDot,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comment_token() {
        let kinds = token_kinds("x := 1 // trailing\n// whole line");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Declare,
                TokenKind::NumLiteral,
                TokenKind::Comment,
                TokenKind::NewLine,
                TokenKind::Comment,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_invalid_character() {
        let (tokens, errors) = lex("x := 1 @");
        assert_eq!(tokens.len(), 4); // x := 1 Eof
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], LexError::UnexpectedChar { ch: '@', .. }));
    }

    #[test]
    fn test_positions() {
        let (tokens, _) = lex("x := 1\n  y := 2");
        assert_eq!(tokens[0].pos, Position::new(1, 1)); // x
        assert_eq!(tokens[2].pos, Position::new(1, 6)); // 1
        assert_eq!(tokens[4].pos, Position::new(2, 3)); // y
    }

    #[test]
    fn test_eof_position_after_trailing_newline() {
        let (tokens, _) = lex("x := 1\n");
        let eof = tokens.last().expect("eof token");
        assert_eq!(eof.kind, TokenKind::Eof);
        assert_eq!(eof.pos, Position::new(2, 1));
    }

    #[test]
    fn test_adjacency_spans() {
        let (tokens, _) = lex("m.key m . key");
        // m.key: dot starts where m ends
        assert_eq!(tokens[0].span.end, tokens[1].span.start);
        // m . key: whitespace between
        assert!(tokens[3].span.end < tokens[4].span.start);
    }
}
