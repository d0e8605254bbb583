//! Lexical analysis: turns the raw input string into a vector of tokens.
//!
//! The tokenizer knows nothing about semantics beyond classifying bytes
//! into the fixed token set. Multi-character punctuators are matched
//! before single-character ones to avoid ambiguity.

use crate::errors::{Location, ParseError};

/// Kinds of tokens recognised by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Keyword,
    Num,
    Punctuator,
    Eof,
}

/// Thin wrapper for the lexical information the parser needs.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// Set only for `Num` tokens.
    pub value: Option<i32>,
    /// Byte offset and length within the source.
    pub loc: usize,
    pub len: usize,
    /// Line/column for diagnostics.
    pub location: Location,
}

const KEYWORDS: &[&str] = &[
    "int", "return", "if", "else", "while", "do", "for", "break", "continue",
];

const MULTI_CHAR_PUNCTUATORS: &[&str] = &["&&", "||", "==", "!=", "<=", ">=", "<<", ">>"];

/// Lex the input into a flat vector of tokens terminated by an `Eof` marker.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line: u32 = 1;
    let mut column: u32 = 1;

    while i < bytes.len() {
        let c = bytes[i];

        if c == b'\n' {
            i += 1;
            line += 1;
            column = 1;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            column += 1;
            continue;
        }

        // Line comments are the only comment form.
        if input[i..].starts_with("//") {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        let location = Location::new(line, column);

        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let text = &input[start..i];
            let value = text.parse::<i32>().map_err(|err| {
                ParseError::new(format!("invalid number `{text}`: {err}"), location)
            })?;
            tokens.push(Token {
                kind: TokenKind::Num,
                value: Some(value),
                loc: start,
                len: i - start,
                location,
            });
            column += (i - start) as u32;
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let text = &input[start..i];
            let kind = if KEYWORDS.contains(&text) {
                TokenKind::Keyword
            } else {
                TokenKind::Ident
            };
            tokens.push(Token {
                kind,
                value: None,
                loc: start,
                len: i - start,
                location,
            });
            column += (i - start) as u32;
            continue;
        }

        if let Some(op) = MULTI_CHAR_PUNCTUATORS
            .iter()
            .find(|op| input[i..].starts_with(**op))
        {
            tokens.push(Token {
                kind: TokenKind::Punctuator,
                value: None,
                loc: i,
                len: op.len(),
                location,
            });
            i += op.len();
            column += op.len() as u32;
            continue;
        }

        if matches!(
            c,
            b'+' | b'-'
                | b'*'
                | b'/'
                | b'%'
                | b'~'
                | b'!'
                | b'&'
                | b'|'
                | b'^'
                | b'<'
                | b'>'
                | b'='
                | b'('
                | b')'
                | b'{'
                | b'}'
                | b';'
                | b','
                | b'?'
                | b':'
        ) {
            tokens.push(Token {
                kind: TokenKind::Punctuator,
                value: None,
                loc: i,
                len: 1,
                location,
            });
            i += 1;
            column += 1;
            continue;
        }

        let invalid = input[i..].chars().next().unwrap_or('\0');
        return Err(ParseError::new(
            format!("invalid character `{invalid}`"),
            location,
        ));
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        value: None,
        loc: input.len(),
        len: 0,
        location: Location::new(line, column),
    });
    Ok(tokens)
}

/// Return the slice from the source that produced this token.
pub fn token_text<'a>(token: &Token, source: &'a str) -> &'a str {
    &source[token.loc..token.loc + token.len]
}
