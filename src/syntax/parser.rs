//! Parser for contraction notation.
//!
//! Grammar:
//! pattern := term ("," term)* ("->" term)?
//! term    := label*

use super::ast::ContractionPattern;
use super::token::Token;
use crate::error::{Result, VmpError};
use logos::Logos;
use std::iter::Peekable;
use std::ops::Range;

type Spanned = (std::result::Result<Token, ()>, Range<usize>);

/// Parser state.
pub struct Parser<'a> {
    tokens: Peekable<Box<dyn Iterator<Item = Spanned> + 'a>>,
}

impl<'a> Parser<'a> {
    /// Create a new parser from input string.
    pub fn new(input: &'a str) -> Self {
        let lexer = Token::lexer(input).spanned();
        let iter: Box<dyn Iterator<Item = Spanned> + 'a> = Box::new(lexer);
        Self {
            tokens: iter.peekable(),
        }
    }

    /// Peek at the next token without consuming it.
    fn peek(&mut self) -> Option<&Spanned> {
        self.tokens.peek()
    }

    /// Consume the next token, turning lexer failures into errors.
    fn next(&mut self) -> Result<Option<Token>> {
        match self.tokens.next() {
            Some((Ok(token), _)) => Ok(Some(token)),
            Some((Err(()), span)) => Err(VmpError::Pattern(format!(
                "unexpected character at position {}",
                span.start
            ))),
            None => Ok(None),
        }
    }

    /// Parse the keys of one operand, stopping before `,`, `->` or the end.
    fn parse_term(&mut self) -> Result<Vec<char>> {
        let mut keys = Vec::new();
        loop {
            match self.peek() {
                Some((Ok(Token::Comma | Token::Arrow), _)) | None => return Ok(keys),
                _ => match self.next()? {
                    Some(Token::Label(c)) => keys.push(c),
                    Some(Token::Ellipsis) => {
                        return Err(VmpError::Unsupported(
                            "ellipsis in contraction patterns".into(),
                        ))
                    }
                    Some(t) => return Err(VmpError::Pattern(format!("unexpected token {}", t))),
                    None => return Ok(keys),
                },
            }
        }
    }

    /// Parse a full pattern.
    pub fn parse(&mut self) -> Result<ContractionPattern> {
        let mut inputs = vec![self.parse_term()?];
        let mut output = None;

        while let Some(token) = self.next()? {
            match token {
                Token::Comma if output.is_none() => inputs.push(self.parse_term()?),
                Token::Arrow if output.is_none() => output = Some(self.parse_term()?),
                Token::Arrow => {
                    return Err(VmpError::Pattern("the string contains too many ->".into()))
                }
                t => return Err(VmpError::Pattern(format!("unexpected token {} in output", t))),
            }
        }

        Ok(ContractionPattern {
            inputs,
            output: output.unwrap_or_default(),
        })
    }
}

/// Parse a contraction pattern such as `"ik,k,kj->ij"`.
pub fn parse_pattern(input: &str) -> Result<ContractionPattern> {
    Parser::new(input).parse()
}
