//! Token definitions for contraction notation.
//!
//! Uses the `logos` crate for lexing patterns such as `"ik,k,kj->ij"`.

use logos::Logos;

/// Tokens of a contraction pattern.
#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"[ \t\r\n]+")] // Whitespace is ignored anywhere in a pattern
pub enum Token {
    #[token(",")]
    Comma,
    #[token("->")]
    Arrow,
    #[token("...")]
    Ellipsis,

    // Single-character axis keys
    #[regex(r"[a-zA-Z]", |lex| lex.slice().chars().next())]
    Label(char),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Comma => write!(f, ","),
            Token::Arrow => write!(f, "->"),
            Token::Ellipsis => write!(f, "..."),
            Token::Label(c) => write!(f, "{}", c),
        }
    }
}
