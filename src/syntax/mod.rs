//! Syntax module: lexer and parser for contraction notation.

pub mod ast;
mod parser;
mod token;

pub use ast::ContractionPattern;
pub use parser::{parse_pattern, Parser};
pub use token::Token;
