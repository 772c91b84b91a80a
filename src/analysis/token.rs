//! Tokens produced by analyzers.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single unit of text after tokenization.
///
/// ```
/// use halberd::analysis::token::Token;
///
/// let token = Token::new("search", 0, 6).with_position_increment(2);
/// assert_eq!(token.text, "search");
/// assert_eq!(token.position_increment, 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The text content of the token.
    pub text: String,

    /// Byte offset where the token starts in the original text.
    pub start_offset: usize,

    /// Byte offset where the token ends in the original text.
    pub end_offset: usize,

    /// Position relative to the previous token (default: 1).
    pub position_increment: u32,
}

impl Token {
    /// Create a token with a position increment of 1.
    pub fn new<S: Into<String>>(text: S, start_offset: usize, end_offset: usize) -> Self {
        Token {
            text: text.into(),
            start_offset,
            end_offset,
            position_increment: 1,
        }
    }

    /// Set the position increment.
    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }
}

/// A stream of tokens. Items are fallible so a tokenizer can fail mid-stream.
pub type TokenStream = Box<dyn Iterator<Item = Result<Token>> + Send>;
