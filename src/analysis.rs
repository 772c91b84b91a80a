//! Text analysis boundary.
//!
//! The index engine treats analysis as an external collaborator: it hands each
//! indexed text value to an [`Analyzer`](analyzer::Analyzer) and consumes the
//! resulting tokens. Any error raised by the analyzer, including one raised in
//! the middle of a token stream, fails only the document being indexed.

pub mod analyzer;
pub mod token;

pub use analyzer::{Analyzer, KeywordAnalyzer, StandardAnalyzer, WhitespaceAnalyzer};
pub use token::{Token, TokenStream};
