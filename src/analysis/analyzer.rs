//! Analyzer trait and the built-in analyzers.

use unicode_segmentation::UnicodeSegmentation;

use crate::analysis::token::{Token, TokenStream};
use crate::error::Result;

/// Converts field text into tokens.
///
/// ```
/// use halberd::analysis::{Analyzer, StandardAnalyzer};
///
/// let analyzer = StandardAnalyzer;
/// let tokens: Vec<_> = analyzer
///     .analyze("body", "Hello, World")
///     .unwrap()
///     .map(|t| t.unwrap().text)
///     .collect();
/// assert_eq!(tokens, vec!["hello", "world"]);
/// ```
pub trait Analyzer: Send + Sync + std::fmt::Debug {
    /// Analyze `text` of field `field`.
    fn analyze(&self, field: &str, text: &str) -> Result<TokenStream>;

    /// Name of this analyzer (for logs and diagnostics).
    fn name(&self) -> &'static str;
}

/// Unicode word segmentation followed by lowercasing.
#[derive(Clone, Debug, Default)]
pub struct StandardAnalyzer;

impl Analyzer for StandardAnalyzer {
    fn analyze(&self, _field: &str, text: &str) -> Result<TokenStream> {
        let tokens: Vec<Result<Token>> = text
            .unicode_word_indices()
            .map(|(start, word)| Ok(Token::new(word.to_lowercase(), start, start + word.len())))
            .collect();
        Ok(Box::new(tokens.into_iter()))
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Splits on whitespace without normalizing case.
#[derive(Clone, Debug, Default)]
pub struct WhitespaceAnalyzer;

impl Analyzer for WhitespaceAnalyzer {
    fn analyze(&self, _field: &str, text: &str) -> Result<TokenStream> {
        let mut tokens = Vec::new();
        let mut start = None;
        for (i, c) in text.char_indices() {
            match (c.is_whitespace(), start) {
                (true, Some(s)) => {
                    tokens.push(Ok(Token::new(&text[s..i], s, i)));
                    start = None;
                }
                (false, None) => start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = start {
            tokens.push(Ok(Token::new(&text[s..], s, text.len())));
        }
        Ok(Box::new(tokens.into_iter()))
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

/// Emits the whole input as a single token.
#[derive(Clone, Debug, Default)]
pub struct KeywordAnalyzer;

impl Analyzer for KeywordAnalyzer {
    fn analyze(&self, _field: &str, text: &str) -> Result<TokenStream> {
        Ok(Box::new(std::iter::once(Ok(Token::new(text, 0, text.len())))))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(analyzer: &dyn Analyzer, text: &str) -> Vec<String> {
        analyzer
            .analyze("f", text)
            .unwrap()
            .map(|t| t.unwrap().text)
            .collect()
    }

    #[test]
    fn test_standard_analyzer() {
        assert_eq!(
            texts(&StandardAnalyzer, "The Quick-brown fox's den"),
            vec!["the", "quick", "brown", "fox's", "den"]
        );
    }

    #[test]
    fn test_whitespace_analyzer_offsets() {
        let tokens: Vec<Token> = WhitespaceAnalyzer
            .analyze("f", "  Foo bar\tBaz ")
            .unwrap()
            .map(|t| t.unwrap())
            .collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].text, "Foo");
        assert_eq!((tokens[0].start_offset, tokens[0].end_offset), (2, 5));
        assert_eq!(tokens[2].text, "Baz");
    }

    #[test]
    fn test_keyword_analyzer() {
        assert_eq!(texts(&KeywordAnalyzer, "doc-0 x"), vec!["doc-0 x"]);
    }
}
