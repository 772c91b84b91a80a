//! Terms: the unit of lookup in the postings.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HalberdError, Result};

/// A field name plus the exact bytes of one indexed token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub bytes: Vec<u8>,
}

impl Term {
    /// Create a term from text.
    pub fn new<F: Into<String>, T: AsRef<str>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            bytes: text.as_ref().as_bytes().to_vec(),
        }
    }

    /// Create a term from raw bytes.
    pub fn from_bytes<F: Into<String>>(field: F, bytes: Vec<u8>) -> Self {
        Term {
            field: field.into(),
            bytes,
        }
    }

    /// Parse `field:value`.
    ///
    /// ```
    /// use halberd::index::term::Term;
    ///
    /// let term = Term::parse("id:doc-0").unwrap();
    /// assert_eq!(term, Term::new("id", "doc-0"));
    /// assert!(Term::parse("no-colon").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once(':') {
            Some((field, value)) if !field.is_empty() => Ok(Term::new(field, value)),
            _ => Err(HalberdError::invalid_argument(format!(
                "term must look like field:value, got {text:?}"
            ))),
        }
    }

    /// The term bytes as text (lossy).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text())
    }
}
