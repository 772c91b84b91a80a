//! Documents and fields.
//!
//! A [`Document`] is an ordered list of [`Field`]s. Each field carries a value
//! and a [`FieldType`] that decides how the writer consumes it: whether it is
//! inverted (and analyzed), stored verbatim, and/or recorded as a per-document
//! doc-values column.
//!
//! # Examples
//!
//! ```
//! use halberd::document::{DocValuesType, Document};
//!
//! let doc = Document::builder()
//!     .add_keyword("id", "doc-0")
//!     .add_text("body", "Hello segment world")
//!     .add_numeric_doc_values("val", 1)
//!     .build();
//!
//! assert_eq!(doc.len(), 3);
//! assert_eq!(
//!     doc.get_field("val").unwrap().field_type.doc_values,
//!     DocValuesType::Numeric
//! );
//! ```

use serde::{Deserialize, Serialize};

/// Per-document columnar value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DocValuesType {
    /// The field has no doc values.
    #[default]
    None,
    /// One i64 per document. Updatable.
    Numeric,
    /// One byte string per document. Updatable.
    Binary,
    /// One byte string per document, sorted for faceting. Not updatable.
    Sorted,
}

impl DocValuesType {
    /// Whether fields of this type accept in-place value updates.
    pub fn is_updatable(&self) -> bool {
        matches!(self, DocValuesType::Numeric | DocValuesType::Binary)
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            DocValuesType::None => 0,
            DocValuesType::Numeric => 1,
            DocValuesType::Binary => 2,
            DocValuesType::Sorted => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DocValuesType::None),
            1 => Some(DocValuesType::Numeric),
            2 => Some(DocValuesType::Binary),
            3 => Some(DocValuesType::Sorted),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocValuesType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DocValuesType::None => "none",
            DocValuesType::Numeric => "numeric",
            DocValuesType::Binary => "binary",
            DocValuesType::Sorted => "sorted",
        };
        write!(f, "{name}")
    }
}

/// How a field is consumed by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    /// Inverted into the postings.
    pub indexed: bool,
    /// Run through the analyzer before inversion (otherwise indexed as one term).
    pub tokenized: bool,
    /// Kept verbatim in the stored-fields file.
    pub stored: bool,
    /// Recorded as a doc-values column.
    pub doc_values: DocValuesType,
}

impl FieldType {
    /// Analyzed text, not stored.
    pub const TEXT: FieldType = FieldType {
        indexed: true,
        tokenized: true,
        stored: false,
        doc_values: DocValuesType::None,
    };

    /// Single untokenized term, stored.
    pub const KEYWORD: FieldType = FieldType {
        indexed: true,
        tokenized: false,
        stored: true,
        doc_values: DocValuesType::None,
    };

    /// Stored only.
    pub const STORED: FieldType = FieldType {
        indexed: false,
        tokenized: false,
        stored: true,
        doc_values: DocValuesType::None,
    };

    /// A doc-values-only field of the given type.
    pub const fn doc_values(kind: DocValuesType) -> FieldType {
        FieldType {
            indexed: false,
            tokenized: false,
            stored: false,
            doc_values: kind,
        }
    }
}

/// The value of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Free text, usually analyzed.
    Text(String),
    /// An exact string.
    Keyword(String),
    /// A 64-bit integer.
    Integer(i64),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// The textual form of the value, if it has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Keyword(s) => Some(s),
            _ => None,
        }
    }

    /// The integer value, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as term bytes. Integers are sign-flipped big-endian so byte
    /// order matches numeric order.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            FieldValue::Text(s) | FieldValue::Keyword(s) => s.as_bytes().to_vec(),
            FieldValue::Integer(v) => ((*v as u64) ^ (1 << 63)).to_be_bytes().to_vec(),
            FieldValue::Bytes(b) => b.clone(),
        }
    }
}

/// A named, typed value inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    pub field_type: FieldType,
}

impl Field {
    /// Create a field with an explicit type.
    pub fn new<S: Into<String>>(name: S, value: FieldValue, field_type: FieldType) -> Self {
        Field {
            name: name.into(),
            value,
            field_type,
        }
    }

    /// Analyzed, unstored text.
    pub fn text<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Self::new(name, FieldValue::Text(value.into()), FieldType::TEXT)
    }

    /// A stored, untokenized term. Typical for primary keys.
    pub fn keyword<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Self::new(name, FieldValue::Keyword(value.into()), FieldType::KEYWORD)
    }

    /// A numeric doc-values field.
    pub fn numeric_doc_values<S: Into<String>>(name: S, value: i64) -> Self {
        Self::new(
            name,
            FieldValue::Integer(value),
            FieldType::doc_values(DocValuesType::Numeric),
        )
    }

    /// A binary doc-values field.
    pub fn binary_doc_values<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Self::new(
            name,
            FieldValue::Bytes(value),
            FieldType::doc_values(DocValuesType::Binary),
        )
    }

    /// A sorted doc-values field. Sorted columns cannot be updated.
    pub fn sorted_doc_values<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Self::new(
            name,
            FieldValue::Bytes(value),
            FieldType::doc_values(DocValuesType::Sorted),
        )
    }

    /// A stored-only field.
    pub fn stored<S: Into<String>>(name: S, value: FieldValue) -> Self {
        Self::new(name, value, FieldType::STORED)
    }
}

/// A document is an ordered list of fields. Field names may repeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    /// Append a field.
    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// First field with the given name.
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        DocumentBuilder {
            document: Document::new(),
        }
    }

    /// Add an analyzed text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add(Field::text(name, value));
        self
    }

    /// Add a stored keyword field.
    pub fn add_keyword<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add(Field::keyword(name, value));
        self
    }

    /// Add a numeric doc-values field.
    pub fn add_numeric_doc_values<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add(Field::numeric_doc_values(name, value));
        self
    }

    /// Add a binary doc-values field.
    pub fn add_binary_doc_values<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add(Field::binary_doc_values(name, value));
        self
    }

    /// Add a sorted doc-values field.
    pub fn add_sorted_doc_values<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add(Field::sorted_doc_values(name, value));
        self
    }

    /// Add a stored-only field.
    pub fn add_stored<S: Into<String>>(mut self, name: S, value: FieldValue) -> Self {
        self.document.add(Field::stored(name, value));
        self
    }

    /// Add an arbitrary field.
    pub fn add_field(mut self, field: Field) -> Self {
        self.document.add(field);
        self
    }

    /// Build the final document.
    pub fn build(self) -> Document {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_order_and_duplicates() {
        let doc = Document::builder()
            .add_text("body", "a")
            .add_text("body", "b")
            .add_keyword("id", "1")
            .build();

        let names: Vec<&str> = doc.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["body", "body", "id"]);
        assert_eq!(doc.get_field("body").unwrap().value.as_text(), Some("a"));
    }

    #[test]
    fn test_doc_values_type_codes() {
        for kind in [
            DocValuesType::None,
            DocValuesType::Numeric,
            DocValuesType::Binary,
            DocValuesType::Sorted,
        ] {
            assert_eq!(DocValuesType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(DocValuesType::from_code(9), None);
        assert!(DocValuesType::Numeric.is_updatable());
        assert!(!DocValuesType::Sorted.is_updatable());
    }

    #[test]
    fn test_integer_bytes_sort_numerically() {
        let a = FieldValue::Integer(3).to_bytes();
        let b = FieldValue::Integer(20).to_bytes();
        let c = FieldValue::Integer(-5).to_bytes();
        assert!(c < a);
        assert!(a < b);
    }
}
