//! Doc-values columns and their update overlays.
//!
//! Base columns are written with the segment (`_S.dvd`). Updated fields are
//! written as full replacement columns into a new generation file
//! (`_S_G.dvu`); the catalog records, per field, which generation holds its
//! latest column.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::DocValuesType;
use crate::error::{HalberdError, Result};
use crate::index::term::Term;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

pub(crate) const DOC_VALUES_MAGIC: u32 = 0x4456_4444; // "DVDD"
pub(crate) const DOC_VALUES_UPDATE_MAGIC: u32 = 0x4456_5544; // "DVUD"
const DOC_VALUES_VERSION: u32 = 1;

/// One doc-values column, one slot per document.
///
/// `None` means the document has no value for the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocValuesColumn {
    Numeric(Vec<Option<i64>>),
    Binary(Vec<Option<Vec<u8>>>),
    Sorted(Vec<Option<Vec<u8>>>),
}

impl DocValuesColumn {
    /// An empty column of `max_doc` slots.
    pub fn empty(kind: DocValuesType, max_doc: u32) -> Option<Self> {
        let n = max_doc as usize;
        match kind {
            DocValuesType::Numeric => Some(DocValuesColumn::Numeric(vec![None; n])),
            DocValuesType::Binary => Some(DocValuesColumn::Binary(vec![None; n])),
            DocValuesType::Sorted => Some(DocValuesColumn::Sorted(vec![None; n])),
            DocValuesType::None => None,
        }
    }

    pub fn kind(&self) -> DocValuesType {
        match self {
            DocValuesColumn::Numeric(_) => DocValuesType::Numeric,
            DocValuesColumn::Binary(_) => DocValuesType::Binary,
            DocValuesColumn::Sorted(_) => DocValuesType::Sorted,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DocValuesColumn::Numeric(v) => v.len(),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn numeric(&self, doc: u32) -> Option<i64> {
        match self {
            DocValuesColumn::Numeric(v) => v.get(doc as usize).copied().flatten(),
            _ => None,
        }
    }

    pub fn binary(&self, doc: u32) -> Option<&[u8]> {
        match self {
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => {
                v.get(doc as usize).and_then(|b| b.as_deref())
            }
            DocValuesColumn::Numeric(_) => None,
        }
    }

    /// Whether `doc` is in the docs-with-field set.
    pub fn has_value(&self, doc: u32) -> bool {
        let i = doc as usize;
        match self {
            DocValuesColumn::Numeric(v) => matches!(v.get(i), Some(Some(_))),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => matches!(v.get(i), Some(Some(_))),
        }
    }

    /// Number of documents with a value.
    pub fn docs_with_field(&self) -> usize {
        match self {
            DocValuesColumn::Numeric(v) => v.iter().filter(|x| x.is_some()).count(),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => {
                v.iter().filter(|x| x.is_some()).count()
            }
        }
    }

    /// Append an empty slot.
    pub fn push_missing(&mut self) {
        match self {
            DocValuesColumn::Numeric(v) => v.push(None),
            DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v) => v.push(None),
        }
    }

    /// Pad with empty slots up to `len`.
    pub fn pad_to(&mut self, len: usize) {
        while self.len() < len {
            self.push_missing();
        }
    }

    /// Store `value` for `doc`. Returns `true` if the slot changed.
    pub fn set(&mut self, doc: u32, value: &DocValue) -> Result<bool> {
        let i = doc as usize;
        if i >= self.len() {
            return Err(HalberdError::index(format!(
                "doc {doc} out of range for column of {} docs",
                self.len()
            )));
        }
        match (self, value) {
            (DocValuesColumn::Numeric(v), DocValue::Numeric(x)) => {
                let changed = v[i] != *x;
                v[i] = *x;
                Ok(changed)
            }
            (DocValuesColumn::Binary(v), DocValue::Binary(x)) => {
                let changed = v[i] != *x;
                v[i] = x.clone();
                Ok(changed)
            }
            (column, value) => Err(HalberdError::schema(format!(
                "cannot store a {} value in a {} column",
                value.kind(),
                column.kind()
            ))),
        }
    }

    /// Copy the slot `from_doc` of `other` into the slot `to_doc` of `self`.
    pub(crate) fn copy_slot(&mut self, to_doc: usize, other: &DocValuesColumn, from_doc: usize) {
        match (self, other) {
            (DocValuesColumn::Numeric(dst), DocValuesColumn::Numeric(src)) => {
                dst[to_doc] = src.get(from_doc).copied().flatten();
            }
            (DocValuesColumn::Binary(dst), DocValuesColumn::Binary(src))
            | (DocValuesColumn::Sorted(dst), DocValuesColumn::Sorted(src)) => {
                dst[to_doc] = src.get(from_doc).cloned().flatten();
            }
            _ => {}
        }
    }

    /// The slot of `doc` as an update value (only for updatable kinds).
    pub(crate) fn value_at(&self, doc: u32) -> Option<DocValue> {
        match self {
            DocValuesColumn::Numeric(v) => Some(DocValue::Numeric(v.get(doc as usize).copied().flatten())),
            DocValuesColumn::Binary(v) => Some(DocValue::Binary(v.get(doc as usize).cloned().flatten())),
            DocValuesColumn::Sorted(_) => None,
        }
    }
}

/// The new value of an update. `None` clears the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocValue {
    Numeric(Option<i64>),
    Binary(Option<Vec<u8>>),
}

impl DocValue {
    pub fn kind(&self) -> DocValuesType {
        match self {
            DocValue::Numeric(_) => DocValuesType::Numeric,
            DocValue::Binary(_) => DocValuesType::Binary,
        }
    }
}

/// An update of one doc-values field on every document matching `term`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocValuesUpdate {
    pub term: Term,
    pub field: String,
    pub value: DocValue,
}

impl DocValuesUpdate {
    pub fn numeric<S: Into<String>>(term: Term, field: S, value: Option<i64>) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value: DocValue::Numeric(value),
        }
    }

    pub fn binary<S: Into<String>>(term: Term, field: S, value: Option<Vec<u8>>) -> Self {
        DocValuesUpdate {
            term,
            field: field.into(),
            value: DocValue::Binary(value),
        }
    }
}

/// Write `columns` as `name`, framed with `magic`.
pub(crate) fn write_columns(
    storage: &dyn Storage,
    name: &str,
    magic: u32,
    columns: &BTreeMap<String, DocValuesColumn>,
) -> Result<()> {
    let output = storage.create_output(name)?;
    let mut writer = StructWriter::new(output);
    writer.write_header(magic, DOC_VALUES_VERSION)?;
    writer.write_varint(columns.len() as u64)?;
    for (field, column) in columns {
        writer.write_string(field)?;
        writer.write_u8(column.kind().code())?;
        writer.write_u32(column.len() as u32)?;
        writer.write_bytes(&bincode::serialize(column)?)?;
    }
    writer.close()
}

/// Read columns written by [`write_columns`], checking every column has `max_doc` slots.
pub(crate) fn read_columns(
    storage: &dyn Storage,
    name: &str,
    magic: u32,
    max_doc: u32,
) -> Result<BTreeMap<String, DocValuesColumn>> {
    let mut reader = StructReader::open(storage, name)?;
    reader.check_header(magic, DOC_VALUES_VERSION, DOC_VALUES_VERSION)?;

    let count = reader.read_varint()?;
    let mut columns = BTreeMap::new();
    for _ in 0..count {
        let field = reader.read_string()?;
        let code = reader.read_u8()?;
        let len = reader.read_u32()?;
        let column: DocValuesColumn = bincode::deserialize(&reader.read_bytes()?)
            .map_err(|e| HalberdError::corruption(name, format!("column {field}: {e}")))?;

        if DocValuesType::from_code(code) != Some(column.kind()) || len != max_doc || column.len() != len as usize {
            return Err(HalberdError::corruption(
                name,
                format!("column {field} does not match its header"),
            ));
        }
        columns.insert(field, column);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_set_clears_and_reports_changes() {
        let mut column = DocValuesColumn::empty(DocValuesType::Numeric, 3).unwrap();
        assert!(column.set(1, &DocValue::Numeric(Some(5))).unwrap());
        assert!(!column.set(1, &DocValue::Numeric(Some(5))).unwrap());
        assert_eq!(column.numeric(1), Some(5));
        assert_eq!(column.docs_with_field(), 1);

        assert!(column.set(1, &DocValue::Numeric(None)).unwrap());
        assert!(!column.has_value(1));
        assert_eq!(column.docs_with_field(), 0);

        assert!(column.set(1, &DocValue::Binary(Some(vec![1]))).is_err());
        assert!(column.set(3, &DocValue::Numeric(Some(1))).is_err());
    }

    #[test]
    fn test_sorted_columns_reject_updates() {
        let mut column = DocValuesColumn::empty(DocValuesType::Sorted, 1).unwrap();
        assert!(column.set(0, &DocValue::Binary(Some(b"x".to_vec()))).is_err());
        assert!(column.value_at(0).is_none());
    }

    #[test]
    fn test_columns_file() {
        let storage = MemoryStorage::new_default();
        let mut columns = BTreeMap::new();
        columns.insert("val".to_string(), DocValuesColumn::Numeric(vec![Some(1), None]));
        columns.insert(
            "blob".to_string(),
            DocValuesColumn::Binary(vec![None, Some(b"abc".to_vec())]),
        );
        write_columns(&storage, "_0_1.dvu", DOC_VALUES_UPDATE_MAGIC, &columns).unwrap();

        let read = read_columns(&storage, "_0_1.dvu", DOC_VALUES_UPDATE_MAGIC, 2).unwrap();
        assert_eq!(read, columns);

        let err = read_columns(&storage, "_0_1.dvu", DOC_VALUES_UPDATE_MAGIC, 3).unwrap_err();
        assert!(err.is_corruption());

        let err = read_columns(&storage, "_0_1.dvu", DOC_VALUES_MAGIC, 2).unwrap_err();
        assert!(err.is_format_error());
    }
}
