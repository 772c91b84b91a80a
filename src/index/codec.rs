//! Segment codecs.
//!
//! A codec turns the in-memory [`SegmentData`] of a flushed or merged segment
//! into its base files and back. The engine never looks at the bytes; the
//! one capability it asks a codec about is whether segments it wrote can carry
//! doc-values update overlays.
//!
//! Two codecs ship with the crate:
//!
//! - [`StandardCodec`]: current format, delta-coded postings, updatable doc values.
//! - [`LegacyCodec`]: the previous format. Readable, writable when configured
//!   explicitly, but its segments reject doc-values updates.
//!
//! Readers pick the codec named in each segment's info through a
//! [`CodecRegistry`], which is passed around explicitly.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::FieldValue;
use crate::error::{HalberdError, Result};
use crate::index::doc_values::{DOC_VALUES_MAGIC, DocValuesColumn, read_columns, write_columns};
use crate::index::file_names::{
    DOC_VALUES_EXTENSION, POSTINGS_EXTENSION, SEGMENT_INFO_EXTENSION, STORED_FIELDS_EXTENSION,
    segment_file_name,
};
use crate::index::query::QueryTarget;
use crate::index::term::Term;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const POSTINGS_MAGIC: u32 = 0x5053_5447; // "PSTG"
const STORED_FIELDS_MAGIC: u32 = 0x5354_4644; // "STFD"

/// A stored field value as written to `_S.fdt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    pub name: String,
    pub value: FieldValue,
}

/// Postings of one field: term bytes to sorted doc ids.
pub type FieldPostings = BTreeMap<Vec<u8>, Vec<u32>>;

/// Decoded content of a segment's base files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentData {
    pub max_doc: u32,
    pub postings: BTreeMap<String, FieldPostings>,
    pub stored: Vec<Vec<StoredField>>,
    pub doc_values: BTreeMap<String, DocValuesColumn>,
}

impl SegmentData {
    /// Sorted doc ids containing `term`.
    pub fn docs(&self, term: &Term) -> &[u32] {
        self.postings
            .get(&term.field)
            .and_then(|terms| terms.get(&term.bytes))
            .map(|docs| docs.as_slice())
            .unwrap_or(&[])
    }

    /// Stored fields of `doc`.
    pub fn stored_fields(&self, doc: u32) -> &[StoredField] {
        self.stored.get(doc as usize).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

impl QueryTarget for SegmentData {
    fn max_doc(&self) -> u32 {
        self.max_doc
    }

    fn term_docs(&self, term: &Term) -> &[u32] {
        self.docs(term)
    }

    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        self.doc_values.get(field).and_then(|c| c.numeric(doc))
    }
}

/// Encoder/decoder of a segment's base files.
pub trait Codec: Send + Sync + Debug {
    /// Name recorded in each segment info.
    fn name(&self) -> &'static str;

    /// Format version this codec writes and reads.
    fn format_version(&self) -> u32;

    /// Whether segments written by this codec accept doc-values update overlays.
    fn supports_doc_values_updates(&self) -> bool;

    /// Write the base files of `segment`. Returns the names written.
    fn write_segment(&self, storage: &dyn Storage, segment: &str, data: &SegmentData) -> Result<Vec<String>>;

    /// Read back the base files of `segment`.
    fn read_segment(&self, storage: &dyn Storage, segment: &str, max_doc: u32) -> Result<SegmentData>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostingsEncoding {
    Plain,
    Delta,
}

fn write_base_files(
    storage: &dyn Storage,
    segment: &str,
    data: &SegmentData,
    version: u32,
    encoding: PostingsEncoding,
) -> Result<Vec<String>> {
    let postings_name = segment_file_name(segment, POSTINGS_EXTENSION);
    let stored_name = segment_file_name(segment, STORED_FIELDS_EXTENSION);
    let doc_values_name = segment_file_name(segment, DOC_VALUES_EXTENSION);

    let mut writer = StructWriter::new(storage.create_output(&postings_name)?);
    writer.write_header(POSTINGS_MAGIC, version)?;
    writer.write_varint(data.postings.len() as u64)?;
    for (field, terms) in &data.postings {
        writer.write_string(field)?;
        writer.write_varint(terms.len() as u64)?;
        for (term, docs) in terms {
            writer.write_bytes(term)?;
            match encoding {
                PostingsEncoding::Delta => writer.write_delta_compressed_u32s(docs)?,
                PostingsEncoding::Plain => {
                    writer.write_u32(docs.len() as u32)?;
                    for &doc in docs {
                        writer.write_u32(doc)?;
                    }
                }
            }
        }
    }
    writer.close()?;

    let mut writer = StructWriter::new(storage.create_output(&stored_name)?);
    writer.write_header(STORED_FIELDS_MAGIC, version)?;
    writer.write_u32(data.max_doc)?;
    for doc in 0..data.max_doc {
        writer.write_bytes(&bincode::serialize(data.stored_fields(doc))?)?;
    }
    writer.close()?;

    write_columns(storage, &doc_values_name, DOC_VALUES_MAGIC, &data.doc_values)?;

    Ok(vec![postings_name, stored_name, doc_values_name])
}

fn read_base_files(
    storage: &dyn Storage,
    segment: &str,
    max_doc: u32,
    version: u32,
    encoding: PostingsEncoding,
) -> Result<SegmentData> {
    let postings_name = segment_file_name(segment, POSTINGS_EXTENSION);
    let mut reader = StructReader::open(storage, &postings_name)?;
    reader.check_header(POSTINGS_MAGIC, version, version)?;

    let mut postings = BTreeMap::new();
    for _ in 0..reader.read_varint()? {
        let field = reader.read_string()?;
        let mut terms = FieldPostings::new();
        for _ in 0..reader.read_varint()? {
            let term = reader.read_bytes()?;
            let docs = match encoding {
                PostingsEncoding::Delta => reader.read_delta_compressed_u32s()?,
                PostingsEncoding::Plain => {
                    let n = reader.read_u32()?;
                    (0..n).map(|_| reader.read_u32()).collect::<Result<Vec<_>>>()?
                }
            };
            if docs.last().is_some_and(|&d| d >= max_doc) {
                return Err(HalberdError::corruption(
                    &postings_name,
                    format!("doc id out of range in field {field}"),
                ));
            }
            terms.insert(term, docs);
        }
        postings.insert(field, terms);
    }

    let stored_name = segment_file_name(segment, STORED_FIELDS_EXTENSION);
    let mut reader = StructReader::open(storage, &stored_name)?;
    reader.check_header(STORED_FIELDS_MAGIC, version, version)?;
    let stored_docs = reader.read_u32()?;
    if stored_docs != max_doc {
        return Err(HalberdError::corruption(
            &stored_name,
            format!("stored fields cover {stored_docs} docs, segment has {max_doc}"),
        ));
    }
    let mut stored = Vec::with_capacity(max_doc as usize);
    for _ in 0..max_doc {
        let fields: Vec<StoredField> = bincode::deserialize(&reader.read_bytes()?)
            .map_err(|e| HalberdError::corruption(&stored_name, e.to_string()))?;
        stored.push(fields);
    }

    let doc_values_name = segment_file_name(segment, DOC_VALUES_EXTENSION);
    let doc_values = read_columns(storage, &doc_values_name, DOC_VALUES_MAGIC, max_doc)?;

    Ok(SegmentData {
        max_doc,
        postings,
        stored,
        doc_values,
    })
}

/// The current segment format.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl StandardCodec {
    pub const NAME: &'static str = "standard";
    pub const VERSION: u32 = 2;
}

impl Codec for StandardCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn format_version(&self) -> u32 {
        Self::VERSION
    }

    fn supports_doc_values_updates(&self) -> bool {
        true
    }

    fn write_segment(&self, storage: &dyn Storage, segment: &str, data: &SegmentData) -> Result<Vec<String>> {
        write_base_files(storage, segment, data, Self::VERSION, PostingsEncoding::Delta)
    }

    fn read_segment(&self, storage: &dyn Storage, segment: &str, max_doc: u32) -> Result<SegmentData> {
        read_base_files(storage, segment, max_doc, Self::VERSION, PostingsEncoding::Delta)
    }
}

/// The previous segment format, which predates doc-values updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyCodec;

impl LegacyCodec {
    pub const NAME: &'static str = "legacy";
    pub const VERSION: u32 = 1;
}

impl Codec for LegacyCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn format_version(&self) -> u32 {
        Self::VERSION
    }

    fn supports_doc_values_updates(&self) -> bool {
        false
    }

    fn write_segment(&self, storage: &dyn Storage, segment: &str, data: &SegmentData) -> Result<Vec<String>> {
        write_base_files(storage, segment, data, Self::VERSION, PostingsEncoding::Plain)
    }

    fn read_segment(&self, storage: &dyn Storage, segment: &str, max_doc: u32) -> Result<SegmentData> {
        read_base_files(storage, segment, max_doc, Self::VERSION, PostingsEncoding::Plain)
    }
}

/// Codecs known to a reader or writer, by name.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = CodecRegistry::empty();
        registry.register(Arc::new(StandardCodec));
        registry.register(Arc::new(LegacyCodec));
        registry
    }
}

impl CodecRegistry {
    /// A registry without any codec.
    pub fn empty() -> Self {
        CodecRegistry {
            codecs: HashMap::new(),
        }
    }

    /// Add or replace a codec.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name(), codec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }

    /// Codec for a segment recorded with `name`/`version`.
    ///
    /// Unknown codecs and version mismatches fail with `UnsupportedFormat`
    /// naming the segment's info file.
    pub fn resolve(&self, segment: &str, name: &str, version: u32) -> Result<Arc<dyn Codec>> {
        let path = segment_file_name(segment, SEGMENT_INFO_EXTENSION);
        let codec = self
            .get(name)
            .ok_or_else(|| HalberdError::unsupported_format(&path, format!("unknown codec {name:?}")))?;
        if codec.format_version() != version {
            return Err(HalberdError::unsupported_format(
                &path,
                format!(
                    "codec {name} version {version} not supported (this build reads version {})",
                    codec.format_version()
                ),
            ));
        }
        Ok(codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn sample() -> SegmentData {
        let mut postings = BTreeMap::new();
        let mut ids = FieldPostings::new();
        ids.insert(b"doc-0".to_vec(), vec![0]);
        ids.insert(b"doc-1".to_vec(), vec![1, 2]);
        postings.insert("id".to_string(), ids);

        let mut doc_values = BTreeMap::new();
        doc_values.insert(
            "val".to_string(),
            DocValuesColumn::Numeric(vec![Some(1), Some(2), None]),
        );

        SegmentData {
            max_doc: 3,
            postings,
            stored: vec![
                vec![StoredField {
                    name: "id".into(),
                    value: FieldValue::Keyword("doc-0".into()),
                }],
                vec![],
                vec![],
            ],
            doc_values,
        }
    }

    #[test]
    fn test_codecs_read_what_they_write() {
        let storage = MemoryStorage::new_default();
        let codecs: [(&str, &dyn Codec); 2] = [("_0", &StandardCodec), ("_1", &LegacyCodec)];
        for (segment, codec) in codecs {
            let files = codec.write_segment(&storage, segment, &sample()).unwrap();
            assert_eq!(files.len(), 3);
            let read = codec.read_segment(&storage, segment, 3).unwrap();
            assert_eq!(read, sample());
            assert_eq!(read.docs(&Term::new("id", "doc-1")), &[1, 2]);
        }
    }

    #[test]
    fn test_codec_mismatch_is_format_error() {
        let storage = MemoryStorage::new_default();
        LegacyCodec.write_segment(&storage, "_0", &sample()).unwrap();
        let err = StandardCodec.read_segment(&storage, "_0", 3).unwrap_err();
        assert!(err.is_format_error());
        match err {
            HalberdError::UnsupportedFormat { path, .. } => assert_eq!(path, "_0.pst"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_registry_resolve() {
        let registry = CodecRegistry::default();
        assert!(registry.resolve("_0", "standard", 2).unwrap().supports_doc_values_updates());
        assert!(!registry.resolve("_0", "legacy", 1).unwrap().supports_doc_values_updates());
        assert!(registry.resolve("_0", "standard", 3).unwrap_err().is_format_error());
        assert!(registry.resolve("_0", "ancient", 1).unwrap_err().is_format_error());
        assert!(CodecRegistry::empty().get("standard").is_none());
    }
}
