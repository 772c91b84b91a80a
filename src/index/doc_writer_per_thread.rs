//! In-memory segment buffers.
//!
//! Each indexing thread checks out one [`DocumentsWriterPerThread`] and
//! appends analyzed documents to it. A buffer owns its postings, stored
//! fields and doc-values columns outright, so appending never takes a shared
//! lock. Flushing a buffer turns it into one immutable segment.
//!
//! Analysis happens in [`stage_document`], before a document is sequenced,
//! so a document that fails analysis never touches a buffer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use log::{debug, warn};

use crate::analysis::Analyzer;
use crate::document::{DocValuesType, Document, FieldValue};
use crate::error::{HalberdError, Result};
use crate::index::codec::{Codec, FieldPostings, SegmentData, StoredField};
use crate::index::delete_queue::BufferedOp;
use crate::index::doc_values::DocValuesColumn;
use crate::index::field_infos::{FieldInfos, FieldNumbers, FieldUsage};
use crate::index::file_names::{LIVE_DOCS_EXTENSION, generation_file_name, parse_segment_name};
use crate::index::live_docs::LiveDocs;
use crate::index::segment_info::{SOURCE_DIAGNOSTIC, SegmentCommitInfo, SegmentInfo, TIMESTAMP_DIAGNOSTIC};
use crate::storage::Storage;

/// Highest position a token may take inside one field of one document.
pub const MAX_POSITION: u32 = i32::MAX as u32 - 128;

/// Longest term the postings accept, in bytes.
pub const MAX_TERM_LENGTH: usize = 32766;

#[derive(Debug, Clone, PartialEq)]
enum StagedValue {
    Numeric(i64),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
struct StagedField {
    name: String,
    number: u32,
    indexed: bool,
    terms: Vec<Vec<u8>>,
    stored: Option<FieldValue>,
    doc_value: Option<(DocValuesType, StagedValue)>,
}

/// A document analyzed and validated, ready to be buffered.
#[derive(Debug)]
pub(crate) struct StagedDocument {
    fields: Vec<StagedField>,
    bytes: usize,
}

fn doc_value_of(name: &str, kind: DocValuesType, value: &FieldValue) -> Result<StagedValue> {
    match (kind, value) {
        (DocValuesType::Numeric, FieldValue::Integer(v)) => Ok(StagedValue::Numeric(*v)),
        (DocValuesType::Binary | DocValuesType::Sorted, FieldValue::Integer(_)) | (DocValuesType::Numeric, _) => {
            Err(HalberdError::illegal_argument(format!(
                "field {name:?}: value {value:?} does not fit {kind} doc values"
            )))
        }
        (_, value) => Ok(StagedValue::Bytes(value.to_bytes())),
    }
}

/// Analyze and validate `doc`.
///
/// Every failure is a per-document failure: analyzer errors surface as
/// `Analysis`, position overflow, oversized terms and doc-values misuse as
/// `IllegalArgument`. Fields are registered with the writer only when the
/// whole document is valid.
pub(crate) fn stage_document(
    doc: &Document,
    analyzer: &dyn Analyzer,
    field_numbers: &FieldNumbers,
) -> Result<StagedDocument> {
    let mut positions: AHashMap<&str, i64> = AHashMap::new();
    let mut doc_value_fields: Vec<&str> = Vec::new();
    let mut staged = Vec::with_capacity(doc.len());
    let mut bytes = 64;

    for field in doc.fields() {
        let field_type = field.field_type;
        let mut terms = Vec::new();

        if field_type.indexed {
            match (&field.value, field_type.tokenized) {
                (FieldValue::Text(text) | FieldValue::Keyword(text), true) => {
                    let position = positions.entry(field.name.as_str()).or_insert(-1);
                    let stream = analyzer
                        .analyze(&field.name, text)
                        .map_err(|e| as_analysis_error(&field.name, e))?;
                    for token in stream {
                        let token = token.map_err(|e| as_analysis_error(&field.name, e))?;
                        *position += i64::from(token.position_increment);
                        if *position > i64::from(MAX_POSITION) {
                            return Err(HalberdError::illegal_argument(format!(
                                "field {:?}: position {} exceeds the maximum of {MAX_POSITION}",
                                field.name, *position
                            )));
                        }
                        terms.push(token.text.into_bytes());
                    }
                }
                (value, _) => terms.push(value.to_bytes()),
            }
            if let Some(term) = terms.iter().find(|t| t.len() > MAX_TERM_LENGTH) {
                return Err(HalberdError::illegal_argument(format!(
                    "field {:?} contains a term of {} bytes, longer than {MAX_TERM_LENGTH}",
                    field.name,
                    term.len()
                )));
            }
        }

        let doc_value = if field_type.doc_values != DocValuesType::None {
            if doc_value_fields.contains(&field.name.as_str()) {
                return Err(HalberdError::illegal_argument(format!(
                    "doc-values field {:?} appears more than once in one document",
                    field.name
                )));
            }
            doc_value_fields.push(field.name.as_str());
            Some((
                field_type.doc_values,
                doc_value_of(&field.name, field_type.doc_values, &field.value)?,
            ))
        } else {
            None
        };

        bytes += field.name.len() + terms.iter().map(|t| t.len() + 24).sum::<usize>();
        bytes += match &doc_value {
            Some((_, StagedValue::Bytes(b))) => b.len() + 24,
            Some((_, StagedValue::Numeric(_))) => 16,
            None => 0,
        };
        let stored = field_type.stored.then(|| field.value.clone());
        if let Some(value) = &stored {
            bytes += 32 + value.to_bytes().len();
        }

        staged.push(StagedField {
            name: field.name.clone(),
            number: 0,
            indexed: field_type.indexed,
            terms,
            stored,
            doc_value,
        });
    }

    let usages: Vec<FieldUsage<'_>> = staged
        .iter()
        .map(|f| FieldUsage {
            name: &f.name,
            doc_values: f.doc_value.as_ref().map_or(DocValuesType::None, |(kind, _)| *kind),
        })
        .collect();
    let numbers = field_numbers.register(&usages)?;
    for (field, number) in staged.iter_mut().zip(numbers) {
        field.number = number;
    }

    Ok(StagedDocument { fields: staged, bytes })
}

fn as_analysis_error(field: &str, error: HalberdError) -> HalberdError {
    if error.is_per_document() {
        error
    } else {
        HalberdError::analysis(format!("analyzing field {field:?}: {error}"))
    }
}

/// A segment produced by a buffer flush.
#[derive(Debug)]
pub(crate) struct FlushedSegment {
    pub segment: SegmentCommitInfo,
}

/// One in-memory segment under construction.
#[derive(Debug)]
pub(crate) struct DocumentsWriterPerThread {
    id: u64,
    num_docs: u32,
    postings: BTreeMap<String, FieldPostings>,
    stored: Vec<Vec<StoredField>>,
    doc_values: BTreeMap<String, DocValuesColumn>,
    field_infos: FieldInfos,
    /// Operations seen by this buffer, each with the number of documents it
    /// may touch.
    private_ops: Vec<(Arc<BufferedOp>, u32)>,
    bytes_used: usize,
}

impl DocumentsWriterPerThread {
    pub fn new(id: u64) -> Self {
        DocumentsWriterPerThread {
            id,
            num_docs: 0,
            postings: BTreeMap::new(),
            stored: Vec::new(),
            doc_values: BTreeMap::new(),
            field_infos: FieldInfos::new(),
            private_ops: Vec::new(),
            bytes_used: 0,
        }
    }

    /// Slice id of this buffer in the delete queue.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Record operations sequenced before the next document.
    pub fn add_ops(&mut self, ops: Vec<Arc<BufferedOp>>) {
        for op in ops {
            self.bytes_used += op.estimated_bytes();
            self.private_ops.push((op, self.num_docs));
        }
    }

    /// Append a staged document. Returns its doc id inside the buffer.
    pub fn add(&mut self, staged: StagedDocument) -> u32 {
        let doc = self.num_docs;
        let mut stored = Vec::new();
        for field in staged.fields {
            self.field_infos.add(
                &field.name,
                field.number,
                field.indexed,
                field.stored.is_some(),
                field.doc_value.as_ref().map_or(DocValuesType::None, |(kind, _)| *kind),
            );
            if !field.terms.is_empty() {
                let terms = self.postings.entry(field.name.clone()).or_default();
                for term in field.terms {
                    let docs = terms.entry(term).or_default();
                    if docs.last() != Some(&doc) {
                        docs.push(doc);
                    }
                }
            }
            if let Some((kind, value)) = field.doc_value {
                if let Some(column) = self.doc_value_column(&field.name, kind) {
                    column.pad_to(doc as usize);
                    push_value(column, value);
                }
            }
            if let Some(value) = field.stored {
                stored.push(StoredField {
                    name: field.name,
                    value,
                });
            }
        }
        self.stored.push(stored);
        self.num_docs += 1;
        self.bytes_used += staged.bytes;
        doc
    }

    fn doc_value_column(&mut self, field: &str, kind: DocValuesType) -> Option<&mut DocValuesColumn> {
        if !self.doc_values.contains_key(field) {
            let column = DocValuesColumn::empty(kind, 0)?;
            self.doc_values.insert(field.to_string(), column);
        }
        self.doc_values.get_mut(field)
    }

    /// Write the buffer as segment `segment`.
    ///
    /// `slice_ops` are the operations sequenced after the last buffered
    /// document; they apply to every document. Returns `None` when every
    /// document ended up deleted, in which case nothing stays on disk.
    /// On failure every file of the segment is removed again.
    pub fn flush(
        self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        segment: &str,
        slice_ops: Vec<Arc<BufferedOp>>,
    ) -> Result<Option<FlushedSegment>> {
        let start = Instant::now();
        let id = self.id;
        match self.write(storage, codec, segment, slice_ops) {
            Ok(flushed) => {
                debug!("buffer {id} flushed as {segment} in {:?}", start.elapsed());
                Ok(flushed)
            }
            Err(e) => {
                warn!("flush of buffer {id} as {segment} failed: {e}");
                remove_segment_files(storage, segment);
                Err(e)
            }
        }
    }

    fn write(
        mut self,
        storage: &dyn Storage,
        codec: &dyn Codec,
        segment: &str,
        slice_ops: Vec<Arc<BufferedOp>>,
    ) -> Result<Option<FlushedSegment>> {
        self.add_ops(slice_ops);
        let max_doc = self.num_docs;
        for column in self.doc_values.values_mut() {
            column.pad_to(max_doc as usize);
        }
        let mut data = SegmentData {
            max_doc,
            postings: std::mem::take(&mut self.postings),
            stored: std::mem::take(&mut self.stored),
            doc_values: std::mem::take(&mut self.doc_values),
        };
        let live = apply_private_ops(&mut data, &self.private_ops)?;
        let deleted = live.as_ref().map_or(0, |l| l.num_deleted());
        if deleted == max_doc {
            debug!("all {max_doc} docs of {segment} deleted before flush, dropping it");
            return Ok(None);
        }

        let mut files = codec.write_segment(storage, segment, &data)?;
        let mut size_in_bytes = 0;
        for file in &files {
            size_in_bytes += storage.file_size(file)?;
        }
        files.push(SegmentInfo::file_name(segment));

        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(SOURCE_DIAGNOSTIC.to_string(), "flush".to_string());
        diagnostics.insert(TIMESTAMP_DIAGNOSTIC.to_string(), chrono::Utc::now().to_rfc3339());
        let info = SegmentInfo {
            name: segment.to_string(),
            max_doc,
            codec_name: codec.name().to_string(),
            codec_version: codec.format_version(),
            id: uuid::Uuid::new_v4(),
            diagnostics,
            field_infos: self.field_infos,
            files,
            size_in_bytes,
        };
        info.write(storage)?;

        let mut commit_info = SegmentCommitInfo::new(Arc::new(info));
        if let Some(live) = live.filter(|l| l.num_deleted() > 0) {
            let name = generation_file_name(segment, commit_info.next_write_del_gen(), LIVE_DOCS_EXTENSION);
            live.write(storage, &name)?;
            commit_info.advance_del_gen(live.num_deleted());
        }
        Ok(Some(FlushedSegment { segment: commit_info }))
    }
}

fn push_value(column: &mut DocValuesColumn, value: StagedValue) {
    match (column, value) {
        (DocValuesColumn::Numeric(v), StagedValue::Numeric(x)) => v.push(Some(x)),
        (DocValuesColumn::Binary(v) | DocValuesColumn::Sorted(v), StagedValue::Bytes(b)) => v.push(Some(b)),
        (column, _) => column.push_missing(),
    }
}

/// Resolve buffered operations against the documents of the buffer.
///
/// Deletes are resolved first, then updates are applied in order to the
/// documents still live. Returns the live docs if anything was deleted.
fn apply_private_ops(data: &mut SegmentData, ops: &[(Arc<BufferedOp>, u32)]) -> Result<Option<LiveDocs>> {
    let mut live: Option<LiveDocs> = None;
    for (op, upto) in ops {
        let doomed: Vec<u32> = match op.as_ref() {
            BufferedOp::DeleteTerm(term) => data.docs(term).iter().copied().filter(|d| d < upto).collect(),
            BufferedOp::DeleteQuery(query) => query.matching_docs(&*data, *upto),
            BufferedOp::Update(_) => continue,
        };
        for doc in doomed {
            live.get_or_insert_with(|| LiveDocs::all_live(data.max_doc)).delete(doc);
        }
    }

    for (op, upto) in ops {
        let BufferedOp::Update(updates) = op.as_ref() else {
            continue;
        };
        for update in updates {
            let docs: Vec<u32> = data
                .docs(&update.term)
                .iter()
                .copied()
                .filter(|d| d < upto && live.as_ref().is_none_or(|l| l.is_live(*d)))
                .collect();
            if docs.is_empty() {
                continue;
            }
            if !data.doc_values.contains_key(&update.field) {
                let Some(column) = DocValuesColumn::empty(update.value.kind(), data.max_doc) else {
                    continue;
                };
                data.doc_values.insert(update.field.clone(), column);
            }
            if let Some(column) = data.doc_values.get_mut(&update.field) {
                for doc in docs {
                    column.set(doc, &update.value)?;
                }
            }
        }
    }
    Ok(live)
}

/// Best-effort removal of every file belonging to `segment`.
pub(crate) fn remove_segment_files(storage: &dyn Storage, segment: &str) {
    let files = match storage.list_files() {
        Ok(files) => files,
        Err(e) => {
            warn!("cannot list files to clean up {segment}: {e}");
            return;
        }
    };
    for file in files.iter().filter(|f| parse_segment_name(f) == Some(segment)) {
        if let Err(e) = storage.delete_file(file) {
            warn!("cannot remove {file}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{StandardAnalyzer, Token, TokenStream};
    use crate::document::{Field, FieldType};
    use crate::index::codec::StandardCodec;
    use crate::index::doc_values::DocValuesUpdate;
    use crate::index::query::Query;
    use crate::index::segment_reader::SegmentReader;
    use crate::index::term::Term;
    use crate::index::codec::CodecRegistry;
    use crate::storage::memory::MemoryStorage;

    fn doc(id: &str, val: i64) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_text("body", "the quick brown fox")
            .add_numeric_doc_values("val", val)
            .build()
    }

    fn buffer_with(docs: &[(&str, i64)], numbers: &FieldNumbers) -> DocumentsWriterPerThread {
        let mut dwpt = DocumentsWriterPerThread::new(1);
        for (id, val) in docs {
            dwpt.add(stage_document(&doc(id, *val), &StandardAnalyzer, numbers).unwrap());
        }
        dwpt
    }

    #[derive(Debug)]
    struct FailingAnalyzer;

    impl Analyzer for FailingAnalyzer {
        fn analyze(&self, _field: &str, _text: &str) -> Result<TokenStream> {
            let tokens = vec![
                Ok(Token::new("ok", 0, 2)),
                Err(HalberdError::storage("tokenizer blew up")),
            ];
            Ok(Box::new(tokens.into_iter()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[derive(Debug)]
    struct HugeGapAnalyzer;

    impl Analyzer for HugeGapAnalyzer {
        fn analyze(&self, _field: &str, _text: &str) -> Result<TokenStream> {
            let tokens = vec![
                Ok(Token::new("a", 0, 1)),
                Ok(Token::new("b", 2, 3).with_position_increment(MAX_POSITION + 1)),
            ];
            Ok(Box::new(tokens.into_iter()))
        }

        fn name(&self) -> &'static str {
            "huge-gap"
        }
    }

    #[test]
    fn test_analyzer_failure_is_per_document() {
        let numbers = FieldNumbers::new();
        let err = stage_document(&doc("a", 1), &FailingAnalyzer, &numbers).unwrap_err();
        assert!(matches!(err, HalberdError::Analysis(_)));
        assert!(err.is_per_document());
        // nothing registered for the failed document
        assert!(numbers.is_empty());
    }

    #[test]
    fn test_position_overflow_fails_document() {
        let numbers = FieldNumbers::new();
        let err = stage_document(&doc("a", 1), &HugeGapAnalyzer, &numbers).unwrap_err();
        assert!(matches!(err, HalberdError::IllegalArgument(_)));
    }

    #[test]
    fn test_doc_values_type_change_fails_document() {
        let numbers = FieldNumbers::new();
        stage_document(&doc("a", 1), &StandardAnalyzer, &numbers).unwrap();
        let bad = Document::builder().add_binary_doc_values("val", b"x".to_vec()).build();
        let err = stage_document(&bad, &StandardAnalyzer, &numbers).unwrap_err();
        assert!(err.is_per_document());
        assert_eq!(numbers.doc_values_type("val"), Some(DocValuesType::Numeric));
    }

    #[test]
    fn test_duplicate_doc_values_field_fails_document() {
        let numbers = FieldNumbers::new();
        let bad = Document::builder()
            .add_numeric_doc_values("val", 1)
            .add_numeric_doc_values("val", 2)
            .build();
        assert!(stage_document(&bad, &StandardAnalyzer, &numbers).is_err());

        let wrong_kind = Document::builder()
            .add_field(Field::new("n", FieldValue::Keyword("x".into()), FieldType::doc_values(DocValuesType::Numeric)))
            .build();
        assert!(stage_document(&wrong_kind, &StandardAnalyzer, &numbers).is_err());
    }

    #[test]
    fn test_flush_writes_a_readable_segment() {
        let storage = MemoryStorage::new_default();
        let numbers = FieldNumbers::new();
        let dwpt = buffer_with(&[("doc-0", 1), ("doc-1", 2), ("doc-2", 3)], &numbers);
        assert_eq!(dwpt.num_docs(), 3);

        let flushed = dwpt.flush(&storage, &StandardCodec, "_0", Vec::new()).unwrap().unwrap();
        assert_eq!(flushed.segment.max_doc(), 3);
        assert!(!flushed.segment.has_deletions());
        assert_eq!(
            flushed.segment.info.diagnostics.get(SOURCE_DIAGNOSTIC).map(String::as_str),
            Some("flush")
        );

        let reader = SegmentReader::open(&storage, &CodecRegistry::default(), &flushed.segment).unwrap();
        assert_eq!(reader.numeric_value("val", 2), Some(3));
        assert_eq!(reader.term_docs(&Term::new("body", "fox")), vec![0, 1, 2]);
    }

    #[test]
    fn test_ops_only_touch_earlier_documents() {
        let storage = MemoryStorage::new_default();
        let numbers = FieldNumbers::new();
        let mut dwpt = DocumentsWriterPerThread::new(1);
        dwpt.add(stage_document(&doc("dup", 1), &StandardAnalyzer, &numbers).unwrap());
        // update-document: the delete is sequenced before the new copy
        dwpt.add_ops(vec![Arc::new(BufferedOp::DeleteTerm(Term::new("id", "dup")))]);
        dwpt.add(stage_document(&doc("dup", 2), &StandardAnalyzer, &numbers).unwrap());

        let update = BufferedOp::Update(vec![DocValuesUpdate::numeric(Term::new("id", "dup"), "val", Some(9))]);
        let flushed = dwpt
            .flush(&storage, &StandardCodec, "_0", vec![Arc::new(update)])
            .unwrap()
            .unwrap();
        assert_eq!(flushed.segment.del_count(), 1);
        assert!(flushed.segment.files().contains(&"_0_1.liv".to_string()));

        let reader = SegmentReader::open(&storage, &CodecRegistry::default(), &flushed.segment).unwrap();
        assert!(!reader.is_live(0));
        assert!(reader.is_live(1));
        assert_eq!(reader.numeric_value("val", 1), Some(9));
    }

    #[test]
    fn test_delete_wins_inside_buffer() {
        let storage = MemoryStorage::new_default();
        let numbers = FieldNumbers::new();
        let dwpt = buffer_with(&[("doc-0", 1), ("doc-1", 2)], &numbers);
        let ops = vec![
            Arc::new(BufferedOp::Update(vec![DocValuesUpdate::numeric(Term::new("id", "doc-1"), "val", Some(7))])),
            Arc::new(BufferedOp::DeleteQuery(Query::NumericRange {
                field: "val".to_string(),
                lower: Some(2),
                upper: Some(2),
            })),
        ];
        let flushed = dwpt.flush(&storage, &StandardCodec, "_0", ops).unwrap().unwrap();
        let reader = SegmentReader::open(&storage, &CodecRegistry::default(), &flushed.segment).unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert!(!reader.is_live(1));
    }

    #[test]
    fn test_fully_deleted_buffer_writes_nothing() {
        let storage = MemoryStorage::new_default();
        let numbers = FieldNumbers::new();
        let dwpt = buffer_with(&[("doc-0", 1)], &numbers);
        let ops = vec![Arc::new(BufferedOp::DeleteTerm(Term::new("id", "doc-0")))];
        assert!(dwpt.flush(&storage, &StandardCodec, "_0", ops).unwrap().is_none());
        assert_eq!(storage.file_count(), 0);
    }
}
