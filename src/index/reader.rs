//! Read-side capabilities shared by segment and composite readers.
//!
//! [`Reader`] is the closed set of reader shapes: one segment, or an ordered
//! composite whose doc ids are the concatenation of its children's. The
//! cross-cutting operations live in the [`LiveDocsAccess`] and
//! [`DocValuesAccess`] traits, implemented by [`SegmentReader`], [`Reader`]
//! and [`DirectoryReader`](crate::index::directory_reader::DirectoryReader).

use std::sync::Arc;

use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;

/// Which documents are live.
pub trait LiveDocsAccess {
    /// Document slots, deleted ones included.
    fn max_doc(&self) -> u32;

    fn num_docs(&self) -> u32;

    fn is_live(&self, doc: u32) -> bool;

    fn num_deleted_docs(&self) -> u32 {
        self.max_doc() - self.num_docs()
    }

    fn has_deletions(&self) -> bool {
        self.num_deleted_docs() > 0
    }

    /// Ids of every live document, ascending.
    fn live_doc_ids(&self) -> Vec<u32> {
        (0..self.max_doc()).filter(|&doc| self.is_live(doc)).collect()
    }
}

/// Per-document doc-values lookup by field.
///
/// Lookups do not consult live docs: a deleted document may still report
/// the value it had, so callers iterate live documents only.
pub trait DocValuesAccess {
    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64>;

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>>;
}

impl LiveDocsAccess for SegmentReader {
    fn max_doc(&self) -> u32 {
        SegmentReader::max_doc(self)
    }

    fn num_docs(&self) -> u32 {
        SegmentReader::num_docs(self)
    }

    fn is_live(&self, doc: u32) -> bool {
        SegmentReader::is_live(self, doc)
    }
}

impl DocValuesAccess for SegmentReader {
    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        SegmentReader::numeric_value(self, field, doc)
    }

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>> {
        SegmentReader::binary_value(self, field, doc).map(|b| b.to_vec())
    }
}

/// A segment reader or an ordered composite of readers.
///
/// A `Reader` is a view: it shares the segment readers but holds none of
/// their references; the reader it was taken from must stay open.
#[derive(Debug, Clone)]
pub enum Reader {
    Segment(Arc<SegmentReader>),
    Composite(Vec<Reader>),
}

impl Reader {
    /// Segment readers in doc id order.
    pub fn leaves(&self) -> Vec<Arc<SegmentReader>> {
        match self {
            Reader::Segment(segment) => vec![Arc::clone(segment)],
            Reader::Composite(children) => children.iter().flat_map(|c| c.leaves()).collect(),
        }
    }

    /// The segment holding `doc`, and the doc id within it.
    pub fn locate(&self, doc: u32) -> Option<(&Arc<SegmentReader>, u32)> {
        match self {
            Reader::Segment(segment) => (doc < segment.max_doc()).then_some((segment, doc)),
            Reader::Composite(children) => {
                let mut base = 0;
                for child in children {
                    let max_doc = child.max_doc();
                    if doc < base + max_doc {
                        return child.locate(doc - base);
                    }
                    base += max_doc;
                }
                None
            }
        }
    }

    /// Live documents containing `term`, as composite doc ids.
    pub fn term_docs(&self, term: &Term) -> Vec<u32> {
        match self {
            Reader::Segment(segment) => segment.term_docs(term),
            Reader::Composite(children) => {
                let mut docs = Vec::new();
                let mut base = 0;
                for child in children {
                    docs.extend(child.term_docs(term).into_iter().map(|d| d + base));
                    base += child.max_doc();
                }
                docs
            }
        }
    }
}

impl LiveDocsAccess for Reader {
    fn max_doc(&self) -> u32 {
        match self {
            Reader::Segment(segment) => segment.max_doc(),
            Reader::Composite(children) => children.iter().map(|c| c.max_doc()).sum(),
        }
    }

    fn num_docs(&self) -> u32 {
        match self {
            Reader::Segment(segment) => segment.num_docs(),
            Reader::Composite(children) => children.iter().map(|c| c.num_docs()).sum(),
        }
    }

    fn is_live(&self, doc: u32) -> bool {
        self.locate(doc).is_some_and(|(segment, local)| segment.is_live(local))
    }
}

impl DocValuesAccess for Reader {
    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        let (segment, local) = self.locate(doc)?;
        segment.numeric_value(field, local)
    }

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>> {
        let (segment, local) = self.locate(doc)?;
        segment.binary_value(field, local).map(|b| b.to_vec())
    }
}
