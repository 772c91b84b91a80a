//! Per-segment readers.
//!
//! A [`SegmentReader`] is a point-in-time view of one segment: the decoded
//! base files (shared through an `Arc<SegmentCore>` between every reader of
//! the same segment) plus the live docs and doc-values overlays of one
//! generation. Newer generations never change an open reader.
//!
//! Readers carry an explicit reference count. The files a reader pins are
//! released back to the writer's file deleter exactly once, when the count
//! drops to zero (or when the reader is dropped while still counted).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::error::{HalberdError, Result};
use crate::index::codec::{CodecRegistry, SegmentData, StoredField};
use crate::index::doc_values::{DOC_VALUES_UPDATE_MAGIC, DocValuesColumn, read_columns};
use crate::index::file_deleter::IndexFileDeleter;
use crate::index::live_docs::LiveDocs;
use crate::index::query::QueryTarget;
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::index::term::Term;
use crate::storage::Storage;

/// Decoded base files of one segment. Immutable.
#[derive(Debug)]
pub struct SegmentCore {
    pub info: Arc<SegmentInfo>,
    pub data: SegmentData,
}

impl SegmentCore {
    /// Decode the base files of `info` with the codec it was written by.
    pub fn load(storage: &dyn Storage, registry: &CodecRegistry, info: Arc<SegmentInfo>) -> Result<Self> {
        let codec = registry.resolve(&info.name, &info.codec_name, info.codec_version)?;
        let data = codec.read_segment(storage, &info.name, info.max_doc)?;
        debug!("loaded core of {} ({} docs)", info.name, info.max_doc);
        Ok(SegmentCore { info, data })
    }
}

/// Live docs and doc-values overrides of one overlay generation.
#[derive(Debug, Default)]
pub(crate) struct SegmentOverlays {
    pub live_docs: Option<LiveDocs>,
    pub doc_values: BTreeMap<String, DocValuesColumn>,
}

/// Read the overlay files `segment` currently references.
pub(crate) fn load_overlays(storage: &dyn Storage, segment: &SegmentCommitInfo) -> Result<SegmentOverlays> {
    let live_docs = match segment.live_docs_file_name() {
        Some(name) => Some(LiveDocs::read(storage, &name, segment.max_doc(), segment.del_count())?),
        None => None,
    };

    let mut doc_values = BTreeMap::new();
    for (generation, fields) in segment.doc_values_generations() {
        let name = segment.doc_values_update_file_name(generation);
        let mut columns = read_columns(storage, &name, DOC_VALUES_UPDATE_MAGIC, segment.max_doc())?;
        for field in fields {
            let column = columns
                .remove(&field)
                .ok_or_else(|| HalberdError::corruption(&name, format!("missing column {field}")))?;
            doc_values.insert(field, column);
        }
    }

    Ok(SegmentOverlays { live_docs, doc_values })
}

/// Base data plus doc-values overrides, as seen by delete queries.
pub(crate) struct SegmentView<'a> {
    pub data: &'a SegmentData,
    pub overrides: &'a BTreeMap<String, Arc<DocValuesColumn>>,
}

impl QueryTarget for SegmentView<'_> {
    fn max_doc(&self) -> u32 {
        self.data.max_doc
    }

    fn term_docs(&self, term: &Term) -> &[u32] {
        self.data.docs(term)
    }

    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        match self.overrides.get(field) {
            Some(column) => column.numeric(doc),
            None => self.data.numeric_value(field, doc),
        }
    }
}

/// Files pinned in the writer's deleter on behalf of a reader.
#[derive(Debug)]
pub(crate) struct FileRefs {
    deleter: Weak<Mutex<IndexFileDeleter>>,
    files: Vec<String>,
}

impl FileRefs {
    pub(crate) fn acquire(deleter: &Arc<Mutex<IndexFileDeleter>>, files: Vec<String>) -> Self {
        deleter.lock().inc_ref(&files);
        FileRefs {
            deleter: Arc::downgrade(deleter),
            files,
        }
    }

    fn release(self) {
        if let Some(deleter) = self.deleter.upgrade() {
            deleter.lock().dec_ref(&self.files);
        }
    }
}

/// A reference-counted view of one segment at one overlay generation.
#[derive(Debug)]
pub struct SegmentReader {
    core: Arc<SegmentCore>,
    commit_info: SegmentCommitInfo,
    live_docs: Option<Arc<LiveDocs>>,
    num_docs: u32,
    doc_values: BTreeMap<String, Arc<DocValuesColumn>>,
    ref_count: AtomicUsize,
    file_refs: Mutex<Option<FileRefs>>,
}

impl SegmentReader {
    /// Open `segment` as recorded in a commit.
    pub fn open(storage: &dyn Storage, registry: &CodecRegistry, segment: &SegmentCommitInfo) -> Result<Self> {
        let core = Arc::new(SegmentCore::load(storage, registry, Arc::clone(&segment.info))?);
        Self::with_core(storage, core, segment)
    }

    /// Open a newer generation of the same segment, sharing its core.
    pub fn reopen(&self, storage: &dyn Storage, segment: &SegmentCommitInfo) -> Result<Self> {
        if segment.info.id != self.core.info.id {
            return Err(HalberdError::invalid_operation(format!(
                "cannot reopen {} as a different segment {}",
                self.core.info.name,
                segment.name()
            )));
        }
        Self::with_core(storage, Arc::clone(&self.core), segment)
    }

    fn with_core(storage: &dyn Storage, core: Arc<SegmentCore>, segment: &SegmentCommitInfo) -> Result<Self> {
        let overlays = load_overlays(storage, segment)?;
        let doc_values = overlays
            .doc_values
            .into_iter()
            .map(|(field, column)| (field, Arc::new(column)))
            .collect();
        Ok(Self::from_parts(
            core,
            segment.clone(),
            overlays.live_docs.map(Arc::new),
            doc_values,
        ))
    }

    pub(crate) fn from_parts(
        core: Arc<SegmentCore>,
        commit_info: SegmentCommitInfo,
        live_docs: Option<Arc<LiveDocs>>,
        doc_values: BTreeMap<String, Arc<DocValuesColumn>>,
    ) -> Self {
        let num_docs = live_docs
            .as_ref()
            .map_or(commit_info.max_doc(), |live| live.num_live());
        SegmentReader {
            core,
            commit_info,
            live_docs,
            num_docs,
            doc_values,
            ref_count: AtomicUsize::new(1),
            file_refs: Mutex::new(None),
        }
    }

    /// Pin the files of this reader's generation until the last reference goes.
    pub(crate) fn pin_files(&self, deleter: &Arc<Mutex<IndexFileDeleter>>) {
        let refs = FileRefs::acquire(deleter, self.commit_info.files());
        if let Some(previous) = self.file_refs.lock().replace(refs) {
            previous.release();
        }
    }

    pub fn name(&self) -> &str {
        self.commit_info.name()
    }

    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    /// Catalog entry this reader was opened against.
    pub fn commit_info(&self) -> &SegmentCommitInfo {
        &self.commit_info
    }

    pub fn max_doc(&self) -> u32 {
        self.core.info.max_doc
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc() - self.num_docs
    }

    /// Live docs bitmap; `None` means every document is live.
    pub fn live_docs(&self) -> Option<&Arc<LiveDocs>> {
        self.live_docs.as_ref()
    }

    pub fn is_live(&self, doc: u32) -> bool {
        doc < self.max_doc() && self.live_docs.as_ref().is_none_or(|live| live.is_live(doc))
    }

    /// Column of `field` as of this reader's generation.
    pub fn doc_values(&self, field: &str) -> Option<&DocValuesColumn> {
        match self.doc_values.get(field) {
            Some(column) => Some(column.as_ref()),
            None => self.core.data.doc_values.get(field),
        }
    }

    /// Numeric value of `field` for `doc`, ignoring deletions.
    pub fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        self.doc_values(field).and_then(|column| column.numeric(doc))
    }

    /// Binary value of `field` for `doc`, ignoring deletions.
    pub fn binary_value(&self, field: &str, doc: u32) -> Option<&[u8]> {
        self.doc_values(field).and_then(|column| column.binary(doc))
    }

    /// Live documents containing `term`.
    pub fn term_docs(&self, term: &Term) -> Vec<u32> {
        self.core
            .data
            .docs(term)
            .iter()
            .copied()
            .filter(|&doc| self.is_live(doc))
            .collect()
    }

    /// Stored fields of `doc`.
    pub fn stored_fields(&self, doc: u32) -> Result<&[StoredField]> {
        if doc >= self.max_doc() {
            return Err(HalberdError::invalid_argument(format!(
                "doc {doc} out of range for segment {} with {} docs",
                self.name(),
                self.max_doc()
            )));
        }
        Ok(self.core.data.stored_fields(doc))
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.ref_count() == 0 {
            return Err(HalberdError::already_closed(format!("segment reader {}", self.name())));
        }
        Ok(())
    }

    /// Add a reference. Fails once the reader is closed.
    pub fn inc_ref(&self) -> Result<()> {
        if self.try_inc_ref() {
            Ok(())
        } else {
            Err(HalberdError::already_closed(format!("segment reader {}", self.name())))
        }
    }

    /// Add a reference unless the reader is already closed.
    pub fn try_inc_ref(&self) -> bool {
        let mut count = self.ref_count.load(Ordering::SeqCst);
        while count > 0 {
            match self
                .ref_count
                .compare_exchange(count, count + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
        false
    }

    /// Drop a reference; the last one releases the pinned files.
    pub fn dec_ref(&self) -> Result<()> {
        let mut count = self.ref_count.load(Ordering::SeqCst);
        loop {
            if count == 0 {
                return Err(HalberdError::already_closed(format!(
                    "segment reader {} was released too many times",
                    self.name()
                )));
            }
            match self
                .ref_count
                .compare_exchange(count, count - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        if count == 1 {
            debug!("segment reader {} closed", self.name());
            if let Some(refs) = self.file_refs.lock().take() {
                refs.release();
            }
        }
        Ok(())
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if let Some(refs) = self.file_refs.get_mut().take() {
            refs.release();
        }
    }
}
