//! Point-in-time readers over a whole index.
//!
//! A [`DirectoryReader`] is opened either on a commit in storage or, near
//! real time, on the current in-memory state of an
//! [`IndexWriter`](crate::index::writer::IndexWriter). It holds one
//! reference on each of its segment readers and releases them when its own
//! reference count drops to zero.
//!
//! Reopening shares every segment reader whose segment did not change, and
//! shares the decoded core of segments that only gained new live-docs or
//! doc-values generations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::error::{HalberdError, Result};
use crate::index::codec::{CodecRegistry, StoredField};
use crate::index::file_deleter::IndexCommit;
use crate::index::file_names::last_commit_generation;
use crate::index::reader::{DocValuesAccess, LiveDocsAccess, Reader};
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;
use crate::index::writer::WriterInner;
use crate::storage::Storage;

pub struct DirectoryReader {
    storage: Arc<dyn Storage>,
    registry: Arc<CodecRegistry>,
    infos: SegmentInfos,
    segments: Vec<Arc<SegmentReader>>,
    /// Doc id base of each segment, plus the total at the end.
    starts: Vec<u32>,
    writer: Option<Weak<WriterInner>>,
    ref_count: AtomicUsize,
}

impl std::fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryReader")
            .field("generation", &self.infos.generation())
            .field("version", &self.infos.version())
            .field("segments", &self.segments.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("nrt", &self.writer.is_some())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl DirectoryReader {
    /// Open the latest commit, decoding segments with the built-in codecs.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        Self::open_with_registry(storage, Arc::new(CodecRegistry::default()))
    }

    pub fn open_with_registry(storage: Arc<dyn Storage>, registry: Arc<CodecRegistry>) -> Result<Self> {
        let infos = SegmentInfos::read_latest(storage.as_ref())?;
        Self::open_catalog(storage, registry, infos, None)
    }

    /// Open one specific commit, as listed by
    /// [`list_commits`](crate::index::file_deleter::list_commits).
    pub fn open_commit(storage: Arc<dyn Storage>, registry: Arc<CodecRegistry>, commit: &IndexCommit) -> Result<Self> {
        let infos = SegmentInfos::read_commit(storage.as_ref(), &commit.segments_file)?;
        Self::open_infos(storage, registry, infos, None)
    }

    /// Open the commit `infos` was read from. When a newer commit deleted
    /// segment files of that commit before they were loaded, move on to the
    /// newest commit and try again.
    fn open_catalog(
        storage: Arc<dyn Storage>,
        registry: Arc<CodecRegistry>,
        mut infos: SegmentInfos,
        previous: Option<&DirectoryReader>,
    ) -> Result<Self> {
        loop {
            let generation = infos.generation();
            let err = match Self::open_infos(Arc::clone(&storage), Arc::clone(&registry), infos, previous) {
                Ok(reader) => return Ok(reader),
                Err(e) if e.is_not_found() => e,
                Err(e) => return Err(e),
            };
            if last_commit_generation(&storage.list_files()?) <= generation {
                return Err(err);
            }
            infos = SegmentInfos::read_latest(storage.as_ref())?;
            if infos.generation() <= generation {
                return Err(err);
            }
            debug!(
                "commit {:?} was replaced while opening ({err}), retrying on {:?}",
                generation,
                infos.generation()
            );
        }
    }

    /// Open `infos`, reusing the segment readers of `previous` where possible.
    fn open_infos(
        storage: Arc<dyn Storage>,
        registry: Arc<CodecRegistry>,
        infos: SegmentInfos,
        previous: Option<&DirectoryReader>,
    ) -> Result<Self> {
        let old: HashMap<&str, &Arc<SegmentReader>> = previous
            .map(|p| p.segments.iter().map(|s| (s.name(), s)).collect())
            .unwrap_or_default();

        let mut segments: Vec<Arc<SegmentReader>> = Vec::with_capacity(infos.len());
        for segment in infos.segments() {
            let opened = match old.get(segment.name()) {
                Some(reader) if reader.commit_info().same_generations(segment) => {
                    reader.inc_ref().map(|()| Arc::clone(reader))
                }
                Some(reader) if reader.commit_info().info.id == segment.info.id => {
                    reader.reopen(storage.as_ref(), segment).map(Arc::new)
                }
                _ => SegmentReader::open(storage.as_ref(), &registry, segment).map(Arc::new),
            };
            match opened {
                Ok(reader) => segments.push(reader),
                Err(e) => {
                    release_all(&segments);
                    return Err(e);
                }
            }
        }
        debug!(
            "opened reader on generation {:?} with {} segments",
            infos.generation(),
            segments.len()
        );
        Ok(Self::from_parts(storage, registry, infos, segments, None))
    }

    /// Assemble a reader that owns one reference on each of `segments`.
    pub(crate) fn from_parts(
        storage: Arc<dyn Storage>,
        registry: Arc<CodecRegistry>,
        infos: SegmentInfos,
        segments: Vec<Arc<SegmentReader>>,
        writer: Option<Weak<WriterInner>>,
    ) -> Self {
        let mut starts = Vec::with_capacity(segments.len() + 1);
        let mut base = 0u32;
        for segment in &segments {
            starts.push(base);
            base += segment.max_doc();
        }
        starts.push(base);
        DirectoryReader {
            storage,
            registry,
            infos,
            segments,
            starts,
            writer,
            ref_count: AtomicUsize::new(1),
        }
    }

    /// A new reader if the index changed since this one was opened, `None`
    /// otherwise. A near-real-time reader reopens on its writer.
    pub fn open_if_changed(&self) -> Result<Option<DirectoryReader>> {
        self.ensure_open()?;
        if self.is_current()? {
            return Ok(None);
        }
        if let Some(writer) = &self.writer {
            let writer = writer
                .upgrade()
                .ok_or_else(|| HalberdError::already_closed("the writer of this reader was closed"))?;
            return WriterInner::open_nrt_reader(&writer).map(Some);
        }
        let infos = SegmentInfos::read_latest(self.storage.as_ref())?;
        if infos.generation() == self.infos.generation() {
            return Ok(None);
        }
        Self::open_catalog(Arc::clone(&self.storage), Arc::clone(&self.registry), infos, Some(self)).map(Some)
    }

    /// Whether this reader still shows the latest commit, or for a
    /// near-real-time reader, the writer's current state.
    pub fn is_current(&self) -> Result<bool> {
        self.ensure_open()?;
        if let Some(writer) = &self.writer {
            return match writer.upgrade() {
                Some(writer) => writer.nrt_is_current(self.infos.version()),
                None => Ok(false),
            };
        }
        let files = self.storage.list_files()?;
        Ok(last_commit_generation(&files) == self.infos.generation())
    }

    pub fn is_near_real_time(&self) -> bool {
        self.writer.is_some()
    }

    /// Commit generation this reader was opened on. A near-real-time reader
    /// reports the last commit its writer knew about.
    pub fn generation(&self) -> Option<u64> {
        self.infos.generation()
    }

    pub fn version(&self) -> u64 {
        self.infos.version()
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        self.infos.user_data()
    }

    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.infos
    }

    /// Segment readers in doc id order.
    pub fn leaves(&self) -> &[Arc<SegmentReader>] {
        &self.segments
    }

    /// Composite view over the segment readers.
    pub fn as_reader(&self) -> Reader {
        Reader::Composite(self.segments.iter().map(|s| Reader::Segment(Arc::clone(s))).collect())
    }

    /// Segment index and local doc id of global `doc`.
    pub fn resolve(&self, doc: u32) -> Option<(usize, u32)> {
        if doc >= self.max_doc() {
            return None;
        }
        let index = self.starts.partition_point(|&start| start <= doc) - 1;
        Some((index, doc - self.starts[index]))
    }

    /// Live documents containing `term`, as global doc ids.
    pub fn term_docs(&self, term: &Term) -> Vec<u32> {
        self.segments
            .iter()
            .zip(&self.starts)
            .flat_map(|(segment, &base)| segment.term_docs(term).into_iter().map(move |d| d + base))
            .collect()
    }

    pub fn stored_fields(&self, doc: u32) -> Result<&[StoredField]> {
        let (index, local) = self
            .resolve(doc)
            .ok_or_else(|| HalberdError::invalid_argument(format!("doc {doc} out of range")))?;
        self.segments[index].stored_fields(local)
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ref_count() == 0 {
            return Err(HalberdError::already_closed("directory reader is closed"));
        }
        Ok(())
    }

    pub fn inc_ref(&self) -> Result<()> {
        if self.try_inc_ref() {
            Ok(())
        } else {
            Err(HalberdError::already_closed("directory reader is closed"))
        }
    }

    /// Take a reference unless the reader is already closed.
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

    /// Drop a reference. The last one releases every segment reader.
    pub fn dec_ref(&self) -> Result<()> {
        let mut count = self.ref_count.load(Ordering::SeqCst);
        loop {
            if count == 0 {
                return Err(HalberdError::already_closed("directory reader was released too many times"));
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
            release_all(&self.segments);
        }
        Ok(())
    }

    /// Drop the reference taken at open.
    pub fn close(&self) -> Result<()> {
        self.dec_ref()
    }
}

fn release_all(segments: &[Arc<SegmentReader>]) {
    for segment in segments {
        if let Err(e) = segment.dec_ref() {
            warn!("releasing segment reader {}: {e}", segment.name());
        }
    }
}

impl Drop for DirectoryReader {
    fn drop(&mut self) {
        if self.ref_count() > 0 {
            release_all(&self.segments);
        }
    }
}

impl LiveDocsAccess for DirectoryReader {
    fn max_doc(&self) -> u32 {
        self.starts.last().copied().unwrap_or(0)
    }

    fn num_docs(&self) -> u32 {
        self.segments.iter().map(|s| s.num_docs()).sum()
    }

    fn is_live(&self, doc: u32) -> bool {
        self.resolve(doc)
            .is_some_and(|(index, local)| self.segments[index].is_live(local))
    }
}

impl DocValuesAccess for DirectoryReader {
    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        let (index, local) = self.resolve(doc)?;
        self.segments[index].numeric_value(field, local)
    }

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>> {
        let (index, local) = self.resolve(doc)?;
        self.segments[index].binary_value(field, local).map(|b| b.to_vec())
    }
}
