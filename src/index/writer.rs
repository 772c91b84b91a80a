//! The index writer.
//!
//! [`IndexWriter`] is the single mutating entry point of an index. It owns
//! the write lock of its storage and coordinates the mutation buffer, the
//! resolution of buffered deletes and updates, merges and the two-phase
//! commit over one in-memory segment catalog.
//!
//! Internal locks are always taken in the order commit, state, file deleter.
//! The catalog, the reader pool and the stream of frozen update packets live
//! together under the state lock; flushing segments and running merges
//! happen outside of it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{HalberdError, Result};
use crate::index::buffered_updates::BufferedUpdatesStream;
use crate::index::commit::{self, CommitPhase, CommitState, PendingCommit};
use crate::index::config::{IndexWriterConfig, OpenMode};
use crate::index::delete_queue::BufferedOp;
use crate::index::directory_reader::DirectoryReader;
use crate::index::doc_values::{DocValue, DocValuesUpdate};
use crate::index::doc_writer::{DocumentsWriter, SegmentNamer};
use crate::index::field_infos::FieldNumbers;
use crate::index::file_deleter::IndexFileDeleter;
use crate::index::file_names::{last_commit_generation, WRITE_LOCK_NAME};
use crate::index::flush_control::FlushStats;
use crate::index::merge_policy::{
    MergeCandidate, MergeInventory, MergePolicy, MergeSegmentInfo, MergeTrigger, OneMerge,
};
use crate::index::merge_scheduler::MergeSource;
use crate::index::merger::{MergedSegment, SegmentMerger};
use crate::index::query::Query;
use crate::index::reader_pool::{ReaderPool, ReadersAndUpdates};
use crate::index::segment_infos::SegmentInfos;
use crate::index::term::Term;
use crate::storage::{Storage, StorageLock};

const MERGE_WAIT: Duration = Duration::from_millis(100);

/// Point-in-time statistics of a writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexWriterStats {
    pub num_docs: u64,
    pub max_doc: u64,
    pub segment_count: usize,
    pub docs_in_ram: usize,
    pub pending_packets: usize,
    pub pending_ops: usize,
    pub pending_merges: usize,
    pub running_merges: usize,
    pub merges_completed: u64,
    pub merges_failed: u64,
    pub docs_merged: u64,
    pub commits: u64,
    pub last_commit_generation: Option<u64>,
    /// Sequence number returned by the last `commit`, until the next one is prepared.
    pub last_commit_sequence_number: Option<u64>,
    pub last_sequence_number: u64,
    /// Documents rejected by analysis or an illegal value; they never became visible.
    pub docs_skipped: u64,
    pub commit_phase: CommitPhase,
    pub flush: FlushStats,
}

#[derive(Debug, Default)]
struct WriterCounters {
    commits: AtomicU64,
    merges_completed: AtomicU64,
    merges_failed: AtomicU64,
    docs_merged: AtomicU64,
    docs_skipped: AtomicU64,
}

/// Everything guarded by the state lock.
#[derive(Debug)]
struct WriterState {
    infos: SegmentInfos,
    pool: ReaderPool,
    stream: BufferedUpdatesStream,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: Vec<Arc<OneMerge>>,
    /// Catalog of the last successful commit; rollback restores it.
    last_committed: SegmentInfos,
    commit_data: BTreeMap<String, String>,
    change_count: u64,
    committed_change_count: u64,
    next_commit_generation: u64,
    stop_merges: bool,
}

impl WriterState {
    fn is_registered(&self, merge: &Arc<OneMerge>) -> bool {
        self.pending_merges.iter().any(|m| Arc::ptr_eq(m, merge))
            || self.running_merges.iter().any(|m| Arc::ptr_eq(m, merge))
    }

    fn has_merges(&self) -> bool {
        !self.pending_merges.is_empty() || !self.running_merges.is_empty()
    }
}

pub(crate) struct WriterInner {
    self_ref: Weak<WriterInner>,
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    field_numbers: Arc<FieldNumbers>,
    namer: Arc<SegmentNamer>,
    doc_writer: DocumentsWriter,
    deleter: Arc<Mutex<IndexFileDeleter>>,
    inventory: Arc<MergeInventory>,
    state: Mutex<WriterState>,
    merge_done: Condvar,
    commit: Mutex<CommitState>,
    next_merge_id: AtomicU64,
    closed: AtomicBool,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    counters: WriterCounters,
}

/// Adds, deletes and updates documents of one index.
///
/// Every mutating call returns the sequence number of the operation.
/// Changes become visible to near-real-time readers after [`reader`](Self::reader)
/// and durable after [`commit`](Self::commit). Dropping an open writer
/// rolls back uncommitted changes.
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("IndexWriter")
            .field("segments", &state.infos.len())
            .field("version", &state.infos.version())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer on `storage`, taking its write lock.
    pub fn open(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.validate()?;
        let mut lock = storage.obtain_lock(WRITE_LOCK_NAME)?;
        match open_inner(Arc::clone(&storage), config) {
            Ok(inner) => {
                *inner.write_lock.lock() = Some(lock);
                Ok(IndexWriter { inner })
            }
            Err(e) => {
                if let Err(release) = lock.release() {
                    warn!("releasing {WRITE_LOCK_NAME} after failed open: {release}");
                }
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Buffer a new document.
    pub fn add_document(&self, doc: &Document) -> Result<u64> {
        self.inner.write_document(doc, None)
    }

    /// Delete every document containing `term`, then add `doc`.
    pub fn update_document(&self, term: Term, doc: &Document) -> Result<u64> {
        self.inner.write_document(doc, Some(BufferedOp::DeleteTerm(term)))
    }

    pub fn delete_documents(&self, terms: Vec<Term>) -> Result<u64> {
        if terms.is_empty() {
            return Err(HalberdError::invalid_argument("delete_documents needs at least one term"));
        }
        self.inner
            .buffer_ops(terms.into_iter().map(BufferedOp::DeleteTerm).collect())
    }

    pub fn delete_documents_by_query(&self, queries: Vec<Query>) -> Result<u64> {
        if queries.is_empty() {
            return Err(HalberdError::invalid_argument("delete_documents_by_query needs at least one query"));
        }
        self.inner
            .buffer_ops(queries.into_iter().map(BufferedOp::DeleteQuery).collect())
    }

    /// Set `field` of every document containing `term`. `None` clears it.
    pub fn update_numeric_value(&self, term: Term, field: &str, value: Option<i64>) -> Result<u64> {
        self.update_doc_values(term, vec![(field.to_string(), DocValue::Numeric(value))])
    }

    pub fn update_binary_value(&self, term: Term, field: &str, value: Option<Vec<u8>>) -> Result<u64> {
        self.update_doc_values(term, vec![(field.to_string(), DocValue::Binary(value))])
    }

    /// Update several doc-values fields of the documents containing `term`
    /// as one operation.
    pub fn update_doc_values(&self, term: Term, updates: Vec<(String, DocValue)>) -> Result<u64> {
        self.inner.update_doc_values(term, updates)
    }

    /// Flush buffered documents into segments and resolve buffered deletes.
    pub fn flush(&self) -> Result<()> {
        self.inner.full_flush()?;
        self.inner.maybe_merge(MergeTrigger::FullFlush)
    }

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.maybe_merge(MergeTrigger::Explicit)
    }

    /// Merge until at most `max_num_segments` segments remain. Blocks until
    /// the merges finish and reports the root cause of a failed one.
    pub fn force_merge(&self, max_num_segments: usize) -> Result<()> {
        if max_num_segments == 0 {
            return Err(HalberdError::invalid_argument("max_num_segments must be at least 1"));
        }
        info!("force merge to {max_num_segments} segments");
        self.inner.force_merges(None, |policy, segments| {
            policy.find_forced_merges(segments, max_num_segments)
        })
    }

    /// Merge away every deleted document.
    pub fn force_merge_deletes(&self) -> Result<()> {
        info!("force merge deletes");
        self.inner
            .force_merges(Some(1), |policy, segments| policy.find_forced_deletes_merges(segments))
    }

    /// Block until no merge is pending or running.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.wait_for_merges()
    }

    /// Drop every document of the index. Takes effect on the next commit.
    pub fn delete_all(&self) -> Result<u64> {
        self.inner.delete_all()
    }

    /// First phase of a commit; see [`commit`](crate::index::commit).
    pub fn prepare_commit(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        let mut commit = self.inner.commit.lock();
        self.inner.prepare_commit(&mut commit)
    }

    /// Make every change durable, preparing the commit first if needed.
    /// Returns the last sequence number the commit covers.
    pub fn commit(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        let mut commit = self.inner.commit.lock();
        self.inner.commit_prepared(&mut commit)
    }

    /// Discard everything since the last commit and close the writer.
    pub fn rollback(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        self.inner.rollback()
    }

    /// Commit (if configured), wait for merges and release the write lock.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Open a near-real-time reader on the current state of this writer.
    pub fn reader(&self) -> Result<DirectoryReader> {
        WriterInner::open_nrt_reader(&self.inner)
    }

    /// Replace the user data stored with the next commit.
    pub fn set_live_commit_data(&self, data: BTreeMap<String, String>) {
        let mut state = self.inner.state.lock();
        state.commit_data = data;
        state.change_count += 1;
    }

    pub fn live_commit_data(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().commit_data.clone()
    }

    /// Live documents, buffered ones included. Deletes that are still
    /// buffered are not subtracted.
    pub fn num_docs(&self) -> u64 {
        let state = self.inner.state.lock();
        let flushed: u64 = state
            .infos
            .segments()
            .iter()
            .map(|s| {
                state
                    .pool
                    .entry(s.name())
                    .map_or(s.num_live(), |e| e.num_live()) as u64
            })
            .sum();
        flushed + self.inner.doc_writer.num_docs_in_ram() as u64
    }

    /// Document slots, buffered and deleted ones included.
    pub fn max_doc(&self) -> u64 {
        let state = self.inner.state.lock();
        state.infos.total_max_doc() + self.inner.doc_writer.num_docs_in_ram() as u64
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().infos.len()
    }

    /// Names of the flushed segments in catalog order.
    pub fn segment_names(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.infos.segments().iter().map(|s| s.name().to_string()).collect()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        let state = self.inner.state.lock();
        state.change_count != state.committed_change_count
            || self.inner.doc_writer.any_changes()
            || !state.stream.is_empty()
    }

    pub fn has_pending_merges(&self) -> bool {
        self.inner.state.lock().has_merges()
    }

    pub fn commit_phase(&self) -> CommitPhase {
        self.inner.commit.lock().phase()
    }

    pub fn stats(&self) -> IndexWriterStats {
        let (commit_phase, committed) = {
            let commit = self.inner.commit.lock();
            (commit.phase(), commit.committed())
        };
        let num_docs = self.num_docs();
        let inner = &self.inner;
        let state = inner.state.lock();
        IndexWriterStats {
            num_docs,
            max_doc: state.infos.total_max_doc() + inner.doc_writer.num_docs_in_ram() as u64,
            segment_count: state.infos.len(),
            docs_in_ram: inner.doc_writer.num_docs_in_ram(),
            pending_packets: state.stream.num_packets(),
            pending_ops: state.stream.num_ops(),
            pending_merges: state.pending_merges.len(),
            running_merges: state.running_merges.len(),
            merges_completed: inner.counters.merges_completed.load(Ordering::Relaxed),
            merges_failed: inner.counters.merges_failed.load(Ordering::Relaxed),
            docs_merged: inner.counters.docs_merged.load(Ordering::Relaxed),
            commits: inner.counters.commits.load(Ordering::Relaxed),
            last_commit_generation: match committed {
                Some((generation, _)) => generation,
                None => state.last_committed.generation(),
            },
            last_commit_sequence_number: committed.map(|(_, seq_no)| seq_no),
            last_sequence_number: inner.doc_writer.queue().last_sequence_number(),
            docs_skipped: inner.counters.docs_skipped.load(Ordering::Relaxed),
            commit_phase,
            flush: inner.doc_writer.flush_stats(),
        }
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if !self.inner.is_closed() {
            debug!("index writer dropped while open, rolling back");
            if let Err(e) = self.inner.rollback() {
                error!("rollback of dropped index writer failed: {e}");
            }
        }
    }
}

fn open_inner(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Arc<WriterInner>> {
    let latest = match SegmentInfos::read_latest(storage.as_ref()) {
        Ok(infos) => Some(infos),
        Err(HalberdError::IndexNotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let (mut infos, last_committed) = match (config.open_mode, latest) {
        (OpenMode::Append, None) => {
            return Err(HalberdError::IndexNotFound(
                "open mode is Append but the storage holds no commit".to_string(),
            ));
        }
        (OpenMode::Create, Some(previous)) => {
            // the old commit stays current until the first commit of this writer
            let mut fresh = SegmentInfos::new();
            fresh.counter = previous.counter;
            fresh.version = previous.version + 1;
            (fresh, previous)
        }
        (_, Some(previous)) => (previous.clone(), previous),
        (_, None) => (SegmentInfos::new(), SegmentInfos::new()),
    };

    let deleter = IndexFileDeleter::init(Arc::clone(&storage), Arc::clone(&config.deletion_policy), &mut infos)?;
    let field_numbers = Arc::new(FieldNumbers::new());
    for segment in infos.segments() {
        field_numbers.seed(&segment.info.field_infos)?;
    }
    let namer = Arc::new(SegmentNamer::new(infos.counter));
    let doc_writer = DocumentsWriter::new(
        Arc::clone(&storage),
        Arc::clone(&config.codec),
        Arc::clone(&config.analyzer),
        Arc::clone(&field_numbers),
        Arc::clone(&namer),
        config.flush_policy(),
    );
    let next_commit_generation = infos.generation().map_or(1, |g| g + 1);
    let committed_change_count = if infos.generation().is_some() { 0 } else { u64::MAX };
    info!(
        "opened index writer ({:?}) on generation {:?} with {} segments",
        config.open_mode,
        last_committed.generation(),
        infos.len()
    );
    let state = WriterState {
        commit_data: infos.user_data.clone(),
        infos,
        pool: ReaderPool::new(),
        stream: BufferedUpdatesStream::new(),
        pending_merges: VecDeque::new(),
        running_merges: Vec::new(),
        last_committed,
        change_count: 0,
        committed_change_count,
        next_commit_generation,
        stop_merges: false,
    };

    Ok(Arc::new_cyclic(|self_ref| WriterInner {
        self_ref: self_ref.clone(),
        storage,
        config,
        field_numbers,
        namer,
        doc_writer,
        deleter: Arc::new(Mutex::new(deleter)),
        inventory: Arc::new(MergeInventory::new()),
        state: Mutex::new(state),
        merge_done: Condvar::new(),
        commit: Mutex::new(CommitState::default()),
        next_merge_id: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        write_lock: Mutex::new(None),
        counters: WriterCounters::default(),
    }))
}

impl WriterInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HalberdError::already_closed("index writer is closed"));
        }
        Ok(())
    }

    fn write_document(&self, doc: &Document, delete: Option<BufferedOp>) -> Result<u64> {
        self.ensure_open()?;
        match self.doc_writer.add_document(doc, delete) {
            Ok(outcome) => {
                if outcome.flushed {
                    self.publish_flushed()?;
                    self.maybe_merge(MergeTrigger::SegmentFlush)?;
                }
                Ok(outcome.seq_no)
            }
            Err(e) => {
                if e.is_per_document() {
                    self.counters.docs_skipped.fetch_add(1, Ordering::Relaxed);
                    debug!("skipped document: {e}");
                } else if let Err(publish) = self.publish_flushed() {
                    // a failed flush still hands its deletes over
                    warn!("publishing after failed flush: {publish}");
                }
                Err(e)
            }
        }
    }

    fn update_doc_values(&self, term: Term, updates: Vec<(String, DocValue)>) -> Result<u64> {
        self.ensure_open()?;
        if updates.is_empty() {
            return Err(HalberdError::invalid_argument("update_doc_values needs at least one field"));
        }
        for (field, value) in &updates {
            self.field_numbers.check_updatable(field, value.kind())?;
        }
        let updates = updates
            .into_iter()
            .map(|(field, value)| DocValuesUpdate {
                term: term.clone(),
                field,
                value,
            })
            .collect();
        self.buffer_ops(vec![BufferedOp::Update(updates)])
    }

    fn buffer_ops(&self, ops: Vec<BufferedOp>) -> Result<u64> {
        self.ensure_open()?;
        let (seq_no, frozen) = self.doc_writer.buffer_ops(ops)?;
        if frozen {
            let mut state = self.state.lock();
            self.publish_locked(&mut state)?;
            self.apply_all_deletes(&mut state)?;
        }
        Ok(seq_no)
    }

    fn publish_flushed(&self) -> Result<bool> {
        let mut state = self.state.lock();
        self.publish_locked(&mut state)
    }

    /// Move finished flush tickets into the catalog and the packet stream.
    fn publish_locked(&self, state: &mut WriterState) -> Result<bool> {
        let tickets = self.doc_writer.take_ready_tickets();
        if tickets.is_empty() {
            return Ok(false);
        }
        for ticket in tickets {
            let (packet, flushed) = ticket.into_parts();
            state.stream.push(packet);
            if let Some(flushed) = flushed {
                let mut segment = flushed.segment;
                segment.buffered_deletes_gen = state.stream.next_gen();
                debug!("publishing segment {} with {} docs", segment.name(), segment.max_doc());
                state.infos.add(segment);
            }
        }
        state.change_count += 1;
        self.deleter.lock().checkpoint(&state.infos, false)?;
        Ok(true)
    }

    fn apply_all_deletes(&self, state: &mut WriterState) -> Result<()> {
        let WriterState { infos, pool, stream, .. } = &mut *state;
        let outcome = stream.apply_all(
            self.storage.as_ref(),
            &self.config.codec_registry,
            infos,
            pool,
            self.config.merge_policy.as_ref(),
        )?;
        if outcome.any_changes() {
            state.change_count += 1;
            if outcome.dropped_segments.is_empty() {
                state.infos.changed();
            } else {
                self.deleter.lock().checkpoint(&state.infos, false)?;
            }
        }
        Ok(())
    }

    /// Flush every buffer, publish and resolve. Returns whether anything
    /// was flushed.
    fn full_flush(&self) -> Result<bool> {
        self.ensure_open()?;
        let flushed = self.doc_writer.flush_all();
        let mut state = self.state.lock();
        let published = self.publish_locked(&mut state);
        let anything = flushed?;
        published?;
        self.apply_all_deletes(&mut state)?;
        Ok(anything)
    }

    pub(crate) fn open_nrt_reader(this: &Arc<WriterInner>) -> Result<DirectoryReader> {
        this.full_flush()?;
        let reader = {
            let mut state = this.state.lock();
            let WriterState { infos, pool, .. } = &mut *state;
            let mut segments = Vec::with_capacity(infos.len());
            for segment in infos.segments() {
                match pool.reader(this.storage.as_ref(), &this.config.codec_registry, segment, &this.deleter) {
                    Ok(reader) => segments.push(reader),
                    Err(e) => {
                        for opened in &segments {
                            if let Err(release) = opened.dec_ref() {
                                warn!("releasing {}: {release}", opened.name());
                            }
                        }
                        return Err(e);
                    }
                }
            }
            debug!("opened near-real-time reader on version {} with {} segments", infos.version(), segments.len());
            DirectoryReader::from_parts(
                Arc::clone(&this.storage),
                Arc::clone(&this.config.codec_registry),
                infos.clone(),
                segments,
                Some(Arc::downgrade(this)),
            )
        };
        if let Err(e) = this.maybe_merge(MergeTrigger::FullFlush) {
            warn!("merging after opening a reader: {e}");
        }
        Ok(reader)
    }

    pub(crate) fn nrt_is_current(&self, version: u64) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let state = self.state.lock();
        Ok(state.infos.version() == version && !self.doc_writer.any_changes() && state.stream.is_empty())
    }

    // ---- merges ----

    fn merge_segment_infos(&self, state: &WriterState) -> Vec<MergeSegmentInfo> {
        state
            .infos
            .segments()
            .iter()
            .map(|segment| {
                let live = state
                    .pool
                    .entry(segment.name())
                    .map_or(segment.num_live(), |e| e.num_live());
                MergeSegmentInfo {
                    name: segment.name().to_string(),
                    size_bytes: segment.info.size_in_bytes,
                    doc_count: segment.max_doc(),
                    deleted_count: segment.max_doc() - live,
                    is_merging: self.inventory.contains(segment.name()),
                }
            })
            .collect()
    }

    fn register_merges(&self, state: &mut WriterState, trigger: MergeTrigger) -> usize {
        if state.stop_merges {
            return 0;
        }
        let segments = self.merge_segment_infos(state);
        let candidates = self.config.merge_policy.find_merges(trigger, &segments);
        self.register_candidates(state, candidates, false).len()
    }

    fn register_candidates(
        &self,
        state: &mut WriterState,
        candidates: Vec<MergeCandidate>,
        forced: bool,
    ) -> Vec<Arc<OneMerge>> {
        let mut registered = Vec::new();
        for candidate in candidates {
            if candidate.segments.is_empty() || !candidate.segments.iter().all(|s| state.infos.contains(s)) {
                continue;
            }
            let Some(guard) = self.inventory.try_register(candidate.segments.clone()) else {
                continue;
            };
            let id = self.next_merge_id.fetch_add(1, Ordering::SeqCst);
            let merge = Arc::new(OneMerge::new(id, candidate, forced, guard));
            for name in &merge.segments {
                state.pool.set_merging(name, true);
            }
            debug!("registered merge {id} of {:?}", merge.segments);
            state.pending_merges.push_back(Arc::clone(&merge));
            registered.push(merge);
        }
        registered
    }

    fn run_scheduler(&self, trigger: MergeTrigger) -> Result<()> {
        let Some(source) = self.self_ref.upgrade() else {
            return Ok(());
        };
        self.config.merge_scheduler.merge(source, trigger)
    }

    fn maybe_merge(&self, trigger: MergeTrigger) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let pending = {
            let mut state = self.state.lock();
            self.register_merges(&mut state, trigger);
            !state.pending_merges.is_empty()
        };
        if pending {
            self.run_scheduler(trigger)?;
        }
        Ok(())
    }

    fn wait_for_merges(&self) -> Result<()> {
        loop {
            let pending = {
                let mut state = self.state.lock();
                if !state.has_merges() {
                    return Ok(());
                }
                if !state.running_merges.is_empty() {
                    self.merge_done.wait_for(&mut state, MERGE_WAIT);
                    continue;
                }
                state.pending_merges.len()
            };
            self.run_scheduler(MergeTrigger::Explicit)?;
            let state = self.state.lock();
            if state.running_merges.is_empty() && state.pending_merges.len() >= pending {
                warn!("{} merges are registered but the scheduler runs none", state.pending_merges.len());
                return Ok(());
            }
        }
    }

    /// Register forced merges found by `find` and wait for them, for at most
    /// `max_rounds` rounds of finding.
    fn force_merges<F>(&self, max_rounds: Option<usize>, find: F) -> Result<()>
    where
        F: Fn(&dyn MergePolicy, &[MergeSegmentInfo]) -> Vec<MergeCandidate>,
    {
        self.full_flush()?;
        let mut round: Vec<Arc<OneMerge>> = Vec::new();
        let mut rounds = 0;
        loop {
            let dispatch = {
                let mut state = self.state.lock();
                if let Some(e) = round.iter().find_map(|m| m.error()) {
                    return Err(match e {
                        HalberdError::MergeAborted(_) => e,
                        cause => HalberdError::merge("background merge hit exception", cause),
                    });
                }
                if self.is_closed() || state.stop_merges {
                    return Err(HalberdError::merge_aborted("writer was closed during a forced merge"));
                }
                if round.iter().any(|m| state.is_registered(m)) {
                    if state.running_merges.is_empty() {
                        true
                    } else {
                        self.merge_done.wait_for(&mut state, MERGE_WAIT);
                        false
                    }
                } else if max_rounds.is_some_and(|max| rounds >= max) {
                    return Ok(());
                } else {
                    let segments = self.merge_segment_infos(&state);
                    let candidates = find(self.config.merge_policy.as_ref(), &segments);
                    round = self.register_candidates(&mut state, candidates, true);
                    rounds += 1;
                    if round.is_empty() {
                        if !state.has_merges() {
                            debug!("forced merge done after {rounds} rounds");
                            return Ok(());
                        }
                        // other merges hold segments we need
                        if state.running_merges.is_empty() {
                            true
                        } else {
                            self.merge_done.wait_for(&mut state, MERGE_WAIT);
                            false
                        }
                    } else {
                        true
                    }
                }
            };
            if dispatch {
                if let Err(e) = self.run_scheduler(MergeTrigger::Explicit) {
                    debug!("merge scheduler reported: {e}");
                }
            }
        }
    }

    fn execute_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let start = Instant::now();
        let result = self
            .merge_init(merge)
            .and_then(|name| self.merge_middle(merge, &name))
            .and_then(|merged| self.commit_merge(merge, merged));
        if let Err(e) = &result {
            merge.set_error(e);
            if !matches!(e, HalberdError::MergeAborted(_)) {
                self.counters.merges_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.merge_finish(merge);

        let docs_out = result?;
        self.counters.merges_completed.fetch_add(1, Ordering::Relaxed);
        self.counters.docs_merged.fetch_add(docs_out, Ordering::Relaxed);
        info!(
            "merge {} of {} segments finished in {} ms ({docs_out} docs)",
            merge.id,
            merge.segments.len(),
            start.elapsed().as_millis()
        );
        let mut state = self.state.lock();
        self.register_merges(&mut state, MergeTrigger::MergeFinished);
        Ok(())
    }

    /// Capture the state of the sources. Returns the merged segment's name.
    fn merge_init(&self, merge: &OneMerge) -> Result<String> {
        let mut state = self.state.lock();
        merge.check_aborted()?;
        if state.stop_merges {
            return Err(HalberdError::merge_aborted(format!("merge {}: merges are stopped", merge.id)));
        }
        self.apply_all_deletes(&mut state)?;
        let mut inputs = Vec::with_capacity(merge.segments.len());
        for name in &merge.segments {
            let Some(segment) = state.infos.get(name).cloned() else {
                debug!("{name} left the catalog before merge {} started", merge.id);
                continue;
            };
            let entry = state
                .pool
                .get_or_load(self.storage.as_ref(), &self.config.codec_registry, &segment)?;
            entry.set_merging(true);
            inputs.push(entry.snapshot());
        }
        *merge.inputs.lock() = inputs;
        Ok(self.namer.next_name())
    }

    fn merge_middle(&self, merge: &OneMerge, name: &str) -> Result<Option<MergedSegment>> {
        let inputs = merge.inputs.lock().clone();
        debug!("merge {} writing {name} from {} segments", merge.id, inputs.len());
        SegmentMerger::new(self.storage.as_ref(), self.config.codec.as_ref(), &self.field_numbers, name)
            .merge(merge, &inputs)
    }

    /// Swap the merged segment into the catalog, carrying over deletes and
    /// updates that reached the sources while the merge ran. Returns the
    /// number of documents written.
    fn commit_merge(&self, merge: &OneMerge, merged: Option<MergedSegment>) -> Result<u64> {
        let mut state = self.state.lock();
        if let Err(e) = merge.check_aborted() {
            if let Some(merged) = &merged {
                self.deleter.lock().delete_new_files(&merged.files);
            }
            return Err(e);
        }

        let inputs = merge.inputs.lock().clone();
        let mut min_gen: Option<u64> = None;
        let mut carried_deletes = Vec::new();
        let mut carried_values = Vec::new();
        for (index, input) in inputs.iter().enumerate() {
            let name = &input.core.info.name;
            let Some(segment) = state.infos.get(name) else {
                continue;
            };
            min_gen = Some(min_gen.map_or(segment.buffered_deletes_gen, |g| g.min(segment.buffered_deletes_gen)));
            let (Some(entry), Some(result)) = (state.pool.entry(name), merged.as_ref()) else {
                continue;
            };
            let doc_map = &result.doc_maps[index];
            for doc in 0..input.core.info.max_doc {
                let Some(target) = doc_map.get(doc) else {
                    continue;
                };
                if !entry.is_live(doc) {
                    carried_deletes.push(target);
                    continue;
                }
                for (field, column) in entry.doc_values_overrides() {
                    if input.doc_values.get(field).is_some_and(|seen| Arc::ptr_eq(seen, column)) {
                        continue;
                    }
                    let now = column.value_at(doc);
                    if now != input.column(field).and_then(|c| c.value_at(doc)) {
                        if let Some(value) = now {
                            carried_values.push((field.clone(), target, value));
                        }
                    }
                }
            }
        }

        let mut docs_out = 0;
        let merged_segment = match merged {
            None => None,
            Some(merged) => {
                let mut entry = ReadersAndUpdates::from_core(Arc::clone(&merged.core));
                for &doc in &carried_deletes {
                    entry.delete(doc);
                }
                for (field, doc, value) in &carried_values {
                    if let Err(e) = entry.set_doc_value(field, *doc, value) {
                        self.deleter.lock().delete_new_files(&merged.files);
                        return Err(e);
                    }
                }
                if !carried_deletes.is_empty() || !carried_values.is_empty() {
                    debug!(
                        "merge {} carried {} deletes and {} values into {}",
                        merge.id,
                        carried_deletes.len(),
                        carried_values.len(),
                        merged.segment.name()
                    );
                }
                merge.set_stats(merged.stats.clone());
                docs_out = merged.stats.docs_out;
                if entry.num_live() == 0 && !self.config.merge_policy.keep_fully_deleted_segment(entry.name()) {
                    debug!("merged segment {} is fully deleted, dropping it", entry.name());
                    self.deleter.lock().delete_new_files(&merged.files);
                    None
                } else {
                    let mut segment = merged.segment;
                    segment.buffered_deletes_gen = min_gen.unwrap_or_else(|| state.stream.next_gen());
                    state.pool.insert(entry);
                    Some(segment)
                }
            }
        };

        for name in &merge.segments {
            state.pool.drop_segment(name);
        }
        state.infos.apply_merge(&merge.segments, merged_segment);
        state.change_count += 1;
        self.deleter.lock().checkpoint(&state.infos, false)?;
        Ok(docs_out)
    }

    fn merge_finish(&self, merge: &Arc<OneMerge>) {
        let mut state = self.state.lock();
        state.running_merges.retain(|m| !Arc::ptr_eq(m, merge));
        state.pending_merges.retain(|m| !Arc::ptr_eq(m, merge));
        for name in &merge.segments {
            state.pool.set_merging(name, false);
        }
        merge.release();
        self.merge_done.notify_all();
    }

    /// Abort every registered merge and wait for running ones to stop.
    fn abort_merges(&self) {
        let mut state = self.state.lock();
        state.stop_merges = true;
        let pending: Vec<Arc<OneMerge>> = state.pending_merges.drain(..).collect();
        for merge in &pending {
            merge.abort();
            for name in &merge.segments {
                state.pool.set_merging(name, false);
            }
            merge.release();
        }
        for merge in &state.running_merges {
            merge.abort();
        }
        while !state.running_merges.is_empty() {
            debug!("waiting for {} aborted merges", state.running_merges.len());
            self.merge_done.wait_for(&mut state, MERGE_WAIT);
        }
        self.merge_done.notify_all();
    }

    fn delete_all(&self) -> Result<u64> {
        self.ensure_open()?;
        self.abort_merges();
        let discarded = self.doc_writer.abort();
        let mut state = self.state.lock();
        state.stop_merges = false;
        state.stream.clear();
        state.pool.drop_all();
        state.infos.clear();
        state.change_count += 1;
        self.deleter.lock().checkpoint(&state.infos, false)?;
        info!("deleted all documents ({discarded} buffered)");
        Ok(self.doc_writer.queue().next_seq())
    }

    // ---- commit ----

    fn prepare_commit(&self, commit: &mut CommitState) -> Result<u64> {
        commit.check_can_prepare()?;
        self.full_flush()?;

        let mut state = self.state.lock();
        let seq_no = self.doc_writer.queue().last_sequence_number();
        let WriterState { pool, infos, .. } = &mut *state;
        let written = pool.write_all_pending(self.storage.as_ref(), infos)?;
        if !written.is_empty() {
            state.change_count += 1;
            self.deleter.lock().checkpoint(&state.infos, false)?;
        }

        if state.change_count == state.committed_change_count {
            debug!("nothing to commit");
            *commit = CommitState::Prepared(None);
            return Ok(seq_no);
        }

        state.infos.counter = state.infos.counter.max(self.namer.peek());
        let mut snapshot = state.infos.clone();
        snapshot.user_data = state.commit_data.clone();
        let on_disk = last_commit_generation(&self.storage.list_files()?).unwrap_or(0);
        let generation = state
            .next_commit_generation
            .max(state.infos.generation().unwrap_or(0) + 1)
            .max(on_disk + 1);
        state.next_commit_generation = generation + 1;
        let files = snapshot.files(false);
        self.deleter.lock().inc_ref(&files);
        let change_count = state.change_count;
        drop(state);

        match commit::write_pending(self.storage.as_ref(), &snapshot, generation) {
            Ok(pending_file) => {
                *commit = CommitState::Prepared(Some(Box::new(PendingCommit {
                    generation,
                    pending_file,
                    infos: snapshot,
                    files,
                    change_count,
                    seq_no,
                })));
                Ok(seq_no)
            }
            Err(e) => {
                let _state = self.state.lock();
                self.deleter.lock().dec_ref(&files);
                Err(e)
            }
        }
    }

    fn commit_prepared(&self, commit: &mut CommitState) -> Result<u64> {
        if commit.phase() != CommitPhase::Prepared {
            self.prepare_commit(commit)?;
        }
        let Some(pending) = commit.take_prepared() else {
            return Err(HalberdError::internal("no prepared commit after prepare_commit"));
        };
        match pending {
            None => {
                let state = self.state.lock();
                let seq_no = self.doc_writer.queue().last_sequence_number();
                *commit = CommitState::Committed {
                    generation: state.last_committed.generation(),
                    seq_no,
                };
                Ok(seq_no)
            }
            Some(pending) => self.finish_commit(commit, *pending),
        }
    }

    fn finish_commit(&self, commit: &mut CommitState, pending: PendingCommit) -> Result<u64> {
        let published = commit::finish(self.storage.as_ref(), &pending);
        let mut state = self.state.lock();
        let file = match published {
            Ok(file) => file,
            Err(e) => {
                self.deleter.lock().dec_ref(&pending.files);
                return Err(e);
            }
        };

        let PendingCommit {
            generation,
            mut infos,
            files,
            change_count,
            seq_no,
            ..
        } = pending;
        infos.set_generation(generation);
        state.infos.set_generation(generation);
        {
            let mut deleter = self.deleter.lock();
            let checkpoint = deleter.checkpoint(&infos, true);
            deleter.dec_ref(&files);
            checkpoint?;
        }
        state.committed_change_count = change_count;
        info!("committed {file} with {} segments ({} docs)", infos.len(), infos.total_max_doc());
        state.last_committed = infos;
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        *commit = CommitState::Committed {
            generation: Some(generation),
            seq_no,
        };
        Ok(seq_no)
    }

    // ---- shutdown ----

    fn rollback(&self) -> Result<()> {
        info!("rolling back index writer");
        self.abort_merges();
        self.doc_writer.close();
        if let Err(e) = self.config.merge_scheduler.close() {
            warn!("closing merge scheduler: {e}");
        }

        let mut commit = self.commit.lock();
        if let Some(Some(pending)) = commit.take_prepared() {
            commit::remove_pending(self.storage.as_ref(), &pending.pending_file);
            let _state = self.state.lock();
            self.deleter.lock().dec_ref(&pending.files);
        }
        *commit = CommitState::RolledBack;

        let result = {
            let mut state = self.state.lock();
            state.pool.drop_all();
            state.stream.clear();
            state.infos = state.last_committed.clone();
            let mut deleter = self.deleter.lock();
            deleter
                .checkpoint(&state.infos, false)
                .and_then(|()| deleter.refresh())
        };
        self.finish_close();
        result
    }

    fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.config.commit_on_close {
            return self.rollback();
        }
        let result = self
            .full_flush()
            .and_then(|_| self.wait_for_merges())
            .and_then(|()| {
                let mut commit = self.commit.lock();
                self.commit_prepared(&mut commit).map(|_| ())
            });
        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.stop_merges = true;
                }
                if let Err(e) = self.config.merge_scheduler.close() {
                    warn!("closing merge scheduler: {e}");
                }
                self.doc_writer.close();
                self.state.lock().pool.drop_all();
                self.finish_close();
                info!("index writer closed");
                Ok(())
            }
            Err(e) => {
                error!("close failed, rolling back: {e}");
                if let Err(rollback) = self.rollback() {
                    error!("rollback after failed close: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn finish_close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut lock) = self.write_lock.lock().take() {
            if let Err(e) = lock.release() {
                warn!("releasing {WRITE_LOCK_NAME}: {e}");
            }
        }
        self.merge_done.notify_all();
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        let mut state = self.state.lock();
        if state.stop_merges {
            return None;
        }
        let merge = state.pending_merges.pop_front()?;
        state.running_merges.push(Arc::clone(&merge));
        Some(merge)
    }

    fn has_pending_merges(&self) -> bool {
        !self.state.lock().pending_merges.is_empty()
    }

    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        self.execute_merge(merge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Analyzer, StandardAnalyzer, TokenStream};
    use crate::index::merge_policy::NoMergePolicy;
    use crate::index::merge_scheduler::SerialMergeScheduler;
    use crate::index::reader::{DocValuesAccess, LiveDocsAccess};
    use crate::storage::memory::MemoryStorage;

    fn config() -> IndexWriterConfig {
        IndexWriterConfig::default()
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(Arc::new(SerialMergeScheduler::default()))
    }

    fn doc(id: &str, val: i64) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_numeric_doc_values("val", val)
            .build()
    }

    #[test]
    fn test_second_writer_cannot_take_lock() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
        assert!(IndexWriter::open(Arc::clone(&storage), config()).is_err());
        writer.close().unwrap();
        let again = IndexWriter::open(storage, config()).unwrap();
        again.close().unwrap();
    }

    #[test]
    fn test_append_requires_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let result = IndexWriter::open(storage, config().with_open_mode(OpenMode::Append));
        assert!(matches!(result, Err(HalberdError::IndexNotFound(_))));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage, config()).unwrap();
        let a = writer.add_document(&doc("a", 1)).unwrap();
        let b = writer.delete_documents(vec![Term::new("id", "a")]).unwrap();
        let c = writer.update_numeric_value(Term::new("id", "b"), "val", Some(3)).unwrap();
        assert!(a < b && b < c);
        writer.rollback().unwrap();
    }

    #[test]
    fn test_commit_without_changes_writes_nothing() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("a", 1)).unwrap();
        writer.commit().unwrap();
        let files = storage.list_files().unwrap();

        writer.commit().unwrap();
        assert_eq!(storage.list_files().unwrap(), files);
        assert_eq!(writer.stats().last_commit_generation, Some(1));
        writer.close().unwrap();
    }

    #[test]
    fn test_prepare_twice_is_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage, config()).unwrap();
        writer.add_document(&doc("a", 1)).unwrap();
        writer.prepare_commit().unwrap();
        assert_eq!(writer.commit_phase(), CommitPhase::Prepared);
        assert!(matches!(writer.prepare_commit(), Err(HalberdError::InvalidOperation(_))));
        writer.commit().unwrap();
        assert_eq!(writer.commit_phase(), CommitPhase::Committed);
        writer.close().unwrap();
    }

    #[test]
    fn test_closed_writer_rejects_operations() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage, config()).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.add_document(&doc("a", 1)), Err(HalberdError::AlreadyClosed(_))));
        assert!(matches!(writer.commit(), Err(HalberdError::AlreadyClosed(_))));
    }

    #[test]
    fn test_update_of_unknown_field_fails_at_call_site() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage, config()).unwrap();
        writer.add_document(&doc("a", 1)).unwrap();
        let result = writer.update_numeric_value(Term::new("id", "a"), "missing", Some(1));
        assert!(matches!(result, Err(HalberdError::Schema(_))));
        let result = writer.update_binary_value(Term::new("id", "a"), "val", Some(vec![1]));
        assert!(matches!(result, Err(HalberdError::Schema(_))));
        writer.rollback().unwrap();
    }

    #[test]
    fn test_nrt_reader_sees_buffered_changes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage, config()).unwrap();
        writer.add_document(&doc("a", 1)).unwrap();
        writer.add_document(&doc("b", 2)).unwrap();
        let reader = writer.reader().unwrap();
        assert_eq!(reader.num_docs(), 2);
        assert!(reader.is_current().unwrap());

        writer.update_numeric_value(Term::new("id", "b"), "val", Some(20)).unwrap();
        assert!(!reader.is_current().unwrap());
        let newer = reader.open_if_changed().unwrap().unwrap();
        assert_eq!(newer.numeric_value("val", 1), Some(20));
        assert_eq!(reader.numeric_value("val", 1), Some(2));
        reader.close().unwrap();
        newer.close().unwrap();
        writer.rollback().unwrap();
    }

    #[derive(Debug)]
    struct RejectingAnalyzer;

    impl Analyzer for RejectingAnalyzer {
        fn analyze(&self, field: &str, text: &str) -> Result<TokenStream> {
            if text.contains("malformed") {
                return Err(HalberdError::analysis(format!("cannot tokenize {field:?}")));
            }
            StandardAnalyzer.analyze(field, text)
        }

        fn name(&self) -> &'static str {
            "rejecting"
        }
    }

    #[test]
    fn test_malformed_document_is_skipped() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(
            Arc::clone(&storage),
            config().with_analyzer(Arc::new(RejectingAnalyzer)),
        )
        .unwrap();
        let text = |id: &str, body: &str| Document::builder().add_keyword("id", id).add_text("body", body).build();

        writer.add_document(&text("a", "first document")).unwrap();
        let err = writer.add_document(&text("bad", "a malformed body")).unwrap_err();
        assert!(err.is_per_document());
        writer.add_document(&text("c", "third document")).unwrap();
        assert_eq!(writer.stats().docs_skipped, 1);

        writer.commit().unwrap();
        let reader = DirectoryReader::open(storage).unwrap();
        assert_eq!(reader.num_docs(), 2);
        assert!(reader.term_docs(&Term::new("id", "bad")).is_empty());
        assert_eq!(reader.term_docs(&Term::new("id", "c")).len(), 1);
        reader.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_stats_report_last_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage, config()).unwrap();
        assert_eq!(writer.stats().last_commit_sequence_number, None);

        writer.add_document(&doc("a", 1)).unwrap();
        let seq_no = writer.commit().unwrap();
        let stats = writer.stats();
        assert_eq!(stats.last_commit_sequence_number, Some(seq_no));
        assert_eq!(stats.last_commit_generation, Some(1));

        writer.add_document(&doc("b", 2)).unwrap();
        writer.prepare_commit().unwrap();
        let stats = writer.stats();
        assert_eq!(stats.last_commit_sequence_number, None);
        assert_eq!(stats.last_commit_generation, Some(1));
        assert_eq!(stats.docs_skipped, 0);
        writer.rollback().unwrap();
    }
}
