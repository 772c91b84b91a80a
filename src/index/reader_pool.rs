//! Writer-side per-segment state.
//!
//! The pool keeps, for every segment the writer has touched, the decoded
//! core, the current live docs and doc-values columns (including changes not
//! yet written), and a cached [`SegmentReader`] handed out to near-real-time
//! readers. Entries live in an arena addressed by [`SegmentHandle`].
//!
//! Live docs and columns are shared with readers through `Arc`s and copied
//! on write, so a reader keeps the values it was opened with.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{HalberdError, Result};
use crate::index::codec::CodecRegistry;
use crate::index::doc_values::{DOC_VALUES_UPDATE_MAGIC, DocValue, DocValuesColumn, write_columns};
use crate::index::file_deleter::IndexFileDeleter;
use crate::index::file_names::{LIVE_DOCS_EXTENSION, generation_file_name};
use crate::index::live_docs::LiveDocs;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::{SegmentCore, SegmentReader, SegmentView, load_overlays};
use crate::storage::Storage;

/// Index of an entry in the pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(usize);

/// Shared state captured when a merge starts.
#[derive(Debug, Clone)]
pub(crate) struct SegmentSnapshot {
    pub core: Arc<SegmentCore>,
    pub live_docs: Option<Arc<LiveDocs>>,
    pub doc_values: BTreeMap<String, Arc<DocValuesColumn>>,
}

impl SegmentSnapshot {
    pub fn is_live(&self, doc: u32) -> bool {
        self.live_docs.as_ref().is_none_or(|live| live.is_live(doc))
    }

    /// Column of `field`, override first.
    pub fn column(&self, field: &str) -> Option<&DocValuesColumn> {
        match self.doc_values.get(field) {
            Some(column) => Some(column.as_ref()),
            None => self.core.data.doc_values.get(field),
        }
    }
}

/// Current state of one segment as the writer sees it.
#[derive(Debug)]
pub struct ReadersAndUpdates {
    name: String,
    core: Arc<SegmentCore>,
    live_docs: Option<Arc<LiveDocs>>,
    pending_delete_count: u32,
    doc_values: BTreeMap<String, Arc<DocValuesColumn>>,
    dirty_fields: BTreeSet<String>,
    merging: bool,
    cached_reader: Option<Arc<SegmentReader>>,
}

impl ReadersAndUpdates {
    fn load(storage: &dyn Storage, registry: &CodecRegistry, segment: &SegmentCommitInfo) -> Result<Self> {
        let core = Arc::new(SegmentCore::load(storage, registry, Arc::clone(&segment.info))?);
        let overlays = load_overlays(storage, segment)?;
        Ok(ReadersAndUpdates {
            name: segment.name().to_string(),
            core,
            live_docs: overlays.live_docs.map(Arc::new),
            pending_delete_count: 0,
            doc_values: overlays
                .doc_values
                .into_iter()
                .map(|(field, column)| (field, Arc::new(column)))
                .collect(),
            dirty_fields: BTreeSet::new(),
            merging: false,
            cached_reader: None,
        })
    }

    /// Entry for a freshly merged segment whose data is already decoded.
    pub(crate) fn from_core(core: Arc<SegmentCore>) -> Self {
        ReadersAndUpdates {
            name: core.info.name.clone(),
            core,
            live_docs: None,
            pending_delete_count: 0,
            doc_values: BTreeMap::new(),
            dirty_fields: BTreeSet::new(),
            merging: false,
            cached_reader: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    pub fn max_doc(&self) -> u32 {
        self.core.info.max_doc
    }

    pub fn num_live(&self) -> u32 {
        self.live_docs.as_ref().map_or(self.max_doc(), |live| live.num_live())
    }

    pub fn is_live(&self, doc: u32) -> bool {
        doc < self.max_doc() && self.live_docs.as_ref().is_none_or(|live| live.is_live(doc))
    }

    pub fn pending_delete_count(&self) -> u32 {
        self.pending_delete_count
    }

    pub fn is_merging(&self) -> bool {
        self.merging
    }

    pub(crate) fn set_merging(&mut self, merging: bool) {
        self.merging = merging;
    }

    pub fn has_pending_changes(&self) -> bool {
        self.pending_delete_count > 0 || !self.dirty_fields.is_empty()
    }

    pub(crate) fn view(&self) -> SegmentView<'_> {
        SegmentView {
            data: &self.core.data,
            overrides: &self.doc_values,
        }
    }

    /// Current column of `field`, override first.
    pub fn column(&self, field: &str) -> Option<&DocValuesColumn> {
        match self.doc_values.get(field) {
            Some(column) => Some(column.as_ref()),
            None => self.core.data.doc_values.get(field),
        }
    }

    /// Doc-values columns that replace the decoded ones.
    pub(crate) fn doc_values_overrides(&self) -> &BTreeMap<String, Arc<DocValuesColumn>> {
        &self.doc_values
    }

    /// Mark `doc` deleted. Returns `true` if it was live.
    pub fn delete(&mut self, doc: u32) -> bool {
        if !self.is_live(doc) {
            return false;
        }
        let max_doc = self.max_doc();
        let live = self
            .live_docs
            .get_or_insert_with(|| Arc::new(LiveDocs::all_live(max_doc)));
        Arc::make_mut(live).delete(doc);
        self.pending_delete_count += 1;
        self.invalidate_reader();
        true
    }

    /// Store `value` for `field` of `doc`. Returns `true` if the value changed.
    pub fn set_doc_value(&mut self, field: &str, doc: u32, value: &DocValue) -> Result<bool> {
        match self.column(field) {
            Some(column) => {
                if column.value_at(doc).as_ref() == Some(value) {
                    return Ok(false);
                }
            }
            None => {
                if matches!(value, DocValue::Numeric(None) | DocValue::Binary(None)) {
                    return Ok(false);
                }
            }
        }

        if !self.doc_values.contains_key(field) {
            let base = match self.core.data.doc_values.get(field) {
                Some(column) => column.clone(),
                None => DocValuesColumn::empty(value.kind(), self.max_doc()).ok_or_else(|| {
                    HalberdError::schema(format!("field {field:?} cannot hold doc values"))
                })?,
            };
            self.doc_values.insert(field.to_string(), Arc::new(base));
        }
        let changed = match self.doc_values.get_mut(field) {
            Some(column) => Arc::make_mut(column).set(doc, value)?,
            None => false,
        };
        if changed {
            self.dirty_fields.insert(field.to_string());
            self.invalidate_reader();
        }
        Ok(changed)
    }

    pub(crate) fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            core: Arc::clone(&self.core),
            live_docs: self.live_docs.clone(),
            doc_values: self.doc_values.clone(),
        }
    }

    /// Write pending deletes and updated columns as new overlay generations.
    ///
    /// Returns the files written. A failed write still consumes its
    /// generation number.
    pub(crate) fn write_pending(&mut self, storage: &dyn Storage, segment: &mut SegmentCommitInfo) -> Result<Vec<String>> {
        let mut written = Vec::new();

        if self.pending_delete_count > 0 {
            if let Some(live) = &self.live_docs {
                let name = generation_file_name(&self.name, segment.next_write_del_gen(), LIVE_DOCS_EXTENSION);
                if let Err(e) = live.write(storage, &name) {
                    segment.advance_next_write_del_gen();
                    remove_partial(storage, &name);
                    return Err(e);
                }
                segment.advance_del_gen(live.num_deleted());
                debug!("wrote {name} ({} deleted)", live.num_deleted());
                written.push(name);
            }
            self.pending_delete_count = 0;
            self.invalidate_reader();
        }

        if !self.dirty_fields.is_empty() {
            let columns: BTreeMap<String, DocValuesColumn> = self
                .dirty_fields
                .iter()
                .filter_map(|field| {
                    self.doc_values
                        .get(field)
                        .map(|column| (field.clone(), column.as_ref().clone()))
                })
                .collect();
            let name = segment.doc_values_update_file_name(segment.next_write_dv_gen());
            if let Err(e) = write_columns(storage, &name, DOC_VALUES_UPDATE_MAGIC, &columns) {
                segment.advance_next_write_dv_gen();
                remove_partial(storage, &name);
                return Err(e);
            }
            segment.advance_dv_gen(columns.keys());
            debug!("wrote {name} ({} fields)", columns.len());
            written.push(name);
            self.dirty_fields.clear();
            self.invalidate_reader();
        }

        Ok(written)
    }

    /// Reader over the current state, shared until the state changes.
    fn reader(&mut self, segment: &SegmentCommitInfo, deleter: &Arc<Mutex<IndexFileDeleter>>) -> Arc<SegmentReader> {
        if let Some(reader) = &self.cached_reader {
            if reader.try_inc_ref() {
                return Arc::clone(reader);
            }
        }
        let reader = Arc::new(SegmentReader::from_parts(
            Arc::clone(&self.core),
            segment.clone(),
            self.live_docs.clone(),
            self.doc_values.clone(),
        ));
        reader.pin_files(deleter);
        // one reference for the cache, one for the caller
        reader.try_inc_ref();
        self.cached_reader = Some(Arc::clone(&reader));
        reader
    }

    fn invalidate_reader(&mut self) {
        if let Some(reader) = self.cached_reader.take() {
            if let Err(e) = reader.dec_ref() {
                warn!("releasing cached reader of {}: {e}", self.name);
            }
        }
    }
}

/// Arena of [`ReadersAndUpdates`], one per segment the writer touched.
#[derive(Debug, Default)]
pub struct ReaderPool {
    slots: Vec<Option<ReadersAndUpdates>>,
    by_name: HashMap<String, SegmentHandle>,
    free: Vec<usize>,
}

impl ReaderPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn handle(&self, name: &str) -> Option<SegmentHandle> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, handle: SegmentHandle) -> Option<&ReadersAndUpdates> {
        self.slots.get(handle.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, handle: SegmentHandle) -> Option<&mut ReadersAndUpdates> {
        self.slots.get_mut(handle.0).and_then(|slot| slot.as_mut())
    }

    pub fn entry(&self, name: &str) -> Option<&ReadersAndUpdates> {
        self.handle(name).and_then(|h| self.get(h))
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut ReadersAndUpdates> {
        self.handle(name).and_then(|h| self.get_mut(h))
    }

    pub(crate) fn insert(&mut self, entry: ReadersAndUpdates) -> SegmentHandle {
        if let Some(old) = self.handle(&entry.name) {
            self.release(old);
        }
        let name = entry.name.clone();
        let handle = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(entry);
                SegmentHandle(index)
            }
            None => {
                self.slots.push(Some(entry));
                SegmentHandle(self.slots.len() - 1)
            }
        };
        self.by_name.insert(name, handle);
        handle
    }

    /// Entry of `segment`, decoding it on first use.
    pub fn get_or_load(
        &mut self,
        storage: &dyn Storage,
        registry: &CodecRegistry,
        segment: &SegmentCommitInfo,
    ) -> Result<&mut ReadersAndUpdates> {
        let handle = match self.handle(segment.name()) {
            Some(handle) => handle,
            None => self.insert(ReadersAndUpdates::load(storage, registry, segment)?),
        };
        self.get_mut(handle)
            .ok_or_else(|| HalberdError::internal(format!("pool lost segment {}", segment.name())))
    }

    /// Forget a segment, releasing its cached reader.
    pub fn drop_segment(&mut self, name: &str) {
        if let Some(handle) = self.by_name.get(name).copied() {
            self.release(handle);
        }
    }

    fn release(&mut self, handle: SegmentHandle) {
        if let Some(mut entry) = self.slots.get_mut(handle.0).and_then(|slot| slot.take()) {
            entry.invalidate_reader();
            self.by_name.remove(&entry.name);
            self.free.push(handle.0);
        }
    }

    /// Forget every segment.
    pub fn drop_all(&mut self) {
        let handles: Vec<SegmentHandle> = self.by_name.values().copied().collect();
        for handle in handles {
            self.release(handle);
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        self.slots.iter().flatten().any(|entry| entry.has_pending_changes())
    }

    pub(crate) fn set_merging(&mut self, name: &str, merging: bool) {
        if let Some(entry) = self.entry_mut(name) {
            entry.set_merging(merging);
        }
    }

    /// Write the pending changes of every segment of `infos`, updating its
    /// generations. Returns the files written.
    pub fn write_all_pending(&mut self, storage: &dyn Storage, infos: &mut SegmentInfos) -> Result<Vec<String>> {
        let mut written = Vec::new();
        let mut changed = false;
        for segment in infos.segments_mut() {
            let Some(entry) = self.entry_mut(segment.name()) else {
                continue;
            };
            if entry.has_pending_changes() {
                written.extend(entry.write_pending(storage, segment)?);
                changed = true;
            }
        }
        if changed {
            infos.changed();
        }
        Ok(written)
    }

    /// Shared reader over the current state of `segment`, with one reference
    /// owned by the caller.
    pub fn reader(
        &mut self,
        storage: &dyn Storage,
        registry: &CodecRegistry,
        segment: &SegmentCommitInfo,
        deleter: &Arc<Mutex<IndexFileDeleter>>,
    ) -> Result<Arc<SegmentReader>> {
        let entry = self.get_or_load(storage, registry, segment)?;
        Ok(entry.reader(segment, deleter))
    }
}

/// Best-effort removal of an overlay whose write failed.
fn remove_partial(storage: &dyn Storage, name: &str) {
    if let Err(e) = storage.delete_file(name) {
        warn!("cannot remove partially written {name}: {e}");
    }
}
