//! Combines the live documents of several segments into one new segment.
//!
//! Sources are read from the snapshots taken when the merge started, so
//! deletes and doc-values updates that arrive while the merge runs are not
//! seen here; the writer carries them over to the merged segment when it
//! commits the merge, using the [`DocMap`]s returned with the result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::error::Result;
use crate::index::codec::{Codec, FieldPostings, SegmentData};
use crate::index::doc_values::DocValuesColumn;
use crate::index::doc_writer_per_thread::remove_segment_files;
use crate::index::field_infos::{FieldInfos, FieldNumbers};
use crate::index::merge_policy::{MergeStats, OneMerge};
use crate::index::reader_pool::SegmentSnapshot;
use crate::index::segment_info::{SOURCE_DIAGNOSTIC, SegmentCommitInfo, SegmentInfo, TIMESTAMP_DIAGNOSTIC};
use crate::index::segment_reader::SegmentCore;
use crate::storage::Storage;

/// Diagnostic listing the source segments of a merged segment.
pub const MERGED_FROM_DIAGNOSTIC: &str = "merged_from";

/// New doc id, in the merged segment, of every doc of one source segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocMap {
    map: Vec<Option<u32>>,
}

impl DocMap {
    fn build(source: &SegmentSnapshot, base: u32) -> Self {
        let mut next = base;
        let map = (0..source.core.info.max_doc)
            .map(|doc| {
                source.is_live(doc).then(|| {
                    let mapped = next;
                    next += 1;
                    mapped
                })
            })
            .collect();
        DocMap { map }
    }

    /// `None` for a document that was dropped.
    pub fn get(&self, doc: u32) -> Option<u32> {
        self.map.get(doc as usize).copied().flatten()
    }

    pub fn num_live(&self) -> u32 {
        self.map.iter().filter(|d| d.is_some()).count() as u32
    }
}

/// A merged segment written to storage but not yet in the catalog.
#[derive(Debug)]
pub struct MergedSegment {
    pub segment: SegmentCommitInfo,
    pub core: Arc<SegmentCore>,
    /// One map per source, in source order.
    pub doc_maps: Vec<DocMap>,
    pub files: Vec<String>,
    pub stats: MergeStats,
}

pub(crate) struct SegmentMerger<'a> {
    storage: &'a dyn Storage,
    codec: &'a dyn Codec,
    field_numbers: &'a FieldNumbers,
    name: &'a str,
}

impl<'a> SegmentMerger<'a> {
    pub fn new(storage: &'a dyn Storage, codec: &'a dyn Codec, field_numbers: &'a FieldNumbers, name: &'a str) -> Self {
        SegmentMerger {
            storage,
            codec,
            field_numbers,
            name,
        }
    }

    /// Merge `inputs`, the sources of `merge` in catalog order.
    ///
    /// Returns `None`, writing nothing, when no source has a live document.
    /// Checks for an abort between phases; on any failure the files of the
    /// new segment are removed.
    pub fn merge(&self, merge: &OneMerge, inputs: &[SegmentSnapshot]) -> Result<Option<MergedSegment>> {
        let start = Instant::now();
        match self.write(merge, inputs, start) {
            Ok(merged) => Ok(merged),
            Err(e) => {
                debug!("merge {} into {} failed: {e}", merge.id, self.name);
                remove_segment_files(self.storage, self.name);
                Err(e)
            }
        }
    }

    fn write(&self, merge: &OneMerge, inputs: &[SegmentSnapshot], start: Instant) -> Result<Option<MergedSegment>> {
        merge.check_aborted()?;
        let mut doc_maps = Vec::with_capacity(inputs.len());
        let mut max_doc = 0u32;
        for input in inputs {
            let map = DocMap::build(input, max_doc);
            max_doc += map.num_live();
            doc_maps.push(map);
        }
        let docs_in: u64 = inputs.iter().map(|i| i.core.info.max_doc as u64).sum();
        if max_doc == 0 {
            debug!("merge {}: no live documents in {:?}", merge.id, merge.segments);
            return Ok(None);
        }

        let mut data = SegmentData {
            max_doc,
            ..SegmentData::default()
        };
        merge_postings(&mut data, inputs, &doc_maps);
        merge.check_aborted()?;
        merge_stored(&mut data, inputs, &doc_maps);
        merge_doc_values(&mut data, inputs, &doc_maps);
        merge.check_aborted()?;

        let field_infos = self.merge_field_infos(inputs, &data);
        let mut files = self.codec.write_segment(self.storage, self.name, &data)?;
        let mut size_in_bytes = 0;
        for file in &files {
            size_in_bytes += self.storage.file_size(file)?;
        }
        files.push(SegmentInfo::file_name(self.name));

        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(SOURCE_DIAGNOSTIC.to_string(), "merge".to_string());
        diagnostics.insert(TIMESTAMP_DIAGNOSTIC.to_string(), chrono::Utc::now().to_rfc3339());
        diagnostics.insert(MERGED_FROM_DIAGNOSTIC.to_string(), merge.segments.join(","));
        let info = Arc::new(SegmentInfo {
            name: self.name.to_string(),
            max_doc,
            codec_name: self.codec.name().to_string(),
            codec_version: self.codec.format_version(),
            id: uuid::Uuid::new_v4(),
            diagnostics,
            field_infos,
            files: files.clone(),
            size_in_bytes,
        });
        info.write(self.storage)?;
        merge.check_aborted()?;

        let stats = MergeStats {
            segments_merged: inputs.len(),
            docs_in,
            docs_out: max_doc as u64,
            bytes_written: size_in_bytes,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            "merged {:?} into {} ({docs_in} -> {max_doc} docs) in {:?}",
            merge.segments,
            self.name,
            start.elapsed()
        );
        Ok(Some(MergedSegment {
            segment: SegmentCommitInfo::new(Arc::clone(&info)),
            core: Arc::new(SegmentCore { info, data }),
            doc_maps,
            files,
            stats,
        }))
    }

    fn merge_field_infos(&self, inputs: &[SegmentSnapshot], data: &SegmentData) -> FieldInfos {
        let mut field_infos = FieldInfos::new();
        for input in inputs {
            for field in input.core.info.field_infos.iter() {
                if field_infos.get(&field.name).is_none() {
                    field_infos.add_info(field);
                }
            }
        }
        // columns created by updates on segments that never had the field
        for (name, column) in &data.doc_values {
            if field_infos.get(name).is_none() {
                match self.field_numbers.number(name) {
                    Some(number) => field_infos.add(name, number, false, false, column.kind()),
                    None => warn!("merged column {name} has no field number"),
                }
            }
        }
        field_infos
    }
}

fn merge_postings(data: &mut SegmentData, inputs: &[SegmentSnapshot], doc_maps: &[DocMap]) {
    for (input, map) in inputs.iter().zip(doc_maps) {
        for (field, terms) in &input.core.data.postings {
            let merged: &mut FieldPostings = data.postings.entry(field.clone()).or_default();
            for (term, docs) in terms {
                let mapped: Vec<u32> = docs.iter().filter_map(|&d| map.get(d)).collect();
                if !mapped.is_empty() {
                    // sources are appended in order, so doc ids stay sorted
                    merged.entry(term.clone()).or_default().extend(mapped);
                }
            }
        }
    }
    data.postings.retain(|_, terms| !terms.is_empty());
}

fn merge_stored(data: &mut SegmentData, inputs: &[SegmentSnapshot], doc_maps: &[DocMap]) {
    data.stored.reserve(data.max_doc as usize);
    for (input, map) in inputs.iter().zip(doc_maps) {
        for doc in 0..input.core.info.max_doc {
            if map.get(doc).is_some() {
                data.stored.push(input.core.data.stored_fields(doc).to_vec());
            }
        }
    }
}

fn merge_doc_values(data: &mut SegmentData, inputs: &[SegmentSnapshot], doc_maps: &[DocMap]) {
    let mut fields: BTreeMap<String, DocValuesColumn> = BTreeMap::new();
    for input in inputs {
        let names = input.core.data.doc_values.keys().chain(input.doc_values.keys());
        for name in names {
            if fields.contains_key(name) {
                continue;
            }
            if let Some(column) = input.column(name) {
                if let Some(empty) = DocValuesColumn::empty(column.kind(), data.max_doc) {
                    fields.insert(name.clone(), empty);
                }
            }
        }
    }

    for (name, merged) in fields.iter_mut() {
        for (input, map) in inputs.iter().zip(doc_maps) {
            let Some(column) = input.column(name) else {
                continue;
            };
            for doc in 0..input.core.info.max_doc {
                if let Some(to) = map.get(doc) {
                    merged.copy_slot(to as usize, column, doc as usize);
                }
            }
        }
    }
    fields.retain(|_, column| column.docs_with_field() > 0);
    data.doc_values = fields;
}
