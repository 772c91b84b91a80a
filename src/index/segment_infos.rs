//! The segment catalog.
//!
//! A [`SegmentInfos`] is the authoritative list of live segments with their
//! overlay generations and the opaque user commit data. Each commit writes a
//! new `segments_N` file; older files keep describing older commits until the
//! deletion policy removes them.
//!
//! Reading the latest commit tolerates a damaged newest catalog: a truncated
//! or checksum-failing `segments_N` is skipped in favour of the previous
//! generation. Format errors are never skipped.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{HalberdError, Result};
use crate::index::file_names::{commit_generation, segments_file_name};
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const SEGMENTS_MAGIC: u32 = 0x5345_4753; // "SEGS"
const SEGMENTS_VERSION: u32 = 1;

/// Retries when the newest commit disappears while it is being read.
const MAX_READ_ATTEMPTS: usize = 3;

/// List of segments plus commit metadata.
#[derive(Debug, Clone)]
pub struct SegmentInfos {
    id: Uuid,
    /// Next segment number to hand out.
    pub(crate) counter: u64,
    /// Incremented on every change; lets readers detect staleness cheaply.
    pub(crate) version: u64,
    generation: Option<u64>,
    pub(crate) user_data: BTreeMap<String, String>,
    segments: Vec<SegmentCommitInfo>,
}

impl Default for SegmentInfos {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentInfos {
    /// An empty catalog that has never been committed.
    pub fn new() -> Self {
        SegmentInfos {
            id: Uuid::new_v4(),
            counter: 0,
            version: 0,
            generation: None,
            user_data: BTreeMap::new(),
            segments: Vec::new(),
        }
    }

    /// Generation of the commit this catalog was read from or last written as.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = Some(generation);
    }

    /// `segments_N` name of this catalog's generation.
    pub fn segments_file_name(&self) -> Option<String> {
        self.generation.map(segments_file_name)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [SegmentCommitInfo] {
        &mut self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Mark the catalog as changed.
    pub(crate) fn changed(&mut self) {
        self.version += 1;
    }

    /// Reserve the next segment name.
    #[cfg(test)]
    pub(crate) fn new_segment_name(&mut self) -> String {
        let name = crate::index::file_names::segment_name(self.counter);
        self.counter += 1;
        self.changed();
        name
    }

    pub(crate) fn add(&mut self, segment: SegmentCommitInfo) {
        self.segments.push(segment);
        self.changed();
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<SegmentCommitInfo> {
        let index = self.segments.iter().position(|s| s.name() == name)?;
        self.changed();
        Some(self.segments.remove(index))
    }

    /// Replace `sources` by `merged`, which takes the position of the first source.
    pub(crate) fn apply_merge(&mut self, sources: &[String], merged: Option<SegmentCommitInfo>) {
        let mut inserted = false;
        let mut kept = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            if sources.iter().any(|s| s == segment.name()) {
                if !inserted {
                    if let Some(merged) = merged.clone() {
                        kept.push(merged);
                    }
                    inserted = true;
                }
            } else {
                kept.push(segment);
            }
        }
        self.segments = kept;
        self.changed();
    }

    pub(crate) fn clear(&mut self) {
        self.segments.clear();
        self.changed();
    }

    /// Total document slots across segments.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.max_doc() as u64).sum()
    }

    /// Every file this catalog references, sorted.
    pub fn files(&self, include_segments_file: bool) -> Vec<String> {
        let mut files: Vec<String> = self.segments.iter().flat_map(|s| s.files()).collect();
        if include_segments_file {
            files.extend(self.segments_file_name());
        }
        files.sort();
        files.dedup();
        files
    }

    /// Write the catalog body to `file_name` (a pending or final catalog name).
    pub(crate) fn write(&self, storage: &dyn Storage, file_name: &str, generation: u64) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(file_name)?);
        writer.write_header(SEGMENTS_MAGIC, SEGMENTS_VERSION)?;
        writer.write_string(&self.id.to_string())?;
        writer.write_u64(self.version)?;
        writer.write_u64(self.counter)?;
        writer.write_u64(generation)?;
        writer.write_string_map(&self.user_data)?;

        writer.write_varint(self.segments.len() as u64)?;
        for segment in &self.segments {
            writer.write_string(segment.name())?;
            writer.write_string(&segment.info.id.to_string())?;
            writer.write_varint(segment.del_gen().unwrap_or(0))?;
            writer.write_u32(segment.del_count())?;
            writer.write_varint(segment.dv_gen().unwrap_or(0))?;
            writer.write_varint(segment.field_dv_gens().len() as u64)?;
            for (field, generation) in segment.field_dv_gens() {
                writer.write_string(field)?;
                writer.write_varint(*generation)?;
            }
        }
        writer.close()
    }

    /// Read one specific `segments_N` file and the infos of its segments.
    pub fn read_commit(storage: &dyn Storage, file_name: &str) -> Result<Self> {
        let generation = commit_generation(file_name).ok_or_else(|| {
            HalberdError::invalid_argument(format!("{file_name} is not a segments file"))
        })?;

        let mut reader = StructReader::open(storage, file_name)?;
        reader.check_header(SEGMENTS_MAGIC, SEGMENTS_VERSION, SEGMENTS_VERSION)?;

        let id = parse_uuid(file_name, &reader.read_string()?)?;
        let version = reader.read_u64()?;
        let counter = reader.read_u64()?;
        let stored_generation = reader.read_u64()?;
        if stored_generation != generation {
            return Err(HalberdError::corruption(
                file_name,
                format!("catalog says generation {stored_generation}"),
            ));
        }
        let user_data = reader.read_string_map()?;

        let count = reader.read_varint()?;
        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = reader.read_string()?;
            let segment_id = parse_uuid(file_name, &reader.read_string()?)?;
            let del_gen = non_zero(reader.read_varint()?);
            let del_count = reader.read_u32()?;
            let dv_gen = non_zero(reader.read_varint()?);
            let mut field_dv_gens = BTreeMap::new();
            for _ in 0..reader.read_varint()? {
                let field = reader.read_string()?;
                field_dv_gens.insert(field, reader.read_varint()?);
            }

            let info = SegmentInfo::read(storage, &name)?;
            if info.id != segment_id {
                return Err(HalberdError::corruption(
                    SegmentInfo::file_name(&name),
                    format!("segment id does not match {file_name}"),
                ));
            }
            if del_count > info.max_doc {
                return Err(HalberdError::corruption(
                    file_name,
                    format!("segment {name} has {del_count} deletions but {} docs", info.max_doc),
                ));
            }
            segments.push(SegmentCommitInfo::from_catalog(
                Arc::new(info),
                del_count,
                del_gen,
                dv_gen,
                field_dv_gens,
            ));
        }

        Ok(SegmentInfos {
            id,
            counter,
            version,
            generation: Some(generation),
            user_data,
            segments,
        })
    }

    /// Read the newest readable commit.
    ///
    /// Corrupt, truncated or vanished catalogs fall back to the previous
    /// generation; format errors propagate. Fails with `IndexNotFound` when
    /// the storage holds no commit at all.
    pub fn read_latest(storage: &dyn Storage) -> Result<Self> {
        let mut first_error = None;
        for attempt in 0..MAX_READ_ATTEMPTS {
            let mut generations: Vec<u64> = storage
                .list_files()?
                .iter()
                .filter_map(|f| commit_generation(f))
                .collect();
            if generations.is_empty() {
                return Err(first_error.unwrap_or_else(|| {
                    HalberdError::IndexNotFound("no segments_N file in storage".to_string())
                }));
            }
            generations.sort_unstable_by(|a, b| b.cmp(a));
            let newest = generations[0];

            for generation in &generations {
                let file_name = segments_file_name(*generation);
                match Self::read_commit(storage, &file_name) {
                    Ok(infos) => return Ok(infos),
                    Err(e) if e.is_format_error() => return Err(e),
                    Err(e) if e.is_corruption() || e.is_not_found() => {
                        warn!("skipping unreadable commit {file_name}: {e}");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            // A newer commit may have replaced the ones we tried.
            let latest_now = storage
                .list_files()?
                .iter()
                .filter_map(|f| commit_generation(f))
                .max();
            if latest_now.is_none_or(|g| g <= newest) {
                break;
            }
            debug!("commit list changed while reading (attempt {attempt}), retrying");
        }

        Err(first_error.unwrap_or_else(|| HalberdError::IndexNotFound("no readable commit".to_string())))
    }
}

fn non_zero(value: u64) -> Option<u64> {
    (value != 0).then_some(value)
}

fn parse_uuid(file_name: &str, text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| HalberdError::corruption(file_name, format!("bad id: {e}")))
}
