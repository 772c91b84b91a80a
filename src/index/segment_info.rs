//! Per-segment metadata.
//!
//! [`SegmentInfo`] is the immutable identity of a segment and is persisted in
//! `_S.si`. [`SegmentCommitInfo`] wraps it with the mutable generation state
//! (live-docs and doc-values update generations) tracked by the catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::document::DocValuesType;
use crate::error::{HalberdError, Result};
use crate::index::field_infos::FieldInfos;
use crate::index::file_names::{
    DOC_VALUES_UPDATE_EXTENSION, LIVE_DOCS_EXTENSION, SEGMENT_INFO_EXTENSION, generation_file_name,
    segment_file_name,
};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const SEGMENT_INFO_MAGIC: u32 = 0x5345_4749; // "SEGI"
const SEGMENT_INFO_VERSION: u32 = 1;

/// Diagnostic key recording how the segment was produced (`flush` or `merge`).
pub const SOURCE_DIAGNOSTIC: &str = "source";
/// Diagnostic key recording when the segment was written.
pub const TIMESTAMP_DIAGNOSTIC: &str = "timestamp";

/// Immutable identity of a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub name: String,
    pub max_doc: u32,
    pub codec_name: String,
    pub codec_version: u32,
    pub id: Uuid,
    pub diagnostics: BTreeMap<String, String>,
    pub field_infos: FieldInfos,
    /// Base files, including the info file itself.
    pub files: Vec<String>,
    pub size_in_bytes: u64,
}

impl SegmentInfo {
    /// Name of the `.si` file of `segment`.
    pub fn file_name(segment: &str) -> String {
        segment_file_name(segment, SEGMENT_INFO_EXTENSION)
    }

    /// Write `_S.si`.
    pub fn write(&self, storage: &dyn Storage) -> Result<String> {
        let name = Self::file_name(&self.name);
        let mut writer = StructWriter::new(storage.create_output(&name)?);
        writer.write_header(SEGMENT_INFO_MAGIC, SEGMENT_INFO_VERSION)?;
        writer.write_string(&self.name)?;
        writer.write_u32(self.max_doc)?;
        writer.write_string(&self.codec_name)?;
        writer.write_u32(self.codec_version)?;
        writer.write_string(&self.id.to_string())?;
        writer.write_string_map(&self.diagnostics)?;
        writer.write_u64(self.size_in_bytes)?;

        writer.write_varint(self.files.len() as u64)?;
        for file in &self.files {
            writer.write_string(file)?;
        }

        writer.write_varint(self.field_infos.len() as u64)?;
        for field in self.field_infos.iter() {
            writer.write_string(&field.name)?;
            writer.write_u32(field.number)?;
            writer.write_u8(u8::from(field.indexed) | (u8::from(field.stored) << 1))?;
            writer.write_u8(field.doc_values.code())?;
        }
        writer.close()?;
        Ok(name)
    }

    /// Read `_S.si`.
    pub fn read(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let name = Self::file_name(segment);
        let mut reader = StructReader::open(storage, &name)?;
        reader.check_header(SEGMENT_INFO_MAGIC, SEGMENT_INFO_VERSION, SEGMENT_INFO_VERSION)?;

        let stored_name = reader.read_string()?;
        if stored_name != segment {
            return Err(HalberdError::corruption(
                &name,
                format!("segment info names {stored_name}, expected {segment}"),
            ));
        }
        let max_doc = reader.read_u32()?;
        let codec_name = reader.read_string()?;
        let codec_version = reader.read_u32()?;
        let id_text = reader.read_string()?;
        let id = Uuid::parse_str(&id_text)
            .map_err(|e| HalberdError::corruption(&name, format!("bad segment id: {e}")))?;
        let diagnostics = reader.read_string_map()?;
        let size_in_bytes = reader.read_u64()?;

        let file_count = reader.read_varint()?;
        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            files.push(reader.read_string()?);
        }

        let mut field_infos = FieldInfos::new();
        for _ in 0..reader.read_varint()? {
            let field = reader.read_string()?;
            let number = reader.read_u32()?;
            let flags = reader.read_u8()?;
            let code = reader.read_u8()?;
            let doc_values = DocValuesType::from_code(code).ok_or_else(|| {
                HalberdError::corruption(&name, format!("unknown doc-values type {code}"))
            })?;
            field_infos.add(&field, number, flags & 1 != 0, flags & 2 != 0, doc_values);
        }

        Ok(SegmentInfo {
            name: stored_name,
            max_doc,
            codec_name,
            codec_version,
            id,
            diagnostics,
            field_infos,
            files,
            size_in_bytes,
        })
    }
}

/// A segment as seen by one catalog: identity plus overlay generations.
///
/// Generations start at 1. The next-write generations only move forward, even
/// when a write fails, so a generation number is never written twice.
#[derive(Debug, Clone)]
pub struct SegmentCommitInfo {
    pub info: Arc<SegmentInfo>,
    del_count: u32,
    del_gen: Option<u64>,
    next_write_del_gen: u64,
    field_dv_gens: BTreeMap<String, u64>,
    dv_gen: Option<u64>,
    next_write_dv_gen: u64,
    /// Oldest buffered-updates packet generation still to be applied here.
    pub(crate) buffered_deletes_gen: u64,
}

impl SegmentCommitInfo {
    /// A freshly written segment without overlays.
    pub fn new(info: Arc<SegmentInfo>) -> Self {
        SegmentCommitInfo {
            info,
            del_count: 0,
            del_gen: None,
            next_write_del_gen: 1,
            field_dv_gens: BTreeMap::new(),
            dv_gen: None,
            next_write_dv_gen: 1,
            buffered_deletes_gen: 0,
        }
    }

    /// Restore from catalog fields.
    pub(crate) fn from_catalog(
        info: Arc<SegmentInfo>,
        del_count: u32,
        del_gen: Option<u64>,
        dv_gen: Option<u64>,
        field_dv_gens: BTreeMap<String, u64>,
    ) -> Self {
        SegmentCommitInfo {
            info,
            del_count,
            del_gen,
            next_write_del_gen: del_gen.map_or(1, |g| g + 1),
            field_dv_gens,
            dv_gen,
            next_write_dv_gen: dv_gen.map_or(1, |g| g + 1),
            buffered_deletes_gen: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    pub fn del_count(&self) -> u32 {
        self.del_count
    }

    pub fn num_live(&self) -> u32 {
        self.info.max_doc - self.del_count
    }

    pub fn del_gen(&self) -> Option<u64> {
        self.del_gen
    }

    pub fn dv_gen(&self) -> Option<u64> {
        self.dv_gen
    }

    pub fn field_dv_gens(&self) -> &BTreeMap<String, u64> {
        &self.field_dv_gens
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen.is_some()
    }

    pub fn has_field_updates(&self) -> bool {
        self.dv_gen.is_some()
    }

    pub fn next_write_del_gen(&self) -> u64 {
        self.next_write_del_gen
    }

    pub fn next_write_dv_gen(&self) -> u64 {
        self.next_write_dv_gen
    }

    /// Record a successful live-docs write at `next_write_del_gen`.
    pub(crate) fn advance_del_gen(&mut self, del_count: u32) {
        self.del_gen = Some(self.next_write_del_gen);
        self.next_write_del_gen += 1;
        self.del_count = del_count;
    }

    /// Skip a generation after a failed live-docs write.
    pub(crate) fn advance_next_write_del_gen(&mut self) {
        self.next_write_del_gen += 1;
    }

    /// Record a successful doc-values update write for `fields`.
    pub(crate) fn advance_dv_gen<'a, I: IntoIterator<Item = &'a String>>(&mut self, fields: I) {
        let generation = self.next_write_dv_gen;
        for field in fields {
            self.field_dv_gens.insert(field.clone(), generation);
        }
        self.dv_gen = Some(generation);
        self.next_write_dv_gen += 1;
    }

    /// Skip a generation after a failed doc-values update write.
    pub(crate) fn advance_next_write_dv_gen(&mut self) {
        self.next_write_dv_gen += 1;
    }

    /// Never write a generation below `generation` again.
    pub(crate) fn ensure_next_write_generations(&mut self, generation: u64) {
        self.next_write_del_gen = self.next_write_del_gen.max(generation);
        self.next_write_dv_gen = self.next_write_dv_gen.max(generation);
    }

    /// Current live-docs file, if the segment has deletions.
    pub fn live_docs_file_name(&self) -> Option<String> {
        self.del_gen
            .map(|g| generation_file_name(&self.info.name, g, LIVE_DOCS_EXTENSION))
    }

    /// Doc-values update file of generation `generation`.
    pub fn doc_values_update_file_name(&self, generation: u64) -> String {
        generation_file_name(&self.info.name, generation, DOC_VALUES_UPDATE_EXTENSION)
    }

    /// Update generations currently referenced, each with the fields it holds.
    pub fn doc_values_generations(&self) -> BTreeMap<u64, Vec<String>> {
        let mut by_gen: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for (field, generation) in &self.field_dv_gens {
            by_gen.entry(*generation).or_default().push(field.clone());
        }
        by_gen
    }

    /// Every file referenced by this segment in its current state.
    pub fn files(&self) -> Vec<String> {
        let mut files: BTreeSet<String> = self.info.files.iter().cloned().collect();
        if let Some(liv) = self.live_docs_file_name() {
            files.insert(liv);
        }
        for generation in self.field_dv_gens.values() {
            files.insert(self.doc_values_update_file_name(*generation));
        }
        files.into_iter().collect()
    }

    /// True when both views share the same base segment and overlay generations.
    pub fn same_generations(&self, other: &SegmentCommitInfo) -> bool {
        self.info.id == other.info.id
            && self.del_gen == other.del_gen
            && self.field_dv_gens == other.field_dv_gens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn info(name: &str, max_doc: u32) -> SegmentInfo {
        let mut field_infos = FieldInfos::new();
        field_infos.add("id", 0, true, true, DocValuesType::None);
        field_infos.add("val", 1, false, false, DocValuesType::Numeric);
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(SOURCE_DIAGNOSTIC.to_string(), "flush".to_string());
        SegmentInfo {
            name: name.to_string(),
            max_doc,
            codec_name: "standard".to_string(),
            codec_version: 2,
            id: Uuid::new_v4(),
            diagnostics,
            field_infos,
            files: vec![format!("{name}.si"), format!("{name}.pst")],
            size_in_bytes: 42,
        }
    }

    #[test]
    fn test_segment_info_write_read() {
        let storage = MemoryStorage::new_default();
        let original = info("_3", 7);
        assert_eq!(original.write(&storage).unwrap(), "_3.si");
        assert_eq!(SegmentInfo::read(&storage, "_3").unwrap(), original);
    }

    #[test]
    fn test_generations_only_move_forward() {
        let mut sci = SegmentCommitInfo::new(Arc::new(info("_0", 4)));
        assert_eq!(sci.files(), vec!["_0.pst", "_0.si"]);

        sci.advance_next_write_del_gen();
        sci.advance_del_gen(1);
        assert_eq!(sci.del_gen(), Some(2));
        assert_eq!(sci.next_write_del_gen(), 3);
        assert_eq!(sci.live_docs_file_name().unwrap(), "_0_2.liv");

        sci.advance_dv_gen(&["val".to_string()]);
        sci.advance_dv_gen(&["other".to_string()]);
        assert_eq!(sci.field_dv_gens().get("val"), Some(&1));
        assert_eq!(sci.field_dv_gens().get("other"), Some(&2));
        assert_eq!(
            sci.files(),
            vec!["_0.pst", "_0.si", "_0_1.dvu", "_0_2.dvu", "_0_2.liv"]
        );
        assert_eq!(sci.num_live(), 3);
    }
}
