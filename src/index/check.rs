//! Offline verification of the latest commit.

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::codec::CodecRegistry;
use crate::index::segment_info::{SegmentCommitInfo, SegmentInfo};
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::SegmentReader;
use crate::storage::Storage;

/// Outcome of checking one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCheck {
    pub name: String,
    pub codec: String,
    pub codec_version: u32,
    pub max_doc: u32,
    /// Live documents as decoded from the live-docs generation.
    pub num_docs: Option<u32>,
    pub del_gen: Option<u64>,
    pub dv_gen: Option<u64>,
    pub files: Vec<String>,
    pub error: Option<String>,
}

impl SegmentCheck {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of [`check_index`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIndexReport {
    pub generation: Option<u64>,
    pub segments_file: Option<String>,
    pub user_data: std::collections::BTreeMap<String, String>,
    pub segments: Vec<SegmentCheck>,
    /// Files the commit names that are missing from storage.
    pub missing_files: Vec<String>,
    pub clean: bool,
}

/// Read every file of the latest commit, verifying checksums, document
/// counts and live-docs cardinality.
///
/// Fails only if no commit can be read at all; problems with individual
/// segments are reported in the result.
pub fn check_index(storage: &dyn Storage, registry: &CodecRegistry) -> Result<CheckIndexReport> {
    let infos = SegmentInfos::read_latest(storage)?;
    let missing_files: Vec<String> = infos
        .files(true)
        .into_iter()
        .filter(|f| !storage.file_exists(f))
        .collect();

    let segments: Vec<SegmentCheck> = infos
        .segments()
        .iter()
        .map(|segment| check_segment(storage, registry, segment))
        .collect();

    let clean = missing_files.is_empty() && segments.iter().all(SegmentCheck::ok);
    if !clean {
        warn!(
            "index check of generation {:?} found problems ({} missing files)",
            infos.generation(),
            missing_files.len()
        );
    }
    Ok(CheckIndexReport {
        generation: infos.generation(),
        segments_file: infos.segments_file_name(),
        user_data: infos.user_data().clone(),
        segments,
        missing_files,
        clean,
    })
}

fn check_segment(storage: &dyn Storage, registry: &CodecRegistry, segment: &SegmentCommitInfo) -> SegmentCheck {
    let mut check = SegmentCheck {
        name: segment.name().to_string(),
        codec: segment.info.codec_name.clone(),
        codec_version: segment.info.codec_version,
        max_doc: segment.max_doc(),
        num_docs: None,
        del_gen: segment.del_gen(),
        dv_gen: segment.dv_gen(),
        files: segment.files(),
        error: None,
    };
    match verify(storage, registry, segment) {
        Ok(num_docs) => check.num_docs = Some(num_docs),
        Err(message) => check.error = Some(message),
    }
    debug!("checked segment {}: {:?}", check.name, check.error);
    check
}

fn verify(storage: &dyn Storage, registry: &CodecRegistry, segment: &SegmentCommitInfo) -> std::result::Result<u32, String> {
    let on_disk = SegmentInfo::read(storage, segment.name()).map_err(|e| e.to_string())?;
    if on_disk.id != segment.info.id {
        return Err(format!(
            "segment id {} does not match the catalog's {}",
            on_disk.id, segment.info.id
        ));
    }
    if on_disk.max_doc != segment.max_doc() {
        return Err(format!(
            "segment info has {} docs, the catalog {}",
            on_disk.max_doc,
            segment.max_doc()
        ));
    }

    let reader = Arc::new(SegmentReader::open(storage, registry, segment).map_err(|e| e.to_string())?);
    let num_docs = reader.num_docs();
    let result = if reader.core().data.max_doc != segment.max_doc() {
        Err(format!(
            "codec decoded {} docs, expected {}",
            reader.core().data.max_doc,
            segment.max_doc()
        ))
    } else if num_docs != segment.num_live() {
        Err(format!(
            "live docs count {num_docs} but the catalog records {} deletions",
            segment.del_count()
        ))
    } else {
        Ok(num_docs)
    };
    if let Err(e) = reader.dec_ref() {
        warn!("releasing checked reader of {}: {e}", segment.name());
    }
    result
}
