//! Merge policies and merge bookkeeping.
//!
//! A [`MergePolicy`] looks at the current segments and proposes groups of
//! adjacent segments to combine. The writer turns each proposal into a
//! [`OneMerge`] and registers its segments in the [`MergeInventory`], so no
//! segment ever takes part in two merges at once.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::HalberdError;
use crate::index::reader_pool::SegmentSnapshot;

/// What caused a call to [`MergePolicy::find_merges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeTrigger {
    /// A single indexing thread flushed a segment.
    SegmentFlush,
    /// Every buffer was flushed (commit, NRT reader, explicit flush).
    FullFlush,
    /// `maybe_merge` was called.
    Explicit,
    /// A merge finished and its result may combine further.
    MergeFinished,
}

/// What a policy knows about one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSegmentInfo {
    pub name: String,
    pub size_bytes: u64,
    pub doc_count: u32,
    pub deleted_count: u32,
    pub is_merging: bool,
}

impl MergeSegmentInfo {
    pub fn deletion_ratio(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.deleted_count as f64 / self.doc_count as f64
        }
    }

    pub fn live_docs(&self) -> u32 {
        self.doc_count - self.deleted_count
    }
}

/// A group of adjacent segments proposed for one merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub segments: Vec<String>,
    pub estimated_size: u64,
}

impl MergeCandidate {
    fn from_infos(infos: &[MergeSegmentInfo]) -> Self {
        MergeCandidate {
            segments: infos.iter().map(|s| s.name.clone()).collect(),
            estimated_size: infos.iter().map(|s| s.size_bytes).sum(),
        }
    }
}

/// Trait for defining merge policies.
///
/// Segments are always passed in catalog order and candidates must name
/// adjacent segments, so merged documents keep their relative order.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Merges worth running after `trigger`.
    fn find_merges(&self, trigger: MergeTrigger, segments: &[MergeSegmentInfo]) -> Vec<MergeCandidate>;

    /// Merges bringing the index down to at most `max_segment_count` segments.
    /// Called repeatedly until it returns nothing.
    fn find_forced_merges(&self, segments: &[MergeSegmentInfo], max_segment_count: usize) -> Vec<MergeCandidate>;

    /// Merges that expunge every deleted document.
    fn find_forced_deletes_merges(&self, segments: &[MergeSegmentInfo]) -> Vec<MergeCandidate>;

    /// Whether a segment without live documents stays in the catalog.
    fn keep_fully_deleted_segment(&self, _segment: &str) -> bool {
        false
    }

    fn name(&self) -> &'static str;

    /// Get policy configuration as key-value pairs for debugging.
    fn get_config(&self) -> HashMap<String, String>;
}

/// How [`LogMergePolicy`] measures segment size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeMeasure {
    Bytes,
    Docs,
}

/// Merges segments of roughly equal size, level by level.
///
/// Segment sizes are mapped to levels on a logarithmic scale with base
/// `merge_factor`. Whenever `merge_factor` adjacent segments share a level
/// they are merged into one segment of the next level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMergePolicy {
    /// Number of segments merged at once, and the base of the level scale.
    pub merge_factor: usize,
    pub measure: SizeMeasure,
    /// Segments below this size all count as the lowest level.
    pub min_merge_size: u64,
    /// Segments at or above this size are not merged by `find_merges`.
    pub max_merge_size: u64,
    /// Same as `max_merge_size`, for forced merges.
    pub max_merge_size_for_forced_merge: u64,
    /// Scale sizes down by the ratio of deleted documents.
    pub calibrate_size_by_deletes: bool,
    pub keep_fully_deleted_segments: bool,
}

/// Width of one level window on the log scale.
pub const LEVEL_LOG_SPAN: f64 = 0.75;
pub const DEFAULT_MERGE_FACTOR: usize = 10;
const MB: f64 = 1024.0 * 1024.0;

impl Default for LogMergePolicy {
    fn default() -> Self {
        Self::by_bytes()
    }
}

impl LogMergePolicy {
    /// Size measured in bytes: levels start at 1.6 MB, nothing above 2 GB is merged.
    pub fn by_bytes() -> Self {
        LogMergePolicy {
            merge_factor: DEFAULT_MERGE_FACTOR,
            measure: SizeMeasure::Bytes,
            min_merge_size: (1.6 * MB) as u64,
            max_merge_size: (2048.0 * MB) as u64,
            max_merge_size_for_forced_merge: u64::MAX,
            calibrate_size_by_deletes: true,
            keep_fully_deleted_segments: false,
        }
    }

    /// Size measured in documents: levels start at 1000 docs.
    pub fn by_docs() -> Self {
        LogMergePolicy {
            merge_factor: DEFAULT_MERGE_FACTOR,
            measure: SizeMeasure::Docs,
            min_merge_size: 1000,
            max_merge_size: u64::MAX,
            max_merge_size_for_forced_merge: u64::MAX,
            calibrate_size_by_deletes: true,
            keep_fully_deleted_segments: false,
        }
    }

    pub fn with_merge_factor(mut self, merge_factor: usize) -> Self {
        self.merge_factor = merge_factor.max(2);
        self
    }

    fn size(&self, segment: &MergeSegmentInfo) -> u64 {
        let raw = match self.measure {
            SizeMeasure::Bytes => segment.size_bytes,
            SizeMeasure::Docs => segment.doc_count as u64,
        };
        if self.calibrate_size_by_deletes {
            (raw as f64 * (1.0 - segment.deletion_ratio())) as u64
        } else {
            raw
        }
    }

    fn level(&self, size: u64) -> f64 {
        (size.max(1) as f64).ln() / (self.merge_factor as f64).ln()
    }

    fn too_large(&self, segment: &MergeSegmentInfo, limit: u64) -> bool {
        self.size(segment) >= limit
    }

    /// A single segment is fully merged when it has no deletions.
    fn is_merged(&self, segments: &[MergeSegmentInfo], max_segment_count: usize) -> bool {
        match segments {
            [] => true,
            [only] => max_segment_count >= 1 && only.deleted_count == 0,
            many => many.len() <= max_segment_count && max_segment_count > 1,
        }
    }
}

impl MergePolicy for LogMergePolicy {
    fn find_merges(&self, _trigger: MergeTrigger, segments: &[MergeSegmentInfo]) -> Vec<MergeCandidate> {
        let mut candidates = Vec::new();
        if segments.is_empty() {
            return candidates;
        }

        let levels: Vec<f64> = segments.iter().map(|s| self.level(self.size(s))).collect();
        let level_floor = if self.min_merge_size == 0 {
            0.0
        } else {
            self.level(self.min_merge_size)
        };

        let num = segments.len();
        let mut start = 0;
        while start < num {
            let max_level = levels[start..].iter().copied().fold(f64::MIN, f64::max);

            let level_bottom = if max_level <= level_floor {
                -1.0
            } else {
                (max_level - LEVEL_LOG_SPAN).max(level_floor)
            };

            let mut upto = num - 1;
            while upto > start && levels[upto] < level_bottom {
                upto -= 1;
            }

            let mut end = start + self.merge_factor;
            while end <= upto + 1 {
                let window = &segments[start..end];
                let blocked = window
                    .iter()
                    .any(|s| s.is_merging || self.too_large(s, self.max_merge_size));
                if !blocked {
                    candidates.push(MergeCandidate::from_infos(window));
                }
                start = end;
                end = start + self.merge_factor;
            }
            start = upto + 1;
        }

        if !candidates.is_empty() {
            debug!("{} proposes {} merges", self.name(), candidates.len());
        }
        candidates
    }

    fn find_forced_merges(&self, segments: &[MergeSegmentInfo], max_segment_count: usize) -> Vec<MergeCandidate> {
        let max_segment_count = max_segment_count.max(1);
        if segments.iter().any(|s| s.is_merging) || self.is_merged(segments, max_segment_count) {
            return Vec::new();
        }

        // segments too large to merge split the index into independent runs
        let mut candidates = Vec::new();
        let mut last = segments.len();
        while last > 0 && self.too_large(&segments[last - 1], self.max_merge_size_for_forced_merge) {
            last -= 1;
        }

        while last >= max_segment_count + self.merge_factor - 1 && last >= self.merge_factor {
            candidates.push(MergeCandidate::from_infos(&segments[last - self.merge_factor..last]));
            last -= self.merge_factor;
        }

        if candidates.is_empty() {
            if max_segment_count == 1 {
                if last > 1 || (last == 1 && segments[0].deleted_count > 0) {
                    candidates.push(MergeCandidate::from_infos(&segments[..last]));
                }
            } else if last > max_segment_count {
                // merge the smallest window that brings the count down
                let window = last - max_segment_count + 1;
                let best = (0..=last - window)
                    .min_by_key(|&i| segments[i..i + window].iter().map(|s| self.size(s)).sum::<u64>())
                    .unwrap_or(0);
                candidates.push(MergeCandidate::from_infos(&segments[best..best + window]));
            }
        }
        candidates
    }

    fn find_forced_deletes_merges(&self, segments: &[MergeSegmentInfo]) -> Vec<MergeCandidate> {
        let mut candidates = Vec::new();
        let mut run: Vec<MergeSegmentInfo> = Vec::new();
        for segment in segments {
            if segment.deleted_count > 0 && !segment.is_merging {
                run.push(segment.clone());
                if run.len() == self.merge_factor {
                    candidates.push(MergeCandidate::from_infos(&run));
                    run.clear();
                }
            } else if !run.is_empty() {
                candidates.push(MergeCandidate::from_infos(&run));
                run.clear();
            }
        }
        if !run.is_empty() {
            candidates.push(MergeCandidate::from_infos(&run));
        }
        candidates
    }

    fn keep_fully_deleted_segment(&self, _segment: &str) -> bool {
        self.keep_fully_deleted_segments
    }

    fn name(&self) -> &'static str {
        match self.measure {
            SizeMeasure::Bytes => "log_byte_size",
            SizeMeasure::Docs => "log_doc",
        }
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("merge_factor".to_string(), self.merge_factor.to_string());
        config.insert("measure".to_string(), format!("{:?}", self.measure));
        config.insert("min_merge_size".to_string(), self.min_merge_size.to_string());
        config.insert("max_merge_size".to_string(), self.max_merge_size.to_string());
        config.insert(
            "max_merge_size_for_forced_merge".to_string(),
            self.max_merge_size_for_forced_merge.to_string(),
        );
        config.insert(
            "calibrate_size_by_deletes".to_string(),
            self.calibrate_size_by_deletes.to_string(),
        );
        config
    }
}

/// Never merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _trigger: MergeTrigger, _segments: &[MergeSegmentInfo]) -> Vec<MergeCandidate> {
        Vec::new()
    }

    fn find_forced_merges(&self, _segments: &[MergeSegmentInfo], _max_segment_count: usize) -> Vec<MergeCandidate> {
        Vec::new()
    }

    fn find_forced_deletes_merges(&self, _segments: &[MergeSegmentInfo]) -> Vec<MergeCandidate> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        "no_merge"
    }

    fn get_config(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Segments currently taking part in a merge.
#[derive(Debug, Default)]
pub struct MergeInventory {
    inner: Mutex<HashSet<String>>,
}

impl MergeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a merge. Returns `None` if any segment is already merging.
    pub fn try_register(self: &Arc<Self>, segments: Vec<String>) -> Option<MergeGuard> {
        let mut inner = self.inner.lock();
        if let Some(busy) = segments.iter().find(|s| inner.contains(*s)) {
            debug!("merge rejected: {busy} already merging ({} active)", inner.len());
            return None;
        }
        inner.extend(segments.iter().cloned());
        Some(MergeGuard {
            inventory: Arc::clone(self),
            segments,
        })
    }

    pub fn contains(&self, segment: &str) -> bool {
        self.inner.lock().contains(segment)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Unregisters its segments when dropped.
#[derive(Debug)]
pub struct MergeGuard {
    inventory: Arc<MergeInventory>,
    segments: Vec<String>,
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        let mut inner = self.inventory.inner.lock();
        for segment in &self.segments {
            inner.remove(segment);
        }
    }
}

/// Statistics of one finished merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub segments_merged: usize,
    pub docs_in: u64,
    pub docs_out: u64,
    pub bytes_written: u64,
    pub elapsed_ms: u64,
}

/// One registered merge.
pub struct OneMerge {
    pub id: u64,
    /// Source segments in catalog order.
    pub segments: Vec<String>,
    /// Part of a `force_merge` or `force_merge_deletes` request.
    pub forced: bool,
    pub estimated_size: u64,
    aborted: AtomicBool,
    error: Mutex<Option<HalberdError>>,
    stats: Mutex<Option<MergeStats>>,
    pub(crate) guard: Mutex<Option<MergeGuard>>,
    /// Source state captured when the merge starts.
    pub(crate) inputs: Mutex<Vec<SegmentSnapshot>>,
}

impl fmt::Debug for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneMerge")
            .field("id", &self.id)
            .field("segments", &self.segments)
            .field("forced", &self.forced)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl OneMerge {
    pub(crate) fn new(id: u64, candidate: MergeCandidate, forced: bool, guard: MergeGuard) -> Self {
        OneMerge {
            id,
            segments: candidate.segments,
            forced,
            estimated_size: candidate.estimated_size,
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
            stats: Mutex::new(None),
            guard: Mutex::new(Some(guard)),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Fails with `MergeAborted` once the merge was aborted.
    pub fn check_aborted(&self) -> crate::error::Result<()> {
        if self.is_aborted() {
            return Err(HalberdError::merge_aborted(format!("merge {} of {:?}", self.id, self.segments)));
        }
        Ok(())
    }

    pub(crate) fn set_error(&self, error: &HalberdError) {
        self.error.lock().get_or_insert_with(|| error.duplicate());
    }

    /// A copy of the error the merge failed with.
    pub fn error(&self) -> Option<HalberdError> {
        self.error.lock().as_ref().map(|e| e.duplicate())
    }

    pub(crate) fn set_stats(&self, stats: MergeStats) {
        *self.stats.lock() = Some(stats);
    }

    pub fn stats(&self) -> Option<MergeStats> {
        self.stats.lock().clone()
    }

    /// Release the inventory registration.
    pub(crate) fn release(&self) {
        self.guard.lock().take();
        self.inputs.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(sizes: &[u32]) -> Vec<MergeSegmentInfo> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &docs)| MergeSegmentInfo {
                name: format!("_{i}"),
                size_bytes: docs as u64 * 100,
                doc_count: docs,
                deleted_count: 0,
                is_merging: false,
            })
            .collect()
    }

    fn doc_policy(merge_factor: usize) -> LogMergePolicy {
        LogMergePolicy {
            min_merge_size: 1,
            ..LogMergePolicy::by_docs().with_merge_factor(merge_factor)
        }
    }

    #[test]
    fn test_equal_segments_merge_in_groups() {
        let policy = doc_policy(3);
        let merges = policy.find_merges(MergeTrigger::SegmentFlush, &segs(&[2, 2, 2, 2, 2, 2, 2]));
        assert_eq!(merges.len(), 2);
        assert_eq!(merges[0].segments, vec!["_0", "_1", "_2"]);
        assert_eq!(merges[1].segments, vec!["_3", "_4", "_5"]);
    }

    #[test]
    fn test_not_enough_segments() {
        let policy = doc_policy(10);
        assert!(policy.find_merges(MergeTrigger::FullFlush, &segs(&[5, 5, 5])).is_empty());
    }

    #[test]
    fn test_merging_segments_are_skipped() {
        let policy = doc_policy(2);
        let mut segments = segs(&[4, 4, 4, 4]);
        segments[0].is_merging = true;
        let merges = policy.find_merges(MergeTrigger::Explicit, &segments);
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].segments, vec!["_2", "_3"]);
    }

    #[test]
    fn test_forced_merge_to_one() {
        let policy = doc_policy(10);
        let merges = policy.find_forced_merges(&segs(&[3, 1, 7]), 1);
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].segments.len(), 3);

        assert!(policy.find_forced_merges(&segs(&[3]), 1).is_empty());
        let mut with_deletes = segs(&[3]);
        with_deletes[0].deleted_count = 1;
        assert_eq!(policy.find_forced_merges(&with_deletes, 1).len(), 1);
    }

    #[test]
    fn test_forced_merge_picks_smallest_window() {
        let policy = doc_policy(10);
        let merges = policy.find_forced_merges(&segs(&[50, 1, 2, 40]), 3);
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].segments, vec!["_1", "_2"]);
    }

    #[test]
    fn test_forced_deletes_merges_group_runs() {
        let policy = doc_policy(10);
        let mut segments = segs(&[5, 5, 5, 5]);
        segments[0].deleted_count = 1;
        segments[1].deleted_count = 2;
        segments[3].deleted_count = 5;
        let merges = policy.find_forced_deletes_merges(&segments);
        assert_eq!(merges.len(), 2);
        assert_eq!(merges[0].segments, vec!["_0", "_1"]);
        assert_eq!(merges[1].segments, vec!["_3"]);
    }

    #[test]
    fn test_inventory_guards() {
        let inventory = Arc::new(MergeInventory::new());
        let guard = inventory
            .try_register(vec!["_0".to_string(), "_1".to_string()])
            .unwrap();
        assert!(inventory.try_register(vec!["_1".to_string()]).is_none());
        assert!(inventory.contains("_0"));
        drop(guard);
        assert!(inventory.is_empty());
        assert!(inventory.try_register(vec!["_1".to_string()]).is_some());
    }

    #[test]
    fn test_one_merge_error_is_kept() {
        let inventory = Arc::new(MergeInventory::new());
        let guard = inventory.try_register(vec!["_0".to_string()]).unwrap();
        let candidate = MergeCandidate {
            segments: vec!["_0".to_string()],
            estimated_size: 0,
        };
        let merge = OneMerge::new(1, candidate, true, guard);
        merge.set_error(&HalberdError::storage("disk full"));
        merge.set_error(&HalberdError::storage("second"));
        assert!(merge.error().unwrap().to_string().contains("disk full"));
        merge.abort();
        assert!(merge.check_aborted().is_err());
        merge.release();
        assert!(inventory.is_empty());
    }
}
