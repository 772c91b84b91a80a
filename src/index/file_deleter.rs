//! Reference counting of index files.
//!
//! Every file named by the current in-memory catalog, by a retained commit
//! point, by a prepared-but-unfinished commit or by an open reader holds a
//! reference. A file is deleted from storage as soon as its count drops to
//! zero. Deletes that fail are retried at the next checkpoint.
//!
//! Which commits are retained is decided by an [`IndexDeletionPolicy`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HalberdError, Result};
use crate::index::file_names::{
    commit_generation, from_base36, is_index_file, parse_generation, parse_segment_name,
    segments_file_name,
};
use crate::index::segment_infos::SegmentInfos;
use crate::storage::Storage;

/// A commit retained by the deleter, as shown to the deletion policy.
#[derive(Debug, Clone)]
pub struct CommitPoint {
    generation: u64,
    segments_file: String,
    segments: Vec<String>,
    user_data: BTreeMap<String, String>,
    files: Vec<String>,
    deleted: bool,
}

impl CommitPoint {
    fn from_infos(infos: &SegmentInfos, generation: u64) -> Self {
        let mut files = infos.files(false);
        let segments_file = segments_file_name(generation);
        files.push(segments_file.clone());
        files.sort();
        CommitPoint {
            generation,
            segments_file,
            segments: infos.segments().iter().map(|s| s.name().to_string()).collect(),
            user_data: infos.user_data().clone(),
            files,
            deleted: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn segments_file(&self) -> &str {
        &self.segments_file
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Ask for this commit to be removed once the policy returns.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn to_index_commit(&self) -> IndexCommit {
        IndexCommit {
            generation: self.generation,
            segments_file: self.segments_file.clone(),
            segments: self.segments.clone(),
            user_data: self.user_data.clone(),
            files: self.files.clone(),
        }
    }
}

/// Decides which commit points to keep.
///
/// Both callbacks receive the commits sorted oldest first; the last one is
/// the newest commit.
pub trait IndexDeletionPolicy: Send + Sync + Debug {
    /// Called once when a writer opens.
    fn on_init(&self, commits: &mut [CommitPoint]) -> Result<()>;

    /// Called after every successful commit.
    fn on_commit(&self, commits: &mut [CommitPoint]) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Removes every commit but the newest. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepOnlyLastCommit;

impl IndexDeletionPolicy for KeepOnlyLastCommit {
    fn on_init(&self, commits: &mut [CommitPoint]) -> Result<()> {
        self.on_commit(commits)
    }

    fn on_commit(&self, commits: &mut [CommitPoint]) -> Result<()> {
        if let Some((_newest, older)) = commits.split_last_mut() {
            for commit in older {
                commit.delete();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "keep_only_last"
    }
}

/// Never removes a commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAllCommits;

impl IndexDeletionPolicy for KeepAllCommits {
    fn on_init(&self, _commits: &mut [CommitPoint]) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self, _commits: &mut [CommitPoint]) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "keep_all"
    }
}

/// A commit found in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCommit {
    pub generation: u64,
    pub segments_file: String,
    pub segments: Vec<String>,
    pub user_data: BTreeMap<String, String>,
    pub files: Vec<String>,
}

/// Every readable commit in `storage`, oldest first.
///
/// Damaged catalogs are skipped with a warning; format errors propagate.
pub fn list_commits(storage: &dyn Storage) -> Result<Vec<IndexCommit>> {
    let mut commits = Vec::new();
    for file in storage.list_files()? {
        let Some(generation) = commit_generation(&file) else {
            continue;
        };
        match SegmentInfos::read_commit(storage, &file) {
            Ok(infos) => commits.push(CommitPoint::from_infos(&infos, generation).to_index_commit()),
            Err(e) if e.is_corruption() || e.is_not_found() => {
                warn!("skipping unreadable commit {file}: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    commits.sort_by_key(|c| c.generation);
    Ok(commits)
}

/// Tracks how many owners each index file has and deletes unowned files.
#[derive(Debug)]
pub struct IndexFileDeleter {
    storage: Arc<dyn Storage>,
    ref_counts: AHashMap<String, usize>,
    commits: Vec<CommitPoint>,
    last_files: Vec<String>,
    pending_deletes: BTreeSet<String>,
    policy: Arc<dyn IndexDeletionPolicy>,
}

impl IndexFileDeleter {
    /// Scan `storage`, load retained commits, run the policy and remove
    /// every index file nothing references. `infos` is the writer's starting
    /// catalog; its counter and next-write generations are raised past any
    /// leftover file so names are never reused.
    pub fn init(
        storage: Arc<dyn Storage>,
        policy: Arc<dyn IndexDeletionPolicy>,
        infos: &mut SegmentInfos,
    ) -> Result<Self> {
        let mut deleter = IndexFileDeleter {
            storage: Arc::clone(&storage),
            ref_counts: AHashMap::new(),
            commits: Vec::new(),
            last_files: Vec::new(),
            pending_deletes: BTreeSet::new(),
            policy,
        };

        let files = storage.list_files()?;
        for file in files.iter().filter(|f| is_index_file(f)) {
            deleter.ref_counts.entry(file.clone()).or_insert(0);
            // pending catalogs have no commit generation and stay unreferenced
            let Some(generation) = commit_generation(file) else {
                continue;
            };
            match SegmentInfos::read_commit(storage.as_ref(), file) {
                Ok(commit) => {
                    let point = CommitPoint::from_infos(&commit, generation);
                    deleter.inc_ref(&point.files);
                    deleter.commits.push(point);
                }
                Err(e) if e.is_corruption() || e.is_not_found() => {
                    warn!("ignoring unreadable commit {file}: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        inflate_generations(infos, &files);

        let unreferenced: Vec<String> = deleter
            .ref_counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in unreferenced {
            deleter.ref_counts.remove(&name);
            deleter.delete_file(&name);
        }

        deleter.commits.sort_by_key(|c| c.generation);
        let policy = Arc::clone(&deleter.policy);
        policy.on_init(&mut deleter.commits)?;
        deleter.checkpoint(infos, false)?;
        deleter.delete_commits();
        Ok(deleter)
    }

    /// Record a new state of the catalog.
    ///
    /// A plain checkpoint swaps the references of the previous in-memory
    /// catalog for the new one. A commit checkpoint adds a commit point and
    /// lets the policy drop older commits.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        self.retry_pending_deletes();

        if is_commit {
            let generation = infos.generation().ok_or_else(|| {
                HalberdError::internal("commit checkpoint without a generation")
            })?;
            let point = CommitPoint::from_infos(infos, generation);
            self.inc_ref(&point.files);
            self.commits.push(point);
            let policy = Arc::clone(&self.policy);
            policy.on_commit(&mut self.commits)?;
            self.delete_commits();
        } else {
            let files = infos.files(false);
            self.inc_ref(&files);
            let previous = std::mem::replace(&mut self.last_files, files);
            self.dec_ref(&previous);
        }
        Ok(())
    }

    pub fn inc_ref(&mut self, files: &[String]) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    pub fn dec_ref(&mut self, files: &[String]) {
        for file in files {
            match self.ref_counts.get_mut(file) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        self.ref_counts.remove(file);
                        self.delete_file(file);
                    }
                }
                _ => warn!("dec_ref of unreferenced file {file}"),
            }
        }
    }

    /// Delete files written by an aborted flush or merge, unless referenced.
    pub fn delete_new_files(&mut self, files: &[String]) {
        for file in files {
            if self.ref_counts.get(file).copied().unwrap_or(0) == 0 {
                self.ref_counts.remove(file);
                self.delete_file(file);
            }
        }
    }

    /// Delete every index file in storage that nothing references. Only safe
    /// while no flush or merge is writing files.
    pub fn refresh(&mut self) -> Result<()> {
        for file in self.storage.list_files()? {
            if is_index_file(&file) && self.ref_counts.get(&file).copied().unwrap_or(0) == 0 {
                self.ref_counts.remove(&file);
                self.delete_file(&file);
            }
        }
        Ok(())
    }

    pub fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Generations of the retained commits, oldest first.
    pub fn commit_generations(&self) -> Vec<u64> {
        self.commits.iter().map(|c| c.generation).collect()
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Files whose deletion failed and will be retried.
    pub fn pending_deletes(&self) -> Vec<String> {
        self.pending_deletes.iter().cloned().collect()
    }

    fn delete_commits(&mut self) {
        let (deleted, kept): (Vec<CommitPoint>, Vec<CommitPoint>) =
            std::mem::take(&mut self.commits).into_iter().partition(|c| c.deleted);
        self.commits = kept;
        for commit in deleted {
            debug!("deleting commit {}", commit.segments_file);
            self.dec_ref(&commit.files);
        }
    }

    fn delete_file(&mut self, name: &str) {
        match self.storage.delete_file(name) {
            Ok(()) => {
                self.pending_deletes.remove(name);
                debug!("deleted {name}");
            }
            Err(e) => {
                warn!("could not delete {name}, will retry: {e}");
                self.pending_deletes.insert(name.to_string());
            }
        }
    }

    fn retry_pending_deletes(&mut self) {
        let pending: Vec<String> = self.pending_deletes.iter().cloned().collect();
        for name in pending {
            if self.ref_count(&name) == 0 {
                self.delete_file(&name);
            } else {
                self.pending_deletes.remove(&name);
            }
        }
    }
}

/// Raise the segment counter and per-segment write generations past every
/// file present, so a leftover file is never overwritten.
fn inflate_generations(infos: &mut SegmentInfos, files: &[String]) {
    let mut max_counter: Option<u64> = None;
    let mut max_gen_per_segment: AHashMap<&str, u64> = AHashMap::new();

    for file in files {
        if commit_generation(file).is_some() {
            continue;
        }
        let Some(segment) = parse_segment_name(file) else {
            continue;
        };
        if let Some(counter) = from_base36(segment.trim_start_matches('_')) {
            max_counter = Some(max_counter.map_or(counter, |m| m.max(counter)));
        }
        if let Some(generation) = parse_generation(file) {
            let entry = max_gen_per_segment.entry(segment).or_insert(0);
            *entry = (*entry).max(generation);
        }
    }

    if let Some(counter) = max_counter {
        infos.counter = infos.counter.max(counter + 1);
    }
    for segment in infos.segments_mut() {
        if let Some(generation) = max_gen_per_segment.get(segment.info.name.as_str()) {
            segment.ensure_next_write_generations(generation + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::io::Write;

    fn touch(storage: &MemoryStorage, name: &str) {
        let mut output = storage.create_output(name).unwrap();
        output.write_all(b"x").unwrap();
        output.close().unwrap();
    }

    #[test]
    fn test_init_deletes_unreferenced_files() {
        let storage = MemoryStorage::new_default();
        touch(&storage, "_0.si");
        touch(&storage, "_0_1.liv");
        touch(&storage, "pending_segments_1");
        touch(&storage, "write.lock");
        touch(&storage, "notes.txt");

        let mut infos = SegmentInfos::new();
        let deleter =
            IndexFileDeleter::init(Arc::new(storage.clone()), Arc::new(KeepOnlyLastCommit), &mut infos)
                .unwrap();

        assert_eq!(storage.list_files().unwrap(), vec!["notes.txt", "write.lock"]);
        assert!(deleter.commit_generations().is_empty());
        // leftover _0 files push the counter past them
        assert_eq!(infos.counter, 1);
    }

    #[test]
    fn test_ref_counts_delete_at_zero() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        let mut deleter =
            IndexFileDeleter::init(Arc::new(storage.clone()), Arc::new(KeepAllCommits), &mut infos)
                .unwrap();

        touch(&storage, "_1.pst");
        let files = vec!["_1.pst".to_string()];
        deleter.inc_ref(&files);
        deleter.inc_ref(&files);
        deleter.dec_ref(&files);
        assert!(storage.file_exists("_1.pst"));
        assert_eq!(deleter.ref_count("_1.pst"), 1);
        deleter.dec_ref(&files);
        assert!(!storage.file_exists("_1.pst"));
    }

    #[test]
    fn test_keep_only_last_commit_policy() {
        let infos = SegmentInfos::new();
        let mut commits = vec![
            CommitPoint::from_infos(&infos, 1),
            CommitPoint::from_infos(&infos, 2),
            CommitPoint::from_infos(&infos, 3),
        ];
        KeepOnlyLastCommit.on_commit(&mut commits).unwrap();
        let kept: Vec<u64> = commits.iter().filter(|c| !c.is_deleted()).map(|c| c.generation()).collect();
        assert_eq!(kept, vec![3]);

        let mut commits = vec![CommitPoint::from_infos(&infos, 1)];
        KeepAllCommits.on_commit(&mut commits).unwrap();
        assert!(!commits[0].is_deleted());
    }

    #[test]
    fn test_commit_checkpoint_retires_old_commit() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        infos.write(&storage, "segments_1", 1).unwrap();
        infos.set_generation(1);

        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let mut deleter =
            IndexFileDeleter::init(Arc::clone(&shared), Arc::new(KeepOnlyLastCommit), &mut infos).unwrap();
        assert_eq!(deleter.commit_generations(), vec![1]);

        infos.write(&storage, "segments_2", 2).unwrap();
        infos.set_generation(2);
        deleter.checkpoint(&infos, true).unwrap();

        assert_eq!(deleter.commit_generations(), vec![2]);
        assert!(!storage.file_exists("segments_1"));
        assert!(storage.file_exists("segments_2"));
        assert_eq!(list_commits(&storage).unwrap().len(), 1);
    }
}
