//! Two-phase commit.
//!
//! A commit moves through `Initial -> Prepared -> Committed`, or ends in
//! `RolledBack` from either of the first two. Everything `commit` needs is
//! captured when the commit is prepared, in a [`PendingCommit`] that is
//! never modified afterwards: the catalog snapshot including its user data,
//! the generation and the pending catalog file. Commit data set between
//! prepare and commit therefore belongs to the next commit.
//!
//! On disk a prepared commit is a synced `pending_segments_N` file. Finishing
//! it is a rename to `segments_N` followed by a metadata sync, so a crash at
//! any point leaves either the previous commit or the new one.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HalberdError, Result};
use crate::index::file_names::{pending_segments_file_name, segments_file_name};
use crate::index::segment_infos::SegmentInfos;
use crate::storage::Storage;

/// Externally visible phase of the writer's commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPhase {
    /// Nothing prepared since the last commit.
    Initial,
    /// `prepare_commit` succeeded; `commit` or `rollback` must follow.
    Prepared,
    /// The last commit finished.
    Committed,
    /// The writer was rolled back and is closed.
    RolledBack,
}

impl fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitPhase::Initial => "initial",
            CommitPhase::Prepared => "prepared",
            CommitPhase::Committed => "committed",
            CommitPhase::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Everything a prepared commit needs to finish.
#[derive(Debug)]
pub(crate) struct PendingCommit {
    pub generation: u64,
    pub pending_file: String,
    /// Catalog as of prepare, with the commit data of that moment.
    pub infos: SegmentInfos,
    /// Files referenced on behalf of this commit until it finishes.
    pub files: Vec<String>,
    /// Writer change count the commit covers.
    pub change_count: u64,
    pub seq_no: u64,
}

/// Commit state of a writer.
#[derive(Debug, Default)]
pub(crate) enum CommitState {
    #[default]
    Initial,
    /// `None` when there was nothing to commit.
    Prepared(Option<Box<PendingCommit>>),
    Committed { generation: Option<u64>, seq_no: u64 },
    RolledBack,
}

impl CommitState {
    pub fn phase(&self) -> CommitPhase {
        match self {
            CommitState::Initial => CommitPhase::Initial,
            CommitState::Prepared(_) => CommitPhase::Prepared,
            CommitState::Committed { .. } => CommitPhase::Committed,
            CommitState::RolledBack => CommitPhase::RolledBack,
        }
    }

    /// Generation and sequence number of the commit that just finished.
    pub fn committed(&self) -> Option<(Option<u64>, u64)> {
        match self {
            CommitState::Committed { generation, seq_no } => Some((*generation, *seq_no)),
            _ => None,
        }
    }

    /// Fails unless a new commit may be prepared.
    pub fn check_can_prepare(&self) -> Result<()> {
        match self {
            CommitState::Initial | CommitState::Committed { .. } => Ok(()),
            CommitState::Prepared(_) => Err(HalberdError::invalid_operation(
                "prepare_commit was already called; call commit or rollback first",
            )),
            CommitState::RolledBack => Err(HalberdError::already_closed("writer was rolled back")),
        }
    }

    /// Take the prepared commit, leaving the state `Initial`. Returns `None`
    /// if nothing is prepared.
    pub fn take_prepared(&mut self) -> Option<Option<Box<PendingCommit>>> {
        match std::mem::take(self) {
            CommitState::Prepared(pending) => Some(pending),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Write `infos` as `pending_segments_N` and sync it together with every
/// file it references. On failure the pending file is removed again.
pub(crate) fn write_pending(storage: &dyn Storage, infos: &SegmentInfos, generation: u64) -> Result<String> {
    let pending_file = pending_segments_file_name(generation);
    let result = infos.write(storage, &pending_file, generation).and_then(|()| {
        let mut to_sync = infos.files(false);
        to_sync.push(pending_file.clone());
        storage.sync_files(&to_sync)
    });
    match result {
        Ok(()) => {
            debug!("prepared {pending_file} with {} segments", infos.len());
            Ok(pending_file)
        }
        Err(e) => {
            remove_pending(storage, &pending_file);
            Err(e)
        }
    }
}

/// Publish a prepared commit: rename the pending file to `segments_N` and
/// make the rename durable. On failure the pending file is removed and the
/// previous commit stays current.
pub(crate) fn finish(storage: &dyn Storage, pending: &PendingCommit) -> Result<String> {
    let final_file = segments_file_name(pending.generation);
    if let Err(e) = storage.rename_file(&pending.pending_file, &final_file) {
        remove_pending(storage, &pending.pending_file);
        return Err(e);
    }
    if let Err(e) = storage.sync_metadata() {
        // the rename may or may not survive a crash; both states are valid commits
        warn!("sync after publishing {final_file} failed: {e}");
        return Err(e);
    }
    Ok(final_file)
}

pub(crate) fn remove_pending(storage: &dyn Storage, pending_file: &str) {
    if storage.file_exists(pending_file) {
        if let Err(e) = storage.delete_file(pending_file) {
            warn!("cannot remove {pending_file}: {e}");
        }
    }
}
