//! The global, ordered log of buffered deletes and doc-values updates.
//!
//! Every delete or update call appends one entry and gets the next sequence
//! number. Each in-memory segment buffer keeps a cursor (its *slice*) into the
//! log and catches up before it accepts a document, recording for every new
//! entry how many of its documents the entry may touch. A second, global
//! cursor marks what has already been frozen into a packet for the segments
//! on disk.
//!
//! All sequence numbers are handed out under the queue lock, so the order of
//! sequence numbers is the order of the log.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::index::doc_values::DocValuesUpdate;
use crate::index::query::Query;
use crate::index::term::Term;

/// One buffered operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferedOp {
    DeleteTerm(Term),
    DeleteQuery(Query),
    /// Several fields updated on the documents matching the same term.
    Update(Vec<DocValuesUpdate>),
}

impl BufferedOp {
    pub fn is_delete(&self) -> bool {
        matches!(self, BufferedOp::DeleteTerm(_) | BufferedOp::DeleteQuery(_))
    }

    pub(crate) fn estimated_bytes(&self) -> usize {
        const OVERHEAD: usize = 48;
        match self {
            BufferedOp::DeleteTerm(term) => OVERHEAD + term.field.len() + term.bytes.len(),
            BufferedOp::DeleteQuery(_) => OVERHEAD * 2,
            BufferedOp::Update(updates) => updates
                .iter()
                .map(|u| OVERHEAD + u.term.field.len() + u.term.bytes.len() + u.field.len() + 16)
                .sum(),
        }
    }
}

/// Entries a buffer or the global packet picked up at freeze time.
#[derive(Debug, Default)]
pub(crate) struct FrozenSlice {
    /// New entries for the buffer being frozen (empty for a global freeze).
    pub slice_ops: Vec<Arc<BufferedOp>>,
    /// Entries not yet handed to the on-disk segments.
    pub global_ops: Vec<Arc<BufferedOp>>,
}

#[derive(Debug)]
struct QueueState {
    log: VecDeque<Arc<BufferedOp>>,
    /// Absolute position of `log[0]`.
    base: u64,
    next_seq: u64,
    global_cursor: u64,
    global_bytes: usize,
    slices: HashMap<u64, u64>,
}

impl QueueState {
    fn end(&self) -> u64 {
        self.base + self.log.len() as u64
    }

    fn ops_since(&self, cursor: u64) -> Vec<Arc<BufferedOp>> {
        let start = cursor.saturating_sub(self.base) as usize;
        self.log.iter().skip(start).cloned().collect()
    }

    /// Drop entries every cursor has moved past.
    fn trim(&mut self) {
        let low = self
            .slices
            .values()
            .copied()
            .chain(std::iter::once(self.global_cursor))
            .min()
            .unwrap_or(self.global_cursor);
        while self.base < low && !self.log.is_empty() {
            self.log.pop_front();
            self.base += 1;
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Thread-safe delete/update log shared by all indexing threads.
#[derive(Debug)]
pub struct DeleteQueue {
    state: Mutex<QueueState>,
}

impl Default for DeleteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteQueue {
    /// An empty queue whose first sequence number is 1.
    pub fn new() -> Self {
        DeleteQueue {
            state: Mutex::new(QueueState {
                log: VecDeque::new(),
                base: 0,
                next_seq: 1,
                global_cursor: 0,
                global_bytes: 0,
                slices: HashMap::new(),
            }),
        }
    }

    /// Append `ops` as one operation. Returns its sequence number.
    pub fn add(&self, ops: Vec<BufferedOp>) -> u64 {
        let mut state = self.state.lock();
        for op in ops {
            state.global_bytes += op.estimated_bytes();
            state.log.push_back(Arc::new(op));
        }
        state.take_seq()
    }

    /// Start a slice for a new buffer. It sees only entries appended later.
    pub(crate) fn register_slice(&self, slice: u64) {
        let mut state = self.state.lock();
        let end = state.end();
        state.slices.insert(slice, end);
    }

    pub(crate) fn unregister_slice(&self, slice: u64) {
        let mut state = self.state.lock();
        state.slices.remove(&slice);
        state.trim();
    }

    /// Sequence a document for buffer `slice`, first appending `delete` (the
    /// delete half of an update-document). Returns the document's sequence
    /// number and every entry the slice had not seen yet; all of them apply
    /// to the documents the buffer holds before this one.
    pub(crate) fn sequence_document(&self, slice: u64, delete: Option<BufferedOp>) -> (u64, Vec<Arc<BufferedOp>>) {
        let mut state = self.state.lock();
        if let Some(op) = delete {
            state.global_bytes += op.estimated_bytes();
            state.log.push_back(Arc::new(op));
        }
        let end = state.end();
        let cursor = state.slices.get(&slice).copied().unwrap_or(end);
        let ops = state.ops_since(cursor);
        state.slices.insert(slice, end);
        (state.take_seq(), ops)
    }

    /// Freeze the global buffer, and the slice of buffer `slice` if given.
    ///
    /// `on_frozen` runs while the queue is still locked so callers can queue
    /// flush tickets in exactly the freeze order.
    pub(crate) fn freeze<R>(&self, slice: Option<u64>, on_frozen: impl FnOnce(FrozenSlice) -> R) -> R {
        let mut state = self.state.lock();
        let end = state.end();
        let slice_ops = match slice.and_then(|s| state.slices.remove(&s)) {
            Some(cursor) => state.ops_since(cursor),
            None => Vec::new(),
        };
        let global_ops = state.ops_since(state.global_cursor);
        state.global_cursor = end;
        state.global_bytes = 0;
        state.trim();
        on_frozen(FrozenSlice {
            slice_ops,
            global_ops,
        })
    }

    /// Entries not yet frozen into a packet.
    pub fn num_global_pending(&self) -> usize {
        let state = self.state.lock();
        (state.end() - state.global_cursor) as usize
    }

    pub fn global_bytes(&self) -> usize {
        self.state.lock().global_bytes
    }

    pub fn any_changes(&self) -> bool {
        self.num_global_pending() > 0
    }

    /// Sequence number the next operation will get.
    pub fn next_sequence_number(&self) -> u64 {
        self.state.lock().next_seq
    }

    /// Sequence number of the newest operation, 0 if none yet.
    pub fn last_sequence_number(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// Take a sequence number for an operation that is not logged.
    pub(crate) fn next_seq(&self) -> u64 {
        self.state.lock().take_seq()
    }

    /// Drop every entry and slice. Sequence numbers keep increasing.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let end = state.end();
        state.log.clear();
        state.base = end;
        state.global_cursor = end;
        state.global_bytes = 0;
        state.slices.clear();
    }

    #[cfg(test)]
    fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete(id: &str) -> BufferedOp {
        BufferedOp::DeleteTerm(Term::new("id", id))
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let queue = DeleteQueue::new();
        assert_eq!(queue.last_sequence_number(), 0);
        let a = queue.add(vec![delete("a")]);
        queue.register_slice(7);
        let (b, _) = queue.sequence_document(7, None);
        let c = queue.add(vec![delete("b"), delete("c")]);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(queue.num_global_pending(), 3);
    }

    #[test]
    fn test_slice_sees_only_later_entries() {
        let queue = DeleteQueue::new();
        queue.add(vec![delete("before")]);
        queue.register_slice(1);

        let (_, seen) = queue.sequence_document(1, None);
        assert!(seen.is_empty());

        queue.add(vec![delete("after")]);
        let (_, seen) = queue.sequence_document(1, Some(delete("own")));
        let seen: Vec<BufferedOp> = seen.iter().map(|op| (**op).clone()).collect();
        assert_eq!(seen, vec![delete("after"), delete("own")]);

        let (_, seen) = queue.sequence_document(1, None);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_freeze_hands_out_each_entry_once() {
        let queue = DeleteQueue::new();
        queue.register_slice(1);
        queue.add(vec![delete("a")]);

        let frozen = queue.freeze(Some(1), |frozen| frozen);
        assert_eq!(frozen.slice_ops.len(), 1);
        assert_eq!(frozen.global_ops.len(), 1);
        assert_eq!(queue.log_len(), 0);

        queue.add(vec![delete("b")]);
        let frozen = queue.freeze(None, |frozen| frozen);
        assert!(frozen.slice_ops.is_empty());
        assert_eq!(frozen.global_ops.len(), 1);
        assert!(!queue.any_changes());
    }

    #[test]
    fn test_trim_waits_for_slowest_slice() {
        let queue = DeleteQueue::new();
        queue.register_slice(1);
        queue.register_slice(2);
        queue.add(vec![delete("a")]);

        queue.freeze(Some(1), |_| ());
        // slice 2 has not caught up yet
        assert_eq!(queue.log_len(), 1);
        let (_, seen) = queue.sequence_document(2, None);
        assert_eq!(seen.len(), 1);
        queue.unregister_slice(2);
        assert_eq!(queue.log_len(), 0);
    }
}
