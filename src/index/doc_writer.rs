//! The mutation buffer shared by all indexing threads.
//!
//! Indexing threads check out an idle [`DocumentsWriterPerThread`], append
//! one document and check it back in, so several threads index in parallel.
//! Deletes and updates never touch a buffer directly: they go through the
//! [`DeleteQueue`] and each buffer picks them up in sequence order.
//!
//! Every flush, of one buffer or of the global deletes, is frozen into a
//! [`FlushTicket`] while the queue is locked. Tickets are published to the
//! catalog strictly in the order they were frozen, so a packet of deletes
//! is always applied to exactly the segments flushed before it.
//!
//! A full flush (commit, NRT reopen, explicit flush) takes the exclusive
//! side of a barrier whose shared side every add holds, flushes every
//! buffer in parallel and freezes the remaining deletes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::analysis::Analyzer;
use crate::document::Document;
use crate::error::{HalberdError, Result};
use crate::index::codec::Codec;
use crate::index::delete_queue::{BufferedOp, DeleteQueue};
use crate::index::doc_writer_per_thread::{DocumentsWriterPerThread, FlushedSegment, stage_document};
use crate::index::field_infos::FieldNumbers;
use crate::index::file_names::segment_name;
use crate::index::flush_control::{FlushControl, FlushDecision, FlushPolicy, FlushStats};
use crate::storage::Storage;

/// Hands out segment names for flushes and merges.
#[derive(Debug, Default)]
pub(crate) struct SegmentNamer {
    counter: AtomicU64,
}

impl SegmentNamer {
    pub fn new(start: u64) -> Self {
        SegmentNamer {
            counter: AtomicU64::new(start),
        }
    }

    pub fn next_name(&self) -> String {
        segment_name(self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Counter value the next name will use.
    pub fn peek(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
enum TicketState {
    Pending,
    Done(Option<FlushedSegment>),
    Failed,
}

/// A frozen packet of global operations, plus the segment flushed with it.
#[derive(Debug)]
pub(crate) struct FlushTicket {
    packet: Vec<Arc<BufferedOp>>,
    state: Mutex<TicketState>,
}

impl FlushTicket {
    fn new(packet: Vec<Arc<BufferedOp>>, state: TicketState) -> Arc<Self> {
        Arc::new(FlushTicket {
            packet,
            state: Mutex::new(state),
        })
    }

    fn finish(&self, state: TicketState) {
        *self.state.lock() = state;
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), TicketState::Pending)
    }

    /// Split a completed ticket into its packet and flushed segment. A
    /// failed flush publishes its packet without a segment.
    pub fn into_parts(self: Arc<Self>) -> (Vec<Arc<BufferedOp>>, Option<FlushedSegment>) {
        let segment = match std::mem::replace(&mut *self.state.lock(), TicketState::Failed) {
            TicketState::Done(segment) => segment,
            TicketState::Pending | TicketState::Failed => None,
        };
        (self.packet.clone(), segment)
    }
}

/// Result of buffering one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DocWriteOutcome {
    pub seq_no: u64,
    /// A buffer was flushed and tickets are ready to publish.
    pub flushed: bool,
}

pub(crate) struct DocumentsWriter {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    analyzer: Arc<dyn Analyzer>,
    field_numbers: Arc<FieldNumbers>,
    namer: Arc<SegmentNamer>,
    queue: DeleteQueue,
    idle: Mutex<Vec<DocumentsWriterPerThread>>,
    next_buffer_id: AtomicU64,
    num_docs_in_ram: AtomicUsize,
    flush_control: FlushControl,
    barrier: RwLock<()>,
    tickets: Mutex<VecDeque<Arc<FlushTicket>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DocumentsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentsWriter")
            .field("codec", &self.codec.name())
            .field("analyzer", &self.analyzer.name())
            .field("num_docs_in_ram", &self.num_docs_in_ram())
            .finish()
    }
}

impl DocumentsWriter {
    pub fn new(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        analyzer: Arc<dyn Analyzer>,
        field_numbers: Arc<FieldNumbers>,
        namer: Arc<SegmentNamer>,
        policy: FlushPolicy,
    ) -> Self {
        DocumentsWriter {
            storage,
            codec,
            analyzer,
            field_numbers,
            namer,
            queue: DeleteQueue::new(),
            idle: Mutex::new(Vec::new()),
            next_buffer_id: AtomicU64::new(0),
            num_docs_in_ram: AtomicUsize::new(0),
            flush_control: FlushControl::new(policy),
            barrier: RwLock::new(()),
            tickets: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &DeleteQueue {
        &self.queue
    }

    pub fn num_docs_in_ram(&self) -> usize {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.flush_control.stats()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HalberdError::already_closed("documents writer is closed"));
        }
        Ok(())
    }

    /// Whether anything is buffered or waiting to be published.
    pub fn any_changes(&self) -> bool {
        self.num_docs_in_ram() > 0 || self.queue.any_changes() || !self.tickets.lock().is_empty()
    }

    /// Buffer `doc`, preceded by `delete` when replacing a document.
    ///
    /// A document that fails analysis consumes no sequence number and its
    /// `delete` is not applied either.
    pub fn add_document(&self, doc: &Document, delete: Option<BufferedOp>) -> Result<DocWriteOutcome> {
        self.ensure_open()?;
        let staged = stage_document(doc, self.analyzer.as_ref(), &self.field_numbers)?;
        self.flush_control.wait_if_stalled();

        let _shared = self.barrier.read();
        self.ensure_open()?;
        let mut buffer = self.obtain_buffer();
        let bytes_before = buffer.bytes_used();
        let (seq_no, ops) = self.queue.sequence_document(buffer.id(), delete);
        buffer.add_ops(ops);
        buffer.add(staged);
        self.num_docs_in_ram.fetch_add(1, Ordering::AcqRel);

        let decision = self.flush_control.after_document(
            buffer.num_docs(),
            buffer.bytes_used(),
            buffer.bytes_used() - bytes_before,
            self.queue.global_bytes(),
        );
        let to_flush = match decision {
            FlushDecision::Nothing => {
                self.idle.lock().push(buffer);
                None
            }
            FlushDecision::This => Some(buffer),
            FlushDecision::Largest => {
                let mut idle = self.idle.lock();
                let largest = idle
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, b)| b.bytes_used())
                    .filter(|(_, b)| b.bytes_used() > buffer.bytes_used())
                    .map(|(i, _)| i);
                match largest {
                    Some(i) => {
                        let other = idle.swap_remove(i);
                        idle.push(buffer);
                        Some(other)
                    }
                    None => Some(buffer),
                }
            }
        };

        let flushed = match to_flush {
            Some(buffer) => {
                self.flush_buffer(buffer)?;
                true
            }
            None => false,
        };
        Ok(DocWriteOutcome { seq_no, flushed })
    }

    /// Append delete or update operations. Returns the sequence number and
    /// whether the global deletes were frozen for publishing.
    pub fn buffer_ops(&self, ops: Vec<BufferedOp>) -> Result<(u64, bool)> {
        self.ensure_open()?;
        let seq_no = self.queue.add(ops);
        let apply = self
            .flush_control
            .deletes_exceeded(self.queue.num_global_pending(), self.queue.global_bytes());
        if apply {
            debug!("{} buffered deletes exceed the limit, freezing them", self.queue.num_global_pending());
            self.freeze_global();
        }
        Ok((seq_no, apply))
    }

    fn obtain_buffer(&self) -> DocumentsWriterPerThread {
        if let Some(buffer) = self.idle.lock().pop() {
            return buffer;
        }
        let id = self.next_buffer_id.fetch_add(1, Ordering::AcqRel);
        self.queue.register_slice(id);
        DocumentsWriterPerThread::new(id)
    }

    /// Freeze the global deletes into a ticket without a segment.
    fn freeze_global(&self) {
        self.queue.freeze(None, |frozen| {
            if !frozen.global_ops.is_empty() {
                self.tickets
                    .lock()
                    .push_back(FlushTicket::new(frozen.global_ops, TicketState::Done(None)));
            }
        });
    }

    /// Freeze `buffer` and queue its ticket. Returns the ticket and the
    /// operations only the buffer still has to apply.
    fn freeze_buffer(&self, buffer: &DocumentsWriterPerThread) -> (Arc<FlushTicket>, Vec<Arc<BufferedOp>>) {
        self.queue.freeze(Some(buffer.id()), |frozen| {
            let ticket = FlushTicket::new(frozen.global_ops, TicketState::Pending);
            self.tickets.lock().push_back(Arc::clone(&ticket));
            (ticket, frozen.slice_ops)
        })
    }

    fn flush_buffer(&self, buffer: DocumentsWriterPerThread) -> Result<()> {
        let (ticket, slice_ops) = self.freeze_buffer(&buffer);
        self.write_buffer(buffer, &ticket, slice_ops)
    }

    fn write_buffer(
        &self,
        buffer: DocumentsWriterPerThread,
        ticket: &FlushTicket,
        slice_ops: Vec<Arc<BufferedOp>>,
    ) -> Result<()> {
        let bytes = buffer.bytes_used();
        let docs = buffer.num_docs() as usize;
        let segment = self.namer.next_name();
        self.flush_control.begin_flush(bytes);
        let result = buffer.flush(self.storage.as_ref(), self.codec.as_ref(), &segment, slice_ops);
        self.num_docs_in_ram.fetch_sub(docs, Ordering::AcqRel);
        self.flush_control.end_flush(bytes);
        match result {
            Ok(flushed) => {
                ticket.finish(TicketState::Done(flushed));
                Ok(())
            }
            Err(e) => {
                ticket.finish(TicketState::Failed);
                Err(e)
            }
        }
    }

    /// Flush every buffer and freeze all global deletes.
    ///
    /// Returns whether anything was flushed or frozen. When several buffers
    /// fail, the first error is returned; the others are logged.
    pub fn flush_all(&self) -> Result<bool> {
        self.ensure_open()?;
        let _exclusive = self.barrier.write();
        let buffers: Vec<DocumentsWriterPerThread> = std::mem::take(&mut *self.idle.lock());

        let mut jobs = Vec::new();
        for buffer in buffers {
            if buffer.num_docs() == 0 {
                self.queue.unregister_slice(buffer.id());
                self.flush_control.release(buffer.bytes_used());
                continue;
            }
            let (ticket, slice_ops) = self.freeze_buffer(&buffer);
            jobs.push((buffer, ticket, slice_ops));
        }
        self.freeze_global();
        let anything = !jobs.is_empty() || !self.tickets.lock().is_empty();

        debug!("full flush of {} buffers", jobs.len());
        let results: Vec<Result<()>> = jobs
            .into_par_iter()
            .map(|(buffer, ticket, slice_ops)| self.write_buffer(buffer, &ticket, slice_ops))
            .collect();

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                match first_error {
                    None => first_error = Some(e),
                    Some(_) => warn!("another buffer failed to flush: {e}"),
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(anything),
        }
    }

    /// Completed tickets at the head of the queue, in freeze order.
    ///
    /// Callers publish them while holding the catalog lock, which keeps the
    /// publish order equal to the freeze order.
    pub fn take_ready_tickets(&self) -> Vec<Arc<FlushTicket>> {
        let mut tickets = self.tickets.lock();
        let mut ready = Vec::new();
        while tickets.front().is_some_and(|t| !t.is_pending()) {
            if let Some(ticket) = tickets.pop_front() {
                ready.push(ticket);
            }
        }
        ready
    }

    /// Drop every buffered document, delete and unpublished ticket.
    /// Returns the number of documents discarded.
    pub fn abort(&self) -> usize {
        let _exclusive = self.barrier.write();
        let buffers: Vec<DocumentsWriterPerThread> = std::mem::take(&mut *self.idle.lock());
        let mut discarded = 0;
        for buffer in buffers {
            discarded += buffer.num_docs() as usize;
            self.queue.unregister_slice(buffer.id());
            self.flush_control.release(buffer.bytes_used());
        }
        self.queue.clear();
        self.tickets.lock().clear();
        self.num_docs_in_ram.store(0, Ordering::Release);
        if discarded > 0 {
            debug!("discarded {discarded} buffered documents");
        }
        discarded
    }

    /// Abort and refuse any further operation.
    pub fn close(&self) -> usize {
        let discarded = self.abort();
        self.closed.store(true, Ordering::Release);
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::index::codec::StandardCodec;
    use crate::index::term::Term;
    use crate::storage::memory::MemoryStorage;
    use std::thread;

    fn writer(policy: FlushPolicy) -> Arc<DocumentsWriter> {
        Arc::new(DocumentsWriter::new(
            Arc::new(MemoryStorage::new_default()),
            Arc::new(StandardCodec),
            Arc::new(StandardAnalyzer),
            Arc::new(FieldNumbers::new()),
            Arc::new(SegmentNamer::new(0)),
            policy,
        ))
    }

    fn doc(id: usize) -> Document {
        Document::builder()
            .add_keyword("id", format!("doc-{id}"))
            .add_numeric_doc_values("val", id as i64)
            .build()
    }

    fn flushed_sizes(tickets: Vec<Arc<FlushTicket>>) -> Vec<u32> {
        tickets
            .into_iter()
            .filter_map(|t| t.into_parts().1)
            .map(|s| s.segment.max_doc())
            .collect()
    }

    #[test]
    fn test_flush_by_doc_count() {
        let dw = writer(FlushPolicy {
            max_buffered_docs: Some(2),
            ram_buffer_size_mb: None,
            ..FlushPolicy::default()
        });
        let mut flushes = 0;
        for i in 0..7 {
            if dw.add_document(&doc(i), None).unwrap().flushed {
                flushes += 1;
            }
        }
        assert_eq!(flushes, 3);
        assert_eq!(dw.num_docs_in_ram(), 1);
        assert!(dw.flush_all().unwrap());
        assert_eq!(flushed_sizes(dw.take_ready_tickets()), vec![2, 2, 2, 1]);
        assert!(!dw.any_changes());
    }

    #[test]
    fn test_sequence_numbers_are_ordered() {
        let dw = writer(FlushPolicy::default());
        let a = dw.add_document(&doc(0), None).unwrap().seq_no;
        let (b, _) = dw.buffer_ops(vec![BufferedOp::DeleteTerm(Term::new("id", "doc-0"))]).unwrap();
        let c = dw.add_document(&doc(1), None).unwrap().seq_no;
        assert!(a < b && b < c);
    }

    #[test]
    fn test_delete_packet_is_published_with_flush() {
        let dw = writer(FlushPolicy::default());
        dw.add_document(&doc(0), None).unwrap();
        dw.buffer_ops(vec![BufferedOp::DeleteTerm(Term::new("id", "doc-0"))]).unwrap();
        dw.flush_all().unwrap();
        let tickets = dw.take_ready_tickets();
        assert_eq!(tickets.len(), 1);
        let (packet, segment) = tickets.into_iter().next().unwrap().into_parts();
        assert_eq!(packet.len(), 1);
        // the delete already applied to the buffered document, which was
        // the only one, so no segment is left
        assert!(segment.is_none());
    }

    #[test]
    fn test_delete_threshold_freezes_global_packet() {
        let dw = writer(FlushPolicy {
            max_buffered_delete_terms: Some(2),
            ..FlushPolicy::default()
        });
        let (_, frozen) = dw.buffer_ops(vec![BufferedOp::DeleteTerm(Term::new("id", "a"))]).unwrap();
        assert!(!frozen);
        let (_, frozen) = dw.buffer_ops(vec![BufferedOp::DeleteTerm(Term::new("id", "b"))]).unwrap();
        assert!(frozen);
        let tickets = dw.take_ready_tickets();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].packet.len(), 2);
    }

    #[test]
    fn test_concurrent_adds_are_all_flushed() {
        let dw = writer(FlushPolicy {
            max_buffered_docs: Some(5),
            ram_buffer_size_mb: None,
            ..FlushPolicy::default()
        });
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let dw = Arc::clone(&dw);
                thread::spawn(move || {
                    for i in 0..25 {
                        dw.add_document(&doc(t * 100 + i), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        dw.flush_all().unwrap();
        let sizes = flushed_sizes(dw.take_ready_tickets());
        assert_eq!(sizes.iter().sum::<u32>(), 100);
        assert!(sizes.iter().all(|&s| s <= 5));
    }

    #[test]
    fn test_abort_discards_everything() {
        let dw = writer(FlushPolicy::default());
        dw.add_document(&doc(0), None).unwrap();
        dw.buffer_ops(vec![BufferedOp::DeleteTerm(Term::new("id", "x"))]).unwrap();
        assert_eq!(dw.close(), 1);
        assert!(!dw.any_changes());
        assert!(matches!(dw.add_document(&doc(1), None), Err(HalberdError::AlreadyClosed(_))));
    }
}
