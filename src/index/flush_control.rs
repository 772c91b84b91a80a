//! Flush triggers and indexing back-pressure.
//!
//! [`FlushPolicy`] holds the thresholds; [`FlushControl`] tracks the RAM held
//! by buffers that are still accepting documents and by buffers being
//! flushed, and stalls indexing threads while too many flushes are in flight.

use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

const MB: f64 = 1024.0 * 1024.0;

/// When buffered state must be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlushPolicy {
    /// Flush the largest buffer once buffered documents and deletes use this much RAM.
    pub ram_buffer_size_mb: Option<f64>,
    /// Flush a buffer once it holds this many documents.
    pub max_buffered_docs: Option<usize>,
    /// Apply buffered deletes once this many are pending.
    pub max_buffered_delete_terms: Option<usize>,
    /// A single buffer is flushed once it reaches this size, whatever the other limits.
    pub per_thread_hard_limit_mb: usize,
    /// Flushes allowed in flight before indexing threads wait.
    pub max_pending_flushes: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            ram_buffer_size_mb: Some(16.0),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            per_thread_hard_limit_mb: 1945,
            max_pending_flushes: (num_cpus::get() * 2).max(2),
        }
    }
}

impl FlushPolicy {
    fn ram_limit_bytes(&self) -> Option<usize> {
        self.ram_buffer_size_mb.map(|mb| (mb * MB) as usize)
    }

    fn hard_limit_bytes(&self) -> usize {
        self.per_thread_hard_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// What to flush after a document was buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushDecision {
    Nothing,
    /// The buffer that took the document.
    This,
    /// The largest buffer, which may be another one.
    Largest,
}

/// Counters exposed through writer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub active_bytes: usize,
    pub flushing_bytes: usize,
    pub flushes_in_flight: usize,
    pub flushes_completed: u64,
    pub stalls: u64,
    /// Indexing threads are blocked until a flush finishes.
    pub stalled: bool,
}

#[derive(Debug, Default)]
struct FlushState {
    active_bytes: usize,
    flushing_bytes: usize,
    flushing: usize,
    stalled: bool,
    flushes_completed: u64,
    stalls: u64,
}

impl FlushState {
    fn update_stall(&mut self, max_pending: usize) {
        let stalled = self.flushing > max_pending;
        if stalled && !self.stalled {
            self.stalls += 1;
            debug!("stalling indexing: {} flushes in flight", self.flushing);
        }
        self.stalled = stalled;
    }
}

#[derive(Debug)]
pub(crate) struct FlushControl {
    policy: FlushPolicy,
    state: Mutex<FlushState>,
    unstalled: Condvar,
}

impl FlushControl {
    pub fn new(policy: FlushPolicy) -> Self {
        FlushControl {
            policy,
            state: Mutex::new(FlushState::default()),
            unstalled: Condvar::new(),
        }
    }

    /// Account for a document added to a buffer now holding `docs`
    /// documents and `bytes` bytes. `delete_bytes` is the RAM held by
    /// buffered global deletes.
    pub fn after_document(&self, docs: u32, bytes: usize, added: usize, delete_bytes: usize) -> FlushDecision {
        let mut state = self.state.lock();
        state.active_bytes += added;

        if bytes >= self.policy.hard_limit_bytes() {
            return FlushDecision::This;
        }
        if self.policy.max_buffered_docs.is_some_and(|max| docs as usize >= max) {
            return FlushDecision::This;
        }
        if let Some(limit) = self.policy.ram_limit_bytes() {
            if state.active_bytes + delete_bytes >= limit {
                return FlushDecision::Largest;
            }
        }
        FlushDecision::Nothing
    }

    /// Whether buffered global deletes should be resolved now.
    pub fn deletes_exceeded(&self, pending_ops: usize, pending_bytes: usize) -> bool {
        if self.policy.max_buffered_delete_terms.is_some_and(|max| pending_ops >= max) {
            return true;
        }
        self.policy.ram_limit_bytes().is_some_and(|limit| {
            let state = self.state.lock();
            pending_bytes > state.active_bytes && state.active_bytes + pending_bytes >= limit
        })
    }

    /// A buffer of `bytes` starts flushing.
    pub fn begin_flush(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.active_bytes = state.active_bytes.saturating_sub(bytes);
        state.flushing_bytes += bytes;
        state.flushing += 1;
        state.update_stall(self.policy.max_pending_flushes);
    }

    /// A flush started with [`begin_flush`](Self::begin_flush) ended, successfully or not.
    pub fn end_flush(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.flushing_bytes = state.flushing_bytes.saturating_sub(bytes);
        state.flushing = state.flushing.saturating_sub(1);
        state.flushes_completed += 1;
        state.update_stall(self.policy.max_pending_flushes);
        if !state.stalled {
            self.unstalled.notify_all();
        }
    }

    /// Forget the RAM of a buffer that was discarded.
    pub fn release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.active_bytes = state.active_bytes.saturating_sub(bytes);
    }

    /// Block while too many flushes are in flight.
    pub fn wait_if_stalled(&self) {
        let mut state = self.state.lock();
        while state.stalled {
            // re-check periodically in case a flush ended without waking us
            self.unstalled.wait_for(&mut state, Duration::from_secs(1));
        }
    }

    pub fn stats(&self) -> FlushStats {
        let state = self.state.lock();
        FlushStats {
            active_bytes: state.active_bytes,
            flushing_bytes: state.flushing_bytes,
            flushes_in_flight: state.flushing,
            flushes_completed: state.flushes_completed,
            stalls: state.stalls,
            stalled: state.stalled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn policy() -> FlushPolicy {
        FlushPolicy {
            ram_buffer_size_mb: None,
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            per_thread_hard_limit_mb: 1945,
            max_pending_flushes: 1,
        }
    }

    #[test]
    fn test_doc_count_trigger() {
        let control = FlushControl::new(FlushPolicy {
            max_buffered_docs: Some(2),
            ..policy()
        });
        assert_eq!(control.after_document(1, 100, 100, 0), FlushDecision::Nothing);
        assert_eq!(control.after_document(2, 200, 100, 0), FlushDecision::This);
    }

    #[test]
    fn test_ram_trigger_counts_deletes() {
        let control = FlushControl::new(FlushPolicy {
            ram_buffer_size_mb: Some(1.0),
            ..policy()
        });
        assert_eq!(control.after_document(1, 1000, 1000, 0), FlushDecision::Nothing);
        assert_eq!(control.after_document(2, 2000, 1000, 1 << 20), FlushDecision::Largest);
        assert!(control.deletes_exceeded(10, 1 << 20));
        assert!(!control.deletes_exceeded(10, 10));
    }

    #[test]
    fn test_delete_count_trigger() {
        let control = FlushControl::new(FlushPolicy {
            max_buffered_delete_terms: Some(3),
            ..policy()
        });
        assert!(!control.deletes_exceeded(2, 0));
        assert!(control.deletes_exceeded(3, 0));
    }

    #[test]
    fn test_stall_releases_waiters() {
        let control = Arc::new(FlushControl::new(policy()));
        control.begin_flush(10);
        control.begin_flush(10);
        assert!(control.stats().stalled);

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_if_stalled())
        };
        control.end_flush(10);
        waiter.join().unwrap();
        assert!(!control.stats().stalled);

        let stats = control.stats();
        assert_eq!(stats.stalls, 1);
        assert_eq!(stats.flushes_in_flight, 1);
        assert_eq!(stats.flushes_completed, 1);
    }
}
