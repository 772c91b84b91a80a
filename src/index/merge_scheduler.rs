//! Merge scheduling.
//!
//! A scheduler pulls registered merges from a [`MergeSource`] (the writer)
//! and runs them, either on the calling thread ([`SerialMergeScheduler`]) or
//! on a bounded pool of worker threads ([`ConcurrentMergeScheduler`]).
//!
//! Background merge failures never unwind into indexing threads. Workers
//! report every finished merge on a result channel; a [`MergeErrorPolicy`]
//! decides whether a failure is only logged or handed back to the next
//! caller of [`MergeScheduler::merge`]. A blocking `force_merge` always sees
//! the failure through the merge itself.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{HalberdError, Result};
use crate::index::merge_policy::{MergeTrigger, OneMerge};

/// Something that has merges to run. Implemented by the index writer.
pub trait MergeSource: Send + Sync {
    /// Take the next registered merge, if any.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    fn has_pending_merges(&self) -> bool;

    /// Run one merge to completion.
    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()>;
}

/// Runs merges handed over by a [`MergeSource`].
pub trait MergeScheduler: Send + Sync + fmt::Debug {
    /// Run or dispatch every pending merge of `source`.
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()>;

    /// Stop accepting merges and wait for running ones.
    fn close(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// What happens to a background merge failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeErrorPolicy {
    /// Log the failure and keep indexing.
    #[default]
    LogAndSuppress,
    /// Return the failure from the next `merge` call on the scheduler.
    Propagate,
}

impl MergeErrorPolicy {
    fn handle(&self, outcome: &MergeOutcome) -> Option<HalberdError> {
        let error = outcome.error.as_ref()?;
        if matches!(error, HalberdError::MergeAborted(_)) {
            debug!("merge {} aborted", outcome.merge_id);
            return None;
        }
        match self {
            MergeErrorPolicy::LogAndSuppress => {
                warn!("merge {} of {:?} failed: {error}", outcome.merge_id, outcome.segments);
                None
            }
            MergeErrorPolicy::Propagate => Some(HalberdError::merge(
                format!("background merge {} of {:?} failed", outcome.merge_id, outcome.segments),
                error.duplicate(),
            )),
        }
    }
}

/// Result of one merge as reported by a worker.
#[derive(Debug)]
pub struct MergeOutcome {
    pub merge_id: u64,
    pub segments: Vec<String>,
    pub error: Option<HalberdError>,
    pub elapsed_ms: u64,
}

fn run_one(source: &dyn MergeSource, merge: &Arc<OneMerge>) -> MergeOutcome {
    let start = Instant::now();
    let error = source.merge(merge).err();
    MergeOutcome {
        merge_id: merge.id,
        segments: merge.segments.clone(),
        error,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

/// Runs every merge on the thread that triggered it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialMergeScheduler {
    pub error_policy: MergeErrorPolicy,
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, _trigger: MergeTrigger) -> Result<()> {
        let mut first_error = None;
        while let Some(merge) = source.next_merge() {
            let outcome = run_one(source.as_ref(), &merge);
            if let Some(e) = self.error_policy.handle(&outcome) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

/// Configuration for [`ConcurrentMergeScheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrentMergeSchedulerConfig {
    /// Worker threads, and so merges running at once.
    pub max_thread_count: usize,
    /// Merges waiting for a worker before `merge` blocks the caller.
    pub max_merge_count: usize,
    pub error_policy: MergeErrorPolicy,
}

impl Default for ConcurrentMergeSchedulerConfig {
    fn default() -> Self {
        let max_thread_count = (num_cpus::get() / 2).clamp(1, 4);
        ConcurrentMergeSchedulerConfig {
            max_thread_count,
            max_merge_count: max_thread_count + 5,
            error_policy: MergeErrorPolicy::default(),
        }
    }
}

/// Statistics about merge execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeSchedulerStats {
    pub merges_submitted: u64,
    pub merges_completed: u64,
    pub merges_failed: u64,
    pub merges_aborted: u64,
    pub total_merge_time_ms: u64,
}

struct MergeTask {
    source: Arc<dyn MergeSource>,
    merge: Arc<OneMerge>,
}

struct Workers {
    task_sender: Option<Sender<MergeTask>>,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Runs merges on a bounded pool of named worker threads.
pub struct ConcurrentMergeScheduler {
    config: ConcurrentMergeSchedulerConfig,
    workers: Mutex<Workers>,
    result_sender: Sender<MergeOutcome>,
    result_receiver: Receiver<MergeOutcome>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    stats: Arc<Mutex<MergeSchedulerStats>>,
}

impl fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMergeScheduler")
            .field("config", &self.config)
            .field("active", &self.active.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        Self::new(ConcurrentMergeSchedulerConfig::default())
    }
}

impl ConcurrentMergeScheduler {
    pub fn new(config: ConcurrentMergeSchedulerConfig) -> Self {
        let (result_sender, result_receiver) = unbounded();
        ConcurrentMergeScheduler {
            config,
            workers: Mutex::new(Workers {
                task_sender: None,
                handles: Vec::new(),
            }),
            result_sender,
            result_receiver,
            running: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(Mutex::new(MergeSchedulerStats::default())),
        }
    }

    pub fn config(&self) -> &ConcurrentMergeSchedulerConfig {
        &self.config
    }

    /// Merges currently running on a worker.
    pub fn active_merges(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MergeSchedulerStats {
        self.stats.lock().clone()
    }

    fn sender(&self) -> Result<Sender<MergeTask>> {
        let mut workers = self.workers.lock();
        if let Some(sender) = &workers.task_sender {
            return Ok(sender.clone());
        }
        let (task_sender, task_receiver) = bounded(self.config.max_merge_count.max(1));
        for worker_id in 0..self.config.max_thread_count.max(1) {
            let handle = self.spawn_worker(worker_id, task_receiver.clone())?;
            workers.handles.push(handle);
        }
        workers.task_sender = Some(task_sender.clone());
        Ok(task_sender)
    }

    fn spawn_worker(&self, worker_id: usize, task_receiver: Receiver<MergeTask>) -> Result<thread::JoinHandle<()>> {
        let result_sender = self.result_sender.clone();
        let running = Arc::clone(&self.running);
        let active = Arc::clone(&self.active);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name(format!("merge-worker-{worker_id}"))
            .spawn(move || {
                loop {
                    let task = match task_receiver.recv_timeout(Duration::from_millis(100)) {
                        Ok(task) => task,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            if running.load(Ordering::Acquire) {
                                continue;
                            }
                            break;
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    };

                    active.fetch_add(1, Ordering::AcqRel);
                    // keep draining merges registered while this one ran
                    let mut next = Some(task.merge);
                    while let Some(merge) = next {
                        let outcome = run_one(task.source.as_ref(), &merge);
                        {
                            let mut stats = stats.lock();
                            stats.total_merge_time_ms += outcome.elapsed_ms;
                            match &outcome.error {
                                None => stats.merges_completed += 1,
                                Some(HalberdError::MergeAborted(_)) => stats.merges_aborted += 1,
                                Some(_) => stats.merges_failed += 1,
                            }
                        }
                        let _ = result_sender.send(outcome);
                        next = task.source.next_merge();
                        if next.is_some() {
                            stats.lock().merges_submitted += 1;
                        }
                    }
                    active.fetch_sub(1, Ordering::AcqRel);
                }
                debug!("merge worker {worker_id} stopped");
            })?;
        Ok(handle)
    }

    /// Drain reported outcomes, returning the first error the policy keeps.
    fn drain_results(&self) -> Option<HalberdError> {
        let mut first = None;
        while let Ok(outcome) = self.result_receiver.try_recv() {
            if let Some(e) = self.config.error_policy.handle(&outcome) {
                first.get_or_insert(e);
            }
        }
        first
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        if let Some(e) = self.drain_results() {
            return Err(e);
        }
        if !self.running.load(Ordering::Acquire) {
            return Err(HalberdError::already_closed("merge scheduler is closed"));
        }

        let sender = self.sender()?;
        while let Some(merge) = source.next_merge() {
            debug!("dispatching merge {} ({trigger:?})", merge.id);
            self.stats.lock().merges_submitted += 1;
            let task = MergeTask {
                source: Arc::clone(&source),
                merge,
            };
            // blocks while max_merge_count merges wait for a worker
            if let Err(e) = sender.send(task) {
                let merge = e.into_inner().merge;
                merge.abort();
                let _ = source.merge(&merge);
                return Err(HalberdError::already_closed("merge workers stopped"));
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let handles = {
            let mut workers = self.workers.lock();
            workers.task_sender = None;
            std::mem::take(&mut workers.handles)
        };
        for handle in handles {
            handle
                .join()
                .map_err(|_| HalberdError::ThreadJoinError("merge worker panicked".to_string()))?;
        }
        if let Some(e) = self.drain_results() {
            debug!("merge failure reported at close: {e}");
        }
        // workers are spawned again on the next merge
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "concurrent"
    }
}
