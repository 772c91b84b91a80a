//! Fault-injecting storage wrapper.
//!
//! [`FaultyStorage`] delegates to another [`Storage`] and fails selected
//! operations according to [`FaultRule`]s. It also tracks which files were
//! never made durable with [`Storage::sync_files`], so [`FaultyStorage::crash`]
//! can drop exactly the bytes a power loss would lose.
//!
//! ```
//! use std::sync::Arc;
//! use halberd::storage::faulty::{FaultOp, FaultRule, FaultyStorage};
//! use halberd::storage::memory::MemoryStorage;
//! use halberd::storage::Storage;
//!
//! let storage = FaultyStorage::new(Arc::new(MemoryStorage::new_default()));
//! storage.add_rule(FaultRule::new(FaultOp::CreateOutput).matching(r"^_0\.").times(1));
//! assert!(storage.create_output("_0.si").is_err());
//! assert!(storage.create_output("_0.si").is_ok());
//! ```

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

use crate::error::{HalberdError, Result};
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

/// Storage operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    OpenInput,
    CreateOutput,
    Write,
    CloseOutput,
    Delete,
    Rename,
    Sync,
    ListFiles,
}

/// One fault injection rule.
#[derive(Debug, Clone)]
pub struct FaultRule {
    /// Operation the rule applies to.
    pub op: FaultOp,
    /// Only file names matching this pattern are affected.
    pub pattern: Option<Regex>,
    /// Number of failures left; `None` fails forever.
    pub remaining: Option<usize>,
    /// Number of matching calls to let through before failing.
    pub skip: usize,
    /// Probability that a matching call fails.
    pub probability: f64,
}

impl FaultRule {
    /// A rule failing every call of `op`.
    pub fn new(op: FaultOp) -> Self {
        FaultRule {
            op,
            pattern: None,
            remaining: None,
            skip: 0,
            probability: 1.0,
        }
    }

    /// Restrict the rule to file names matching `pattern`.
    ///
    /// An invalid pattern leaves the rule unrestricted.
    pub fn matching(mut self, pattern: &str) -> Self {
        self.pattern = Regex::new(pattern).ok();
        self
    }

    /// Fail only `count` times.
    pub fn times(mut self, count: usize) -> Self {
        self.remaining = Some(count);
        self
    }

    /// Let `count` matching calls succeed first.
    pub fn after(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    /// Fail matching calls with the given probability.
    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability.clamp(0.0, 1.0);
        self
    }

    fn applies_to(&self, op: FaultOp, name: &str) -> bool {
        self.op == op
            && self.remaining != Some(0)
            && self.pattern.as_ref().is_none_or(|p| p.is_match(name))
    }
}

#[derive(Debug)]
struct FaultState {
    rules: Mutex<Vec<FaultRule>>,
    rng: Mutex<StdRng>,
    crashed: AtomicBool,
    injected: AtomicUsize,
}

impl FaultState {
    fn check(&self, op: FaultOp, name: &str) -> Result<()> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(HalberdError::storage(format!("injected fault: storage crashed ({op:?} {name})")));
        }

        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if !rule.applies_to(op, name) {
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            let fire = rule.probability >= 1.0 || self.rng.lock().random_bool(rule.probability);
            if !fire {
                continue;
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            self.injected.fetch_add(1, Ordering::SeqCst);
            debug!("injecting {op:?} fault for {name}");
            return Err(HalberdError::storage(format!("injected fault: {op:?} {name}")));
        }
        Ok(())
    }
}

/// Storage wrapper injecting failures and simulating crashes.
#[derive(Debug, Clone)]
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    state: Arc<FaultState>,
    unsynced: Arc<Mutex<HashSet<String>>>,
}

impl FaultyStorage {
    /// Wrap `inner` with a fixed random seed.
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self::with_seed(inner, 0x5EED)
    }

    /// Wrap `inner`, seeding probabilistic rules with `seed`.
    pub fn with_seed(inner: Arc<dyn Storage>, seed: u64) -> Self {
        FaultyStorage {
            inner,
            state: Arc::new(FaultState {
                rules: Mutex::new(Vec::new()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                crashed: AtomicBool::new(false),
                injected: AtomicUsize::new(0),
            }),
            unsynced: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The wrapped storage.
    pub fn inner(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.inner)
    }

    /// Add a fault rule.
    pub fn add_rule(&self, rule: FaultRule) {
        self.state.rules.lock().push(rule);
    }

    /// Remove every fault rule.
    pub fn clear_rules(&self) {
        self.state.rules.lock().clear();
    }

    /// Number of faults injected so far.
    pub fn injected_faults(&self) -> usize {
        self.state.injected.load(Ordering::SeqCst)
    }

    /// Files written but never synced.
    pub fn unsynced_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.unsynced.lock().iter().cloned().collect();
        files.sort();
        files
    }

    /// Simulate a power loss: every unsynced file disappears and all further
    /// operations fail until [`FaultyStorage::restart`].
    pub fn crash(&self) -> Result<()> {
        self.state.crashed.store(true, Ordering::SeqCst);
        let lost: Vec<String> = self.unsynced.lock().drain().collect();
        for name in lost {
            debug!("crash drops unsynced file {name}");
            self.inner.delete_file(&name)?;
        }
        Ok(())
    }

    /// Bring the storage back after [`FaultyStorage::crash`].
    pub fn restart(&self) {
        self.state.crashed.store(false, Ordering::SeqCst);
    }
}

impl Storage for FaultyStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.state.check(FaultOp::OpenInput, name)?;
        Ok(Box::new(FaultyInput {
            inner: self.inner.open_input(name)?,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.state.check(FaultOp::CreateOutput, name)?;
        let inner = self.inner.create_output(name)?;
        self.unsynced.lock().insert(name.to_string());
        Ok(Box::new(FaultyOutput {
            name: name.to_string(),
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.state.check(FaultOp::Delete, name)?;
        self.inner.delete_file(name)?;
        self.unsynced.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.state.check(FaultOp::ListFiles, "")?;
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.state.check(FaultOp::Rename, old_name)?;
        self.inner.rename_file(old_name, new_name)?;
        let mut unsynced = self.unsynced.lock();
        if unsynced.remove(old_name) {
            unsynced.insert(new_name.to_string());
        }
        Ok(())
    }

    fn sync_files(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.state.check(FaultOp::Sync, name)?;
        }
        self.inner.sync_files(names)?;
        let mut unsynced = self.unsynced.lock();
        for name in names {
            unsynced.remove(name);
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        self.state.check(FaultOp::Sync, "")?;
        self.inner.sync_metadata()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.inner.obtain_lock(name)
    }
}

#[derive(Debug)]
struct FaultyInput {
    inner: Box<dyn StorageInput>,
}

impl Read for FaultyInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for FaultyInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl StorageInput for FaultyInput {
    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[derive(Debug)]
struct FaultyOutput {
    name: String,
    inner: Box<dyn StorageOutput>,
    state: Arc<FaultState>,
}

fn to_io(err: HalberdError) -> std::io::Error {
    match err {
        HalberdError::Io(e) => e,
        other => std::io::Error::other(other.to_string()),
    }
}

impl Write for FaultyOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.state.check(FaultOp::Write, &self.name).map_err(to_io)?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl StorageOutput for FaultyOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.inner.flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.inner.position()
    }

    fn close(&mut self) -> Result<()> {
        self.state.check(FaultOp::CloseOutput, &self.name)?;
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn write_file(storage: &dyn Storage, name: &str) -> Result<()> {
        let mut out = storage.create_output(name)?;
        out.write_all(b"data")?;
        out.close()
    }

    #[test]
    fn test_rule_fires_limited_times() {
        let storage = FaultyStorage::new(Arc::new(MemoryStorage::new_default()));
        storage.add_rule(FaultRule::new(FaultOp::Write).matching(r"\.pst$").times(2));

        assert!(write_file(&storage, "_0.pst").is_err());
        assert!(write_file(&storage, "_1.pst").is_err());
        write_file(&storage, "_2.pst").unwrap();
        write_file(&storage, "_0.si").unwrap();
        assert_eq!(storage.injected_faults(), 2);
    }

    #[test]
    fn test_skip_lets_calls_through() {
        let storage = FaultyStorage::new(Arc::new(MemoryStorage::new_default()));
        storage.add_rule(FaultRule::new(FaultOp::CreateOutput).after(1).times(1));

        write_file(&storage, "a").unwrap();
        assert!(write_file(&storage, "b").is_err());
        write_file(&storage, "c").unwrap();
    }

    #[test]
    fn test_crash_drops_unsynced_files() {
        let inner = Arc::new(MemoryStorage::new_default());
        let storage = FaultyStorage::new(inner.clone());

        write_file(&storage, "durable").unwrap();
        write_file(&storage, "volatile").unwrap();
        storage.sync_files(&["durable".to_string()]).unwrap();
        assert_eq!(storage.unsynced_files(), vec!["volatile"]);

        storage.crash().unwrap();
        assert!(write_file(&storage, "after").is_err());
        assert!(inner.file_exists("durable"));
        assert!(!inner.file_exists("volatile"));

        storage.restart();
        write_file(&storage, "after").unwrap();
    }

    #[test]
    fn test_rename_carries_sync_state() {
        let storage = FaultyStorage::new(Arc::new(MemoryStorage::new_default()));
        write_file(&storage, "pending").unwrap();
        storage.rename_file("pending", "final").unwrap();
        assert_eq!(storage.unsynced_files(), vec!["final"]);
    }
}
