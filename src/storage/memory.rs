//! In-memory storage implementation for testing and throwaway indexes.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{HalberdError, Result};
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

type FileMap = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 16,
        }
    }
}

/// An in-memory storage implementation.
///
/// Files become visible when their output is closed (or dropped).
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    files: FileMap,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::with_capacity(config.initial_capacity))),
            locks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }

    /// Overwrite the bytes of an existing file. Test hook for corruption scenarios.
    pub fn replace_contents(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let mut files = self.files.lock();
        if !files.contains_key(name) {
            return Err(HalberdError::file_not_found(name));
        }
        files.insert(name.to_string(), Arc::from(data));
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| HalberdError::file_not_found(name))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut file_names: Vec<String> = files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| HalberdError::file_not_found(name))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| HalberdError::file_not_found(old_name))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync_files(&self, names: &[String]) -> Result<()> {
        let files = self.files.lock();
        for name in names {
            if !files.contains_key(name) {
                return Err(HalberdError::file_not_found(name));
            }
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let mut locks = self.locks.lock();
        if !locks.insert(name.to_string()) {
            return Err(HalberdError::lock_obtain_failed(name));
        }

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            released: false,
        }))
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<SharedBytes>,
    size: u64,
}

#[derive(Debug, Clone)]
struct SharedBytes(Arc<[u8]>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(SharedBytes(data)),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer));
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // An abandoned output still leaves its (possibly partial) file behind.
        let _ = self.close();
    }
}

#[derive(Debug)]
struct MemoryLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.locks.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalberdError;

    #[test]
    fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("test.txt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        // not visible before close
        assert!(!storage.file_exists("test.txt"));
        output.close().unwrap();

        assert!(storage.file_exists("test.txt"));
        assert_eq!(storage.file_size("test.txt").unwrap(), 13);
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.total_size(), 13);

        let mut input = storage.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, World!");

        input.seek(SeekFrom::Start(7)).unwrap();
        let mut tail = String::new();
        input.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "World!");
    }

    #[test]
    fn test_rename_and_delete() {
        let storage = MemoryStorage::new_default();
        let mut output = storage.create_output("a").unwrap();
        output.write_all(b"x").unwrap();
        drop(output);

        storage.rename_file("a", "b").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["b"]);
        assert!(storage.rename_file("a", "c").is_err());

        storage.delete_file("b").unwrap();
        assert!(storage.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_lock_exclusive() {
        let storage = MemoryStorage::new_default();
        let mut lock = storage.obtain_lock("write.lock").unwrap();
        assert_eq!(lock.name(), "write.lock");
        assert!(matches!(
            storage.obtain_lock("write.lock"),
            Err(HalberdError::LockObtainFailed(_))
        ));
        lock.release().unwrap();
        assert!(!lock.is_valid());
        let _again = storage.obtain_lock("write.lock").unwrap();
    }

    #[test]
    fn test_clones_share_files() {
        let storage = MemoryStorage::new_default();
        let view = storage.clone();
        let mut output = storage.create_output("shared").unwrap();
        output.write_all(b"abc").unwrap();
        output.close().unwrap();
        assert!(view.file_exists("shared"));

        view.replace_contents("shared", b"xyz".to_vec()).unwrap();
        assert_eq!(storage.read_all("shared").unwrap(), b"xyz");
    }
}
