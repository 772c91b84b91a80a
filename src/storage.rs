//! Directory abstraction used by the index engine.
//!
//! The engine never touches the file system directly. Segment files, overlay
//! generations, catalogs and the write lock all go through [`Storage`], so an
//! index can live on disk, in memory, or behind a wrapper that fails on
//! purpose.
//!
//! The contract the engine relies on:
//!
//! - a file is written once through a [`StorageOutput`] and never modified;
//!   a name is reused only after the old file was deleted
//! - `rename_file` replaces its target atomically (commits publish
//!   `pending_segments_N` this way)
//! - nothing is durable until `sync_files` (contents) and `sync_metadata`
//!   (renames and deletes) return
//! - `obtain_lock` is exclusive across writer instances
//!
//! Backends: [`file::FileStorage`], [`memory::MemoryStorage`] and
//! [`faulty::FaultyStorage`]. [`StorageFactory`] builds the first two from a
//! [`StorageConfig`].
//!
//! ```
//! use halberd::storage::{StorageConfig, StorageFactory};
//! use halberd::storage::memory::MemoryStorageConfig;
//!
//! # fn main() -> halberd::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! assert!(storage.list_files()?.is_empty());
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::Result;

pub mod faulty;
pub mod file;
pub mod memory;
pub mod structured;

/// The files of one index.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    ///
    /// ```
    /// use std::io::{Read, Write};
    /// use halberd::storage::Storage;
    /// use halberd::storage::memory::MemoryStorage;
    ///
    /// # fn main() -> halberd::error::Result<()> {
    /// let storage = MemoryStorage::new_default();
    /// let mut out = storage.create_output("_0.si")?;
    /// out.write_all(b"segment")?;
    /// out.close()?;
    ///
    /// let mut bytes = Vec::new();
    /// storage.open_input("_0.si")?.read_to_end(&mut bytes)?;
    /// assert_eq!(bytes, b"segment");
    /// # Ok(())
    /// # }
    /// ```
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file, truncating any file of that name.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. A missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// File names, sorted.
    fn list_files(&self) -> Result<Vec<String>>;

    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename `from` to `to`, replacing `to`.
    fn rename_file(&self, from: &str, to: &str) -> Result<()>;

    /// Make the contents of `names` durable.
    fn sync_files(&self, names: &[String]) -> Result<()>;

    /// Make renames and deletes durable.
    fn sync_metadata(&self) -> Result<()>;

    /// Take the exclusive lock `name`, failing with
    /// [`HalberdError::LockObtainFailed`](crate::error::HalberdError::LockObtainFailed)
    /// while someone else holds it. Dropping the lock releases it.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Whole contents of a file.
    fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        let mut bytes = Vec::with_capacity(input.size()? as usize);
        input.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// A file opened for reading.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    fn size(&self) -> Result<u64>;

    fn close(&mut self) -> Result<()>;
}

/// A file being written.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush buffered bytes and sync them.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Bytes written so far.
    fn position(&self) -> Result<u64>;

    /// Finish the file. Its contents are visible to readers afterwards.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        (**self).flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        (**self).position()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// An exclusive lock held on a storage location.
pub trait StorageLock: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Give the lock up. A second release does nothing.
    fn release(&mut self) -> Result<()>;

    fn is_valid(&self) -> bool;
}

/// Which backend to build, with its settings.
///
/// ```
/// use halberd::storage::StorageConfig;
/// use halberd::storage::file::FileStorageConfig;
///
/// let mut disk = FileStorageConfig::new("/var/lib/halberd/products");
/// disk.buffer_size = 128 * 1024;
/// let config = StorageConfig::File(disk);
/// # let _ = config;
/// ```
#[derive(Debug, Clone)]
pub enum StorageConfig {
    File(file::FileStorageConfig),
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// Builds a [`Storage`] from a [`StorageConfig`].
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        Ok(match config {
            StorageConfig::Memory(config) => Arc::new(memory::MemoryStorage::new(config)),
            StorageConfig::File(config) => {
                let directory = config.path.clone();
                Arc::new(file::FileStorage::new(&directory, config)?)
            }
        })
    }
}
