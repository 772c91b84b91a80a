//! Index files on the local file system.
//!
//! One directory per index. Reads and writes are buffered; nothing reaches
//! the disk durably until [`Storage::sync_files`] or
//! [`Storage::sync_metadata`]. The write lock is a `create_new` file holding
//! the owner's process id, so a second process (or a second
//! [`FileStorage`] over the same directory) cannot take it.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{HalberdError, Result};
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

/// Settings for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Index directory; created when missing.
    pub path: PathBuf,

    /// Read and write buffer size in bytes.
    pub buffer_size: usize,

    /// Flush every write to the OS and sync outputs on close.
    pub sync_writes: bool,

    /// Lock files. Without them `obtain_lock` refuses, so only readers can
    /// use the storage.
    pub use_locking: bool,
}

impl FileStorageConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 64 * 1024,
            sync_writes: false,
            use_locking: true,
        }
    }
}

#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    config: FileStorageConfig,
    /// Locks taken through this instance; the lock files guard against others.
    locks: Arc<Mutex<HashSet<String>>>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(directory: P, config: FileStorageConfig) -> Result<Self> {
        let root = directory.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| HalberdError::storage(format!("cannot create {}: {e}", root.display())))?;
        if !root.is_dir() {
            return Err(HalberdError::storage(format!("{} is not a directory", root.display())));
        }
        debug!("file storage at {}", root.display());
        Ok(FileStorage {
            root,
            config,
            locks: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Storage over `directory` with default settings.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let config = FileStorageConfig::new(directory.as_ref());
        Self::new(directory, config)
    }

    pub fn directory(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Missing files become [`HalberdError::file_not_found`] naming the index file.
fn io_error(name: &str, e: io::Error) -> HalberdError {
    match e.kind() {
        io::ErrorKind::NotFound => HalberdError::file_not_found(name),
        _ => HalberdError::Io(e),
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let file = File::open(self.path(name)).map_err(|e| io_error(name, e))?;
        let len = file.metadata()?.len();
        Ok(Box::new(FileInput {
            reader: BufReader::with_capacity(self.config.buffer_size, file),
            len,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(name))?;
        Ok(Box::new(FileOutput {
            writer: BufWriter::with_capacity(self.config.buffer_size, file),
            written: 0,
            sync_writes: self.config.sync_writes,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(HalberdError::Io(e)),
            _ => Ok(()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!("skipping non UTF-8 file name {raw:?}"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.path(name)).map_err(|e| io_error(name, e))?.len())
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.path(from), self.path(to)).map_err(|e| io_error(from, e))
    }

    fn sync_files(&self, names: &[String]) -> Result<()> {
        for name in names {
            File::open(self.path(name))
                .map_err(|e| io_error(name, e))?
                .sync_all()?;
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        // Directories cannot be opened for syncing on every platform.
        #[cfg(unix)]
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        if !self.config.use_locking {
            return Err(HalberdError::invalid_operation(format!(
                "locking is disabled for {}",
                self.root.display()
            )));
        }
        let mut locks = self.locks.lock();
        if locks.contains(name) {
            return Err(HalberdError::lock_obtain_failed(name));
        }
        let path = self.path(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => HalberdError::lock_obtain_failed(name),
                _ => HalberdError::Io(e),
            })?;
        writeln!(file, "{}", std::process::id())?;
        locks.insert(name.to_string());
        Ok(Box::new(FileLock {
            name: name.to_string(),
            path,
            _file: file,
            locks: Arc::clone(&self.locks),
            released: false,
        }))
    }
}

#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    len: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    written: u64,
    sync_writes: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        if self.sync_writes {
            self.writer.flush()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.written)
    }

    fn close(&mut self) -> Result<()> {
        if self.sync_writes {
            return self.flush_and_sync();
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Held while the lock file exists; removed on release or drop.
#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    _file: File,
    locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.locks.lock().remove(&self.name);
        fs::remove_file(&self.path)
            .map_err(|e| HalberdError::storage(format!("cannot remove lock file {}: {e}", self.path.display())))
    }

    fn is_valid(&self) -> bool {
        !self.released && self.path.exists()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{Builder, TempDir};

    use super::*;

    fn storage() -> (TempDir, FileStorage) {
        let dir = Builder::new().prefix("file_storage").tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_write_then_read_segment_file() {
        let (_dir, storage) = storage();

        let mut out = storage.create_output("_0.pst").unwrap();
        out.write_all(b"postings").unwrap();
        assert_eq!(out.position().unwrap(), 8);
        out.close().unwrap();

        let mut input = storage.open_input("_0.pst").unwrap();
        assert_eq!(input.size().unwrap(), 8);
        input.seek(SeekFrom::Start(4)).unwrap();
        let mut tail = String::new();
        input.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "ings");
    }

    #[test]
    fn test_publish_catalog_by_rename() {
        let (_dir, storage) = storage();
        assert!(!storage.file_exists("segments_1"));

        let mut out = storage.create_output("pending_segments_1").unwrap();
        out.write_all(b"catalog").unwrap();
        out.close().unwrap();
        storage.sync_files(&["pending_segments_1".to_string()]).unwrap();
        storage.rename_file("pending_segments_1", "segments_1").unwrap();
        storage.sync_metadata().unwrap();

        assert_eq!(storage.list_files().unwrap(), vec!["segments_1"]);
        assert_eq!(storage.file_size("segments_1").unwrap(), 7);

        storage.delete_file("segments_1").unwrap();
        assert!(!storage.file_exists("segments_1"));
        storage.delete_file("segments_1").unwrap();
    }

    #[test]
    fn test_missing_files() {
        let (_dir, storage) = storage();
        assert!(storage.open_input("_9.si").unwrap_err().is_not_found());
        assert!(storage.file_size("_9.si").unwrap_err().is_not_found());
        assert!(storage.rename_file("_9.si", "_10.si").unwrap_err().is_not_found());
        assert!(storage.sync_files(&["_9.si".to_string()]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_write_lock_excludes_other_instances() {
        let (dir, storage) = storage();

        let lock = storage.obtain_lock("write.lock").unwrap();
        assert!(lock.is_valid());
        assert!(matches!(
            storage.obtain_lock("write.lock"),
            Err(HalberdError::LockObtainFailed(_))
        ));
        let other = FileStorage::open(dir.path()).unwrap();
        assert!(other.obtain_lock("write.lock").is_err());

        drop(lock);
        assert!(!storage.file_exists("write.lock"));
        let _lock = other.obtain_lock("write.lock").unwrap();
    }

    #[test]
    fn test_locking_disabled() {
        let dir = Builder::new().prefix("file_storage").tempdir().unwrap();
        let mut config = FileStorageConfig::new(dir.path());
        config.use_locking = false;
        let storage = FileStorage::new(dir.path(), config).unwrap();
        assert!(storage.obtain_lock("write.lock").is_err());
    }
}
