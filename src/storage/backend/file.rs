//! File-backed backing store

use super::BackingStore;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Backing store over a single file.
///
/// Reads and writes seek the shared file handle, so all access is
/// serialized through one mutex.
pub struct FileBackend {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileBackend {
    /// Create (or truncate) a file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        info!(path = ?path, "Created backing file");
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Open an existing file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!(path = ?path, "Opened backing file");
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Open the file if it exists, otherwise create it
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for FileBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        if offset + buf.len() as u64 > file_len {
            return Err(Error::Corruption(format!(
                "Read of {} bytes at offset {} past end of {:?} ({} bytes)",
                buf.len(),
                offset,
                self.path,
                file_len
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend").field("path", &self.path).finish()
    }
}
