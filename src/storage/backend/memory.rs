//! In-memory backing store

use super::BackingStore;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::io;

/// Backing store held entirely in memory.
///
/// Contents are lost when the backend is dropped. Used for tests and for
/// stores that only live as long as the process. An optional limit caps
/// how far the store may grow.
#[derive(Default)]
pub struct MemoryBackend {
    bytes: RwLock<Vec<u8>>,
    limit: RwLock<Option<u64>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend over existing bytes (e.g. a snapshot of another store)
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
            limit: RwLock::new(None),
        }
    }

    /// Create an empty backend that refuses to grow past `max_len` bytes
    pub fn with_limit(max_len: u64) -> Self {
        let backend = Self::new();
        backend.set_limit(Some(max_len));
        backend
    }

    /// Change the growth limit; `None` removes it. Existing bytes are kept.
    pub fn set_limit(&self, max_len: Option<u64>) {
        *self.limit.write() = max_len;
    }

    fn check_limit(&self, len: u64) -> Result<()> {
        match *self.limit.read() {
            Some(max) if len > max => Err(Error::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("memory store limited to {} bytes, {} requested", max, len),
            ))),
            _ => Ok(()),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl BackingStore for MemoryBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(Error::Corruption(format!(
                "Read of {} bytes at offset {} past end of store ({} bytes)",
                buf.len(),
                offset,
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            self.check_limit(end as u64)?;
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let mut bytes = self.bytes.write();
        if len > bytes.len() as u64 {
            self.check_limit(len)?;
        }
        bytes.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("len", &self.bytes.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_grows_store() -> Result<()> {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty()?);

        backend.write_at(10, b"abc")?;
        assert_eq!(backend.len()?, 13);

        let mut buf = [0u8; 3];
        backend.read_at(10, &mut buf)?;
        assert_eq!(&buf, b"abc");

        // The gap is zero-filled
        let mut gap = [0xffu8; 10];
        backend.read_at(0, &mut gap)?;
        assert_eq!(gap, [0u8; 10]);
        Ok(())
    }

    #[test]
    fn test_read_past_end_fails() {
        let backend = MemoryBackend::from_bytes(vec![1, 2, 3]);
        let mut buf = [0u8; 4];
        assert!(matches!(
            backend.read_at(0, &mut buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_set_len_truncates() -> Result<()> {
        let backend = MemoryBackend::from_bytes(vec![7; 32]);
        backend.set_len(8)?;
        assert_eq!(backend.len()?, 8);
        assert_eq!(backend.snapshot(), vec![7; 8]);
        Ok(())
    }

    #[test]
    fn test_limit_refuses_growth() -> Result<()> {
        let backend = MemoryBackend::with_limit(16);
        backend.write_at(0, &[1; 16])?;
        assert!(matches!(backend.write_at(12, &[2; 8]), Err(Error::Io(_))));
        assert!(matches!(backend.set_len(17), Err(Error::Io(_))));
        assert_eq!(backend.snapshot(), vec![1; 16]);

        // Shrinking and in-place writes still work
        backend.set_len(8)?;
        backend.write_at(0, &[3; 8])?;
        backend.set_limit(None);
        backend.set_len(64)?;
        assert_eq!(backend.len()?, 64);
        Ok(())
    }
}
