//! Backing store abstraction
//!
//! A backing store is a linear, growable byte space. The clustered layer
//! addresses it by absolute offset and never interprets it beyond that.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::error::Result;

/// Linear byte space the engine reads and writes directly.
pub trait BackingStore: Send + Sync {
    /// Fill `buf` from `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corruption` if the range extends past the end of the
    /// store and `Error::Io` if the underlying read fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, growing the store if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Grow (zero-filled) or truncate the store.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flush pending writes to durable storage.
    fn flush(&self) -> Result<()>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
