//! Metadata providers
//!
//! A provider is a secondary structure bound to one reserved stream of a
//! container. The container notifies it before and after every item
//! operation, in registration order. A provider rejects an operation by
//! failing its pre-notification, which aborts the operation before any
//! item bytes are written.

mod key_index;
mod merkle;
mod recyclable;

pub use key_index::{KeyIndex, KeyIndexMode};
pub use merkle::{leaf_digest, Digest, MerkleTreeProvider, ZERO_DIGEST};
pub use recyclable::RecyclableIndexStore;

use crate::error::Result;
use crate::object::ItemEvent;
use crate::storage::ClusteredStreams;
use std::any::Any;
use std::io::Write;

/// Secondary structure kept consistent with a container's items
pub trait MetadataProvider<T>: Send + 'static {
    /// Load state from the reserved stream. Called once, before the first
    /// item operation.
    fn attach(&mut self, ctx: &ProviderContext<'_>) -> Result<()>;

    /// Validate an operation before it touches the store
    fn pre_item_operation(&mut self, _ctx: &ProviderContext<'_>, _event: &ItemEvent<'_, T>) -> Result<()> {
        Ok(())
    }

    /// Apply a committed operation
    fn post_item_operation(&mut self, ctx: &ProviderContext<'_>, event: &ItemEvent<'_, T>) -> Result<()>;

    /// Reset after the container was cleared
    fn clear(&mut self, ctx: &ProviderContext<'_>) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// A provider's view of the store: its own reserved stream plus read
/// access to item bytes.
pub struct ProviderContext<'a> {
    streams: &'a ClusteredStreams,
    reserved_index: u64,
}

impl<'a> ProviderContext<'a> {
    pub(crate) fn new(streams: &'a ClusteredStreams, reserved_index: u64) -> Self {
        Self {
            streams,
            reserved_index,
        }
    }

    pub fn reserved_index(&self) -> u64 {
        self.reserved_index
    }

    /// Logical item count at the time of the call
    pub fn item_count(&self) -> u64 {
        self.streams.count() - self.streams.reserved_streams()
    }

    /// Contents of the reserved stream (empty if null)
    pub fn load(&self) -> Result<Vec<u8>> {
        Ok(self
            .streams
            .read_all(self.reserved_index)?
            .unwrap_or_default())
    }

    /// Replace the contents of the reserved stream
    pub fn store(&self, bytes: &[u8]) -> Result<()> {
        let mut handle = self.streams.open_write(self.reserved_index)?;
        handle.set_len(bytes.len() as u64)?;
        handle.write_all(bytes)?;
        Ok(())
    }

    /// Serialized bytes of item `index`; `None` for null or reaped items
    pub fn item_bytes(&self, index: u64) -> Result<Option<Vec<u8>>> {
        self.streams
            .read_all(index + self.streams.reserved_streams())
    }
}
