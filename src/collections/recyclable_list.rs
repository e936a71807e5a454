//! List whose removed slots are reaped and reused by later adds

use crate::error::{Error, Result};
use crate::metadata::RecyclableIndexStore;
use crate::object::{ItemOperation, ItemSerializer, ObjectContainer};
use crate::storage::ClusteredStreams;
use std::sync::Arc;

/// Reserved stream holding the reaped-slot set
pub const RECYCLE_STREAM: u64 = 0;

/// List where removal reaps the slot and `push` refills the lowest reaped
/// slot before appending. Indices of live items never move.
pub struct RecyclableList<T: 'static> {
    container: ObjectContainer<T>,
}

impl<T: 'static> RecyclableList<T> {
    /// The store needs at least one reserved stream
    pub fn new(streams: Arc<ClusteredStreams>, serializer: impl ItemSerializer<T> + 'static) -> Result<Self> {
        Self::from_container(ObjectContainer::new(streams, serializer))
    }

    pub fn from_container(container: ObjectContainer<T>) -> Result<Self> {
        if container.streams().reserved_streams() <= RECYCLE_STREAM {
            return Err(Error::Config(
                "Recyclable list needs one reserved stream".to_string(),
            ));
        }
        container.register_provider(RECYCLE_STREAM, RecyclableIndexStore::new())?;
        Ok(Self { container })
    }

    pub fn container(&self) -> &ObjectContainer<T> {
        &self.container
    }

    /// Live (non-reaped) items
    pub fn len(&self) -> Result<u64> {
        let _scope = self.container.streams().enter();
        let reaped = self.reaped_count()?;
        Ok(self.container.count() - reaped)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Slots in use or awaiting reuse
    pub fn slot_count(&self) -> u64 {
        self.container.count()
    }

    pub fn reaped_count(&self) -> Result<u64> {
        self.container
            .with_provider(RECYCLE_STREAM, |s: &RecyclableIndexStore| s.len() as u64)
    }

    /// Store `item` in a free slot and return its index
    pub fn push(&self, item: T) -> Result<u64> {
        let _scope = self.container.streams().enter();
        let recycled = self
            .container
            .with_provider(RECYCLE_STREAM, |s: &RecyclableIndexStore| s.lowest())?;
        match recycled {
            Some(index) => {
                self.container
                    .save_item(index, Some(&item), ItemOperation::Update)?;
                Ok(index)
            }
            None => {
                let index = self.container.count();
                self.container
                    .save_item(index, Some(&item), ItemOperation::Add)?;
                Ok(index)
            }
        }
    }

    /// Item at `index`; `None` if the slot was removed
    pub fn get(&self, index: u64) -> Result<Option<T>> {
        self.container.load_item(index)
    }

    pub fn set(&self, index: u64, item: T) -> Result<()> {
        self.container
            .save_item(index, Some(&item), ItemOperation::Update)
    }

    /// Reap the slot; later indices are unaffected
    pub fn remove_at(&self, index: u64) -> Result<()> {
        self.container.reap_item(index)
    }

    pub fn is_removed(&self, index: u64) -> Result<bool> {
        self.container.is_reaped(index)
    }

    pub fn clear(&self) -> Result<()> {
        self.container.clear()
    }

    /// `(index, item)` for every live slot
    pub fn iter(&self) -> impl Iterator<Item = Result<(u64, T)>> + '_ {
        (0..self.slot_count()).filter_map(move |i| match self.get(i) {
            Ok(Some(item)) => Some(Ok((i, item))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        })
    }
}
