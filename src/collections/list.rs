//! List with one stream per item; removal shifts later indices

use crate::error::Result;
use crate::object::{ItemOperation, ItemSerializer, ObjectContainer};
use crate::storage::ClusteredStreams;
use std::sync::Arc;

/// List whose items live one per stream.
///
/// Items may be null (`None`), which round-trips distinctly from an empty
/// value.
pub struct StreamMappedList<T: 'static> {
    container: ObjectContainer<T>,
}

impl<T: 'static> StreamMappedList<T> {
    pub fn new(streams: Arc<ClusteredStreams>, serializer: impl ItemSerializer<T> + 'static) -> Self {
        Self {
            container: ObjectContainer::new(streams, serializer),
        }
    }

    pub fn from_container(container: ObjectContainer<T>) -> Self {
        Self { container }
    }

    pub fn container(&self) -> &ObjectContainer<T> {
        &self.container
    }

    pub fn len(&self) -> u64 {
        self.container.count()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    /// Append and return the new index
    pub fn push(&self, item: T) -> Result<u64> {
        self.push_opt(Some(&item))
    }

    pub fn push_opt(&self, item: Option<&T>) -> Result<u64> {
        let _scope = self.container.streams().enter();
        let index = self.container.count();
        self.container.save_item(index, item, ItemOperation::Add)?;
        Ok(index)
    }

    pub fn insert(&self, index: u64, item: T) -> Result<()> {
        self.container
            .save_item(index, Some(&item), ItemOperation::Insert)
    }

    pub fn get(&self, index: u64) -> Result<Option<T>> {
        self.container.load_item(index)
    }

    pub fn set(&self, index: u64, item: T) -> Result<()> {
        self.container
            .save_item(index, Some(&item), ItemOperation::Update)
    }

    pub fn set_opt(&self, index: u64, item: Option<&T>) -> Result<()> {
        self.container.save_item(index, item, ItemOperation::Update)
    }

    pub fn remove_at(&self, index: u64) -> Result<()> {
        self.container.remove_item(index)
    }

    pub fn clear(&self) -> Result<()> {
        self.container.clear()
    }

    /// Items in index order
    pub fn iter(&self) -> impl Iterator<Item = Result<Option<T>>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}
