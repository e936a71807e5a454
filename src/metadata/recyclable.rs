//! Reaped-slot tracking for recyclable collections

use super::{MetadataProvider, ProviderContext};
use crate::error::{Error, Result};
use crate::object::{ItemEvent, ItemOperation};
use std::any::Any;
use std::collections::BTreeSet;
use tracing::debug;

/// Set of reaped item indices, persisted as little-endian `u64` records.
#[derive(Debug, Default, Clone)]
pub struct RecyclableIndexStore {
    reaped: BTreeSet<u64>,
}

impl RecyclableIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest reaped index, the next slot to reuse
    pub fn lowest(&self) -> Option<u64> {
        self.reaped.iter().next().copied()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.reaped.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.reaped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.reaped.iter().copied()
    }

    fn persist(&self, ctx: &ProviderContext<'_>) -> Result<()> {
        let bytes: Vec<u8> = self.reaped.iter().flat_map(|i| i.to_le_bytes()).collect();
        ctx.store(&bytes)
    }
}

impl<T: 'static> MetadataProvider<T> for RecyclableIndexStore {
    fn attach(&mut self, ctx: &ProviderContext<'_>) -> Result<()> {
        let bytes = ctx.load()?;
        if bytes.len() % 8 != 0 {
            return Err(Error::Corruption(format!(
                "Recyclable index store in reserved stream {} holds {} bytes",
                ctx.reserved_index(),
                bytes.len()
            )));
        }
        self.reaped = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect();
        debug!(reserved_index = ctx.reserved_index(), reaped = self.reaped.len(), "Loaded recyclable index store");
        Ok(())
    }

    fn post_item_operation(&mut self, ctx: &ProviderContext<'_>, event: &ItemEvent<'_, T>) -> Result<()> {
        let index = event.index;
        match event.operation {
            ItemOperation::Read => return Ok(()),
            ItemOperation::Reap => {
                self.reaped.insert(index);
            }
            ItemOperation::Add | ItemOperation::Update => {
                if !self.reaped.remove(&index) {
                    return Ok(());
                }
            }
            ItemOperation::Insert => {
                let moved = self.reaped.split_off(&index);
                self.reaped.extend(moved.into_iter().map(|i| i + 1));
            }
            ItemOperation::Remove => {
                self.reaped.remove(&index);
                let moved = self.reaped.split_off(&index);
                self.reaped.extend(moved.into_iter().map(|i| i - 1));
            }
        }
        self.persist(ctx)
    }

    fn clear(&mut self, ctx: &ProviderContext<'_>) -> Result<()> {
        self.reaped.clear();
        self.persist(ctx)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{I64Serializer, ObjectContainer};
    use crate::storage::{ClusteredStreams, MemoryBackend, StreamsOptions};
    use std::sync::Arc;

    fn container() -> Result<ObjectContainer<i64>> {
        let streams = ClusteredStreams::create(
            Arc::new(MemoryBackend::new()),
            &StreamsOptions {
                cluster_size: 16,
                reserved_streams: 1,
            },
        )?;
        let c = ObjectContainer::new(Arc::new(streams), I64Serializer);
        c.register_provider(0, RecyclableIndexStore::new())?;
        Ok(c)
    }

    fn reaped(c: &ObjectContainer<i64>) -> Result<Vec<u64>> {
        c.with_provider(0, |s: &RecyclableIndexStore| s.indices().collect())
    }

    #[test]
    fn test_tracks_reaped_slots() -> Result<()> {
        let c = container()?;
        for i in 0..5 {
            c.save_item(i, Some(&(i as i64)), ItemOperation::Add)?;
        }
        c.reap_item(3)?;
        c.reap_item(1)?;
        assert_eq!(reaped(&c)?, vec![1, 3]);

        c.save_item(1, Some(&10), ItemOperation::Update)?;
        assert_eq!(reaped(&c)?, vec![3]);

        c.save_item(0, Some(&-1), ItemOperation::Insert)?;
        assert_eq!(reaped(&c)?, vec![4]);

        c.remove_item(2)?;
        assert_eq!(reaped(&c)?, vec![3]);
        assert!(c.is_reaped(3)?);
        Ok(())
    }

    #[test]
    fn test_clear_empties_store() -> Result<()> {
        let c = container()?;
        c.save_item(0, Some(&1), ItemOperation::Add)?;
        c.reap_item(0)?;
        c.clear()?;
        assert_eq!(reaped(&c)?, Vec::<u64>::new());
        assert_eq!(c.count(), 0);
        Ok(())
    }
}
