//! Page persistence

use crate::error::{Error, Result};
use crate::object::ItemSerializer;
use crate::storage::ClusteredStreams;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Where evicted pages go
pub trait PageStorage<T>: Send {
    fn save(&mut self, page: usize, items: &[T]) -> Result<()>;

    fn load(&mut self, page: usize) -> Result<Vec<T>>;

    fn delete(&mut self, page: usize) -> Result<()>;
}

/// Pages kept as cloned vectors
#[derive(Debug)]
pub struct MemoryPageStorage<T> {
    pages: HashMap<usize, Vec<T>>,
}

impl<T> MemoryPageStorage<T> {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    pub fn stored_pages(&self) -> usize {
        self.pages.len()
    }
}

impl<T> Default for MemoryPageStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> PageStorage<T> for MemoryPageStorage<T> {
    fn save(&mut self, page: usize, items: &[T]) -> Result<()> {
        self.pages.insert(page, items.to_vec());
        Ok(())
    }

    fn load(&mut self, page: usize) -> Result<Vec<T>> {
        self.pages
            .get(&page)
            .cloned()
            .ok_or_else(|| Error::Corruption(format!("Page {} was never saved", page)))
    }

    fn delete(&mut self, page: usize) -> Result<()> {
        self.pages.remove(&page);
        Ok(())
    }
}

/// One clustered stream per page: `[count u32]` then `[len u32][item]` per item
pub struct StreamPageStorage<T> {
    streams: Arc<ClusteredStreams>,
    serializer: Arc<dyn ItemSerializer<T>>,
}

impl<T> StreamPageStorage<T> {
    pub fn new(streams: Arc<ClusteredStreams>, serializer: Arc<dyn ItemSerializer<T>>) -> Self {
        Self { streams, serializer }
    }

    fn stream_index(&self, page: usize) -> u64 {
        self.streams.reserved_streams() + page as u64
    }
}

impl<T> PageStorage<T> for StreamPageStorage<T> {
    fn save(&mut self, page: usize, items: &[T]) -> Result<()> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items {
            let size = self.serializer.calculate_size(item);
            let len = u32::try_from(size)
                .map_err(|_| Error::Serialization(format!("Item of {} bytes too large for a page", size)))?;
            bytes.extend_from_slice(&len.to_le_bytes());
            let start = bytes.len();
            self.serializer.serialize(item, &mut bytes)?;
            if (bytes.len() - start) as u64 != size {
                return Err(Error::Corruption(format!(
                    "Serializer declared {} bytes but wrote {}",
                    size,
                    bytes.len() - start
                )));
            }
        }

        let _scope = self.streams.enter();
        let index = self.stream_index(page);
        while self.streams.count() <= index {
            self.streams.add()?.set_null()?;
        }
        let mut handle = self.streams.open_write(index)?;
        handle.set_len(bytes.len() as u64)?;
        handle.write_all(&bytes)?;
        Ok(())
    }

    fn load(&mut self, page: usize) -> Result<Vec<T>> {
        let index = self.stream_index(page);
        let bytes = self
            .streams
            .read_all(index)?
            .ok_or_else(|| Error::Corruption(format!("Page {} was never saved", page)))?;

        let mut reader = bytes.as_slice();
        let count = read_u32(&mut reader)? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32(&mut reader)? as u64;
            if reader.len() < len as usize {
                return Err(Error::Corruption(format!("Page {} truncated", page)));
            }
            let (item_bytes, rest) = reader.split_at(len as usize);
            items.push(self.serializer.deserialize(&mut &item_bytes[..], len)?);
            reader = rest;
        }
        Ok(items)
    }

    fn delete(&mut self, page: usize) -> Result<()> {
        let _scope = self.streams.enter();
        let index = self.stream_index(page);
        if index >= self.streams.count() {
            return Ok(());
        }
        if index + 1 == self.streams.count() {
            self.streams.remove(index)
        } else {
            self.streams.open_write(index)?.set_null()
        }
    }
}

fn read_u32(reader: &mut &[u8]) -> Result<u32> {
    if reader.len() < 4 {
        return Err(Error::Corruption("Page record truncated".to_string()));
    }
    let (head, rest) = reader.split_at(4);
    *reader = rest;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::StringSerializer;
    use crate::storage::{MemoryBackend, StreamsOptions};

    #[test]
    fn test_stream_page_storage() -> Result<()> {
        let streams = Arc::new(ClusteredStreams::create(
            Arc::new(MemoryBackend::new()),
            &StreamsOptions {
                cluster_size: 16,
                reserved_streams: 1,
            },
        )?);
        let mut storage = StreamPageStorage::new(streams.clone(), Arc::new(StringSerializer));

        let page: Vec<String> = vec!["one".into(), String::new(), "three".into()];
        storage.save(2, &page)?;
        assert_eq!(streams.count(), 4);
        assert_eq!(storage.load(2)?, page);
        assert!(storage.load(0).is_err());

        storage.delete(2)?;
        assert_eq!(streams.count(), 3);
        storage.delete(0)?;
        assert!(streams.descriptor(1)?.traits.is_null());
        Ok(())
    }

    #[test]
    fn test_memory_page_storage() -> Result<()> {
        let mut storage = MemoryPageStorage::new();
        storage.save(0, &[1u8, 2])?;
        assert_eq!(storage.load(0)?, vec![1, 2]);
        storage.delete(0)?;
        assert!(storage.load(0).is_err());
        Ok(())
    }
}
