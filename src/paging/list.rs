//! List materialized as cached in-memory pages

use super::cache::{CacheStats, PageCache};
use super::page::Page;
use super::storage::{MemoryPageStorage, PageStorage};
use crate::config::PageCacheConfig;
use crate::error::{Error, Result};
use crate::object::ItemSerializer;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct PageInfo {
    start: u64,
    count: u64,
    size_bytes: u64,
}

impl PageInfo {
    fn end(&self) -> u64 {
        self.start + self.count
    }
}

/// Item list split into pages of at most `page_size` declared bytes.
///
/// Pages load lazily on first access and leave memory only when the cache
/// evicts them. A page always holds at least one item, so an item larger
/// than `page_size` gets a page of its own.
pub struct MemoryPagedList<T> {
    cache: PageCache<T>,
    directory: Vec<PageInfo>,
    serializer: Arc<dyn ItemSerializer<T>>,
    page_size: u64,
    len: u64,
}

impl<T: Clone> MemoryPagedList<T> {
    pub fn new(
        storage: Box<dyn PageStorage<T>>,
        serializer: Arc<dyn ItemSerializer<T>>,
        config: &PageCacheConfig,
    ) -> Self {
        Self {
            cache: PageCache::new(storage, serializer.clone(), config.capacity),
            directory: Vec::new(),
            serializer,
            page_size: config.page_size as u64,
            len: 0,
        }
    }

    /// List whose evicted pages are kept in process memory
    pub fn in_memory(serializer: Arc<dyn ItemSerializer<T>>, config: &PageCacheConfig) -> Self
    where
        T: Send + 'static,
    {
        Self::new(Box::new(MemoryPageStorage::new()), serializer, config)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_count(&self) -> usize {
        self.directory.len()
    }

    pub fn cache(&self) -> &PageCache<T> {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Append and return the new index.
    ///
    /// If making room fails (a dirty page could not be saved) the item is
    /// taken back out and the list is unchanged.
    pub fn push(&mut self, item: T) -> Result<u64> {
        let size = self.serializer.calculate_size(&item);
        let index = self.len;

        let fits = self
            .directory
            .last()
            .is_some_and(|last| last.size_bytes + size <= self.page_size);
        if fits {
            let number = self.directory.len() - 1;
            let info = self.directory[number];
            let was_dirty = self.cache.with_page_mut(number, info.start, |page| {
                let was_dirty = page.is_dirty();
                page.push(item, size);
                was_dirty
            })?;
            self.directory[number].count += 1;
            self.directory[number].size_bytes += size;
            self.len += 1;

            if let Err(e) = self.cache.settle(number) {
                self.cache.with_page_mut(number, info.start, |page| {
                    page.truncate(info.count as usize);
                    page.dirty = was_dirty;
                })?;
                self.directory[number] = info;
                self.len = index;
                return Err(e);
            }
        } else {
            let number = self.directory.len();
            self.cache
                .insert(Page::new(number, index, vec![item], vec![size]));
            self.directory.push(PageInfo {
                start: index,
                count: 1,
                size_bytes: size,
            });
            self.len += 1;

            if let Err(e) = self.cache.settle(number) {
                self.cache.discard(number);
                self.directory.pop();
                self.len = index;
                return Err(e);
            }
        }
        Ok(index)
    }

    pub fn get(&mut self, index: u64) -> Result<T> {
        let number = self.locate(index)?;
        let start = self.directory[number].start;
        self.cache
            .with_page(number, start, |page| page.get(index).cloned())?
            .ok_or_else(|| page_mismatch(number, index))
    }

    /// Replace item `index`; on failure the old item stays in place
    pub fn set(&mut self, index: u64, item: T) -> Result<()> {
        let number = self.locate(index)?;
        let info = self.directory[number];
        let size = self.serializer.calculate_size(&item);
        let (old, old_size, was_dirty) = self
            .cache
            .with_page_mut(number, info.start, |page| {
                let was_dirty = page.is_dirty();
                page.set(index, item, size).map(|(old, old_size)| (old, old_size, was_dirty))
            })?
            .ok_or_else(|| page_mismatch(number, index))?;
        self.directory[number].size_bytes = info.size_bytes - old_size + size;

        if let Err(e) = self.cache.settle(number) {
            self.cache.with_page_mut(number, info.start, |page| {
                page.set(index, old, old_size);
                page.dirty = was_dirty;
            })?;
            self.directory[number] = info;
            return Err(e);
        }
        Ok(())
    }

    /// Keep the first `len` items, deleting pages past the end
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if len >= self.len {
            return Ok(());
        }
        while let Some(last) = self.directory.last().copied() {
            if last.start < len {
                break;
            }
            self.cache.remove(self.directory.len() - 1)?;
            self.directory.pop();
            // Tail pages already deleted stay deleted if a later step fails
            self.len = last.start;
        }
        if let Some(last) = self.directory.last().copied() {
            if last.end() > len {
                let number = self.directory.len() - 1;
                let keep = (len - last.start) as usize;
                let size = self.cache.with_page_mut(number, last.start, |page| {
                    page.truncate(keep);
                    page.size_bytes()
                })?;
                let info = &mut self.directory[number];
                info.count = keep as u64;
                info.size_bytes = size;
            }
        }
        self.len = len;
        Ok(())
    }

    /// Save every dirty page
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush()
    }

    pub fn to_vec(&mut self) -> Result<Vec<T>> {
        let mut items = Vec::with_capacity(self.len as usize);
        for number in 0..self.directory.len() {
            let start = self.directory[number].start;
            self.cache
                .with_page(number, start, |page| items.extend_from_slice(page.items()))?;
        }
        Ok(items)
    }

    fn locate(&self, index: u64) -> Result<usize> {
        if index >= self.len {
            return Err(Error::OutOfRange {
                index,
                count: self.len,
            });
        }
        Ok(self.directory.partition_point(|p| p.end() <= index))
    }
}

fn page_mismatch(number: usize, index: u64) -> Error {
    Error::Corruption(format!("Page {} does not hold item {}", number, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheCapacity;
    use crate::object::{StringSerializer, U64Serializer};
    use crate::paging::{PageState, StreamPageStorage};
    use crate::storage::{ClusteredStreams, MemoryBackend, StreamsOptions};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(page_size: usize, capacity: CacheCapacity) -> PageCacheConfig {
        PageCacheConfig {
            page_size,
            capacity,
        }
    }

    #[test]
    fn test_pages_fill_by_declared_size() -> Result<()> {
        let mut list: MemoryPagedList<u64> = MemoryPagedList::in_memory(Arc::new(U64Serializer), &config(32, CacheCapacity::Pages(2)));
        for i in 0..10u64 {
            assert_eq!(list.push(i * i)?, i);
        }
        // Four u64 per 32-byte page
        assert_eq!(list.page_count(), 3);
        assert_eq!(list.cache().loaded_pages(), 2);

        for i in 0..10u64 {
            assert_eq!(list.get(i)?, i * i);
        }
        assert!(matches!(list.get(10), Err(Error::OutOfRange { .. })));
        Ok(())
    }

    #[test]
    fn test_evicted_updates_survive() -> Result<()> {
        let mut list: MemoryPagedList<u64> = MemoryPagedList::in_memory(Arc::new(U64Serializer), &config(16, CacheCapacity::Pages(1)));
        for i in 0..8u64 {
            list.push(i)?;
        }
        list.set(0, 100)?;
        list.set(7, 700)?;
        list.set(3, 300)?;
        assert_eq!(list.to_vec()?, vec![100, 1, 2, 300, 4, 5, 6, 700]);

        let stats = list.stats();
        assert!(stats.unloads > 0);
        assert_eq!(stats.loaded_pages, 1);
        Ok(())
    }

    #[test]
    fn test_truncate_deletes_tail_pages() -> Result<()> {
        let mut list: MemoryPagedList<u64> = MemoryPagedList::in_memory(Arc::new(U64Serializer), &config(16, CacheCapacity::Pages(4)));
        for i in 0..7u64 {
            list.push(i)?;
        }
        assert_eq!(list.page_count(), 4);
        list.truncate(3)?;
        assert_eq!(list.len(), 3);
        assert_eq!(list.page_count(), 2);
        assert_eq!(list.cache().state_of(3), PageState::Deleted);
        assert_eq!(list.to_vec()?, vec![0, 1, 2]);

        list.push(9)?;
        assert_eq!(list.page_count(), 2);
        assert_eq!(list.get(3)?, 9);
        Ok(())
    }

    #[test]
    fn test_variable_size_items_and_byte_capacity() -> Result<()> {
        let mut list: MemoryPagedList<String> = MemoryPagedList::in_memory(Arc::new(StringSerializer), &config(8, CacheCapacity::Bytes(16)));
        for word in ["a", "bb", "ccc", "dddddddddd", "e"] {
            list.push(word.to_string())?;
        }
        // [a bb ccc] [dddddddddd] [e]
        assert_eq!(list.page_count(), 3);
        assert!(list.cache().loaded_bytes() <= 16 || list.cache().loaded_pages() == 1);
        assert_eq!(list.get(3)?, "dddddddddd");
        assert_eq!(list.get(0)?, "a");
        Ok(())
    }

    #[test]
    fn test_stream_backed_pages() -> Result<()> {
        let streams = Arc::new(ClusteredStreams::create(Arc::new(MemoryBackend::new()), &StreamsOptions::default())?);
        let serializer: Arc<dyn ItemSerializer<String>> = Arc::new(StringSerializer);
        let storage = StreamPageStorage::new(streams.clone(), serializer.clone());
        let mut list = MemoryPagedList::new(Box::new(storage), serializer, &config(6, CacheCapacity::Pages(1)));

        for i in 0..12 {
            list.push(format!("item{}", i))?;
        }
        list.flush()?;
        assert_eq!(streams.count(), list.page_count() as u64);
        assert_eq!(list.get(0)?, "item0");
        assert_eq!(list.get(11)?, "item11");
        Ok(())
    }

    struct SwitchableStorage {
        inner: MemoryPageStorage<u64>,
        failing: Arc<AtomicBool>,
    }

    impl PageStorage<u64> for SwitchableStorage {
        fn save(&mut self, page: usize, items: &[u64]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.inner.save(page, items)
        }
        fn load(&mut self, page: usize) -> Result<Vec<u64>> {
            self.inner.load(page)
        }
        fn delete(&mut self, page: usize) -> Result<()> {
            self.inner.delete(page)
        }
    }

    #[test]
    fn test_failed_eviction_leaves_list_unchanged() -> Result<()> {
        let failing = Arc::new(AtomicBool::new(false));
        let storage = SwitchableStorage {
            inner: MemoryPageStorage::new(),
            failing: failing.clone(),
        };
        let mut list = MemoryPagedList::new(
            Box::new(storage),
            Arc::new(U64Serializer),
            &config(16, CacheCapacity::Bytes(24)),
        );
        for i in 0..3u64 {
            list.push(i)?;
        }

        failing.store(true, Ordering::SeqCst);
        assert!(matches!(list.push(3), Err(Error::Io(_))));
        assert_eq!(list.len(), 3);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(list.push(4)?, 3);
        assert_eq!(list.len(), 4);
        assert_eq!(list.get(3)?, 4);

        // Page 0 was evicted; reloading it has to evict dirty page 1
        failing.store(true, Ordering::SeqCst);
        assert!(list.set(0, 77).is_err());
        failing.store(false, Ordering::SeqCst);
        assert_eq!(list.to_vec()?, vec![0, 1, 2, 4]);
        Ok(())
    }

    #[test]
    fn test_failed_eviction_drops_new_page() -> Result<()> {
        let failing = Arc::new(AtomicBool::new(false));
        let storage = SwitchableStorage {
            inner: MemoryPageStorage::new(),
            failing: failing.clone(),
        };
        let mut list = MemoryPagedList::new(
            Box::new(storage),
            Arc::new(U64Serializer),
            &config(16, CacheCapacity::Bytes(16)),
        );
        list.push(0)?;
        list.push(1)?;

        failing.store(true, Ordering::SeqCst);
        assert!(list.push(2).is_err());
        assert_eq!(list.len(), 2);
        assert_eq!(list.page_count(), 1);
        assert_eq!(list.cache().loaded_pages(), 1);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(list.push(3)?, 2);
        assert_eq!(list.page_count(), 2);
        assert_eq!(list.to_vec()?, vec![0, 1, 3]);
        Ok(())
    }
}
