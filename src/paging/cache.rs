//! LRU page cache
//!
//! Pages are evicted least-recently-used first. An evicted dirty page is
//! always saved before it is unloaded; a deleted page is dropped without
//! saving.

use super::page::{Page, PageState};
use super::storage::PageStorage;
use crate::config::CacheCapacity;
use crate::error::{Error, Result};
use crate::object::ItemSerializer;
use lru::LruCache;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Callback told about every page state transition
pub type StateObserver = Box<dyn FnMut(usize, PageState) + Send>;

/// Page cache over a [`PageStorage`]
pub struct PageCache<T> {
    pages: LruCache<usize, Page<T>>,
    deleted: BTreeSet<usize>,
    storage: Box<dyn PageStorage<T>>,
    serializer: Arc<dyn ItemSerializer<T>>,
    capacity: CacheCapacity,
    stats: CacheStats,
    observer: Option<StateObserver>,
}

impl<T> PageCache<T> {
    pub fn new(
        storage: Box<dyn PageStorage<T>>,
        serializer: Arc<dyn ItemSerializer<T>>,
        capacity: CacheCapacity,
    ) -> Self {
        Self {
            pages: LruCache::unbounded(),
            deleted: BTreeSet::new(),
            storage,
            serializer,
            capacity,
            stats: CacheStats::default(),
            observer: None,
        }
    }

    /// Report every state transition to `observer`
    pub fn observe(&mut self, observer: impl FnMut(usize, PageState) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub fn capacity(&self) -> CacheCapacity {
        self.capacity
    }

    pub fn loaded_pages(&self) -> usize {
        self.pages.len()
    }

    /// Declared bytes of every loaded page
    pub fn loaded_bytes(&self) -> u64 {
        self.pages.iter().map(|(_, page)| page.size_bytes()).sum()
    }

    pub fn contains(&self, number: usize) -> bool {
        self.pages.contains(&number)
    }

    pub fn state_of(&self, number: usize) -> PageState {
        match self.pages.peek(&number) {
            Some(page) => page.state(),
            None if self.deleted.contains(&number) => PageState::Deleted,
            None => PageState::NotLoaded,
        }
    }

    pub fn is_dirty(&self, number: usize) -> bool {
        self.pages.peek(&number).is_some_and(|p| p.is_dirty())
    }

    /// Run `f` on page `number`, loading it on first access
    pub fn with_page<R>(&mut self, number: usize, start_index: u64, f: impl FnOnce(&Page<T>) -> R) -> Result<R> {
        self.ensure_loaded(number, start_index)?;
        self.pages
            .get(&number)
            .map(f)
            .ok_or_else(|| not_resident(number))
    }

    /// Run `f` on page `number` for mutation.
    ///
    /// Never evicts after `f` runs, so a failed save elsewhere cannot strand
    /// a half-recorded change; call [`settle`](Self::settle) once the change
    /// is accounted for.
    pub fn with_page_mut<R>(
        &mut self,
        number: usize,
        start_index: u64,
        f: impl FnOnce(&mut Page<T>) -> R,
    ) -> Result<R> {
        self.ensure_loaded(number, start_index)?;
        self.pages
            .get_mut(&number)
            .map(f)
            .ok_or_else(|| not_resident(number))
    }

    /// Add a freshly created page; it starts dirty. Call `settle` afterwards.
    pub fn insert(&mut self, mut page: Page<T>) {
        let number = page.number();
        page.state = PageState::Loaded;
        page.dirty = true;
        self.deleted.remove(&number);
        self.pages.put(number, page);
        self.notify(number, PageState::Loaded);
    }

    /// Drop a page that was never saved, without touching storage
    pub(crate) fn discard(&mut self, number: usize) {
        if self.pages.pop(&number).is_some() {
            self.notify(number, PageState::NotLoaded);
        }
    }

    /// Evict least-recently-used pages until within capacity, never `keep`
    pub fn settle(&mut self, keep: usize) -> Result<()> {
        self.evict(keep)
    }

    /// Delete a page from cache and storage without saving it
    pub fn remove(&mut self, number: usize) -> Result<()> {
        self.storage.delete(number)?;
        if let Some(mut page) = self.pages.pop(&number) {
            page.state = PageState::Deleted;
        }
        self.deleted.insert(number);
        self.stats.deletes += 1;
        self.notify(number, PageState::Deleted);
        debug!(page = number, "Deleted page");
        Ok(())
    }

    /// Save every dirty page, keeping it loaded
    pub fn flush(&mut self) -> Result<()> {
        for (&number, page) in self.pages.iter_mut() {
            if page.dirty {
                save(&mut *self.storage, &mut self.stats, &mut self.observer, number, page)?;
            }
        }
        Ok(())
    }

    /// Save dirty pages and unload everything
    pub fn unload_all(&mut self) -> Result<()> {
        while let Some((number, page)) = self.pages.pop_lru() {
            self.unload(number, page)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.loaded_pages = self.pages.len();
        stats
    }

    fn notify(&mut self, number: usize, state: PageState) {
        notify(&mut self.observer, number, state);
    }

    fn ensure_loaded(&mut self, number: usize, start_index: u64) -> Result<()> {
        if self.pages.contains(&number) {
            self.stats.hits += 1;
            return Ok(());
        }
        self.stats.misses += 1;

        self.notify(number, PageState::Loading);
        let items = match self.storage.load(number) {
            Ok(items) => items,
            Err(e) => {
                self.notify(number, PageState::NotLoaded);
                return Err(e);
            }
        };
        let sizes = items
            .iter()
            .map(|item| self.serializer.calculate_size(item))
            .collect();
        let page = Page::new(number, start_index, items, sizes);
        self.stats.loads += 1;
        self.pages.put(number, page);
        self.notify(number, PageState::Loaded);
        self.evict(number)
    }

    fn over_capacity(&self) -> bool {
        match self.capacity {
            CacheCapacity::Pages(max) => self.pages.len() > max.max(1),
            CacheCapacity::Bytes(max) => self.pages.len() > 1 && self.loaded_bytes() > max as u64,
        }
    }

    fn evict(&mut self, keep: usize) -> Result<()> {
        while self.over_capacity() {
            let Some((number, page)) = self.pages.pop_lru() else {
                break;
            };
            if number == keep {
                self.pages.put(number, page);
                break;
            }
            self.unload(number, page)?;
        }
        Ok(())
    }

    /// Save if dirty, then drop the page. On a failed save the page goes
    /// back into the cache unchanged.
    fn unload(&mut self, number: usize, mut page: Page<T>) -> Result<()> {
        page.state = PageState::Unloading;
        self.notify(number, PageState::Unloading);
        if page.dirty {
            if let Err(e) = save(&mut *self.storage, &mut self.stats, &mut self.observer, number, &mut page) {
                page.state = PageState::Loaded;
                self.pages.put(number, page);
                // Back at the cold end so the next eviction tries it first
                self.pages.demote(&number);
                self.notify(number, PageState::Loaded);
                return Err(e);
            }
        }
        self.stats.unloads += 1;
        self.notify(number, PageState::NotLoaded);
        debug!(page = number, "Unloaded page");
        Ok(())
    }
}

fn notify(observer: &mut Option<StateObserver>, number: usize, state: PageState) {
    trace!(page = number, ?state, "Page state");
    if let Some(observer) = observer.as_mut() {
        observer(number, state);
    }
}

fn save<T>(
    storage: &mut dyn PageStorage<T>,
    stats: &mut CacheStats,
    observer: &mut Option<StateObserver>,
    number: usize,
    page: &mut Page<T>,
) -> Result<()> {
    let resume = page.state;
    page.state = PageState::Saving;
    notify(observer, number, PageState::Saving);
    let result = storage.save(number, page.items());
    page.state = resume;
    notify(observer, number, resume);
    result?;
    page.dirty = false;
    stats.saves += 1;
    trace!(page = number, "Saved page");
    Ok(())
}

fn not_resident(number: usize) -> Error {
    Error::InvalidOperation(format!("Page {} is not resident", number))
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub saves: u64,
    pub unloads: u64,
    pub deletes: u64,
    pub loaded_pages: usize,
}
