//! In-memory page of items

/// Lifecycle of a page. `dirty` is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    NotLoaded,
    Loading,
    Loaded,
    Saving,
    Unloading,
    Deleted,
}

/// Contiguous item range `[start_index, start_index + len)`
#[derive(Debug, Clone)]
pub struct Page<T> {
    number: usize,
    start_index: u64,
    items: Vec<T>,
    sizes: Vec<u64>,
    pub(crate) state: PageState,
    pub(crate) dirty: bool,
}

impl<T> Page<T> {
    /// Page built from items with their serializer-declared sizes
    pub(crate) fn new(number: usize, start_index: u64, items: Vec<T>, sizes: Vec<u64>) -> Self {
        debug_assert_eq!(items.len(), sizes.len());
        Self {
            number,
            start_index,
            items,
            sizes,
            state: PageState::Loaded,
            dirty: false,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Sum of the items' declared sizes
    pub fn size_bytes(&self) -> u64 {
        self.sizes.iter().sum()
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Item at absolute index `index`
    pub fn get(&self, index: u64) -> Option<&T> {
        let offset = index.checked_sub(self.start_index)?;
        self.items.get(offset as usize)
    }

    pub(crate) fn push(&mut self, item: T, size: u64) {
        self.items.push(item);
        self.sizes.push(size);
        self.dirty = true;
    }

    /// Replace the item at absolute `index`; returns the old item and its
    /// declared size
    pub(crate) fn set(&mut self, index: u64, item: T, size: u64) -> Option<(T, u64)> {
        let offset = index.checked_sub(self.start_index)? as usize;
        let slot = self.items.get_mut(offset)?;
        let old = std::mem::replace(slot, item);
        let old_size = std::mem::replace(&mut self.sizes[offset], size);
        self.dirty = true;
        Some((old, old_size))
    }

    /// Keep the first `len` items
    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.items.len() {
            self.items.truncate(len);
            self.sizes.truncate(len);
            self.dirty = true;
        }
    }
}
