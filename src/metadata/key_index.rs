//! Key index: item key to item index(es)

use super::{MetadataProvider, ProviderContext};
use crate::error::{Error, Result};
use crate::object::{ItemEvent, ItemOperation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyIndexMode {
    /// At most one item per key; duplicates are rejected
    Unique,
    /// Any number of items per key
    Multi,
}

type KeyFn<T, K> = Box<dyn Fn(&T) -> K + Send>;

/// Maps a key derived from each item to the item's index.
///
/// Persisted as a JSON array of `[index, key]` pairs in its reserved stream.
pub struct KeyIndex<T, K> {
    mode: KeyIndexMode,
    key_of: KeyFn<T, K>,
    by_index: BTreeMap<u64, K>,
    by_key: HashMap<K, BTreeSet<u64>>,
}

impl<T, K> KeyIndex<T, K>
where
    K: Clone + Eq + Hash,
{
    pub fn unique(key_of: impl Fn(&T) -> K + Send + 'static) -> Self {
        Self::with_mode(KeyIndexMode::Unique, key_of)
    }

    pub fn multi(key_of: impl Fn(&T) -> K + Send + 'static) -> Self {
        Self::with_mode(KeyIndexMode::Multi, key_of)
    }

    pub fn with_mode(mode: KeyIndexMode, key_of: impl Fn(&T) -> K + Send + 'static) -> Self {
        Self {
            mode,
            key_of: Box::new(key_of),
            by_index: BTreeMap::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn mode(&self) -> KeyIndexMode {
        self.mode
    }

    /// First (lowest) index holding `key`
    pub fn get(&self, key: &K) -> Option<u64> {
        self.by_key.get(key).and_then(|set| set.iter().next().copied())
    }

    /// Every index holding `key`, ascending
    pub fn get_all(&self, key: &K) -> Vec<u64> {
        self.by_key
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    /// Key of item `index`, if it is indexed
    pub fn key_at(&self, index: u64) -> Option<&K> {
        self.by_index.get(&index)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.by_key.keys()
    }

    /// Number of indexed items
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    fn unlink(&mut self, index: u64) {
        if let Some(key) = self.by_index.remove(&index) {
            if let Some(set) = self.by_key.get_mut(&key) {
                set.remove(&index);
                if set.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }

    fn link(&mut self, index: u64, key: K) {
        self.by_key.entry(key.clone()).or_default().insert(index);
        self.by_index.insert(index, key);
    }

    /// Move every index at or above `from` up or down by one
    fn shift(&mut self, from: u64, up: bool) {
        let moved = self.by_index.split_off(&from);
        for (index, key) in &moved {
            if let Some(set) = self.by_key.get_mut(key) {
                set.remove(index);
            }
        }
        for (index, key) in moved {
            let new_index = if up { index + 1 } else { index - 1 };
            self.link(new_index, key);
        }
    }

    fn rebuild(&mut self, entries: Vec<(u64, K)>) {
        self.by_index.clear();
        self.by_key.clear();
        for (index, key) in entries {
            self.link(index, key);
        }
    }
}

impl<T, K> KeyIndex<T, K>
where
    K: Clone + Eq + Hash + Serialize,
{
    fn persist(&self, ctx: &ProviderContext<'_>) -> Result<()> {
        let entries: Vec<(&u64, &K)> = self.by_index.iter().collect();
        let bytes = serde_json::to_vec(&entries).map_err(|e| Error::Serialization(e.to_string()))?;
        ctx.store(&bytes)
    }
}

impl<T, K> MetadataProvider<T> for KeyIndex<T, K>
where
    T: 'static,
    K: Clone + Eq + Hash + Serialize + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    fn attach(&mut self, ctx: &ProviderContext<'_>) -> Result<()> {
        let bytes = ctx.load()?;
        let entries: Vec<(u64, K)> = if bytes.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&bytes).map_err(|e| {
                Error::Corruption(format!(
                    "Key index in reserved stream {}: {}",
                    ctx.reserved_index(),
                    e
                ))
            })?
        };
        self.rebuild(entries);
        debug!(reserved_index = ctx.reserved_index(), keys = self.by_key.len(), "Loaded key index");
        Ok(())
    }

    fn pre_item_operation(&mut self, _ctx: &ProviderContext<'_>, event: &ItemEvent<'_, T>) -> Result<()> {
        if self.mode != KeyIndexMode::Unique {
            return Ok(());
        }
        let item = match (event.operation, event.item) {
            (ItemOperation::Add | ItemOperation::Insert | ItemOperation::Update, Some(item)) => item,
            _ => return Ok(()),
        };
        let key = (self.key_of)(item);
        let Some(existing) = self.by_key.get(&key) else {
            return Ok(());
        };
        let conflict = match event.operation {
            ItemOperation::Update => existing.iter().any(|&i| i != event.index),
            _ => true,
        };
        if conflict {
            return Err(Error::Validation(format!("Duplicate key {:?}", key)));
        }
        Ok(())
    }

    fn post_item_operation(&mut self, ctx: &ProviderContext<'_>, event: &ItemEvent<'_, T>) -> Result<()> {
        let index = event.index;
        match event.operation {
            ItemOperation::Read => return Ok(()),
            ItemOperation::Add | ItemOperation::Update => {
                self.unlink(index);
                if let Some(item) = event.item {
                    self.link(index, (self.key_of)(item));
                }
            }
            ItemOperation::Insert => {
                self.shift(index, true);
                if let Some(item) = event.item {
                    self.link(index, (self.key_of)(item));
                }
            }
            ItemOperation::Remove => {
                self.unlink(index);
                self.shift(index + 1, false);
            }
            ItemOperation::Reap => self.unlink(index),
        }
        self.persist(ctx)
    }

    fn clear(&mut self, ctx: &ProviderContext<'_>) -> Result<()> {
        self.by_index.clear();
        self.by_key.clear();
        self.persist(ctx)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectContainer, PairSerializer, StringSerializer, U32Serializer};
    use crate::storage::{ClusteredStreams, MemoryBackend, StreamsOptions};
    use std::sync::Arc;

    type Entry = (String, u32);

    fn container(mode: KeyIndexMode) -> Result<ObjectContainer<Entry>> {
        let streams = ClusteredStreams::create(
            Arc::new(MemoryBackend::new()),
            &StreamsOptions {
                cluster_size: 64,
                reserved_streams: 1,
            },
        )?;
        let container = ObjectContainer::new(
            Arc::new(streams),
            PairSerializer::new(StringSerializer, U32Serializer),
        );
        container.register_provider(0, KeyIndex::with_mode(mode, |e: &Entry| e.0.clone()))?;
        Ok(container)
    }

    fn entry(key: &str, value: u32) -> Entry {
        (key.to_string(), value)
    }

    fn lookup(c: &ObjectContainer<Entry>, key: &str) -> Result<Vec<u64>> {
        c.with_provider(0, |idx: &KeyIndex<Entry, String>| idx.get_all(&key.to_string()))
    }

    #[test]
    fn test_unique_rejects_duplicates_without_writing() -> Result<()> {
        let c = container(KeyIndexMode::Unique)?;
        c.save_item(0, Some(&entry("a", 1)), ItemOperation::Add)?;
        let err = c.save_item(1, Some(&entry("a", 2)), ItemOperation::Add);
        assert!(matches!(err, Err(Error::Validation(_))));
        assert_eq!(c.count(), 1);

        // Updating an item under its own key is allowed
        c.save_item(0, Some(&entry("a", 3)), ItemOperation::Update)?;
        assert_eq!(c.load_item(0)?, Some(entry("a", 3)));
        Ok(())
    }

    #[test]
    fn test_multi_tracks_every_index() -> Result<()> {
        let c = container(KeyIndexMode::Multi)?;
        c.save_item(0, Some(&entry("a", 1)), ItemOperation::Add)?;
        c.save_item(1, Some(&entry("b", 2)), ItemOperation::Add)?;
        c.save_item(2, Some(&entry("a", 3)), ItemOperation::Add)?;
        assert_eq!(lookup(&c, "a")?, vec![0, 2]);
        Ok(())
    }

    #[test]
    fn test_rekeys_on_insert_and_remove() -> Result<()> {
        let c = container(KeyIndexMode::Unique)?;
        c.save_item(0, Some(&entry("a", 1)), ItemOperation::Add)?;
        c.save_item(1, Some(&entry("c", 3)), ItemOperation::Add)?;
        c.save_item(1, Some(&entry("b", 2)), ItemOperation::Insert)?;
        assert_eq!(lookup(&c, "c")?, vec![2]);

        c.remove_item(0)?;
        assert_eq!(lookup(&c, "a")?, Vec::<u64>::new());
        assert_eq!(lookup(&c, "b")?, vec![0]);
        assert_eq!(lookup(&c, "c")?, vec![1]);

        c.reap_item(1)?;
        assert_eq!(lookup(&c, "c")?, Vec::<u64>::new());
        Ok(())
    }

    #[test]
    fn test_index_survives_reattach() -> Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        let options = StreamsOptions {
            cluster_size: 64,
            reserved_streams: 1,
        };
        {
            let streams = ClusteredStreams::create(backend.clone(), &options)?;
            let c = ObjectContainer::new(Arc::new(streams), PairSerializer::new(StringSerializer, U32Serializer));
            c.register_provider(0, KeyIndex::unique(|e: &Entry| e.0.clone()))?;
            c.save_item(0, Some(&entry("x", 1)), ItemOperation::Add)?;
            c.save_item(1, Some(&entry("y", 2)), ItemOperation::Add)?;
        }

        let streams = ClusteredStreams::open(backend)?;
        let c = ObjectContainer::new(Arc::new(streams), PairSerializer::new(StringSerializer, U32Serializer));
        c.register_provider(0, KeyIndex::unique(|e: &Entry| e.0.clone()))?;
        assert_eq!(lookup(&c, "y")?, vec![1]);
        assert!(matches!(
            c.save_item(2, Some(&entry("x", 9)), ItemOperation::Add),
            Err(Error::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_registration_rules() -> Result<()> {
        let c = container(KeyIndexMode::Unique)?;
        assert!(matches!(
            c.register_provider(0, KeyIndex::unique(|e: &Entry| e.1)),
            Err(Error::ProviderRegistration(_))
        ));
        assert!(matches!(
            c.register_provider(1, KeyIndex::unique(|e: &Entry| e.1)),
            Err(Error::ProviderRegistration(_))
        ));
        c.save_item(0, Some(&entry("a", 1)), ItemOperation::Add)?;

        // Wrong provider type
        assert!(c
            .with_provider(0, |_: &KeyIndex<Entry, u32>| ())
            .is_err());
        Ok(())
    }
}
