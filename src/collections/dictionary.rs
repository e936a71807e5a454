//! Keyed dictionary over recyclable slots with a unique key index

use super::recyclable_list::RECYCLE_STREAM;
use crate::error::{Error, Result};
use crate::metadata::{KeyIndex, RecyclableIndexStore};
use crate::object::{ItemOperation, ItemSerializer, ObjectContainer, PairSerializer};
use crate::storage::ClusteredStreams;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Reserved stream holding the key index
pub const KEY_INDEX_STREAM: u64 = 1;

/// Dictionary stored as `(key, value)` items.
///
/// A unique key index locates entries; removed entries are reaped and their
/// slots reused.
pub struct StreamMappedDictionary<K: 'static, V: 'static> {
    container: ObjectContainer<(K, V)>,
}

impl<K, V> StreamMappedDictionary<K, V>
where
    K: Clone + Eq + Hash + Serialize + DeserializeOwned + Debug + Send + 'static,
    V: 'static,
{
    /// The store needs at least two reserved streams
    pub fn new(
        streams: Arc<ClusteredStreams>,
        key_serializer: impl ItemSerializer<K> + 'static,
        value_serializer: impl ItemSerializer<V> + 'static,
    ) -> Result<Self> {
        if streams.reserved_streams() <= KEY_INDEX_STREAM {
            return Err(Error::Config(
                "Dictionary needs two reserved streams".to_string(),
            ));
        }
        let container = ObjectContainer::new(streams, PairSerializer::new(key_serializer, value_serializer));
        container.register_provider(RECYCLE_STREAM, RecyclableIndexStore::new())?;
        container.register_provider(KEY_INDEX_STREAM, KeyIndex::unique(|entry: &(K, V)| entry.0.clone()))?;
        Ok(Self { container })
    }

    pub fn container(&self) -> &ObjectContainer<(K, V)> {
        &self.container
    }

    fn index_of(&self, key: &K) -> Result<Option<u64>> {
        self.container
            .with_provider(KEY_INDEX_STREAM, |idx: &KeyIndex<(K, V), K>| idx.get(key))
    }

    pub fn len(&self) -> Result<u64> {
        self.container
            .with_provider(KEY_INDEX_STREAM, |idx: &KeyIndex<(K, V), K>| idx.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.index_of(key)?.is_some())
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        self.container
            .with_provider(KEY_INDEX_STREAM, |idx: &KeyIndex<(K, V), K>| {
                idx.keys().cloned().collect()
            })
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let _scope = self.container.streams().enter();
        match self.index_of(key)? {
            Some(index) => Ok(self.container.load_item(index)?.map(|(_, v)| v)),
            None => Ok(None),
        }
    }

    /// Insert or replace; returns the previous value
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        let _scope = self.container.streams().enter();
        let entry = (key, value);
        if let Some(index) = self.index_of(&entry.0)? {
            let previous = self.container.load_item(index)?.map(|(_, v)| v);
            self.container
                .save_item(index, Some(&entry), ItemOperation::Update)?;
            return Ok(previous);
        }

        let recycled = self
            .container
            .with_provider(RECYCLE_STREAM, |s: &RecyclableIndexStore| s.lowest())?;
        match recycled {
            Some(index) => self
                .container
                .save_item(index, Some(&entry), ItemOperation::Update)?,
            None => {
                let index = self.container.count();
                self.container
                    .save_item(index, Some(&entry), ItemOperation::Add)?
            }
        }
        Ok(None)
    }

    /// Remove `key`; returns its value
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let _scope = self.container.streams().enter();
        let Some(index) = self.index_of(key)? else {
            return Ok(None);
        };
        let previous = self.container.load_item(index)?.map(|(_, v)| v);
        self.container.reap_item(index)?;
        Ok(previous)
    }

    pub fn clear(&self) -> Result<()> {
        self.container.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{JsonSerializer, StringSerializer};
    use crate::storage::{MemoryBackend, StreamsOptions};

    fn dictionary(backend: Arc<MemoryBackend>) -> Result<StreamMappedDictionary<String, Vec<u32>>> {
        let streams = ClusteredStreams::open_or_create(
            backend,
            &StreamsOptions {
                cluster_size: 32,
                reserved_streams: 2,
            },
        )?;
        StreamMappedDictionary::new(Arc::new(streams), StringSerializer, JsonSerializer::new())
    }

    #[test]
    fn test_insert_get_remove() -> Result<()> {
        let dict = dictionary(Arc::new(MemoryBackend::new()))?;
        assert_eq!(dict.insert("a".into(), vec![1])?, None);
        assert_eq!(dict.insert("b".into(), vec![2, 2])?, None);
        assert_eq!(dict.insert("a".into(), vec![3])?, Some(vec![1]));
        assert_eq!(dict.len()?, 2);
        assert_eq!(dict.get(&"a".into())?, Some(vec![3]));

        assert_eq!(dict.remove(&"a".into())?, Some(vec![3]));
        assert!(!dict.contains_key(&"a".into())?);
        assert_eq!(dict.remove(&"a".into())?, None);

        // The reaped slot is reused
        dict.insert("c".into(), vec![])?;
        assert_eq!(dict.container().count(), 2);
        let mut keys = dict.keys()?;
        keys.sort();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
        Ok(())
    }

    #[test]
    fn test_dictionary_reopens() -> Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        {
            let dict = dictionary(backend.clone())?;
            dict.insert("k".into(), vec![7, 8])?;
        }
        let dict = dictionary(backend)?;
        assert_eq!(dict.get(&"k".into())?, Some(vec![7, 8]));
        Ok(())
    }
}
