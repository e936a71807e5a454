//! Serializer registry keyed by item type

use super::serializer::{
    BytesSerializer, I32Serializer, I64Serializer, ItemSerializer, StringSerializer, U32Serializer,
    U64Serializer,
};
use crate::error::{Error, Result};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

struct Entry {
    /// `Arc<dyn ItemSerializer<T>>` for the keyed `T`
    erased: Box<dyn Any + Send + Sync>,
    /// `Arc<S>` for the concrete serializer type
    concrete: Box<dyn Any + Send + Sync>,
    serializer_name: &'static str,
}

/// Factory resolving a serializer for each item type.
///
/// Populated while a store is configured; containers resolve their
/// serializer once at construction.
#[derive(Default)]
pub struct SerializerRegistry {
    entries: HashMap<TypeId, Entry>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the fixed-width integer, string and byte serializers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<i32, _>(I32Serializer);
        registry.register::<u32, _>(U32Serializer);
        registry.register::<i64, _>(I64Serializer);
        registry.register::<u64, _>(U64Serializer);
        registry.register::<String, _>(StringSerializer);
        registry.register::<Vec<u8>, _>(BytesSerializer);
        registry
    }

    /// Register `serializer` for `T`, replacing any previous one
    pub fn register<T, S>(&mut self, serializer: S)
    where
        T: 'static,
        S: ItemSerializer<T> + 'static,
    {
        let concrete = Arc::new(serializer);
        let erased: Arc<dyn ItemSerializer<T>> = concrete.clone();
        self.entries.insert(
            TypeId::of::<T>(),
            Entry {
                erased: Box::new(erased),
                concrete: Box::new(concrete),
                serializer_name: type_name::<S>(),
            },
        );
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Serializer registered for `T`
    pub fn get<T: 'static>(&self) -> Result<Arc<dyn ItemSerializer<T>>> {
        let entry = self.entry::<T>()?;
        entry
            .erased
            .downcast_ref::<Arc<dyn ItemSerializer<T>>>()
            .cloned()
            .ok_or_else(Error::type_mismatch::<dyn ItemSerializer<T>, dyn Any>)
    }

    /// Serializer registered for `T`, as its concrete type `S`
    pub fn get_as<T: 'static, S: ItemSerializer<T> + 'static>(&self) -> Result<Arc<S>> {
        let entry = self.entry::<T>()?;
        entry
            .concrete
            .downcast_ref::<Arc<S>>()
            .cloned()
            .ok_or_else(|| Error::TypeMismatch {
                expected: type_name::<S>().to_string(),
                found: entry.serializer_name.to_string(),
            })
    }

    fn entry<T: 'static>(&self) -> Result<&Entry> {
        self.entries.get(&TypeId::of::<T>()).ok_or_else(|| {
            Error::Config(format!("No serializer registered for {}", type_name::<T>()))
        })
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.values().map(|e| e.serializer_name))
            .finish()
    }
}
