//! Object container: typed items over clustered streams
//!
//! Item `i` is stored in stream `i + reserved_streams`. The reserved prefix
//! belongs to metadata providers.

use super::events::{ContainerEvent, ItemEvent, ItemOperation, Listener, ListenerId};
use super::registry::SerializerRegistry;
use super::serializer::ItemSerializer;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::metadata::{MetadataProvider, ProviderContext};
use crate::storage::{ClusteredStreams, StreamHandle, StreamTraits};
use parking_lot::{Mutex, RwLock};
use std::any::{type_name, Any};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Container options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Size the stream to the declared item size before writing
    pub preallocate: bool,
    /// Flush the store when the container is dropped
    pub owns_streams: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            preallocate: true,
            owns_streams: true,
        }
    }
}

impl From<&StoreConfig> for ContainerOptions {
    fn from(cfg: &StoreConfig) -> Self {
        Self {
            preallocate: cfg.preallocate,
            ..Self::default()
        }
    }
}

struct ProviderSlot<T> {
    reserved_index: u64,
    provider: Box<dyn MetadataProvider<T>>,
}

/// Typed item sequence stored one item per stream.
///
/// Providers and listeners are invoked while the store's access scope is
/// held; they must not call back into the same container.
pub struct ObjectContainer<T: 'static> {
    streams: Arc<ClusteredStreams>,
    serializer: Arc<dyn ItemSerializer<T>>,
    options: ContainerOptions,
    providers: Mutex<Vec<ProviderSlot<T>>>,
    listeners: RwLock<Vec<(ListenerId, Listener<T>)>>,
    next_listener: AtomicU64,
    initialized: AtomicBool,
}

impl<T: 'static> ObjectContainer<T> {
    pub fn new(streams: Arc<ClusteredStreams>, serializer: impl ItemSerializer<T> + 'static) -> Self {
        Self::with_serializer(streams, Arc::new(serializer))
    }

    pub fn with_serializer(streams: Arc<ClusteredStreams>, serializer: Arc<dyn ItemSerializer<T>>) -> Self {
        Self {
            streams,
            serializer,
            options: ContainerOptions::default(),
            providers: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Resolve the serializer for `T` from a registry
    pub fn from_registry(streams: Arc<ClusteredStreams>, registry: &SerializerRegistry) -> Result<Self> {
        Ok(Self::with_serializer(streams, registry.get::<T>()?))
    }

    pub fn with_options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ContainerOptions {
        self.options
    }

    pub fn streams(&self) -> &Arc<ClusteredStreams> {
        &self.streams
    }

    pub fn serializer(&self) -> &Arc<dyn ItemSerializer<T>> {
        &self.serializer
    }

    /// Logical item count
    pub fn count(&self) -> u64 {
        let _scope = self.streams.enter();
        self.streams.count() - self.streams.reserved_streams()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Bind `provider` to a reserved stream. Only allowed before the first
    /// item operation.
    pub fn register_provider<P>(&self, reserved_index: u64, provider: P) -> Result<()>
    where
        P: MetadataProvider<T>,
    {
        if self.initialized.load(Ordering::Acquire) {
            return Err(Error::ProviderRegistration(
                "Providers must be registered before the container is used".to_string(),
            ));
        }
        let reserved = self.streams.reserved_streams();
        if reserved_index >= reserved {
            return Err(Error::ProviderRegistration(format!(
                "Reserved index {} out of range ({} reserved streams)",
                reserved_index, reserved
            )));
        }
        let mut providers = self.providers.lock();
        if providers.iter().any(|s| s.reserved_index == reserved_index) {
            return Err(Error::ProviderRegistration(format!(
                "Reserved index {} already has a provider",
                reserved_index
            )));
        }
        debug!(reserved_index, provider = type_name::<P>(), "Registered metadata provider");
        providers.push(ProviderSlot {
            reserved_index,
            provider: Box::new(provider),
        });
        Ok(())
    }

    /// Run `f` against the provider bound to `reserved_index`
    pub fn with_provider<P, R>(&self, reserved_index: u64, f: impl FnOnce(&P) -> R) -> Result<R>
    where
        P: MetadataProvider<T>,
    {
        let _scope = self.streams.enter();
        self.initialize()?;
        let providers = self.providers.lock();
        let slot = providers
            .iter()
            .find(|s| s.reserved_index == reserved_index)
            .ok_or_else(|| {
                Error::ProviderRegistration(format!("No provider at reserved index {}", reserved_index))
            })?;
        let provider = slot.provider.as_any().downcast_ref::<P>().ok_or_else(|| {
            Error::ProviderRegistration(format!(
                "Provider at reserved index {} is not a {}",
                reserved_index,
                type_name::<P>()
            ))
        })?;
        Ok(f(provider))
    }

    /// Listen to container events
    pub fn subscribe(&self, listener: impl Fn(&ContainerEvent<'_, T>) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Attach providers to their reserved streams. Runs implicitly before
    /// the first item operation.
    pub fn initialize(&self) -> Result<()> {
        let _scope = self.streams.enter();
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.emit(&ContainerEvent::Loading);
        {
            let mut providers = self.providers.lock();
            for slot in providers.iter_mut() {
                let ctx = ProviderContext::new(&self.streams, slot.reserved_index);
                slot.provider.attach(&ctx)?;
            }
        }
        self.initialized.store(true, Ordering::Release);
        self.emit(&ContainerEvent::Loaded);
        Ok(())
    }

    /// Write `item` at `index`.
    ///
    /// `Add` targets `index == count()`, `Insert` shifts later items up,
    /// `Update` replaces. `None` stores a null item.
    pub fn save_item(&self, index: u64, item: Option<&T>, operation: ItemOperation) -> Result<()> {
        let _scope = self.streams.enter();
        self.initialize()?;

        let count = self.count();
        match operation {
            ItemOperation::Add if index != count => {
                return Err(Error::InvalidOperation(format!(
                    "Add must target index {}, got {}",
                    count, index
                )))
            }
            ItemOperation::Insert if index > count => {
                return Err(Error::OutOfRange { index, count })
            }
            ItemOperation::Update if index >= count => {
                return Err(Error::OutOfRange { index, count })
            }
            ItemOperation::Add | ItemOperation::Insert | ItemOperation::Update => {}
            other => {
                return Err(Error::InvalidOperation(format!(
                    "save_item does not perform {} operations",
                    other
                )))
            }
        }

        let bytes = match item {
            Some(item) => Some(self.serialize(item)?),
            None => None,
        };

        let event = ItemEvent {
            index,
            item,
            operation,
        };
        self.notify_pre(&event)?;

        let stream_index = index + self.streams.reserved_streams();
        let previous = match operation {
            ItemOperation::Update => Some(StoredStream::capture(&self.streams, stream_index)?),
            _ => None,
        };
        let written = {
            // A failed add or insert leaves no stream behind
            let mut handle = match operation {
                ItemOperation::Add => self.streams.add()?,
                ItemOperation::Insert => self.streams.insert(stream_index)?,
                _ => self.streams.open_write(stream_index)?,
            };
            self.fill(&mut handle, bytes.as_deref())
        };
        if let Err(e) = written {
            self.undo_save(stream_index, operation, previous);
            return Err(e);
        }

        self.notify_post(&event)
    }

    fn fill(&self, handle: &mut StreamHandle<'_>, bytes: Option<&[u8]>) -> Result<()> {
        match bytes {
            None => handle.set_null(),
            Some(bytes) => {
                if self.options.preallocate {
                    handle.set_len(bytes.len() as u64)?;
                } else {
                    handle.set_len(0)?;
                }
                handle.write_bytes(bytes)
            }
        }
    }

    /// Put the store back the way it was before a failed `save_item`
    fn undo_save(&self, stream_index: u64, operation: ItemOperation, previous: Option<StoredStream>) {
        let undone = match (operation, previous) {
            (ItemOperation::Update, Some(previous)) => previous.restore(&self.streams, stream_index),
            (ItemOperation::Add | ItemOperation::Insert, _) => self.streams.remove(stream_index),
            _ => Ok(()),
        };
        match undone {
            Ok(()) => debug!(stream_index, operation = %operation, "Rolled back failed save"),
            Err(e) => error!(
                stream_index,
                operation = %operation,
                error = %e,
                "Could not roll back failed save"
            ),
        }
    }

    /// Dynamically typed entry point for `save_item`
    pub fn save_any(&self, index: u64, item: Option<&dyn Any>, operation: ItemOperation) -> Result<()> {
        let typed = match item {
            Some(any) => Some(any.downcast_ref::<T>().ok_or_else(|| Error::TypeMismatch {
                expected: type_name::<T>().to_string(),
                found: format!("{:?}", any.type_id()),
            })?),
            None => None,
        };
        self.save_item(index, typed, operation)
    }

    /// Item at `index`; `None` if the slot is null or reaped
    pub fn load_item(&self, index: u64) -> Result<Option<T>> {
        let _scope = self.streams.enter();
        self.initialize()?;
        self.check_index(index)?;

        self.notify_pre(&ItemEvent {
            index,
            item: None,
            operation: ItemOperation::Read,
        })?;

        let item = {
            let mut handle = self
                .streams
                .open_read(index + self.streams.reserved_streams())?;
            if handle.is_null() || handle.is_reaped() {
                None
            } else {
                let len = handle.len();
                Some(self.serializer.deserialize(&mut handle, len)?)
            }
        };

        self.notify_post(&ItemEvent {
            index,
            item: item.as_ref(),
            operation: ItemOperation::Read,
        })?;
        Ok(item)
    }

    /// Item at `index`, or `T::default()` for null and reaped slots
    pub fn load_item_or_default(&self, index: u64) -> Result<T>
    where
        T: Default,
    {
        Ok(self.load_item(index)?.unwrap_or_default())
    }

    /// Delete item `index`; later items shift down by one
    pub fn remove_item(&self, index: u64) -> Result<()> {
        let _scope = self.streams.enter();
        self.initialize()?;
        self.check_index(index)?;

        let event = ItemEvent {
            index,
            item: None,
            operation: ItemOperation::Remove,
        };
        self.notify_pre(&event)?;
        self.streams
            .remove(index + self.streams.reserved_streams())?;
        self.notify_post(&event)
    }

    /// Empty item `index` while keeping every index stable
    pub fn reap_item(&self, index: u64) -> Result<()> {
        let _scope = self.streams.enter();
        self.initialize()?;
        self.check_index(index)?;

        let event = ItemEvent {
            index,
            item: None,
            operation: ItemOperation::Reap,
        };
        self.notify_pre(&event)?;
        self.streams
            .open_write(index + self.streams.reserved_streams())?
            .reap()?;
        self.notify_post(&event)
    }

    /// Serialized bytes of item `index`; `None` for null or reaped slots
    pub fn get_item_bytes(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let _scope = self.streams.enter();
        self.check_index(index)?;
        self.streams
            .read_all(index + self.streams.reserved_streams())
    }

    pub fn is_reaped(&self, index: u64) -> Result<bool> {
        let _scope = self.streams.enter();
        self.check_index(index)?;
        Ok(self
            .streams
            .descriptor(index + self.streams.reserved_streams())?
            .traits
            .is_reaped())
    }

    pub fn is_null(&self, index: u64) -> Result<bool> {
        let _scope = self.streams.enter();
        self.check_index(index)?;
        Ok(self
            .streams
            .descriptor(index + self.streams.reserved_streams())?
            .traits
            .is_null())
    }

    /// Reset the store to its initial state and clear every provider
    pub fn clear(&self) -> Result<()> {
        let _scope = self.streams.enter();
        self.initialize()?;
        self.emit(&ContainerEvent::Clearing);
        self.streams.clear()?;
        {
            let mut providers = self.providers.lock();
            for slot in providers.iter_mut() {
                let ctx = ProviderContext::new(&self.streams, slot.reserved_index);
                slot.provider.clear(&ctx)?;
            }
        }
        self.emit(&ContainerEvent::Cleared);
        Ok(())
    }

    fn check_index(&self, index: u64) -> Result<()> {
        let count = self.count();
        if index >= count {
            return Err(Error::OutOfRange { index, count });
        }
        Ok(())
    }

    fn serialize(&self, item: &T) -> Result<Vec<u8>> {
        let declared = self.serializer.calculate_size(item);
        let mut bytes = Vec::with_capacity(declared as usize);
        self.serializer.serialize(item, &mut bytes)?;
        if bytes.len() as u64 != declared {
            return Err(Error::Corruption(format!(
                "Serializer declared {} bytes but wrote {}",
                declared,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    fn notify_pre(&self, event: &ItemEvent<'_, T>) -> Result<()> {
        {
            let mut providers = self.providers.lock();
            for slot in providers.iter_mut() {
                let ctx = ProviderContext::new(&self.streams, slot.reserved_index);
                if let Err(e) = slot.provider.pre_item_operation(&ctx, event) {
                    warn!(
                        index = event.index,
                        operation = %event.operation,
                        reserved_index = slot.reserved_index,
                        error = %e,
                        "Provider rejected item operation"
                    );
                    return Err(e);
                }
            }
        }
        self.emit(&ContainerEvent::PreItem(*event));
        Ok(())
    }

    fn notify_post(&self, event: &ItemEvent<'_, T>) -> Result<()> {
        {
            let mut providers = self.providers.lock();
            for slot in providers.iter_mut() {
                let ctx = ProviderContext::new(&self.streams, slot.reserved_index);
                slot.provider.post_item_operation(&ctx, event)?;
            }
        }
        self.emit(&ContainerEvent::PostItem(*event));
        Ok(())
    }

    fn emit(&self, event: &ContainerEvent<'_, T>) {
        for (_, listener) in self.listeners.read().iter() {
            listener(event);
        }
    }
}

/// Contents and traits of a stream, kept to undo a failed update
struct StoredStream {
    traits: StreamTraits,
    bytes: Vec<u8>,
}

impl StoredStream {
    fn capture(streams: &ClusteredStreams, index: u64) -> Result<Self> {
        let mut handle = streams.open_read(index)?;
        Ok(Self {
            traits: handle.traits(),
            bytes: handle.read_to_vec()?,
        })
    }

    fn restore(self, streams: &ClusteredStreams, index: u64) -> Result<()> {
        let mut handle = streams.open_write(index)?;
        if self.traits.is_null() {
            handle.set_null()
        } else if self.traits.is_reaped() {
            handle.reap()
        } else {
            handle.set_len(self.bytes.len() as u64)?;
            handle.write_bytes(&self.bytes)
        }
    }
}

impl<T: 'static> Drop for ObjectContainer<T> {
    fn drop(&mut self) {
        if self.options.owns_streams {
            if let Err(e) = self.streams.flush() {
                error!(error = %e, "Failed to flush store on drop");
            }
        }
    }
}

impl<T: 'static> std::fmt::Debug for ObjectContainer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectContainer")
            .field("item_type", &type_name::<T>())
            .field("options", &self.options)
            .field("providers", &self.providers.lock().len())
            .finish()
    }
}
