//! Typed items over clustered streams
//!
//! ```text
//! save_item:  T ──serialize──→ bytes ──pre──→ StreamHandle write ──post──→
//! load_item:  StreamHandle read ──deserialize──→ T
//! ```

mod container;
mod events;
mod registry;
mod serializer;

pub use container::{ContainerOptions, ObjectContainer};
pub use events::{ContainerEvent, ItemEvent, ItemOperation, Listener, ListenerId};
pub use registry::SerializerRegistry;
pub use serializer::{
    BytesSerializer, I32Serializer, I64Serializer, ItemSerializer, JsonSerializer, PairSerializer,
    StringSerializer, U32Serializer, U64Serializer,
};
