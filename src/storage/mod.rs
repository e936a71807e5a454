//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! ClusteredStreams
//!   ├─→ Header          (cluster size, counts, free-list head, CRC32)
//!   ├─→ Descriptor chain → [stream 0][stream 1][stream 2]...
//!   │                        start cluster, length, Null/Reaped traits
//!   ├─→ Stream chains     stream 2: c4 → c9 → c5 → ∅
//!   └─→ Free list         c7 → c3 → ∅  (reused before the store grows)
//!
//! BackingStore
//!   ├─→ MemoryBackend  (Vec<u8>)
//!   └─→ FileBackend    (std::fs::File)
//! ```
//!
//! Every operation runs inside an [`AccessScope`], a reentrant exclusive
//! lock that several stores may share through a cloned [`AccessLock`].

pub mod backend;
pub mod clustered;
pub mod scope;

pub use backend::{BackingStore, FileBackend, MemoryBackend};
pub use clustered::{
    ClusteredStreams, StreamDescriptor, StreamHandle, StreamStats, StreamTraits, StreamsOptions,
    VerifyReport,
};
pub use scope::{AccessLock, AccessScope};
