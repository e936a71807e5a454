// clustore - Clustered Stream Storage
// An embedded object store built on chains of fixed-size clusters

#![warn(rust_2018_idioms)]

pub mod collections;
pub mod config;
pub mod metadata;
pub mod object;
pub mod paging;
pub mod storage;

// Re-exports for convenience
pub use config::StoreConfig;
pub use object::{ItemOperation, ItemSerializer, ObjectContainer};
pub use storage::{AccessLock, ClusteredStreams, FileBackend, MemoryBackend};

/// clustore error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Type mismatch: expected {expected}, found {found}")]
        TypeMismatch { expected: String, found: String },

        #[error("Index {index} out of range (count {count})")]
        OutOfRange { index: u64, count: u64 },

        #[error("Stream {index} is already open")]
        Reentrancy { index: u64 },

        #[error("Validation rejected: {0}")]
        Validation(String),

        #[error("Corruption detected: {0}")]
        Corruption(String),

        #[error("Invalid operation: {0}")]
        InvalidOperation(String),

        #[error("Provider registration error: {0}")]
        ProviderRegistration(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl Error {
        pub(crate) fn type_mismatch<E: ?Sized, F: ?Sized>() -> Self {
            Error::TypeMismatch {
                expected: std::any::type_name::<E>().to_string(),
                found: std::any::type_name::<F>().to_string(),
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
