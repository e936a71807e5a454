//! Clustered stream store
//!
//! A backing store is split into fixed-size clusters. Each stream is a
//! singly-linked chain of clusters addressed by its position in a
//! descriptor table, which is itself kept in a cluster chain.

mod allocator;
pub mod format;
mod handle;
mod streams;

pub use format::{ClusterId, StreamDescriptor, StreamTraits};
pub use handle::StreamHandle;
pub use streams::{ClusteredStreams, StreamStats, StreamsOptions, VerifyReport};
