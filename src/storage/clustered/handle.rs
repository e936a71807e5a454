//! Byte-level access to one stream

use super::allocator::{read_chain, write_chain, zero_chain, ClusterAllocator};
use super::streams::release_tail;
use super::format::{ClusterId, ClusterTraits, Geometry, StreamDescriptor, StreamTraits, NO_CLUSTER};
use super::streams::ClusteredStreams;
use crate::error::{Error, Result};
use crate::storage::scope::AccessScope;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    Read,
    Write,
}

/// Open stream.
///
/// Holds the store's access scope until dropped. Write handles persist every
/// change to the descriptor table and the allocator state immediately.
pub struct StreamHandle<'a> {
    streams: &'a ClusteredStreams,
    _scope: AccessScope<'a>,
    index: u64,
    mode: AccessMode,
    descriptor: StreamDescriptor,
    chain: Vec<ClusterId>,
    geometry: Geometry,
    position: u64,
}

impl<'a> StreamHandle<'a> {
    pub(crate) fn new(
        streams: &'a ClusteredStreams,
        scope: AccessScope<'a>,
        index: u64,
        mode: AccessMode,
        descriptor: StreamDescriptor,
        chain: Vec<ClusterId>,
        geometry: Geometry,
    ) -> Self {
        Self {
            streams,
            _scope: scope,
            index,
            mode,
            descriptor,
            chain,
            geometry,
            position: 0,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> u64 {
        self.descriptor.length
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.length == 0
    }

    pub fn traits(&self) -> StreamTraits {
        self.descriptor.traits
    }

    pub fn is_null(&self) -> bool {
        self.descriptor.traits.is_null()
    }

    pub fn is_reaped(&self) -> bool {
        self.descriptor.traits.is_reaped()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_writable(&self) -> bool {
        self.mode == AccessMode::Write
    }

    /// Resize the stream. Growing zero-fills; shrinking frees clusters.
    /// Either way the stream becomes a normal (non-null, non-reaped) stream.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.resize(len, true, StreamTraits::NORMAL)?;
        self.position = self.position.min(len);
        Ok(())
    }

    /// Truncate to zero and mark the stream null
    pub fn set_null(&mut self) -> Result<()> {
        self.discard(StreamTraits::NULL)
    }

    /// Truncate to zero and mark the slot reaped
    pub fn reap(&mut self) -> Result<()> {
        self.discard(StreamTraits::REAPED)
    }

    /// Whole contents regardless of the current position
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.descriptor.length as usize];
        read_chain(
            &*self.streams.backend,
            self.geometry,
            &self.chain,
            0,
            &mut bytes,
        )?;
        self.position = self.descriptor.length;
        Ok(bytes)
    }

    /// Write `data` at the current position, growing the stream as needed
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Ok(());
        }
        let old_len = self.descriptor.length;
        let end = self.position + data.len() as u64;
        if end > old_len || self.descriptor.traits != StreamTraits::NORMAL {
            self.resize(end.max(old_len), false, StreamTraits::NORMAL)?;
            if self.position > old_len {
                zero_chain(
                    &*self.streams.backend,
                    self.geometry,
                    &self.chain,
                    old_len,
                    self.position - old_len,
                )?;
            }
        }
        write_chain(
            &*self.streams.backend,
            self.geometry,
            &self.chain,
            self.position,
            data,
        )?;
        self.position = end;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Err(Error::InvalidOperation(format!(
                "Stream {} is open for reading",
                self.index
            )));
        }
        Ok(())
    }

    /// Grow or shrink the chain and persist the new descriptor.
    ///
    /// Clusters claimed for growth are released again if anything after the
    /// allocation fails; clusters cut off by shrinking are freed only once
    /// the shorter descriptor is on disk.
    fn resize(&mut self, len: u64, zero_fill: bool, traits: StreamTraits) -> Result<()> {
        self.ensure_writable()?;
        let old_len = self.descriptor.length;
        let needed = self.geometry.clusters_for(len);
        let have = self.chain.len();
        let backend = &*self.streams.backend;

        let mut state = self.streams.state.lock();
        if needed > have {
            let fresh = ClusterAllocator::new(backend, &mut state.header).allocate(
                needed - have,
                ClusterTraits::DATA,
                self.chain.last().copied(),
            )?;
            self.chain.extend(fresh);
        }

        let descriptor = StreamDescriptor {
            start_cluster: self.chain[..needed].first().copied().unwrap_or(NO_CLUSTER),
            length: len,
            traits,
        };
        let committed = (|| {
            if zero_fill && len > old_len {
                zero_chain(backend, self.geometry, &self.chain, old_len, len - old_len)?;
            }
            let previous = std::mem::replace(&mut state.descriptors[self.index as usize], descriptor);
            if let Err(e) = state.store_descriptor(backend, self.index) {
                state.descriptors[self.index as usize] = previous;
                return Err(e);
            }
            Ok(())
        })();
        if let Err(e) = committed {
            if self.chain.len() > have {
                let fresh = self.chain.split_off(have);
                let last = self.chain.last().copied();
                release_tail(backend, &mut state.header, last, &fresh);
            }
            if let Err(e) = state.write_header(backend) {
                warn!(index = self.index, error = %e, "Could not rewrite header after failed resize");
            }
            return Err(e);
        }

        self.descriptor = descriptor;
        if needed < have {
            let released = self.chain.split_off(needed);
            let last = self.chain.last().copied();
            release_tail(backend, &mut state.header, last, &released);
        }
        state.write_header(backend)?;
        trace!(index = self.index, old_len, len, clusters = self.chain.len(), "Resized stream");
        Ok(())
    }

    fn discard(&mut self, traits: StreamTraits) -> Result<()> {
        self.resize(0, false, traits)?;
        self.position = 0;
        Ok(())
    }
}

fn to_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl Read for StreamHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.descriptor.length;
        if self.position >= len || buf.is_empty() {
            return Ok(0);
        }
        let n = ((len - self.position) as usize).min(buf.len());
        read_chain(
            &*self.streams.backend,
            self.geometry,
            &self.chain,
            self.position,
            &mut buf[..n],
        )
        .map_err(to_io)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for StreamHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for StreamHandle<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.descriptor.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        self.position = target;
        Ok(target)
    }
}

impl Drop for StreamHandle<'_> {
    fn drop(&mut self) {
        self.streams.state.lock().release(self.index, self.mode);
    }
}

impl std::fmt::Debug for StreamHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("index", &self.index)
            .field("mode", &self.mode)
            .field("descriptor", &self.descriptor)
            .field("position", &self.position)
            .finish()
    }
}
