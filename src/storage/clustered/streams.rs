//! Clustered streams: a descriptor table over cluster chains

use super::allocator::{read_chain, walk_chain, write_chain, ClusterAllocator};
use super::format::{
    descriptor_table_len, ClusterId, ClusterTraits, StoreHeader, StreamDescriptor, DESCRIPTOR_SIZE,
    HEADER_SIZE, NO_CLUSTER,
};
use super::handle::{AccessMode, StreamHandle};
use crate::config::{StoreConfig, MAX_CLUSTER_SIZE, MIN_CLUSTER_SIZE};
use crate::error::{Error, Result};
use crate::storage::backend::BackingStore;
use crate::storage::scope::{AccessLock, AccessScope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Layout options used when a store is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamsOptions {
    pub cluster_size: u32,
    pub reserved_streams: u32,
}

impl Default for StreamsOptions {
    fn default() -> Self {
        Self {
            cluster_size: 256,
            reserved_streams: 0,
        }
    }
}

impl From<&StoreConfig> for StreamsOptions {
    fn from(cfg: &StoreConfig) -> Self {
        Self {
            cluster_size: cfg.cluster_size,
            reserved_streams: cfg.reserved_streams,
        }
    }
}

/// Variable-length byte streams stored as cluster chains.
///
/// Streams are addressed by their position in the descriptor table. The
/// first `reserved_streams()` positions belong to metadata providers.
pub struct ClusteredStreams {
    pub(super) backend: Arc<dyn BackingStore>,
    lock: AccessLock,
    pub(super) state: Mutex<StreamsState>,
}

/// Mutable state, only touched while the access scope is held
pub(crate) struct StreamsState {
    pub header: StoreHeader,
    pub descriptors: Vec<StreamDescriptor>,
    descriptor_chain: Vec<ClusterId>,
    open: HashMap<u64, OpenHandles>,
}

#[derive(Debug, Default, Clone, Copy)]
struct OpenHandles {
    readers: usize,
    writer: bool,
}

impl StreamsState {
    pub fn write_header(&self, backend: &dyn BackingStore) -> Result<()> {
        backend.write_at(0, &self.header.to_bytes())
    }

    pub fn check_index(&self, index: u64) -> Result<()> {
        let count = self.descriptors.len() as u64;
        if index >= count {
            return Err(Error::OutOfRange { index, count });
        }
        Ok(())
    }

    /// Persist one descriptor record in place
    pub fn store_descriptor(&self, backend: &dyn BackingStore, index: u64) -> Result<()> {
        let record = self.descriptors[index as usize].to_bytes();
        write_chain(
            backend,
            self.header.geometry(),
            &self.descriptor_chain,
            index * DESCRIPTOR_SIZE as u64,
            &record,
        )
    }

    /// Persist records `from..` after the table changed size, resizing the
    /// descriptor chain and rewriting the header.
    ///
    /// On failure the descriptor chain and stream count are unchanged and
    /// any clusters claimed for the table are back on the free list; the
    /// caller restores `descriptors`.
    fn store_descriptors_from(&mut self, backend: &dyn BackingStore, from: usize) -> Result<()> {
        let have = self.descriptor_chain.len();
        let result = self.rewrite_table(backend, from);
        if result.is_err() && self.descriptor_chain.len() > have {
            let fresh = self.descriptor_chain.split_off(have);
            let last = self.descriptor_chain.last().copied();
            release_tail(backend, &mut self.header, last, &fresh);
            if let Err(e) = self.write_header(backend) {
                warn!(error = %e, "Could not rewrite header after failed table update");
            }
        }
        result
    }

    /// Rewrite records `from..` after an in-memory rollback; a partial
    /// shift may already be on disk
    fn restore_table(&mut self, backend: &dyn BackingStore, from: usize) {
        if let Err(e) = self.store_descriptors_from(backend, from) {
            warn!(from, error = %e, "Could not restore descriptor records");
        }
    }

    fn rewrite_table(&mut self, backend: &dyn BackingStore, from: usize) -> Result<()> {
        let geometry = self.header.geometry();
        let table_len = descriptor_table_len(self.descriptors.len() as u64)?;
        let needed = geometry.clusters_for(table_len);
        let have = self.descriptor_chain.len();

        if needed > have {
            let link_from = self.descriptor_chain.last().copied();
            let fresh = ClusterAllocator::new(backend, &mut self.header).allocate(
                needed - have,
                ClusterTraits::DESCRIPTOR,
                link_from,
            )?;
            self.descriptor_chain.extend(fresh);
        }

        if from < self.descriptors.len() {
            let tail: Vec<u8> = self.descriptors[from..]
                .iter()
                .flat_map(|d| d.to_bytes())
                .collect();
            write_chain(
                backend,
                geometry,
                &self.descriptor_chain,
                (from * DESCRIPTOR_SIZE) as u64,
                &tail,
            )?;
        }

        let mut next = self.header.clone();
        next.stream_count = self.descriptors.len() as u64;
        next.descriptor_head = if needed == 0 {
            NO_CLUSTER
        } else {
            self.descriptor_chain.first().copied().unwrap_or(NO_CLUSTER)
        };
        backend.write_at(0, &next.to_bytes())?;
        self.header = next;

        // Committed; surplus clusters only leak if releasing them fails
        if needed < have {
            let released = self.descriptor_chain.split_off(needed);
            let last = self.descriptor_chain.last().copied();
            release_tail(backend, &mut self.header, last, &released);
            self.write_header(backend)?;
        }
        Ok(())
    }

    fn any_open(&self) -> bool {
        !self.open.is_empty()
    }

    fn register(&mut self, index: u64, mode: AccessMode) -> Result<()> {
        let entry = self.open.get(&index).copied().unwrap_or_default();
        let conflict = match mode {
            AccessMode::Read => entry.writer,
            AccessMode::Write => entry.writer || entry.readers > 0,
        };
        if conflict {
            return Err(Error::Reentrancy { index });
        }
        let entry = self.open.entry(index).or_default();
        match mode {
            AccessMode::Read => entry.readers += 1,
            AccessMode::Write => entry.writer = true,
        }
        Ok(())
    }

    pub fn release(&mut self, index: u64, mode: AccessMode) {
        if let Some(entry) = self.open.get_mut(&index) {
            match mode {
                AccessMode::Read => entry.readers = entry.readers.saturating_sub(1),
                AccessMode::Write => entry.writer = false,
            }
            if entry.readers == 0 && !entry.writer {
                self.open.remove(&index);
            }
        }
    }

    /// Reset to an empty store holding only the reserved streams
    fn reset(&mut self, backend: &dyn BackingStore) -> Result<()> {
        let reserved = self.header.reserved_streams;
        self.header = StoreHeader::new(self.header.cluster_size, reserved);
        self.descriptor_chain.clear();
        self.descriptors = vec![StreamDescriptor::empty(); reserved as usize];
        backend.set_len(HEADER_SIZE as u64)?;
        self.store_descriptors_from(backend, 0)
    }
}

/// Detach `tail` from the chain ending at `last` and free it, logging
/// rather than failing since the caller is already unwinding or committed
pub(super) fn release_tail(
    backend: &dyn BackingStore,
    header: &mut StoreHeader,
    last: Option<ClusterId>,
    tail: &[ClusterId],
) {
    let mut alloc = ClusterAllocator::new(backend, header);
    let released = last
        .map_or(Ok(()), |last| alloc.set_next(last, NO_CLUSTER))
        .and_then(|()| alloc.free(tail));
    if let Err(e) = released {
        warn!(clusters = tail.len(), error = %e, "Could not release clusters; they stay leaked until verified");
    }
}

impl ClusteredStreams {
    /// Create a new store, discarding whatever the backend held
    pub fn create(backend: Arc<dyn BackingStore>, options: &StreamsOptions) -> Result<Self> {
        if !(MIN_CLUSTER_SIZE..=MAX_CLUSTER_SIZE).contains(&options.cluster_size) {
            return Err(Error::Config(format!(
                "cluster_size {} outside {}..={}",
                options.cluster_size, MIN_CLUSTER_SIZE, MAX_CLUSTER_SIZE
            )));
        }

        let mut state = StreamsState {
            header: StoreHeader::new(options.cluster_size, options.reserved_streams),
            descriptors: Vec::new(),
            descriptor_chain: Vec::new(),
            open: HashMap::new(),
        };
        state.reset(&*backend)?;

        info!(
            cluster_size = options.cluster_size,
            reserved_streams = options.reserved_streams,
            "Created clustered store"
        );

        Ok(Self {
            backend,
            lock: AccessLock::new(),
            state: Mutex::new(state),
        })
    }

    /// Open an existing store, validating header, descriptor chain and records
    pub fn open(backend: Arc<dyn BackingStore>) -> Result<Self> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        backend.read_at(0, &mut header_bytes)?;
        let header = StoreHeader::from_bytes(&header_bytes)?;
        let geometry = header.geometry();

        let store_len = backend.len()?;
        if store_len < geometry.store_len(header.total_clusters)? {
            return Err(Error::Corruption(format!(
                "Store holds {} bytes but header declares {} clusters",
                store_len, header.total_clusters
            )));
        }

        let table_len = descriptor_table_len(header.stream_count)?;
        let table_clusters = geometry.clusters_for(table_len);
        if table_clusters as u64 > header.total_clusters {
            return Err(Error::Corruption(format!(
                "Descriptor table for {} streams needs {} clusters, store has {}",
                header.stream_count, table_clusters, header.total_clusters
            )));
        }
        let descriptor_chain = walk_chain(
            &*backend,
            &header,
            header.descriptor_head,
            ClusterTraits::DESCRIPTOR,
            Some(table_clusters),
        )?;

        let mut table = vec![0u8; table_len as usize];
        read_chain(&*backend, geometry, &descriptor_chain, 0, &mut table)?;
        let descriptors = table
            .chunks_exact(DESCRIPTOR_SIZE)
            .enumerate()
            .map(|(i, record)| StreamDescriptor::from_bytes(i as u64, record))
            .collect::<Result<Vec<_>>>()?;

        info!(
            streams = descriptors.len(),
            clusters = header.total_clusters,
            free = header.free_count,
            "Opened clustered store"
        );

        Ok(Self {
            backend,
            lock: AccessLock::new(),
            state: Mutex::new(StreamsState {
                header,
                descriptors,
                descriptor_chain,
                open: HashMap::new(),
            }),
        })
    }

    /// Open the store if the backend holds one, otherwise create it.
    ///
    /// Layout options only apply on creation; an existing store keeps the
    /// cluster size and reserved stream count recorded in its header.
    pub fn open_or_create(backend: Arc<dyn BackingStore>, options: &StreamsOptions) -> Result<Self> {
        if backend.is_empty()? {
            return Self::create(backend, options);
        }
        let streams = Self::open(backend)?;
        {
            let state = streams.state.lock();
            if state.header.cluster_size != options.cluster_size
                || state.header.reserved_streams != options.reserved_streams
            {
                warn!(
                    stored_cluster_size = state.header.cluster_size,
                    stored_reserved = state.header.reserved_streams,
                    requested_cluster_size = options.cluster_size,
                    requested_reserved = options.reserved_streams,
                    "Existing store layout differs from requested options; using stored layout"
                );
            }
        }
        Ok(streams)
    }

    /// Join an existing lock domain (e.g. shared by all stores of one object space)
    pub fn with_access_lock(mut self, lock: AccessLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn access_lock(&self) -> &AccessLock {
        &self.lock
    }

    /// Enter this store's access scope
    pub fn enter(&self) -> AccessScope<'_> {
        self.lock.enter()
    }

    /// Number of descriptors, reserved ones included
    pub fn count(&self) -> u64 {
        let _scope = self.enter();
        self.state.lock().descriptors.len() as u64
    }

    pub fn reserved_streams(&self) -> u64 {
        self.state.lock().header.reserved_streams as u64
    }

    pub fn cluster_size(&self) -> u32 {
        self.state.lock().header.cluster_size
    }

    pub fn descriptor(&self, index: u64) -> Result<StreamDescriptor> {
        let _scope = self.enter();
        let state = self.state.lock();
        state.check_index(index)?;
        Ok(state.descriptors[index as usize])
    }

    /// Append an empty stream and open it for writing
    pub fn add(&self) -> Result<StreamHandle<'_>> {
        let scope = self.enter();
        let index = {
            let mut state = self.state.lock();
            state.descriptors.push(StreamDescriptor::empty());
            let index = state.descriptors.len() - 1;
            if let Err(e) = state.store_descriptors_from(&*self.backend, index) {
                state.descriptors.pop();
                return Err(e);
            }
            index as u64
        };
        debug!(index, "Added stream");
        self.open_handle(scope, index, AccessMode::Write)
    }

    /// Insert an empty stream at `index`, shifting later streams up by one
    pub fn insert(&self, index: u64) -> Result<StreamHandle<'_>> {
        let scope = self.enter();
        {
            let mut state = self.state.lock();
            let count = state.descriptors.len() as u64;
            if index > count {
                return Err(Error::OutOfRange { index, count });
            }
            if state.any_open() {
                return Err(Error::Reentrancy { index });
            }
            state
                .descriptors
                .insert(index as usize, StreamDescriptor::empty());
            if let Err(e) = state.store_descriptors_from(&*self.backend, index as usize) {
                state.descriptors.remove(index as usize);
                state.restore_table(&*self.backend, index as usize);
                return Err(e);
            }
        }
        debug!(index, "Inserted stream");
        self.open_handle(scope, index, AccessMode::Write)
    }

    pub fn open_read(&self, index: u64) -> Result<StreamHandle<'_>> {
        let scope = self.enter();
        self.open_handle(scope, index, AccessMode::Read)
    }

    pub fn open_write(&self, index: u64) -> Result<StreamHandle<'_>> {
        let scope = self.enter();
        self.open_handle(scope, index, AccessMode::Write)
    }

    fn open_handle<'a>(
        &'a self,
        scope: AccessScope<'a>,
        index: u64,
        mode: AccessMode,
    ) -> Result<StreamHandle<'a>> {
        let mut state = self.state.lock();
        state.check_index(index)?;
        let descriptor = state.descriptors[index as usize];
        let geometry = state.header.geometry();
        let chain = walk_chain(
            &*self.backend,
            &state.header,
            descriptor.start_cluster,
            ClusterTraits::DATA,
            Some(geometry.clusters_for(descriptor.length)),
        )?;
        state.register(index, mode)?;
        drop(state);
        Ok(StreamHandle::new(
            self, scope, index, mode, descriptor, chain, geometry,
        ))
    }

    /// Delete a stream, returning its clusters to the free list and
    /// shifting later streams down by one
    pub fn remove(&self, index: u64) -> Result<()> {
        let _scope = self.enter();
        let mut state = self.state.lock();
        state.check_index(index)?;
        if state.any_open() {
            return Err(Error::Reentrancy { index });
        }
        let descriptor = state.descriptors[index as usize];
        let geometry = state.header.geometry();
        let chain = walk_chain(
            &*self.backend,
            &state.header,
            descriptor.start_cluster,
            ClusterTraits::DATA,
            Some(geometry.clusters_for(descriptor.length)),
        )?;
        state.descriptors.remove(index as usize);
        if let Err(e) = state.store_descriptors_from(&*self.backend, index as usize) {
            state.descriptors.insert(index as usize, descriptor);
            state.restore_table(&*self.backend, index as usize);
            return Err(e);
        }
        release_tail(&*self.backend, &mut state.header, None, &chain);
        state.write_header(&*self.backend)?;
        debug!(index, clusters = chain.len(), "Removed stream");
        Ok(())
    }

    /// Whole contents of a stream; `None` for null or reaped streams
    pub fn read_all(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let mut handle = self.open_read(index)?;
        if handle.is_null() || handle.is_reaped() {
            return Ok(None);
        }
        let mut bytes = Vec::with_capacity(handle.len() as usize);
        handle.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    /// Reset to the initial state: header plus empty reserved streams
    pub fn clear(&self) -> Result<()> {
        let _scope = self.enter();
        let mut state = self.state.lock();
        if state.any_open() {
            return Err(Error::InvalidOperation(
                "Cannot clear a store with open stream handles".to_string(),
            ));
        }
        state.reset(&*self.backend)?;
        info!("Cleared clustered store");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let _scope = self.enter();
        self.backend.flush()
    }

    pub fn stats(&self) -> Result<StreamStats> {
        let _scope = self.enter();
        let state = self.state.lock();
        Ok(StreamStats {
            stream_count: state.descriptors.len() as u64,
            reserved_streams: state.header.reserved_streams as u64,
            cluster_size: state.header.cluster_size,
            total_clusters: state.header.total_clusters,
            free_clusters: state.header.free_count,
            descriptor_clusters: state.descriptor_chain.len() as u64,
            store_bytes: self.backend.len()?,
        })
    }

    /// Walk every chain and account for every cluster.
    ///
    /// Structural problems are collected into the report rather than
    /// returned as errors; only I/O failures abort the walk.
    pub fn verify(&self) -> Result<VerifyReport> {
        let _scope = self.enter();
        let state = self.state.lock();
        let header = &state.header;
        let backend = &*self.backend;
        let mut report = VerifyReport {
            total_clusters: header.total_clusters,
            ..VerifyReport::default()
        };
        let mut owners: Vec<Option<u64>> = vec![None; header.total_clusters as usize];
        const FREE_OWNER: u64 = u64::MAX;
        const TABLE_OWNER: u64 = u64::MAX - 1;

        let mut claim = |chain: &[ClusterId], owner: u64, report: &mut VerifyReport| {
            for &id in chain {
                match owners.get_mut(id as usize) {
                    Some(slot) => match *slot {
                        None => *slot = Some(owner),
                        Some(previous) => report.problems.push(format!(
                            "Cluster {} claimed twice (first by {})",
                            id, previous
                        )),
                    },
                    None => report.problems.push(format!("Cluster {} out of range", id)),
                }
            }
        };

        match collect(walk_chain(backend, header, header.free_head, ClusterTraits::FREE, None))? {
            Ok(free) => {
                if free.len() as u64 != header.free_count {
                    report.problems.push(format!(
                        "Free list holds {} clusters, header declares {}",
                        free.len(),
                        header.free_count
                    ));
                }
                report.free_clusters = free.len() as u64;
                claim(&free, FREE_OWNER, &mut report);
            }
            Err(problem) => report.problems.push(format!("Free list: {}", problem)),
        }

        report.descriptor_clusters = state.descriptor_chain.len() as u64;
        claim(&state.descriptor_chain, TABLE_OWNER, &mut report);

        for (index, descriptor) in state.descriptors.iter().enumerate() {
            if let Err(e) = descriptor.validate(index as u64) {
                report.problems.push(e.to_string());
                continue;
            }
            let expected = header.geometry().clusters_for(descriptor.length);
            match collect(walk_chain(
                backend,
                header,
                descriptor.start_cluster,
                ClusterTraits::DATA,
                Some(expected),
            ))? {
                Ok(chain) => {
                    report.data_clusters += chain.len() as u64;
                    claim(&chain, index as u64, &mut report);
                }
                Err(problem) => report
                    .problems
                    .push(format!("Stream {}: {}", index, problem)),
            }
        }

        report.leaked = owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.is_none())
            .map(|(id, _)| id as ClusterId)
            .collect();

        if !report.is_consistent() {
            warn!(
                problems = report.problems.len(),
                leaked = report.leaked.len(),
                "Clustered store verification found inconsistencies"
            );
        }
        Ok(report)
    }
}

/// Split corruption (reported) from I/O failures (propagated)
fn collect<T>(result: Result<T>) -> Result<std::result::Result<T, String>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(Error::Corruption(msg)) => Ok(Err(msg)),
        Err(e) => Err(e),
    }
}

/// Store statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub stream_count: u64,
    pub reserved_streams: u64,
    pub cluster_size: u32,
    pub total_clusters: u64,
    pub free_clusters: u64,
    pub descriptor_clusters: u64,
    pub store_bytes: u64,
}

/// Result of [`ClusteredStreams::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub total_clusters: u64,
    pub data_clusters: u64,
    pub descriptor_clusters: u64,
    pub free_clusters: u64,
    /// Clusters no chain or free list accounts for
    pub leaked: Vec<ClusterId>,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty() && self.leaked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{FileBackend, MemoryBackend};
    use std::io::{Seek, SeekFrom, Write};

    fn memory_store(cluster_size: u32, reserved: u32) -> Result<ClusteredStreams> {
        ClusteredStreams::create(
            Arc::new(MemoryBackend::new()),
            &StreamsOptions {
                cluster_size,
                reserved_streams: reserved,
            },
        )
    }

    #[test]
    fn test_create_allocates_reserved_streams() -> Result<()> {
        let streams = memory_store(32, 2)?;
        assert_eq!(streams.count(), 2);
        assert_eq!(streams.reserved_streams(), 2);
        assert_eq!(streams.descriptor(1)?, StreamDescriptor::empty());
        Ok(())
    }

    #[test]
    fn test_write_and_read_across_clusters() -> Result<()> {
        let streams = memory_store(16, 0)?;
        let payload: Vec<u8> = (0..100u8).collect();
        {
            let mut handle = streams.add()?;
            handle.write_all(&payload)?;
            assert_eq!(handle.len(), 100);
        }
        assert_eq!(streams.read_all(0)?, Some(payload.clone()));

        let mut handle = streams.open_read(0)?;
        handle.seek(SeekFrom::Start(90))?;
        let mut tail = Vec::new();
        std::io::Read::read_to_end(&mut handle, &mut tail)?;
        assert_eq!(tail, payload[90..]);
        Ok(())
    }

    #[test]
    fn test_shrink_returns_clusters_to_free_list() -> Result<()> {
        let streams = memory_store(16, 0)?;
        {
            let mut handle = streams.add()?;
            handle.write_all(&[7u8; 64])?;
            handle.set_len(20)?;
        }
        let stats = streams.stats()?;
        assert_eq!(stats.free_clusters, 2);

        // The grown descriptor table and the new stream both reuse freed
        // clusters before the store grows
        let total = stats.total_clusters;
        let mut handle = streams.add()?;
        assert_eq!(streams.stats()?.free_clusters, 1);
        handle.write_all(&[1u8; 16])?;
        drop(handle);
        let stats = streams.stats()?;
        assert_eq!(stats.total_clusters, total);
        assert_eq!(stats.free_clusters, 0);
        assert!(streams.verify()?.is_consistent());
        Ok(())
    }

    #[test]
    fn test_set_len_zero_fills_growth() -> Result<()> {
        let streams = memory_store(16, 0)?;
        {
            let mut handle = streams.add()?;
            handle.write_all(&[0xAA; 40])?;
            handle.set_len(0)?;
            handle.set_len(40)?;
        }
        let bytes = streams.read_all(0)?.unwrap_or_default();
        assert_eq!(bytes, vec![0u8; 40]);
        Ok(())
    }

    #[test]
    fn test_null_and_empty_are_distinct() -> Result<()> {
        let streams = memory_store(16, 0)?;
        streams.add()?.set_null()?;
        streams.add()?;

        assert!(streams.descriptor(0)?.traits.is_null());
        assert_eq!(streams.read_all(0)?, None);
        assert_eq!(streams.read_all(1)?, Some(Vec::new()));
        Ok(())
    }

    #[test]
    fn test_insert_and_remove_shift_indices() -> Result<()> {
        let streams = memory_store(16, 1)?;
        streams.add()?.write_all(b"a")?;
        streams.add()?.write_all(b"c")?;
        streams.insert(2)?.write_all(b"b")?;
        assert_eq!(streams.count(), 4);
        assert_eq!(streams.read_all(2)?, Some(b"b".to_vec()));
        assert_eq!(streams.read_all(3)?, Some(b"c".to_vec()));

        streams.remove(1)?;
        assert_eq!(streams.count(), 3);
        assert_eq!(streams.read_all(1)?, Some(b"b".to_vec()));
        assert!(streams.verify()?.is_consistent());
        Ok(())
    }

    #[test]
    fn test_out_of_range() -> Result<()> {
        let streams = memory_store(16, 0)?;
        streams.add()?;
        assert!(matches!(
            streams.open_read(1),
            Err(Error::OutOfRange { index: 1, count: 1 })
        ));
        assert!(matches!(streams.remove(5), Err(Error::OutOfRange { .. })));
        assert!(matches!(streams.insert(3), Err(Error::OutOfRange { .. })));
        Ok(())
    }

    #[test]
    fn test_second_write_handle_is_rejected() -> Result<()> {
        let streams = memory_store(16, 0)?;
        let writer = streams.add()?;
        assert!(matches!(
            streams.open_write(0),
            Err(Error::Reentrancy { index: 0 })
        ));
        assert!(matches!(streams.open_read(0), Err(Error::Reentrancy { .. })));
        assert!(matches!(streams.remove(0), Err(Error::Reentrancy { .. })));
        assert!(matches!(streams.clear(), Err(Error::InvalidOperation(_))));
        drop(writer);

        let r1 = streams.open_read(0)?;
        let _r2 = streams.open_read(0)?;
        assert!(matches!(streams.open_write(0), Err(Error::Reentrancy { .. })));
        drop(r1);
        Ok(())
    }

    #[test]
    fn test_read_handle_cannot_write() -> Result<()> {
        let streams = memory_store(16, 0)?;
        streams.add()?;
        let mut reader = streams.open_read(0)?;
        assert!(matches!(reader.set_len(4), Err(Error::InvalidOperation(_))));
        assert!(reader.write_all(b"x").is_err());
        Ok(())
    }

    #[test]
    fn test_clear_resets_store() -> Result<()> {
        let streams = memory_store(16, 2)?;
        for _ in 0..5 {
            streams.add()?.write_all(&[9u8; 50])?;
        }
        streams.clear()?;
        let stats = streams.stats()?;
        assert_eq!(stats.stream_count, 2);
        assert_eq!(stats.free_clusters, 0);
        assert_eq!(stats.total_clusters, stats.descriptor_clusters);
        Ok(())
    }

    #[test]
    fn test_reopen_from_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("clustore_streams_{}.bin", std::process::id()));
        {
            let streams = ClusteredStreams::create(
                Arc::new(FileBackend::create(&path)?),
                &StreamsOptions {
                    cluster_size: 32,
                    reserved_streams: 1,
                },
            )?;
            streams.add()?.write_all(b"persisted")?;
            streams.add()?.reap()?;
            streams.flush()?;
        }

        let streams = ClusteredStreams::open(Arc::new(FileBackend::open(&path)?))?;
        assert_eq!(streams.count(), 3);
        assert_eq!(streams.reserved_streams(), 1);
        assert_eq!(streams.read_all(1)?, Some(b"persisted".to_vec()));
        assert!(streams.descriptor(2)?.traits.is_reaped());
        assert!(streams.verify()?.is_consistent());

        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn test_failed_growth_keeps_stream_and_allocator() -> Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        let streams = ClusteredStreams::create(
            backend.clone(),
            &StreamsOptions {
                cluster_size: 32,
                reserved_streams: 0,
            },
        )?;
        streams.add()?.write_all(b"kept")?;
        let before = streams.stats()?;

        backend.set_limit(Some(backend.len()?));
        {
            let mut handle = streams.open_write(0)?;
            assert!(matches!(handle.set_len(100), Err(Error::Io(_))));
            assert!(handle.write_bytes(&[1u8; 80]).is_err());
            assert_eq!(handle.len(), 4);
        }
        // Appending needs a second descriptor cluster
        assert!(streams.add().is_err());
        assert_eq!(streams.count(), 1);

        assert_eq!(streams.stats()?, before);
        assert_eq!(streams.read_all(0)?, Some(b"kept".to_vec()));
        assert!(streams.verify()?.is_consistent());

        backend.set_limit(None);
        drop(streams);
        let reopened = ClusteredStreams::open(backend)?;
        assert_eq!(reopened.read_all(0)?, Some(b"kept".to_vec()));
        Ok(())
    }

    #[test]
    fn test_open_rejects_damaged_descriptor() -> Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        let options = StreamsOptions {
            cluster_size: 32,
            reserved_streams: 0,
        };
        {
            let streams = ClusteredStreams::create(backend.clone(), &options)?;
            streams.add()?.write_all(&[1u8; 10])?;
        }
        // Descriptor 0 lives in cluster 0; mark it null while it still owns bytes
        let geometry = crate::storage::clustered::format::Geometry { cluster_size: 32 };
        backend.write_at(geometry.payload_offset(0)? + 16, &1u32.to_le_bytes())?;

        assert!(matches!(
            ClusteredStreams::open(backend),
            Err(Error::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_shared_access_lock() -> Result<()> {
        let lock = AccessLock::new();
        let a = memory_store(16, 0)?.with_access_lock(lock.clone());
        let b = memory_store(16, 0)?.with_access_lock(lock.clone());
        assert!(a.access_lock().same_domain(b.access_lock()));

        // Nested scopes across stores of one domain do not deadlock
        let _outer = a.enter();
        b.add()?.write_all(b"nested")?;
        assert_eq!(b.read_all(0)?, Some(b"nested".to_vec()));
        Ok(())
    }
}
