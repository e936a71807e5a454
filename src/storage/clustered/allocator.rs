//! Cluster allocation and chain I/O
//!
//! Free clusters form a singly-linked list threaded through their `next`
//! field, headed by `StoreHeader::free_head`. Allocation pops from that list
//! before extending the backing store.

use super::format::{
    ClusterId, ClusterTraits, Geometry, StoreHeader, CLUSTER_HEADER_SIZE, NO_CLUSTER,
};
use crate::error::{Error, Result};
use crate::storage::backend::BackingStore;
use tracing::{debug, warn};

/// Allocator over the cluster area of one store.
///
/// Mutates the in-memory header; the caller persists it afterwards.
pub(crate) struct ClusterAllocator<'a> {
    backend: &'a dyn BackingStore,
    header: &'a mut StoreHeader,
}

impl<'a> ClusterAllocator<'a> {
    pub fn new(backend: &'a dyn BackingStore, header: &'a mut StoreHeader) -> Self {
        Self { backend, header }
    }

    /// Allocate `count` clusters with `traits`, linked in order.
    ///
    /// When `link_from` is given, that cluster's `next` is pointed at the
    /// first new cluster so the chain is extended in place. On failure the
    /// header, the free list and the store length are left as they were.
    pub fn allocate(
        &mut self,
        count: usize,
        traits: ClusterTraits,
        link_from: Option<ClusterId>,
    ) -> Result<Vec<ClusterId>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let snapshot = self.header.clone();
        let total_before = snapshot.total_clusters;
        let clusters = match self.claim(count) {
            Ok(clusters) => clusters,
            Err(e) => {
                *self.header = snapshot;
                return Err(e);
            }
        };
        if let Err(e) = self.link(&clusters, traits, link_from) {
            self.undo_claim(snapshot, &clusters);
            return Err(e);
        }

        let reused = clusters.iter().filter(|&&id| id < total_before).count();
        debug!(count, reused, fresh = count - reused, "Allocated clusters");
        Ok(clusters)
    }

    /// Pop free clusters, then extend the store for the rest. The backend
    /// only changes once every free-list entry has been checked.
    fn claim(&mut self, count: usize) -> Result<Vec<ClusterId>> {
        let mut clusters = Vec::with_capacity(count);
        while clusters.len() < count && self.header.free_head != NO_CLUSTER {
            let id = self.header.free_head;
            let (found, next) = read_cluster_header(self.backend, self.header, id)?;
            if found != ClusterTraits::FREE {
                return Err(Error::Corruption(format!(
                    "Free list entry {} has traits {:#x}",
                    id,
                    found.bits()
                )));
            }
            self.header.free_head = next;
            self.header.free_count = self.header.free_count.saturating_sub(1);
            clusters.push(id);
        }

        let fresh = (count - clusters.len()) as u64;
        if fresh > 0 {
            let first = self.header.total_clusters;
            let total = first.checked_add(fresh).ok_or_else(|| {
                Error::Corruption(format!("Cluster count {} overflows", first))
            })?;
            let len = self.header.geometry().store_len(total)?;
            self.backend.set_len(len)?;
            self.header.total_clusters = total;
            clusters.extend(first..total);
        }
        Ok(clusters)
    }

    fn link(&mut self, clusters: &[ClusterId], traits: ClusterTraits, link_from: Option<ClusterId>) -> Result<()> {
        let geometry = self.header.geometry();
        for (i, &id) in clusters.iter().enumerate() {
            let next = clusters.get(i + 1).copied().unwrap_or(NO_CLUSTER);
            write_cluster_header(self.backend, geometry, id, traits, next)?;
        }
        if let (Some(prev), Some(&first)) = (link_from, clusters.first()) {
            self.set_next(prev, first)?;
        }
        Ok(())
    }

    /// Put popped clusters back on the free list in their old order and
    /// shrink the store to its old length
    fn undo_claim(&mut self, snapshot: StoreHeader, clusters: &[ClusterId]) {
        let geometry = snapshot.geometry();
        let reused: Vec<ClusterId> = clusters
            .iter()
            .copied()
            .filter(|&id| id < snapshot.total_clusters)
            .collect();
        let tail = self.header.free_head;
        for (i, &id) in reused.iter().enumerate() {
            let next = reused.get(i + 1).copied().unwrap_or(tail);
            if let Err(e) = write_cluster_header(self.backend, geometry, id, ClusterTraits::FREE, next) {
                warn!(cluster = id, error = %e, "Could not return cluster to the free list");
            }
        }
        if self.header.total_clusters != snapshot.total_clusters {
            let restored = geometry
                .store_len(snapshot.total_clusters)
                .and_then(|len| self.backend.set_len(len));
            if let Err(e) = restored {
                warn!(error = %e, "Could not shrink store after failed allocation");
            }
        }
        *self.header = snapshot;
    }

    /// Return clusters to the free list
    pub fn free(&mut self, clusters: &[ClusterId]) -> Result<()> {
        let geometry = self.header.geometry();
        for &id in clusters {
            write_cluster_header(
                self.backend,
                geometry,
                id,
                ClusterTraits::FREE,
                self.header.free_head,
            )?;
            self.header.free_head = id;
            self.header.free_count += 1;
        }
        if !clusters.is_empty() {
            debug!(count = clusters.len(), free = self.header.free_count, "Freed clusters");
        }
        Ok(())
    }

    /// Point `id` at `next`, keeping its traits
    pub fn set_next(&mut self, id: ClusterId, next: ClusterId) -> Result<()> {
        let (traits, _) = read_cluster_header(self.backend, self.header, id)?;
        write_cluster_header(self.backend, self.header.geometry(), id, traits, next)
    }
}

/// Read `(traits, next)` of a cluster
pub(crate) fn read_cluster_header(
    backend: &dyn BackingStore,
    header: &StoreHeader,
    id: ClusterId,
) -> Result<(ClusterTraits, ClusterId)> {
    if id >= header.total_clusters {
        return Err(Error::Corruption(format!(
            "Cluster {} beyond cluster count {}",
            id, header.total_clusters
        )));
    }
    let mut buf = [0u8; CLUSTER_HEADER_SIZE];
    backend.read_at(header.geometry().cluster_offset(id)?, &mut buf)?;
    let traits = ClusterTraits::from_bits(buf[0]).ok_or_else(|| {
        Error::Corruption(format!("Cluster {} has unknown traits {:#x}", id, buf[0]))
    })?;
    let mut next = [0u8; 8];
    next.copy_from_slice(&buf[8..16]);
    Ok((traits, u64::from_le_bytes(next)))
}

fn write_cluster_header(
    backend: &dyn BackingStore,
    geometry: Geometry,
    id: ClusterId,
    traits: ClusterTraits,
    next: ClusterId,
) -> Result<()> {
    let mut buf = [0u8; CLUSTER_HEADER_SIZE];
    buf[0] = traits.bits();
    buf[8..16].copy_from_slice(&next.to_le_bytes());
    backend.write_at(geometry.cluster_offset(id)?, &buf)
}

/// Follow a chain from `start`, checking every cluster's traits.
///
/// With `expected` set, the chain must be exactly that long. Chains longer
/// than the cluster count are reported as cycles.
pub(crate) fn walk_chain(
    backend: &dyn BackingStore,
    header: &StoreHeader,
    start: ClusterId,
    traits: ClusterTraits,
    expected: Option<usize>,
) -> Result<Vec<ClusterId>> {
    let capacity = expected.unwrap_or(0).min(header.total_clusters as usize);
    let mut chain = Vec::with_capacity(capacity);
    let mut current = start;
    while current != NO_CLUSTER {
        if chain.len() as u64 >= header.total_clusters {
            return Err(Error::Corruption(format!(
                "Cycle detected in chain starting at cluster {}",
                start
            )));
        }
        let (found, next) = read_cluster_header(backend, header, current)?;
        if found != traits {
            return Err(Error::Corruption(format!(
                "Cluster {} has traits {:#x}, expected {:#x}",
                current,
                found.bits(),
                traits.bits()
            )));
        }
        chain.push(current);
        current = next;
    }
    if let Some(expected) = expected {
        if chain.len() != expected {
            return Err(Error::Corruption(format!(
                "Chain at cluster {} has {} clusters, expected {}",
                start,
                chain.len(),
                expected
            )));
        }
    }
    Ok(chain)
}

/// Read `buf.len()` payload bytes starting at byte `offset` of a chain
pub(crate) fn read_chain(
    backend: &dyn BackingStore,
    geometry: Geometry,
    chain: &[ClusterId],
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let mut done = 0usize;
    let mut pos = offset;
    while done < buf.len() {
        let (id, within, n) = locate(geometry, chain, pos, buf.len() - done)?;
        backend.read_at(geometry.payload_offset(id)? + within, &mut buf[done..done + n])?;
        done += n;
        pos += n as u64;
    }
    Ok(())
}

/// Write `data` at byte `offset` of a chain; the chain must be long enough
pub(crate) fn write_chain(
    backend: &dyn BackingStore,
    geometry: Geometry,
    chain: &[ClusterId],
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let mut done = 0usize;
    let mut pos = offset;
    while done < data.len() {
        let (id, within, n) = locate(geometry, chain, pos, data.len() - done)?;
        backend.write_at(geometry.payload_offset(id)? + within, &data[done..done + n])?;
        done += n;
        pos += n as u64;
    }
    Ok(())
}

/// Zero `len` bytes at byte `offset` of a chain
pub(crate) fn zero_chain(
    backend: &dyn BackingStore,
    geometry: Geometry,
    chain: &[ClusterId],
    offset: u64,
    len: u64,
) -> Result<()> {
    let zeros = vec![0u8; geometry.cluster_size.min(len) as usize];
    let mut pos = offset;
    let end = offset + len;
    while pos < end {
        let want = (end - pos).min(zeros.len() as u64) as usize;
        let (id, within, n) = locate(geometry, chain, pos, want)?;
        backend.write_at(geometry.payload_offset(id)? + within, &zeros[..n])?;
        pos += n as u64;
    }
    Ok(())
}

/// Cluster, offset within it, and byte count for the next chunk of a transfer
fn locate(
    geometry: Geometry,
    chain: &[ClusterId],
    pos: u64,
    remaining: usize,
) -> Result<(ClusterId, u64, usize)> {
    let slot = (pos / geometry.cluster_size) as usize;
    let within = pos % geometry.cluster_size;
    let id = *chain.get(slot).ok_or_else(|| {
        Error::Corruption(format!(
            "Offset {} beyond chain of {} clusters",
            pos,
            chain.len()
        ))
    })?;
    let n = ((geometry.cluster_size - within) as usize).min(remaining);
    Ok((id, within, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;
    use crate::storage::clustered::format::HEADER_SIZE;

    fn setup(cluster_size: u32) -> (MemoryBackend, StoreHeader) {
        let backend = MemoryBackend::new();
        backend.set_len(HEADER_SIZE as u64).unwrap();
        (backend, StoreHeader::new(cluster_size, 0))
    }

    #[test]
    fn test_allocate_extends_store() -> Result<()> {
        let (backend, mut header) = setup(32);
        let chain = ClusterAllocator::new(&backend, &mut header).allocate(3, ClusterTraits::DATA, None)?;
        assert_eq!(chain, vec![0, 1, 2]);
        assert_eq!(header.total_clusters, 3);
        assert_eq!(backend.len()?, header.geometry().store_len(3)?);

        let walked = walk_chain(&backend, &header, 0, ClusterTraits::DATA, Some(3))?;
        assert_eq!(walked, chain);
        Ok(())
    }

    #[test]
    fn test_free_clusters_are_reused_first() -> Result<()> {
        let (backend, mut header) = setup(32);
        let mut alloc = ClusterAllocator::new(&backend, &mut header);
        let chain = alloc.allocate(4, ClusterTraits::DATA, None)?;
        alloc.free(&chain[1..3])?;

        let reused = alloc.allocate(3, ClusterTraits::DATA, None)?;
        // Two come off the free list (LIFO), one extends the store
        assert_eq!(reused, vec![2, 1, 4]);
        assert_eq!(header.free_count, 0);
        assert_eq!(header.total_clusters, 5);
        Ok(())
    }

    #[test]
    fn test_failed_growth_leaves_allocator_untouched() -> Result<()> {
        let (backend, mut header) = setup(32);
        let mut alloc = ClusterAllocator::new(&backend, &mut header);
        let chain = alloc.allocate(4, ClusterTraits::DATA, None)?;
        alloc.free(&chain[1..3])?;
        let before = alloc.header.clone();

        backend.set_limit(Some(backend.len()?));
        assert!(matches!(
            alloc.allocate(3, ClusterTraits::DATA, Some(chain[3])),
            Err(Error::Io(_))
        ));
        assert_eq!(*alloc.header, before);

        // Free list still intact and usable
        let walked = walk_chain(&backend, &before, before.free_head, ClusterTraits::FREE, Some(2))?;
        assert_eq!(walked, vec![2, 1]);
        assert_eq!(walk_chain(&backend, &before, 3, ClusterTraits::DATA, Some(1))?, vec![3]);
        assert_eq!(alloc.allocate(2, ClusterTraits::DATA, None)?, vec![2, 1]);
        Ok(())
    }

    #[test]
    fn test_link_from_extends_chain() -> Result<()> {
        let (backend, mut header) = setup(32);
        let mut alloc = ClusterAllocator::new(&backend, &mut header);
        let first = alloc.allocate(2, ClusterTraits::DATA, None)?;
        alloc.allocate(2, ClusterTraits::DATA, Some(first[1]))?;

        let walked = walk_chain(&backend, &header, 0, ClusterTraits::DATA, None)?;
        assert_eq!(walked, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_walk_detects_wrong_traits_and_length() -> Result<()> {
        let (backend, mut header) = setup(32);
        ClusterAllocator::new(&backend, &mut header).allocate(2, ClusterTraits::DESCRIPTOR, None)?;

        assert!(walk_chain(&backend, &header, 0, ClusterTraits::DATA, None).is_err());
        assert!(walk_chain(&backend, &header, 0, ClusterTraits::DESCRIPTOR, Some(3)).is_err());
        Ok(())
    }

    #[test]
    fn test_walk_detects_cycle() -> Result<()> {
        let (backend, mut header) = setup(32);
        let mut alloc = ClusterAllocator::new(&backend, &mut header);
        let chain = alloc.allocate(2, ClusterTraits::DATA, None)?;
        alloc.set_next(chain[1], chain[0])?;

        let err = walk_chain(&backend, &header, 0, ClusterTraits::DATA, None).unwrap_err();
        assert!(err.to_string().contains("Cycle"));
        Ok(())
    }

    #[test]
    fn test_chain_io_spans_clusters() -> Result<()> {
        let (backend, mut header) = setup(16);
        let chain = ClusterAllocator::new(&backend, &mut header).allocate(3, ClusterTraits::DATA, None)?;
        let geometry = header.geometry();

        let data: Vec<u8> = (0..40).collect();
        write_chain(&backend, geometry, &chain, 4, &data)?;

        let mut back = vec![0u8; 40];
        read_chain(&backend, geometry, &chain, 4, &mut back)?;
        assert_eq!(back, data);

        zero_chain(&backend, geometry, &chain, 10, 20)?;
        read_chain(&backend, geometry, &chain, 10, &mut back[..20])?;
        assert!(back[..20].iter().all(|&b| b == 0));

        let mut too_far = [0u8; 4];
        assert!(read_chain(&backend, geometry, &chain, 46, &mut too_far).is_err());
        Ok(())
    }
}
