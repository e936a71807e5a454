//! On-disk layout of a clustered store
//!
//! ```text
//! [Header 80B][Cluster 0][Cluster 1][Cluster 2]...
//!
//! Cluster = [traits u8][zero 7B][next u64][payload cluster_size B]
//! Descriptor record (24B) = [start u64][length u64][traits u32][zero 4B]
//! ```
//!
//! All integers are little-endian. The descriptor table is stored in the
//! chain starting at `Header::descriptor_head`; the header CRC32 covers
//! bytes 0..76.

use crate::error::{Error, Result};

/// Cluster identifier (position in the cluster area)
pub type ClusterId = u64;

/// Chain terminator / "no cluster"
pub const NO_CLUSTER: ClusterId = u64::MAX;

/// Magic number at offset 0
pub const MAGIC: &[u8; 8] = b"CLUSTORE";

/// Current format version
pub const FORMAT_VERSION: u16 = 1;

/// Size of the store header
pub const HEADER_SIZE: usize = 80;

/// Size of the per-cluster header (traits + next link)
pub const CLUSTER_HEADER_SIZE: usize = 16;

/// Size of one descriptor record
pub const DESCRIPTOR_SIZE: usize = 24;

const HEADER_CHECKSUMMED: usize = 76;

/// Role of a cluster, stored in its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterTraits(u8);

impl ClusterTraits {
    pub const FREE: Self = Self(0x01);
    pub const DATA: Self = Self(0x02);
    pub const DESCRIPTOR: Self = Self(0x04);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x01 | 0x02 | 0x04 => Some(Self(bits)),
            _ => None,
        }
    }
}

/// Trait bitmask of a stream descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamTraits(u32);

impl StreamTraits {
    /// Present stream (possibly zero-length)
    pub const NORMAL: Self = Self(0);
    /// Logically absent: zero length, no chain
    pub const NULL: Self = Self(0x01);
    /// Slot emptied but retained so that indices stay stable
    pub const REAPED: Self = Self(0x02);

    const KNOWN: u32 = 0x03;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::KNOWN != 0 {
            return None;
        }
        Some(Self(bits))
    }

    pub fn is_null(self) -> bool {
        self.0 & Self::NULL.0 != 0
    }

    pub fn is_reaped(self) -> bool {
        self.0 & Self::REAPED.0 != 0
    }
}

/// Location and shape of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub start_cluster: ClusterId,
    pub length: u64,
    pub traits: StreamTraits,
}

impl StreamDescriptor {
    /// Empty, present stream
    pub fn empty() -> Self {
        Self {
            start_cluster: NO_CLUSTER,
            length: 0,
            traits: StreamTraits::NORMAL,
        }
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..8].copy_from_slice(&self.start_cluster.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.traits.bits().to_le_bytes());
        buf
    }

    /// Decode and validate a record; `index` is only used for messages
    pub fn from_bytes(index: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_SIZE {
            return Err(Error::Corruption(format!(
                "Descriptor {} truncated ({} bytes)",
                index,
                buf.len()
            )));
        }
        let bits = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let traits = StreamTraits::from_bits(bits).ok_or_else(|| {
            Error::Corruption(format!("Descriptor {} has unknown traits {:#x}", index, bits))
        })?;
        let descriptor = Self {
            start_cluster: u64::from_le_bytes(read8(&buf[0..8])),
            length: u64::from_le_bytes(read8(&buf[8..16])),
            traits,
        };
        descriptor.validate(index)?;
        Ok(descriptor)
    }

    /// Trait flags must agree with the chain shape
    pub fn validate(&self, index: u64) -> Result<()> {
        let t = self.traits;
        if t.is_null() && t.is_reaped() {
            return Err(Error::Corruption(format!(
                "Descriptor {} is both null and reaped",
                index
            )));
        }
        if (t.is_null() || t.is_reaped()) && (self.length != 0 || self.start_cluster != NO_CLUSTER)
        {
            return Err(Error::Corruption(format!(
                "Descriptor {} is {} but owns {} bytes",
                index,
                if t.is_null() { "null" } else { "reaped" },
                self.length
            )));
        }
        if (self.length == 0) != (self.start_cluster == NO_CLUSTER) {
            return Err(Error::Corruption(format!(
                "Descriptor {} length {} disagrees with start cluster {}",
                index, self.length, self.start_cluster
            )));
        }
        Ok(())
    }
}

/// Store header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub version: u16,
    pub cluster_size: u32,
    pub reserved_streams: u32,
    pub total_clusters: u64,
    pub stream_count: u64,
    pub descriptor_head: ClusterId,
    pub free_head: ClusterId,
    pub free_count: u64,
}

impl StoreHeader {
    pub fn new(cluster_size: u32, reserved_streams: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            cluster_size,
            reserved_streams,
            total_clusters: 0,
            stream_count: 0,
            descriptor_head: NO_CLUSTER,
            free_head: NO_CLUSTER,
            free_count: 0,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            cluster_size: self.cluster_size as u64,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&self.version.to_le_bytes());
        // 10..12 flags, 20..24 padding
        buf[12..16].copy_from_slice(&self.cluster_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.reserved_streams.to_le_bytes());
        buf[24..32].copy_from_slice(&self.total_clusters.to_le_bytes());
        buf[32..40].copy_from_slice(&self.stream_count.to_le_bytes());
        buf[40..48].copy_from_slice(&self.descriptor_head.to_le_bytes());
        buf[48..56].copy_from_slice(&self.free_head.to_le_bytes());
        buf[56..64].copy_from_slice(&self.free_count.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..HEADER_CHECKSUMMED]);
        buf[76..80].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corruption("Header too short".to_string()));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::Corruption("Invalid magic number".to_string()));
        }
        let stored_crc = u32::from_le_bytes([buf[76], buf[77], buf[78], buf[79]]);
        let computed_crc = crc32fast::hash(&buf[0..HEADER_CHECKSUMMED]);
        if stored_crc != computed_crc {
            return Err(Error::Corruption(format!(
                "Header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, computed_crc
            )));
        }
        let version = u16::from_le_bytes([buf[8], buf[9]]);
        if version > FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "Unsupported format version {}",
                version
            )));
        }
        let header = Self {
            version,
            cluster_size: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            reserved_streams: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            total_clusters: u64::from_le_bytes(read8(&buf[24..32])),
            stream_count: u64::from_le_bytes(read8(&buf[32..40])),
            descriptor_head: u64::from_le_bytes(read8(&buf[40..48])),
            free_head: u64::from_le_bytes(read8(&buf[48..56])),
            free_count: u64::from_le_bytes(read8(&buf[56..64])),
        };
        if header.cluster_size == 0 {
            return Err(Error::Corruption("Cluster size is zero".to_string()));
        }
        header.geometry().store_len(header.total_clusters)?;
        descriptor_table_len(header.stream_count)?;
        if header.stream_count < header.reserved_streams as u64 {
            return Err(Error::Corruption(format!(
                "Stream count {} below reserved stream count {}",
                header.stream_count, header.reserved_streams
            )));
        }
        Ok(header)
    }
}

/// Byte positions of clusters for one cluster size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cluster_size: u64,
}

impl Geometry {
    pub fn cluster_stride(&self) -> u64 {
        CLUSTER_HEADER_SIZE as u64 + self.cluster_size
    }

    pub fn cluster_offset(&self, id: ClusterId) -> Result<u64> {
        self.offset_past(id, 0)
            .ok_or_else(|| Error::Corruption(format!("Cluster {} lies beyond the addressable range", id)))
    }

    pub fn payload_offset(&self, id: ClusterId) -> Result<u64> {
        self.offset_past(id, CLUSTER_HEADER_SIZE as u64)
            .ok_or_else(|| Error::Corruption(format!("Cluster {} lies beyond the addressable range", id)))
    }

    /// Clusters needed to hold `len` bytes
    pub fn clusters_for(&self, len: u64) -> usize {
        len.div_ceil(self.cluster_size) as usize
    }

    /// Store length holding `total_clusters` clusters
    pub fn store_len(&self, total_clusters: u64) -> Result<u64> {
        self.offset_past(total_clusters, 0).ok_or_else(|| {
            Error::Corruption(format!(
                "{} clusters of {} bytes exceed the addressable range",
                total_clusters, self.cluster_size
            ))
        })
    }

    fn offset_past(&self, id: ClusterId, extra: u64) -> Option<u64> {
        id.checked_mul(self.cluster_stride())?
            .checked_add(HEADER_SIZE as u64)?
            .checked_add(extra)
    }
}

/// Byte length of a descriptor table holding `stream_count` records
pub fn descriptor_table_len(stream_count: u64) -> Result<u64> {
    stream_count
        .checked_mul(DESCRIPTOR_SIZE as u64)
        .ok_or_else(|| Error::Corruption(format!("Stream count {} overflows the descriptor table", stream_count)))
}

fn read8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}
