//! Merkle tree over item bytes

use super::{MetadataProvider, ProviderContext};
use crate::error::{Error, Result};
use crate::object::{ItemEvent, ItemOperation};
use std::any::Any;
use tracing::debug;

pub type Digest = [u8; 32];

/// Leaf digest of null and reaped items, and root of an empty tree
pub const ZERO_DIGEST: Digest = [0u8; 32];

const LEAF_DOMAIN: &[u8] = b"clustore-leaf:";
const NODE_DOMAIN: &[u8] = b"clustore-node:";

/// BLAKE3 digest per item, kept in its reserved stream as 32-byte records.
///
/// The root pairs nodes level by level; an odd node is hashed with itself.
#[derive(Debug, Default, Clone)]
pub struct MerkleTreeProvider {
    leaves: Vec<Digest>,
}

impl MerkleTreeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaves(&self) -> &[Digest] {
        &self.leaves
    }

    pub fn leaf(&self, index: u64) -> Option<Digest> {
        self.leaves.get(index as usize).copied()
    }

    pub fn root(&self) -> Digest {
        if self.leaves.is_empty() {
            return ZERO_DIGEST;
        }
        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
        }
        level[0]
    }

    fn persist(&self, ctx: &ProviderContext<'_>) -> Result<()> {
        ctx.store(&self.leaves.concat())
    }
}

/// Leaf digest of serialized item bytes
pub fn leaf_digest(bytes: Option<&[u8]>) -> Digest {
    match bytes {
        None => ZERO_DIGEST,
        Some(bytes) => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(LEAF_DOMAIN);
            hasher.update(bytes);
            *hasher.finalize().as_bytes()
        }
    }
}

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NODE_DOMAIN);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

impl<T: 'static> MetadataProvider<T> for MerkleTreeProvider {
    fn attach(&mut self, ctx: &ProviderContext<'_>) -> Result<()> {
        let bytes = ctx.load()?;
        if bytes.len() % 32 != 0 {
            return Err(Error::Corruption(format!(
                "Merkle leaves in reserved stream {} hold {} bytes",
                ctx.reserved_index(),
                bytes.len()
            )));
        }
        self.leaves = bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut digest = ZERO_DIGEST;
                digest.copy_from_slice(chunk);
                digest
            })
            .collect();
        if self.leaves.len() as u64 != ctx.item_count() {
            return Err(Error::Corruption(format!(
                "Merkle tree has {} leaves for {} items",
                self.leaves.len(),
                ctx.item_count()
            )));
        }
        debug!(reserved_index = ctx.reserved_index(), leaves = self.leaves.len(), "Loaded merkle tree");
        Ok(())
    }

    fn post_item_operation(&mut self, ctx: &ProviderContext<'_>, event: &ItemEvent<'_, T>) -> Result<()> {
        let index = event.index as usize;
        match event.operation {
            ItemOperation::Read => return Ok(()),
            ItemOperation::Add | ItemOperation::Insert | ItemOperation::Update => {
                let digest = leaf_digest(ctx.item_bytes(event.index)?.as_deref());
                match event.operation {
                    ItemOperation::Update => {
                        if let Some(leaf) = self.leaves.get_mut(index) {
                            *leaf = digest;
                        }
                    }
                    _ => self.leaves.insert(index.min(self.leaves.len()), digest),
                }
            }
            ItemOperation::Reap => {
                if let Some(leaf) = self.leaves.get_mut(index) {
                    *leaf = ZERO_DIGEST;
                }
            }
            ItemOperation::Remove => {
                if index < self.leaves.len() {
                    self.leaves.remove(index);
                }
            }
        }
        self.persist(ctx)
    }

    fn clear(&mut self, ctx: &ProviderContext<'_>) -> Result<()> {
        self.leaves.clear();
        self.persist(ctx)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
