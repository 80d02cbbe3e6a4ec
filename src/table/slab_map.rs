//! # Slab Hash Table
//!
//! `SlabMap<N>` maps fixed-size keys to variable-size values. The file is
//! a bucket array followed by a slab heap; each chain node is a slab:
//!
//! ```text
//! [ key: N bytes ][ next: u64 ][ value bytes ... ]
//! ```
//!
//! `next = 0` terminates a chain (slab offset 0 is never allocated).
//! Duplicate keys are not detected: a later `store` shadows earlier ones
//! and `get` returns the most recent. `unlink` splices a node out of its
//! chain but never reclaims slab bytes; the heap is append-only.

use std::path::Path;

use eyre::Result;

use crate::storage::{load_u64, store_u64, DiskArray, MemoryMap, SlabManager, EMPTY_SLAB};

use super::fingerprint_bucket;

#[derive(Debug)]
pub struct SlabMap<const N: usize> {
    file: MemoryMap,
    buckets: DiskArray<u64>,
    slabs: SlabManager,
}

impl<const N: usize> SlabMap<N> {
    const NODE_HEADER: usize = N + 8;

    /// Creates the bucket array and an empty slab heap in the file at
    /// `path` (which must already exist, non-empty).
    pub fn create<P: AsRef<Path>>(path: P, bucket_count: u32) -> Result<Self> {
        let mut file = MemoryMap::open(path)?;
        let buckets = DiskArray::create(&mut file, 0, bucket_count)?;
        let slabs = SlabManager::create(&mut file, buckets.end_offset())?;
        Ok(Self {
            file,
            buckets,
            slabs,
        })
    }

    /// Opens a previously created table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = MemoryMap::open(path)?;
        let buckets = DiskArray::open(&file, 0)?;
        let slabs = SlabManager::open(&file, buckets.end_offset())?;
        Ok(Self {
            file,
            buckets,
            slabs,
        })
    }

    /// Stores a value, prepending a fresh node to the key's chain. The
    /// `write` closure must fill exactly `value_size` bytes. Returns the
    /// new slab's offset.
    ///
    /// The node's `next` is written before the bucket head, so an
    /// interruption leaves the old chain intact with at most one orphan
    /// slab.
    pub fn store(
        &mut self,
        key: &[u8; N],
        value_size: usize,
        write: impl FnOnce(&mut [u8]),
    ) -> Result<u64> {
        let bucket = self.bucket_index(key);
        let next = self.chain_head(bucket)?;

        let slab_size = Self::NODE_HEADER + value_size;
        let offset = self.slabs.allocate(&mut self.file, slab_size as u64)?;
        {
            let node = self.slabs.slab_mut(&mut self.file, offset, slab_size)?;
            node[..N].copy_from_slice(key);
            store_u64(node, N, next);
            write(&mut node[Self::NODE_HEADER..]);
        }

        self.buckets.put(&mut self.file, bucket, offset)?;
        Ok(offset)
    }

    /// The value of the most recently stored node for `key`, or `None`.
    ///
    /// The returned slice extends to the heap's append cursor; variable
    /// values are self-delimiting to their callers.
    pub fn get(&self, key: &[u8; N]) -> Result<Option<&[u8]>> {
        let mut position = self.chain_head(self.bucket_index(key))?;
        while position != 0 {
            let node = self.slabs.slab(&self.file, position, Self::NODE_HEADER)?;
            if &node[..N] == key {
                let value_offset = position + Self::NODE_HEADER as u64;
                return Ok(Some(self.slabs.slab_to_end(&self.file, value_offset)?));
            }
            position = load_u64(node, N);
        }
        Ok(None)
    }

    /// The value bytes of the node at `offset`, as previously returned by
    /// `store`. Secondary indexes persist these offsets to reach a row
    /// without rehashing its key.
    pub fn value_at(&self, offset: u64) -> Result<&[u8]> {
        self.slabs
            .slab_to_end(&self.file, offset + Self::NODE_HEADER as u64)
    }

    /// Splices the first matching node out of its chain. Returns `false`
    /// when the key is absent. The node's bytes are not reclaimed.
    pub fn unlink(&mut self, key: &[u8; N]) -> Result<bool> {
        let bucket = self.bucket_index(key);
        let mut position = self.chain_head(bucket)?;
        let mut previous: Option<u64> = None;

        while position != 0 {
            let node = self.slabs.slab(&self.file, position, Self::NODE_HEADER)?;
            let next = load_u64(node, N);
            if &node[..N] == key {
                match previous {
                    None => self.buckets.put(&mut self.file, bucket, next)?,
                    Some(prev) => {
                        let prev_node =
                            self.slabs.slab_mut(&mut self.file, prev, Self::NODE_HEADER)?;
                        store_u64(prev_node, N, next);
                    }
                }
                return Ok(true);
            }
            previous = Some(position);
            position = next;
        }
        Ok(false)
    }

    /// Publishes the heap cursor and flushes the file.
    pub fn sync(&mut self) -> Result<()> {
        self.slabs.sync(&mut self.file)
    }

    fn bucket_index(&self, key: &[u8; N]) -> u32 {
        fingerprint_bucket(key, self.buckets.len())
    }

    fn chain_head(&self, bucket: u32) -> Result<u64> {
        let head = self.buckets.get(&self.file, bucket)?;
        Ok(if head == EMPTY_SLAB { 0 } else { head })
    }
}
