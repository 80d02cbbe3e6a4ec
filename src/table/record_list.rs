//! # Linked Record List
//!
//! A singly-linked list over record slots in a dedicated file, node layout
//! `[ next: u32 ][ payload ]` with `0xFFFF_FFFF` terminating. Lists are
//! built head-first: `insert` takes the index the new node should point
//! at, so repeated inserts produce LIFO order. The multimap stores one
//! such list per key, all sharing this file.

use std::path::Path;

use eyre::Result;

use crate::storage::{load_u32, store_u32, MemoryMap, RecordManager};

#[derive(Debug)]
pub struct RecordList {
    file: MemoryMap,
    records: RecordManager,
    payload_size: usize,
}

impl RecordList {
    pub fn create<P: AsRef<Path>>(path: P, payload_size: usize) -> Result<Self> {
        let mut file = MemoryMap::open(path)?;
        let records = RecordManager::create(&mut file, 0, 4 + payload_size)?;
        Ok(Self {
            file,
            records,
            payload_size,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, payload_size: usize) -> Result<Self> {
        let file = MemoryMap::open(path)?;
        let records = RecordManager::open(&file, 0, 4 + payload_size)?;
        Ok(Self {
            file,
            records,
            payload_size,
        })
    }

    /// Creates a node pointing at `next` (the terminator for a list tail)
    /// and fills its payload via `write`. Returns the node's index.
    pub fn insert(&mut self, next: u32, write: impl FnOnce(&mut [u8])) -> Result<u32> {
        let index = self.records.allocate(&mut self.file)?;
        let node = self.records.record_mut(&mut self.file, index)?;
        store_u32(node, 0, next);
        write(&mut node[4..]);
        Ok(index)
    }

    /// The successor of `index`, or the terminator.
    pub fn next(&self, index: u32) -> Result<u32> {
        let node = self.records.record(&self.file, index)?;
        Ok(load_u32(node, 0))
    }

    pub fn payload(&self, index: u32) -> Result<&[u8]> {
        let node = self.records.record(&self.file, index)?;
        Ok(&node[4..])
    }

    pub fn payload_mut(&mut self, index: u32) -> Result<&mut [u8]> {
        let node = self.records.record_mut(&mut self.file, index)?;
        Ok(&mut node[4..])
    }

    /// Returns a node's slot to the free list. The caller must have
    /// unlinked it first.
    pub fn release(&mut self, index: u32) -> Result<()> {
        self.records.release(&mut self.file, index)
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn sync(&mut self) -> Result<()> {
        self.records.sync(&mut self.file)
    }
}
