//! # Record Hash Table
//!
//! `RecordMap<N>` maps fixed-size keys to fixed-size payloads. Chain nodes
//! live in record slots:
//!
//! ```text
//! [ key: N bytes ][ next: u32 ][ payload: payload_size bytes ]
//! ```
//!
//! `next = 0xFFFF_FFFF` terminates a chain and marks an empty bucket.
//! Compared to the slab variant, the 4-byte links halve the index traffic
//! and unlinked slots are reclaimed through the record free list.
//! `store` always appends a fresh node; `update` overwrites the payload of
//! an existing one in place.

use std::path::Path;

use eyre::Result;

use crate::storage::{load_u32, store_u32, DiskArray, MemoryMap, RecordManager, EMPTY_RECORD};

use super::fingerprint_bucket;

#[derive(Debug)]
pub struct RecordMap<const N: usize> {
    file: MemoryMap,
    buckets: DiskArray<u32>,
    records: RecordManager,
    payload_size: usize,
}

impl<const N: usize> RecordMap<N> {
    const NODE_HEADER: usize = N + 4;

    pub fn create<P: AsRef<Path>>(
        path: P,
        bucket_count: u32,
        payload_size: usize,
    ) -> Result<Self> {
        let mut file = MemoryMap::open(path)?;
        let buckets = DiskArray::create(&mut file, 0, bucket_count)?;
        let records = RecordManager::create(
            &mut file,
            buckets.end_offset(),
            Self::NODE_HEADER + payload_size,
        )?;
        Ok(Self {
            file,
            buckets,
            records,
            payload_size,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, payload_size: usize) -> Result<Self> {
        let file = MemoryMap::open(path)?;
        let buckets = DiskArray::open(&file, 0)?;
        let records = RecordManager::open(
            &file,
            buckets.end_offset(),
            Self::NODE_HEADER + payload_size,
        )?;
        Ok(Self {
            file,
            buckets,
            records,
            payload_size,
        })
    }

    /// Appends a fresh node for `key` and links it at the chain head.
    /// The `write` closure fills the payload. Returns the record index.
    pub fn store(&mut self, key: &[u8; N], write: impl FnOnce(&mut [u8])) -> Result<u32> {
        let bucket = self.bucket_index(key);
        let next = self.buckets.get(&self.file, bucket)?;

        let index = self.records.allocate(&mut self.file)?;
        {
            let node = self.records.record_mut(&mut self.file, index)?;
            node[..N].copy_from_slice(key);
            store_u32(node, N, next);
            write(&mut node[Self::NODE_HEADER..]);
        }

        self.buckets.put(&mut self.file, bucket, index)?;
        Ok(index)
    }

    /// The payload of the most recently stored node for `key`.
    pub fn get(&self, key: &[u8; N]) -> Result<Option<&[u8]>> {
        match self.find(key)? {
            Some(index) => {
                let node = self.records.record(&self.file, index)?;
                Ok(Some(&node[Self::NODE_HEADER..]))
            }
            None => Ok(None),
        }
    }

    /// Overwrites the payload of the first matching node in place.
    /// Returns `false` when the key is absent.
    pub fn update(&mut self, key: &[u8; N], write: impl FnOnce(&mut [u8])) -> Result<bool> {
        match self.find(key)? {
            Some(index) => {
                let node = self.records.record_mut(&mut self.file, index)?;
                write(&mut node[Self::NODE_HEADER..]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Splices the first matching node out of its chain and releases the
    /// slot to the free list.
    pub fn unlink(&mut self, key: &[u8; N]) -> Result<bool> {
        let bucket = self.bucket_index(key);
        let mut position = self.buckets.get(&self.file, bucket)?;
        let mut previous: Option<u32> = None;

        while position != EMPTY_RECORD {
            let node = self.records.record(&self.file, position)?;
            let next = load_u32(node, N);
            if &node[..N] == key {
                match previous {
                    None => self.buckets.put(&mut self.file, bucket, next)?,
                    Some(prev) => {
                        let prev_node = self.records.record_mut(&mut self.file, prev)?;
                        store_u32(prev_node, N, next);
                    }
                }
                self.records.release(&mut self.file, position)?;
                return Ok(true);
            }
            previous = Some(position);
            position = next;
        }
        Ok(false)
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Publishes the record count and free list, then flushes.
    pub fn sync(&mut self) -> Result<()> {
        self.records.sync(&mut self.file)
    }

    fn find(&self, key: &[u8; N]) -> Result<Option<u32>> {
        let mut position = self.buckets.get(&self.file, self.bucket_index(key))?;
        while position != EMPTY_RECORD {
            let node = self.records.record(&self.file, position)?;
            if &node[..N] == key {
                return Ok(Some(position));
            }
            position = load_u32(node, N);
        }
        Ok(None)
    }

    fn bucket_index(&self, key: &[u8; N]) -> u32 {
        fingerprint_bucket(key, self.buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn touch(path: &PathBuf) {
        let mut file = File::create(path).unwrap();
        file.write_all(b"H").unwrap();
    }

    #[test]
    fn store_get_update_unlink() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        touch(&path);

        let mut map: RecordMap<8> = RecordMap::create(&path, 17, 4).unwrap();
        let key = *b"outpoint";

        map.store(&key, |p| p.copy_from_slice(&[9, 9, 9, 9])).unwrap();
        assert_eq!(map.get(&key).unwrap().unwrap(), &[9, 9, 9, 9]);

        assert!(map.update(&key, |p| p.copy_from_slice(&[1, 2, 3, 4])).unwrap());
        assert_eq!(map.get(&key).unwrap().unwrap(), &[1, 2, 3, 4]);

        assert!(map.unlink(&key).unwrap());
        assert!(map.get(&key).unwrap().is_none());
        assert!(!map.unlink(&key).unwrap());
        assert!(!map.update(&key, |_| {}).unwrap());
    }

    #[test]
    fn collisions_chain_and_splice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        touch(&path);

        let mut map: RecordMap<4> = RecordMap::create(&path, 1, 1).unwrap();
        map.store(b"AAAA", |p| p.copy_from_slice(b"a")).unwrap();
        map.store(b"BBBB", |p| p.copy_from_slice(b"b")).unwrap();
        map.store(b"CCCC", |p| p.copy_from_slice(b"c")).unwrap();

        assert!(map.unlink(b"BBBB").unwrap());
        assert_eq!(map.get(b"AAAA").unwrap().unwrap(), b"a");
        assert!(map.get(b"BBBB").unwrap().is_none());
        assert_eq!(map.get(b"CCCC").unwrap().unwrap(), b"c");
    }

    #[test]
    fn unlinked_slot_is_recycled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        touch(&path);

        let mut map: RecordMap<4> = RecordMap::create(&path, 7, 2).unwrap();
        let first = map.store(b"AAAA", |p| p.copy_from_slice(b"aa")).unwrap();
        map.store(b"BBBB", |p| p.copy_from_slice(b"bb")).unwrap();
        map.unlink(b"AAAA").unwrap();

        let recycled = map.store(b"CCCC", |p| p.copy_from_slice(b"cc")).unwrap();
        assert_eq!(recycled, first);
        assert_eq!(map.get(b"CCCC").unwrap().unwrap(), b"cc");
        assert_eq!(map.get(b"BBBB").unwrap().unwrap(), b"bb");
    }

    #[test]
    fn reopen_after_sync_restores_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map");
        touch(&path);

        {
            let mut map: RecordMap<8> = RecordMap::create(&path, 17, 4).unwrap();
            map.store(b"spend--1", |p| p.copy_from_slice(&[1, 1, 1, 1]))
                .unwrap();
            map.store(b"spend--2", |p| p.copy_from_slice(&[2, 2, 2, 2]))
                .unwrap();
            map.sync().unwrap();
        }

        let map: RecordMap<8> = RecordMap::open(&path, 4).unwrap();
        assert_eq!(map.get(b"spend--1").unwrap().unwrap(), &[1, 1, 1, 1]);
        assert_eq!(map.get(b"spend--2").unwrap().unwrap(), &[2, 2, 2, 2]);
    }
}
