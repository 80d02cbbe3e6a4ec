//! # Disk Array
//!
//! A fixed-size persistent array of bucket values, used as the bucket table
//! of every on-disk hash map:
//!
//! ```text
//! start:      [ bucket_count: u32 ]
//! start + 4:  [ value 0 ][ value 1 ] ... [ value bucket_count-1 ]
//! ```
//!
//! Values are either `u64` (slab offsets) or `u32` (record indexes),
//! selected by the [`BucketValue`] trait. An empty bucket holds the
//! all-ones sentinel. Writes go straight through the mapping; durability
//! rides on the owning file's flush.

use std::marker::PhantomData;

use eyre::{ensure, Result};

use super::{load_u32, load_u64, store_u32, store_u64, MemoryMap, EMPTY_RECORD, EMPTY_SLAB};

/// A fixed-width value storable in a bucket slot.
pub trait BucketValue: Copy + PartialEq {
    const SIZE: usize;
    const EMPTY: Self;

    fn load(data: &[u8], offset: usize) -> Self;
    fn store(data: &mut [u8], offset: usize, value: Self);
}

impl BucketValue for u32 {
    const SIZE: usize = 4;
    const EMPTY: Self = EMPTY_RECORD;

    fn load(data: &[u8], offset: usize) -> Self {
        load_u32(data, offset)
    }

    fn store(data: &mut [u8], offset: usize, value: Self) {
        store_u32(data, offset, value);
    }
}

impl BucketValue for u64 {
    const SIZE: usize = 8;
    const EMPTY: Self = EMPTY_SLAB;

    fn load(data: &[u8], offset: usize) -> Self {
        load_u64(data, offset)
    }

    fn store(data: &mut [u8], offset: usize, value: Self) {
        store_u64(data, offset, value);
    }
}

#[derive(Debug)]
pub struct DiskArray<V> {
    start: u64,
    count: u32,
    _value: PhantomData<V>,
}

impl<V: BucketValue> DiskArray<V> {
    /// Initializes `count` empty buckets at `start`.
    pub fn create(file: &mut MemoryMap, start: u64, count: u32) -> Result<Self> {
        ensure!(count > 0, "bucket count must be nonzero");

        let array = Self {
            start,
            count,
            _value: PhantomData,
        };
        file.resize(array.end_offset())?;

        let header = file.slice_mut(start, 4)?;
        store_u32(header, 0, count);
        for index in 0..count {
            array.put(file, index, V::EMPTY)?;
        }
        Ok(array)
    }

    /// Opens an existing bucket table, reading its count.
    pub fn open(file: &MemoryMap, start: u64) -> Result<Self> {
        let count = load_u32(file.slice(start, 4)?, 0);
        ensure!(count > 0, "bucket table at {} has zero buckets", start);

        let array = Self {
            start,
            count,
            _value: PhantomData,
        };
        ensure!(
            array.end_offset() <= file.size(),
            "bucket table at {} is corrupt: {} buckets exceed file size {}",
            start,
            count,
            file.size()
        );
        Ok(array)
    }

    pub fn get(&self, file: &MemoryMap, index: u32) -> Result<V> {
        self.check(index)?;
        let data = file.slice(self.slot_offset(index), V::SIZE)?;
        Ok(V::load(data, 0))
    }

    pub fn put(&self, file: &mut MemoryMap, index: u32, value: V) -> Result<()> {
        self.check(index)?;
        let data = file.slice_mut(self.slot_offset(index), V::SIZE)?;
        V::store(data, 0, value);
        Ok(())
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    /// The offset just past the last bucket, where the next region of the
    /// file begins.
    pub fn end_offset(&self) -> u64 {
        self.start + 4 + self.count as u64 * V::SIZE as u64
    }

    fn slot_offset(&self, index: u32) -> u64 {
        self.start + 4 + index as u64 * V::SIZE as u64
    }

    fn check(&self, index: u32) -> Result<()> {
        ensure!(
            index < self.count,
            "bucket {} out of range (count {})",
            index,
            self.count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    fn open_map(path: &Path) -> MemoryMap {
        if !path.exists() {
            let mut file = File::create(path).unwrap();
            file.write_all(b"H").unwrap();
        }
        MemoryMap::open(path).unwrap()
    }

    #[test]
    fn create_fills_buckets_with_sentinel() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("buckets"));
        let array: DiskArray<u64> = DiskArray::create(&mut file, 0, 7).unwrap();

        for index in 0..7 {
            assert_eq!(array.get(&file, index).unwrap(), EMPTY_SLAB);
        }
        assert_eq!(array.end_offset(), 4 + 7 * 8);
    }

    #[test]
    fn values_roundtrip_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buckets");

        {
            let mut file = open_map(&path);
            let array: DiskArray<u32> = DiskArray::create(&mut file, 0, 3).unwrap();
            array.put(&mut file, 0, 42).unwrap();
            array.put(&mut file, 2, 7).unwrap();
            file.flush().unwrap();
        }

        let file = open_map(&path);
        let array: DiskArray<u32> = DiskArray::open(&file, 0).unwrap();
        assert_eq!(array.len(), 3);
        assert_eq!(array.get(&file, 0).unwrap(), 42);
        assert_eq!(array.get(&file, 1).unwrap(), EMPTY_RECORD);
        assert_eq!(array.get(&file, 2).unwrap(), 7);
    }

    #[test]
    fn out_of_range_bucket_is_an_error() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("buckets"));
        let array: DiskArray<u64> = DiskArray::create(&mut file, 0, 2).unwrap();

        assert!(array.get(&file, 2).is_err());
        assert!(array.put(&mut file, 2, 1).is_err());
    }

    #[test]
    fn zero_buckets_is_rejected() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("buckets"));
        assert!(DiskArray::<u64>::create(&mut file, 0, 0).is_err());
    }
}
