//! # Record Allocation
//!
//! `RecordManager` is a bump allocator for fixed-size slots inside a
//! [`MemoryMap`]. Its on-disk region is:
//!
//! ```text
//! start:      [ record_count: u32 ][ free_head: u32 ]
//! start + 8:  [ record 0 ][ record 1 ] ...
//! ```
//!
//! Records are identified by index; a record's offset is
//! `start + 8 + index * record_size`. `record_count` grows monotonically
//! during normal operation. Released slots are threaded onto an intrusive
//! free list: the next-free index is written into the released record's
//! first 4 bytes and `free_head` points at the most recent release.
//! `allocate` consumes the free list before bumping the count.
//!
//! As with slabs, only `sync` publishes the header, so batched writes hit
//! the file before the count that makes them reachable.

use eyre::{ensure, Result};

use super::{load_u32, store_u32, MemoryMap, EMPTY_RECORD};

/// Size of the `record_count` + `free_head` header.
pub const RECORD_HEADER_SIZE: u64 = 8;

#[derive(Debug)]
pub struct RecordManager {
    start: u64,
    record_size: usize,
    count: u32,
    free_head: u32,
}

impl RecordManager {
    /// Initializes an empty record region at `start`.
    pub fn create(file: &mut MemoryMap, start: u64, record_size: usize) -> Result<Self> {
        ensure!(record_size >= 4, "record size {} below minimum", record_size);

        file.resize(start + RECORD_HEADER_SIZE)?;
        let header = file.slice_mut(start, 8)?;
        store_u32(header, 0, 0);
        store_u32(header, 4, EMPTY_RECORD);

        Ok(Self {
            start,
            record_size,
            count: 0,
            free_head: EMPTY_RECORD,
        })
    }

    /// Opens an existing record region, validating the stored count.
    pub fn open(file: &MemoryMap, start: u64, record_size: usize) -> Result<Self> {
        ensure!(record_size >= 4, "record size {} below minimum", record_size);

        let header = file.slice(start, 8)?;
        let count = load_u32(header, 0);
        let free_head = load_u32(header, 4);

        let end = start + RECORD_HEADER_SIZE + count as u64 * record_size as u64;
        ensure!(
            end <= file.size(),
            "record region at {} is corrupt: {} records of {} bytes exceed file size {}",
            start,
            count,
            record_size,
            file.size()
        );
        ensure!(
            free_head == EMPTY_RECORD || free_head < count,
            "record region at {} is corrupt: free head {} >= count {}",
            start,
            free_head,
            count
        );

        Ok(Self {
            start,
            record_size,
            count,
            free_head,
        })
    }

    /// Returns a fresh record index, reusing the most recently released
    /// slot when one exists.
    pub fn allocate(&mut self, file: &mut MemoryMap) -> Result<u32> {
        if self.free_head != EMPTY_RECORD {
            let index = self.free_head;
            let slot = file.slice(self.offset(index), 4)?;
            self.free_head = load_u32(slot, 0);
            return Ok(index);
        }

        let index = self.count;
        self.count += 1;
        file.reserve(self.end_offset())?;
        Ok(index)
    }

    /// Pushes a slot onto the free list. The slot's first 4 bytes are
    /// overwritten with the previous free head.
    pub fn release(&mut self, file: &mut MemoryMap, index: u32) -> Result<()> {
        ensure!(
            index < self.count,
            "cannot release record {} (count {})",
            index,
            self.count
        );
        let slot = file.slice_mut(self.offset(index), 4)?;
        store_u32(slot, 0, self.free_head);
        self.free_head = index;
        Ok(())
    }

    /// A checked shared view of the record at `index`.
    pub fn record<'a>(&self, file: &'a MemoryMap, index: u32) -> Result<&'a [u8]> {
        self.check(index)?;
        file.slice(self.offset(index), self.record_size)
    }

    /// A checked exclusive view of the record at `index`.
    pub fn record_mut<'a>(&self, file: &'a mut MemoryMap, index: u32) -> Result<&'a mut [u8]> {
        self.check(index)?;
        file.slice_mut(self.offset(index), self.record_size)
    }

    /// Rolls the count back to `new_count`, logically discarding every
    /// later record. Only meaningful for regions that never `release`
    /// (the free list is not rewound).
    pub fn truncate(&mut self, new_count: u32) -> Result<()> {
        ensure!(
            new_count <= self.count,
            "cannot truncate {} records to {}",
            self.count,
            new_count
        );
        self.count = new_count;
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// The file offset of the record at `index`.
    pub fn offset(&self, index: u32) -> u64 {
        self.start + RECORD_HEADER_SIZE + index as u64 * self.record_size as u64
    }

    fn end_offset(&self) -> u64 {
        self.offset(self.count)
    }

    fn check(&self, index: u32) -> Result<()> {
        ensure!(
            index < self.count,
            "record index {} past count {}",
            index,
            self.count
        );
        Ok(())
    }

    /// Publishes count and free head, then flushes. Idempotent.
    pub fn sync(&self, file: &mut MemoryMap) -> Result<()> {
        let header = file.slice_mut(self.start, 8)?;
        store_u32(header, 0, self.count);
        store_u32(header, 4, self.free_head);
        file.flush()
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
    fn allocate_bumps_sequentially() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("records"));
        let mut records = RecordManager::create(&mut file, 0, 16).unwrap();

        assert_eq!(records.allocate(&mut file).unwrap(), 0);
        assert_eq!(records.allocate(&mut file).unwrap(), 1);
        assert_eq!(records.allocate(&mut file).unwrap(), 2);
        assert_eq!(records.count(), 3);
        assert_eq!(records.offset(1), RECORD_HEADER_SIZE + 16);
    }

    #[test]
    fn released_slot_is_reused_lifo() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("records"));
        let mut records = RecordManager::create(&mut file, 0, 8).unwrap();

        for _ in 0..4 {
            records.allocate(&mut file).unwrap();
        }
        records.release(&mut file, 1).unwrap();
        records.release(&mut file, 3).unwrap();

        assert_eq!(records.allocate(&mut file).unwrap(), 3);
        assert_eq!(records.allocate(&mut file).unwrap(), 1);
        assert_eq!(records.allocate(&mut file).unwrap(), 4);
        assert_eq!(records.count(), 5);
    }

    #[test]
    fn free_list_survives_sync_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        {
            let mut file = open_map(&path);
            let mut records = RecordManager::create(&mut file, 0, 8).unwrap();
            for _ in 0..3 {
                records.allocate(&mut file).unwrap();
            }
            records.release(&mut file, 0).unwrap();
            records.sync(&mut file).unwrap();
        }

        let mut file = open_map(&path);
        let mut records = RecordManager::open(&file, 0, 8).unwrap();
        assert_eq!(records.count(), 3);
        assert_eq!(records.allocate(&mut file).unwrap(), 0);
    }

    #[test]
    fn unsynced_records_are_invisible_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        {
            let mut file = open_map(&path);
            let mut records = RecordManager::create(&mut file, 0, 8).unwrap();
            records.allocate(&mut file).unwrap();
            records.sync(&mut file).unwrap();
            records.allocate(&mut file).unwrap();
            file.flush().unwrap();
        }

        let file = open_map(&path);
        let records = RecordManager::open(&file, 0, 8).unwrap();
        assert_eq!(records.count(), 1);
        assert!(records.record(&file, 1).is_err());
    }

    #[test]
    fn truncate_discards_tail() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("records"));
        let mut records = RecordManager::create(&mut file, 0, 8).unwrap();

        for _ in 0..5 {
            records.allocate(&mut file).unwrap();
        }
        records.truncate(2).unwrap();
        assert_eq!(records.count(), 2);
        assert!(records.record(&file, 2).is_err());
        assert!(records.truncate(3).is_err());
    }

    #[test]
    fn record_views_roundtrip_payload() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("records"));
        let mut records = RecordManager::create(&mut file, 0, 12).unwrap();

        let index = records.allocate(&mut file).unwrap();
        records
            .record_mut(&mut file, index)
            .unwrap()
            .copy_from_slice(b"0123456789ab");
        assert_eq!(records.record(&file, index).unwrap(), b"0123456789ab");
    }
}
