//! # Slab Allocation
//!
//! `SlabManager` is a bump-pointer allocator for variable-size byte regions
//! inside a [`MemoryMap`]. Its on-disk region is:
//!
//! ```text
//! start:      [ payload_end: u64 ]     <- append cursor, absolute offset
//! start + 8:  [ slab bytes ... ]
//! ```
//!
//! Slabs are identified by their absolute file offset. Offset 0 is never
//! allocated (the region begins past its own header) and doubles as the
//! null chain terminator in the hash tables built on top.
//!
//! Allocation only moves the in-memory cursor and grows the file; the
//! header is rewritten by `sync`. Callers are expected to batch: many
//! `allocate` + write cycles, then one `sync`. Body bytes therefore always
//! reach the file before the cursor that makes them reachable, so a crash
//! mid-batch strands unreferenced bytes but never publishes a dangling
//! offset.

use eyre::{ensure, Result};

use super::{load_u64, store_u64, MemoryMap};

/// Size of the `payload_end` header.
pub const SLAB_HEADER_SIZE: u64 = 8;

#[derive(Debug)]
pub struct SlabManager {
    start: u64,
    payload_end: u64,
}

impl SlabManager {
    /// Initializes an empty slab region at `start`, writing its header.
    pub fn create(file: &mut MemoryMap, start: u64) -> Result<Self> {
        let payload_end = start + SLAB_HEADER_SIZE;
        file.resize(payload_end)?;

        let manager = Self { start, payload_end };
        store_u64(file.slice_mut(start, 8)?, 0, payload_end);
        Ok(manager)
    }

    /// Opens an existing slab region, reading and validating its cursor.
    pub fn open(file: &MemoryMap, start: u64) -> Result<Self> {
        let payload_end = load_u64(file.slice(start, 8)?, 0);

        ensure!(
            payload_end >= start + SLAB_HEADER_SIZE && payload_end <= file.size(),
            "slab region at {} is corrupt: payload_end {} outside [{}, {}]",
            start,
            payload_end,
            start + SLAB_HEADER_SIZE,
            file.size()
        );

        Ok(Self { start, payload_end })
    }

    /// Reserves `size` bytes and returns their absolute offset. Grows the
    /// file as needed; does not touch the header.
    pub fn allocate(&mut self, file: &mut MemoryMap, size: u64) -> Result<u64> {
        let offset = self.payload_end;
        self.payload_end += size;
        file.reserve(self.payload_end)?;
        Ok(offset)
    }

    /// A checked shared view of `len` bytes of slab data at `offset`.
    pub fn slab<'a>(&self, file: &'a MemoryMap, offset: u64, len: usize) -> Result<&'a [u8]> {
        self.check(offset, len as u64)?;
        file.slice(offset, len)
    }

    /// A checked exclusive view of `len` bytes of slab data at `offset`.
    pub fn slab_mut<'a>(
        &self,
        file: &'a mut MemoryMap,
        offset: u64,
        len: usize,
    ) -> Result<&'a mut [u8]> {
        self.check(offset, len as u64)?;
        file.slice_mut(offset, len)
    }

    /// Everything from `offset` to the append cursor. Used for
    /// variable-size values whose length only the caller can determine.
    pub fn slab_to_end<'a>(&self, file: &'a MemoryMap, offset: u64) -> Result<&'a [u8]> {
        self.check(offset, 0)?;
        file.slice(offset, (self.payload_end - offset) as usize)
    }

    fn check(&self, offset: u64, len: u64) -> Result<()> {
        ensure!(
            offset >= self.start + SLAB_HEADER_SIZE && offset + len <= self.payload_end,
            "slab offset {} (+{}) outside allocated region [{}, {})",
            offset,
            len,
            self.start + SLAB_HEADER_SIZE,
            self.payload_end
        );
        Ok(())
    }

    /// The current append cursor (absolute file offset).
    pub fn payload_end(&self) -> u64 {
        self.payload_end
    }

    /// Publishes the cursor to the header and flushes. Idempotent.
    pub fn sync(&self, file: &mut MemoryMap) -> Result<()> {
        store_u64(file.slice_mut(self.start, 8)?, 0, self.payload_end);
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
    fn allocate_is_append_only() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("slabs"));
        let mut slabs = SlabManager::create(&mut file, 0).unwrap();

        let a = slabs.allocate(&mut file, 10).unwrap();
        let b = slabs.allocate(&mut file, 4).unwrap();
        let c = slabs.allocate(&mut file, 1).unwrap();

        assert_eq!(a, 8);
        assert_eq!(b, 18);
        assert_eq!(c, 22);
        assert_eq!(slabs.payload_end(), 23);
    }

    #[test]
    fn payload_end_counts_every_allocation() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("slabs"));
        let mut slabs = SlabManager::create(&mut file, 0).unwrap();

        let sizes = [3u64, 17, 1, 200, 42];
        for size in sizes {
            slabs.allocate(&mut file, size).unwrap();
        }
        slabs.sync(&mut file).unwrap();

        let total: u64 = sizes.iter().sum();
        assert_eq!(slabs.payload_end(), SLAB_HEADER_SIZE + total);

        let reopened = SlabManager::open(&file, 0).unwrap();
        assert_eq!(reopened.payload_end(), SLAB_HEADER_SIZE + total);
    }

    #[test]
    fn unsynced_allocation_is_invisible_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slabs");

        {
            let mut file = open_map(&path);
            let mut slabs = SlabManager::create(&mut file, 0).unwrap();
            let offset = slabs.allocate(&mut file, 8).unwrap();
            slabs
                .slab_mut(&mut file, offset, 8)
                .unwrap()
                .copy_from_slice(b"AAAAAAAA");
            slabs.sync(&mut file).unwrap();

            // Allocated but never synced: the crash model.
            slabs.allocate(&mut file, 100).unwrap();
            file.flush().unwrap();
        }

        let file = open_map(&path);
        let slabs = SlabManager::open(&file, 0).unwrap();
        assert_eq!(slabs.payload_end(), SLAB_HEADER_SIZE + 8);
        assert!(slabs.slab(&file, SLAB_HEADER_SIZE + 8, 1).is_err());
    }

    #[test]
    fn sync_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("slabs"));
        let mut slabs = SlabManager::create(&mut file, 0).unwrap();
        slabs.allocate(&mut file, 5).unwrap();

        slabs.sync(&mut file).unwrap();
        let header_after_first: Vec<u8> = file.slice(0, 8).unwrap().to_vec();
        slabs.sync(&mut file).unwrap();
        assert_eq!(file.slice(0, 8).unwrap(), &header_after_first[..]);
    }

    #[test]
    fn offsets_past_the_cursor_are_corruption() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("slabs"));
        let mut slabs = SlabManager::create(&mut file, 0).unwrap();
        slabs.allocate(&mut file, 16).unwrap();

        assert!(slabs.slab(&file, 0, 1).is_err());
        assert!(slabs.slab(&file, 8, 17).is_err());
        assert!(slabs.slab(&file, 8, 16).is_ok());
    }

    #[test]
    fn region_can_start_past_other_data() {
        let dir = tempdir().unwrap();
        let mut file = open_map(&dir.path().join("slabs"));
        file.resize(100).unwrap();

        let mut slabs = SlabManager::create(&mut file, 100).unwrap();
        let offset = slabs.allocate(&mut file, 4).unwrap();
        assert_eq!(offset, 108);
        slabs.sync(&mut file).unwrap();

        let reopened = SlabManager::open(&file, 100).unwrap();
        assert_eq!(reopened.payload_end(), 112);
    }
}
