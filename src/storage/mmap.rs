//! # Memory-Mapped File Storage
//!
//! `MemoryMap` is the lowest layer of coindb: a read-write mapping of one
//! database file that only ever grows. Every table region (bucket arrays,
//! slab heaps, record heaps, shard entries) is a byte range inside one of
//! these maps.
//!
//! ## Design Philosophy
//!
//! The store trades buffer management for the OS page cache: files are
//! mapped directly into the address space, reads return `&[u8]` slices
//! pointing at the mapping, and writes mutate it in place. The kernel
//! handles paging and write-back; `flush` is the durability point.
//!
//! ## Safety Considerations
//!
//! A grown file must be remapped, and the new mapping may live at a
//! different base address. Every pointer derived from the old mapping is
//! invalid from that moment on. Rather than hazard pointers or epochs,
//! the borrow checker enforces this:
//!
//! ```text
//! slice(&self, ..)      -> &[u8]       // shared borrow of the map
//! slice_mut(&mut self)  -> &mut [u8]   // exclusive borrow
//! resize(&mut self, ..)                // exclusive borrow
//! ```
//!
//! Since `resize` requires `&mut self`, no view handed out by `slice` can
//! still be alive when the mapping moves.
//!
//! ## Growth
//!
//! `resize` never shrinks. On Linux the mapping is grown in place with
//! `mremap` (allowing the kernel to move it); elsewhere the old map is
//! flushed, dropped, and re-created at the new length. `reserve` applies
//! the allocators' growth policy of `max(size * 3 / 2, required)` so that
//! repeated small appends amortize to O(1) remaps.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

#[derive(Debug)]
pub struct MemoryMap {
    file: File,
    map: MmapMut,
    size: u64,
    path: PathBuf,
}

impl MemoryMap {
    /// Maps an existing file read-write. The file must be non-empty; the
    /// engine touches every database file with a single byte before the
    /// first map so that this holds even for brand new stores.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            size > 0,
            "cannot map empty database file '{}'",
            path.display()
        );

        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // modified externally. This is safe because:
        // 1. Database files are owned exclusively by one process, enforced
        //    by the advisory directory lock taken at startup
        // 2. The mmap lifetime is tied to MemoryMap, preventing
        //    use-after-unmap
        // 3. All access goes through slice()/slice_mut() which bounds-check
        let map = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            map,
            size,
            path: path.to_path_buf(),
        })
    }

    /// A bounds-checked shared view of `len` bytes at `offset`.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset + len as u64;
        ensure!(
            end <= self.size,
            "read of {} bytes at offset {} exceeds size {} of '{}'",
            len,
            offset,
            self.size,
            self.path.display()
        );
        Ok(&self.map[offset as usize..end as usize])
    }

    /// A bounds-checked exclusive view of `len` bytes at `offset`.
    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let end = offset + len as u64;
        ensure!(
            end <= self.size,
            "write of {} bytes at offset {} exceeds size {} of '{}'",
            len,
            offset,
            self.size,
            self.path.display()
        );
        Ok(&mut self.map[offset as usize..end as usize])
    }

    /// Grows the file and mapping to `new_size`, preserving existing bytes
    /// and zero-filling the tail. Never shrinks; a smaller request is a
    /// no-op. The mapping base may move.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size <= self.size {
            return Ok(());
        }

        self.file
            .set_len(new_size)
            .wrap_err_with(|| {
                format!(
                    "failed to extend '{}' to {} bytes",
                    self.path.display(),
                    new_size
                )
            })?;

        #[cfg(target_os = "linux")]
        {
            // SAFETY: remap invalidates all views of the old mapping, which
            // cannot exist because resize holds &mut self. The file has
            // already been extended to new_size.
            unsafe {
                self.map
                    .remap(
                        new_size as usize,
                        memmap2::RemapOptions::new().may_move(true),
                    )
                    .wrap_err_with(|| format!("failed to remap '{}'", self.path.display()))?;
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            self.map
                .flush()
                .wrap_err("failed to flush mmap before remap")?;

            // SAFETY: the old map is dropped on assignment and no views of
            // it can exist (resize holds &mut self).
            self.map = unsafe {
                MmapMut::map_mut(&self.file)
                    .wrap_err_with(|| format!("failed to remap '{}'", self.path.display()))?
            };
        }

        self.size = new_size;
        Ok(())
    }

    /// Ensures at least `required` bytes are mapped, growing by the
    /// amortizing policy `max(size * 3 / 2, required)`.
    pub fn reserve(&mut self, required: u64) -> Result<()> {
        if required <= self.size {
            return Ok(());
        }
        let target = required.max(self.size + self.size / 2);
        self.resize(target)
    }

    /// Durably flushes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        let mut file = File::create(path).unwrap();
        file.write_all(b"H").unwrap();
    }

    #[test]
    fn open_rejects_missing_file() {
        let dir = tempdir().unwrap();
        assert!(MemoryMap::open(dir.path().join("absent")).is_err());
    }

    #[test]
    fn open_rejects_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        assert!(MemoryMap::open(&path).is_err());
    }

    #[test]
    fn resize_preserves_bytes_and_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        touch(&path);

        let mut map = MemoryMap::open(&path).unwrap();
        map.resize(8).unwrap();
        map.slice_mut(0, 8)
            .unwrap()
            .copy_from_slice(b"deadbeef");

        map.resize(64).unwrap();
        assert_eq!(map.size(), 64);
        assert_eq!(map.slice(0, 8).unwrap(), b"deadbeef");
        assert!(map.slice(8, 56).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn resize_never_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        touch(&path);

        let mut map = MemoryMap::open(&path).unwrap();
        map.resize(128).unwrap();
        map.resize(16).unwrap();
        assert_eq!(map.size(), 128);
    }

    #[test]
    fn reserve_grows_by_half() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        touch(&path);

        let mut map = MemoryMap::open(&path).unwrap();
        map.resize(100).unwrap();
        map.reserve(101).unwrap();
        assert_eq!(map.size(), 150);

        // A large request wins over the policy.
        map.reserve(1000).unwrap();
        assert_eq!(map.size(), 1000);
    }

    #[test]
    fn out_of_bounds_access_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        touch(&path);

        let mut map = MemoryMap::open(&path).unwrap();
        map.resize(32).unwrap();
        assert!(map.slice(0, 33).is_err());
        assert!(map.slice(32, 1).is_err());
        assert!(map.slice_mut(30, 4).is_err());
    }

    #[test]
    fn data_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        touch(&path);

        {
            let mut map = MemoryMap::open(&path).unwrap();
            map.resize(16).unwrap();
            map.slice_mut(4, 4).unwrap().copy_from_slice(b"abcd");
            map.flush().unwrap();
        }

        let map = MemoryMap::open(&path).unwrap();
        assert_eq!(map.slice(4, 4).unwrap(), b"abcd");
    }
}
