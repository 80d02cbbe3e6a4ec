//! # Record Multimap
//!
//! Many fixed-size values per key: a [`RecordMap`] whose 4-byte payload is
//! the head index of a per-key list in a shared [`RecordList`] file.
//!
//! `add` prepends, so traversal yields values newest first (LIFO), which
//! is exactly the order the chain engine pops history rows back off.
//! `delete_last` removes the newest value and drops the hash entry once
//! the list empties. Iteration is the caller's: start from `lookup` and
//! follow [`RecordList::next`].

use std::path::Path;

use eyre::{ensure, Result};

use crate::storage::{load_u32, store_u32, EMPTY_RECORD};

use super::{RecordList, RecordMap};

#[derive(Debug)]
pub struct RecordMultimap<const N: usize> {
    heads: RecordMap<N>,
    rows: RecordList,
}

impl<const N: usize> RecordMultimap<N> {
    /// Creates the head table in `lookup_path` and the shared value list
    /// in `rows_path`.
    pub fn create<P: AsRef<Path>>(
        lookup_path: P,
        rows_path: P,
        bucket_count: u32,
        value_size: usize,
    ) -> Result<Self> {
        let heads = RecordMap::create(lookup_path, bucket_count, 4)?;
        let rows = RecordList::create(rows_path, value_size)?;
        Ok(Self { heads, rows })
    }

    pub fn open<P: AsRef<Path>>(lookup_path: P, rows_path: P, value_size: usize) -> Result<Self> {
        let heads = RecordMap::open(lookup_path, 4)?;
        let rows = RecordList::open(rows_path, value_size)?;
        Ok(Self { heads, rows })
    }

    /// Prepends a value to `key`'s list, creating the list on first add.
    pub fn add(&mut self, key: &[u8; N], write: impl FnOnce(&mut [u8])) -> Result<()> {
        match self.lookup(key)? {
            Some(head) => {
                let node = self.rows.insert(head, write)?;
                let updated = self.heads.update(key, |p| store_u32(p, 0, node))?;
                ensure!(updated, "multimap head vanished during add");
            }
            None => {
                let node = self.rows.insert(EMPTY_RECORD, write)?;
                self.heads.store(key, |p| store_u32(p, 0, node))?;
            }
        }
        Ok(())
    }

    /// The head index of `key`'s value list, or `None`.
    pub fn lookup(&self, key: &[u8; N]) -> Result<Option<u32>> {
        Ok(self.heads.get(key)?.map(|payload| load_u32(payload, 0)))
    }

    /// Removes the newest value for `key`. When it was the only one, the
    /// hash entry goes too. Returns `false` if the key has no values.
    pub fn delete_last(&mut self, key: &[u8; N]) -> Result<bool> {
        let Some(head) = self.lookup(key)? else {
            return Ok(false);
        };

        let next = self.rows.next(head)?;
        self.rows.release(head)?;

        if next == EMPTY_RECORD {
            let unlinked = self.heads.unlink(key)?;
            ensure!(unlinked, "multimap head vanished during delete");
        } else {
            let updated = self.heads.update(key, |p| store_u32(p, 0, next))?;
            ensure!(updated, "multimap head vanished during delete");
        }
        Ok(true)
    }

    /// The shared value list, for caller-driven iteration.
    pub fn rows(&self) -> &RecordList {
        &self.rows
    }

    pub fn sync(&mut self) -> Result<()> {
        self.heads.sync()?;
        self.rows.sync()
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

    fn collect(map: &RecordMultimap<4>, key: &[u8; 4]) -> Vec<u8> {
        let mut values = Vec::new();
        let mut index = map.lookup(key).unwrap().unwrap_or(EMPTY_RECORD);
        while index != EMPTY_RECORD {
            values.push(map.rows().payload(index).unwrap()[0]);
            index = map.rows().next(index).unwrap();
        }
        values
    }

    #[test]
    fn values_traverse_newest_first() {
        let dir = tempdir().unwrap();
        let lookup = dir.path().join("lookup");
        let rows = dir.path().join("rows");
        touch(&lookup);
        touch(&rows);

        let mut map: RecordMultimap<4> = RecordMultimap::create(&lookup, &rows, 13, 1).unwrap();
        for value in [b"1", b"2", b"3", b"4", b"5"] {
            map.add(b"addr", |p| p.copy_from_slice(value)).unwrap();
        }

        assert_eq!(collect(&map, b"addr"), b"54321");
    }

    #[test]
    fn delete_last_pops_lifo_and_drops_empty_key() {
        let dir = tempdir().unwrap();
        let lookup = dir.path().join("lookup");
        let rows = dir.path().join("rows");
        touch(&lookup);
        touch(&rows);

        let mut map: RecordMultimap<4> = RecordMultimap::create(&lookup, &rows, 13, 1).unwrap();
        map.add(b"addr", |p| p.copy_from_slice(b"a")).unwrap();
        map.add(b"addr", |p| p.copy_from_slice(b"b")).unwrap();

        assert!(map.delete_last(b"addr").unwrap());
        assert_eq!(collect(&map, b"addr"), b"a");

        assert!(map.delete_last(b"addr").unwrap());
        assert!(map.lookup(b"addr").unwrap().is_none());
        assert!(!map.delete_last(b"addr").unwrap());
    }

    #[test]
    fn keys_do_not_interfere() {
        let dir = tempdir().unwrap();
        let lookup = dir.path().join("lookup");
        let rows = dir.path().join("rows");
        touch(&lookup);
        touch(&rows);

        // One bucket: all keys collide in the head table, lists stay apart.
        let mut map: RecordMultimap<4> = RecordMultimap::create(&lookup, &rows, 1, 1).unwrap();
        map.add(b"AAAA", |p| p.copy_from_slice(b"a")).unwrap();
        map.add(b"BBBB", |p| p.copy_from_slice(b"x")).unwrap();
        map.add(b"AAAA", |p| p.copy_from_slice(b"b")).unwrap();
        map.add(b"BBBB", |p| p.copy_from_slice(b"y")).unwrap();

        assert_eq!(collect(&map, b"AAAA"), b"ba");
        assert_eq!(collect(&map, b"BBBB"), b"yx");

        map.delete_last(b"AAAA").unwrap();
        assert_eq!(collect(&map, b"AAAA"), b"a");
        assert_eq!(collect(&map, b"BBBB"), b"yx");
    }

    #[test]
    fn multimap_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let lookup = dir.path().join("lookup");
        let rows = dir.path().join("rows");
        touch(&lookup);
        touch(&rows);

        {
            let mut map: RecordMultimap<4> =
                RecordMultimap::create(&lookup, &rows, 13, 1).unwrap();
            map.add(b"addr", |p| p.copy_from_slice(b"p")).unwrap();
            map.add(b"addr", |p| p.copy_from_slice(b"q")).unwrap();
            map.sync().unwrap();
        }

        let map: RecordMultimap<4> = RecordMultimap::open(&lookup, &rows, 1).unwrap();
        assert_eq!(collect(&map, b"addr"), b"qp");
    }
}
