//! # Spend Table
//!
//! Whether an output point has been spent, and by which input. One record
//! hash file keyed by the 36-byte outpoint, payload the 36-byte spending
//! input point.

use std::path::Path;

use eyre::Result;

use crate::table::RecordMap;

use super::primitives::{InputPoint, OutPoint};

const KEY_SIZE: usize = OutPoint::SERIALIZED_SIZE;

#[derive(Debug)]
pub struct SpendTable {
    map: RecordMap<KEY_SIZE>,
}

impl SpendTable {
    pub fn create<P: AsRef<Path>>(path: P, bucket_count: u32) -> Result<Self> {
        let map = RecordMap::create(path, bucket_count, OutPoint::SERIALIZED_SIZE)?;
        Ok(Self { map })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let map = RecordMap::open(path, OutPoint::SERIALIZED_SIZE)?;
        Ok(Self { map })
    }

    pub fn store(&mut self, outpoint: &OutPoint, spend: &InputPoint) -> Result<()> {
        let spend_bytes = spend.to_bytes();
        self.map
            .store(&outpoint.to_bytes(), |payload| {
                payload.copy_from_slice(&spend_bytes)
            })
            .map(|_| ())
    }

    /// The input point spending `outpoint`, or `None` while unspent.
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<InputPoint>> {
        match self.map.get(&outpoint.to_bytes())? {
            Some(payload) => Ok(Some(InputPoint::from_bytes(payload)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Result<bool> {
        self.map.unlink(&outpoint.to_bytes())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.map.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn spends_roundtrip_and_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spends");
        File::create(&path).unwrap().write_all(b"H").unwrap();

        let mut table = SpendTable::create(&path, 97).unwrap();
        let outpoint = OutPoint {
            hash: [3; 32],
            index: 1,
        };
        let spend = InputPoint {
            hash: [4; 32],
            index: 0,
        };

        assert!(table.get(&outpoint).unwrap().is_none());
        table.store(&outpoint, &spend).unwrap();
        assert_eq!(table.get(&outpoint).unwrap(), Some(spend));

        assert!(table.remove(&outpoint).unwrap());
        assert!(table.get(&outpoint).unwrap().is_none());
        assert!(!table.remove(&outpoint).unwrap());
    }
}
