//! # History Table
//!
//! Per-address output and spend rows in a record multimap: the lookup
//! file maps a 20-byte address hash to its list head, the rows file holds
//! the 49-byte rows:
//!
//! ```text
//! [ kind: u8 ][ point: 36 ][ height: u32 ][ value_or_checksum: u64 ]
//! ```
//!
//! An output row carries the output point and its value; a spend row
//! carries the spending input point and a checksum of the output it
//! consumed. Rows traverse newest first, which lets a block pop undo its
//! own additions with `delete_last`.

use std::path::Path;

use eyre::{bail, ensure, Result};

use crate::storage::EMPTY_RECORD;
use crate::table::RecordMultimap;

use super::primitives::{spend_checksum, AddressHash, InputPoint, OutPoint, ADDRESS_HASH_SIZE};

/// On-disk size of one history row.
pub const HISTORY_ROW_SIZE: usize = 1 + OutPoint::SERIALIZED_SIZE + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Output,
    Spend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRow {
    pub kind: HistoryKind,
    /// Output point for outputs, spending input point for spends.
    pub point: OutPoint,
    pub height: u32,
    /// Output value for outputs, spent-outpoint checksum for spends.
    pub value: u64,
}

impl HistoryRow {
    fn write_to(&self, buf: &mut [u8]) {
        buf[0] = match self.kind {
            HistoryKind::Output => 0,
            HistoryKind::Spend => 1,
        };
        buf[1..37].copy_from_slice(&self.point.to_bytes());
        buf[37..41].copy_from_slice(&self.height.to_le_bytes());
        buf[41..49].copy_from_slice(&self.value.to_le_bytes());
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HISTORY_ROW_SIZE,
            "history row of {} bytes is truncated",
            bytes.len()
        );
        let kind = match bytes[0] {
            0 => HistoryKind::Output,
            1 => HistoryKind::Spend,
            other => bail!("history row kind {} is corrupt", other),
        };
        Ok(Self {
            kind,
            point: OutPoint::from_bytes(&bytes[1..37])?,
            height: u32::from_le_bytes(bytes[37..41].try_into().unwrap()),
            value: u64::from_le_bytes(bytes[41..49].try_into().unwrap()),
        })
    }
}

#[derive(Debug)]
pub struct HistoryTable {
    map: RecordMultimap<ADDRESS_HASH_SIZE>,
}

impl HistoryTable {
    pub fn create<P: AsRef<Path>>(
        lookup_path: P,
        rows_path: P,
        bucket_count: u32,
    ) -> Result<Self> {
        let map = RecordMultimap::create(lookup_path, rows_path, bucket_count, HISTORY_ROW_SIZE)?;
        Ok(Self { map })
    }

    pub fn open<P: AsRef<Path>>(lookup_path: P, rows_path: P) -> Result<Self> {
        let map = RecordMultimap::open(lookup_path, rows_path, HISTORY_ROW_SIZE)?;
        Ok(Self { map })
    }

    pub fn add_output(
        &mut self,
        address: &AddressHash,
        outpoint: &OutPoint,
        height: u32,
        value: u64,
    ) -> Result<()> {
        let row = HistoryRow {
            kind: HistoryKind::Output,
            point: *outpoint,
            height,
            value,
        };
        self.map.add(address, |buf| row.write_to(buf))
    }

    pub fn add_spend(
        &mut self,
        address: &AddressHash,
        previous: &OutPoint,
        spend: &InputPoint,
        height: u32,
    ) -> Result<()> {
        let row = HistoryRow {
            kind: HistoryKind::Spend,
            point: *spend,
            height,
            value: spend_checksum(previous),
        };
        self.map.add(address, |buf| row.write_to(buf))
    }

    /// Every row for `address` at or above `from_height`, newest first.
    pub fn fetch(&self, address: &AddressHash, from_height: u32) -> Result<Vec<HistoryRow>> {
        let mut rows = Vec::new();
        let mut index = self.map.lookup(address)?.unwrap_or(EMPTY_RECORD);
        while index != EMPTY_RECORD {
            let row = HistoryRow::from_bytes(self.map.rows().payload(index)?)?;
            if row.height >= from_height {
                rows.push(row);
            }
            index = self.map.rows().next(index)?;
        }
        Ok(rows)
    }

    /// Removes the newest row for `address`, the undo step for a popped
    /// block. Returns `false` when the address has no rows.
    pub fn delete_last(&mut self, address: &AddressHash) -> Result<bool> {
        self.map.delete_last(address)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.map.sync()
    }
}
