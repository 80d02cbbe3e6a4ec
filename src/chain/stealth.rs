//! # Stealth Table
//!
//! Stealth payment rows in a height shard, scannable by a bit prefix of
//! the 32-bit stealth prefix key. The row value is 84 bytes:
//!
//! ```text
//! [ ephemeral_key: 32 ][ address_hash: 20 ][ tx_hash: 32 ]
//! ```
//!
//! The scan key is the prefix in big-endian byte order, so prefix bits
//! compare most significant first. One entry is written per block height;
//! a chain reorganization truncates with `unlink`.

use std::path::Path;

use eyre::{ensure, Result};

use crate::shard::{BitPrefix, Shard, ShardSettings};

use super::primitives::{AddressHash, Hash, ADDRESS_HASH_SIZE, HASH_SIZE};

/// On-disk size of one stealth row value.
pub const STEALTH_ROW_SIZE: usize = HASH_SIZE + ADDRESS_HASH_SIZE + HASH_SIZE;

/// Shard geometry for the stealth index: 4-byte scan keys, no outer
/// sharding, 256 buckets per entry.
pub fn stealth_shard_settings(max_entries: usize) -> ShardSettings {
    ShardSettings {
        total_key_size: 4,
        sharded_bitsize: 0,
        bucket_bitsize: 8,
        row_value_size: STEALTH_ROW_SIZE,
        max_entries,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthRow {
    pub ephemeral_key: Hash,
    pub address_hash: AddressHash,
    pub tx_hash: Hash,
}

impl StealthRow {
    fn to_bytes(self) -> [u8; STEALTH_ROW_SIZE] {
        let mut bytes = [0u8; STEALTH_ROW_SIZE];
        bytes[..32].copy_from_slice(&self.ephemeral_key);
        bytes[32..52].copy_from_slice(&self.address_hash);
        bytes[52..].copy_from_slice(&self.tx_hash);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= STEALTH_ROW_SIZE,
            "stealth row of {} bytes is truncated",
            bytes.len()
        );
        let mut row = Self {
            ephemeral_key: [0; 32],
            address_hash: [0; 20],
            tx_hash: [0; 32],
        };
        row.ephemeral_key.copy_from_slice(&bytes[..32]);
        row.address_hash.copy_from_slice(&bytes[32..52]);
        row.tx_hash.copy_from_slice(&bytes[52..STEALTH_ROW_SIZE]);
        Ok(row)
    }
}

#[derive(Debug)]
pub struct StealthTable {
    shard: Shard,
}

impl StealthTable {
    pub fn create<P: AsRef<Path>>(
        index_path: P,
        rows_path: P,
        max_entries: usize,
    ) -> Result<Self> {
        let shard = Shard::create(index_path, rows_path, stealth_shard_settings(max_entries))?;
        Ok(Self { shard })
    }

    pub fn open<P: AsRef<Path>>(index_path: P, rows_path: P, max_entries: usize) -> Result<Self> {
        let shard = Shard::open(index_path, rows_path, stealth_shard_settings(max_entries))?;
        Ok(Self { shard })
    }

    /// Buffers a row under `prefix` for the next `sync`.
    pub fn store(&mut self, prefix: u32, row: &StealthRow) -> Result<()> {
        self.shard.add(&prefix.to_be_bytes(), &row.to_bytes())
    }

    /// Writes the buffered rows as the entry for `height`.
    pub fn sync(&mut self, height: usize) -> Result<()> {
        self.shard.sync(height)
    }

    /// Drops every row at or above `height`.
    pub fn unlink(&mut self, height: usize) -> Result<()> {
        self.shard.unlink(height)
    }

    /// Every row from `from_height` on whose prefix key starts with
    /// `prefix`.
    pub fn scan(&self, prefix: &BitPrefix, from_height: usize) -> Result<Vec<StealthRow>> {
        let mut rows = Vec::new();
        self.shard.scan(
            prefix,
            |value| {
                rows.push(StealthRow::from_bytes(value)?);
                Ok(())
            },
            from_height,
        )?;
        Ok(rows)
    }
}
