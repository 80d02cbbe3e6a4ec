//! # Block Table
//!
//! Two files. `blocks_lookup` is a slab hash keyed by block hash; the
//! slab value is the block row:
//!
//! ```text
//! [ header: 80 ][ height: u32 ][ tx_count: u32 ][ txid: 32 ] ...
//! ```
//!
//! `blocks_rows` is a record file of 8-byte slots indexed by height, each
//! holding the offset of that height's row in the lookup file. The record
//! count doubles as the chain length, so the top of the chain is
//! `count - 1` and a pop is a one-slot truncate.

use std::path::Path;

use eyre::{ensure, Result};

use crate::storage::{load_u32, load_u64, store_u32, store_u64, MemoryMap, RecordManager};
use crate::table::SlabMap;

use super::primitives::{Block, BlockHeader, Hash, BLOCK_HEADER_SIZE, HASH_SIZE};

/// A stored block: header plus the txids in block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub header: BlockHeader,
    pub height: u32,
    pub tx_hashes: Vec<Hash>,
}

#[derive(Debug)]
pub struct BlockTable {
    lookup: SlabMap<HASH_SIZE>,
    rows_file: MemoryMap,
    rows: RecordManager,
}

impl BlockTable {
    pub fn create<P: AsRef<Path>>(
        lookup_path: P,
        rows_path: P,
        bucket_count: u32,
    ) -> Result<Self> {
        let lookup = SlabMap::create(lookup_path, bucket_count)?;
        let mut rows_file = MemoryMap::open(rows_path)?;
        let rows = RecordManager::create(&mut rows_file, 0, 8)?;
        Ok(Self {
            lookup,
            rows_file,
            rows,
        })
    }

    pub fn open<P: AsRef<Path>>(lookup_path: P, rows_path: P) -> Result<Self> {
        let lookup = SlabMap::open(lookup_path)?;
        let rows_file = MemoryMap::open(rows_path)?;
        let rows = RecordManager::open(&rows_file, 0, 8)?;
        Ok(Self {
            lookup,
            rows_file,
            rows,
        })
    }

    /// The height of the chain top, or `None` for an empty store.
    pub fn last_height(&self) -> Option<u32> {
        self.rows.count().checked_sub(1)
    }

    /// Appends `block` at the next height and returns it.
    pub fn store(&mut self, block: &Block) -> Result<u32> {
        let height = self.rows.count();
        let hash = block.header.hash();

        let tx_count = block.transactions.len();
        let row_size = BLOCK_HEADER_SIZE + 4 + 4 + tx_count * HASH_SIZE;
        let offset = self.lookup.store(&hash, row_size, |row| {
            row[..BLOCK_HEADER_SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&block.header));
            store_u32(row, BLOCK_HEADER_SIZE, height);
            store_u32(row, BLOCK_HEADER_SIZE + 4, tx_count as u32);
            let mut at = BLOCK_HEADER_SIZE + 8;
            for tx in &block.transactions {
                row[at..at + HASH_SIZE].copy_from_slice(&tx.hash());
                at += HASH_SIZE;
            }
        })?;

        let index = self.rows.allocate(&mut self.rows_file)?;
        debug_assert_eq!(index, height);
        store_u64(self.rows.record_mut(&mut self.rows_file, index)?, 0, offset);
        Ok(height)
    }

    /// The row stored at `height`, or `None` past the chain top.
    pub fn get(&self, height: u32) -> Result<Option<BlockRow>> {
        if height >= self.rows.count() {
            return Ok(None);
        }
        let offset = load_u64(self.rows.record(&self.rows_file, height)?, 0);
        let row = parse_row(self.lookup.value_at(offset)?)?;
        ensure!(
            row.height == height,
            "block row at height {} claims height {}",
            height,
            row.height
        );
        Ok(Some(row))
    }

    /// The row for the block with `hash`, or `None`. Rows whose height
    /// was truncated by `unlink` are no longer reachable.
    pub fn get_by_hash(&self, hash: &Hash) -> Result<Option<BlockRow>> {
        match self.lookup.get(hash)? {
            Some(bytes) => {
                let row = parse_row(bytes)?;
                if row.height >= self.rows.count() {
                    return Ok(None);
                }
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Removes the top block, which must sit at `height`. The height
    /// index shrinks by one and the hash entry is unlinked; the row's
    /// slab bytes are abandoned.
    pub fn unlink(&mut self, height: u32) -> Result<()> {
        ensure!(
            self.last_height() == Some(height),
            "can only unlink the chain top, not height {}",
            height
        );
        let row = self
            .get(height)?
            .ok_or_else(|| eyre::eyre!("chain top row missing at height {}", height))?;
        let hash = row.header.hash();
        self.rows.truncate(height)?;
        let unlinked = self.lookup.unlink(&hash)?;
        ensure!(unlinked, "block hash entry missing during unlink");
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.lookup.sync()?;
        self.rows.sync(&mut self.rows_file)
    }
}

fn parse_row(bytes: &[u8]) -> Result<BlockRow> {
    ensure!(
        bytes.len() >= BLOCK_HEADER_SIZE + 8,
        "block row of {} bytes is truncated",
        bytes.len()
    );
    let header = BlockHeader::from_bytes(&bytes[..BLOCK_HEADER_SIZE])?;
    let height = load_u32(bytes, BLOCK_HEADER_SIZE);
    let tx_count = load_u32(bytes, BLOCK_HEADER_SIZE + 4) as usize;

    let hashes_at = BLOCK_HEADER_SIZE + 8;
    ensure!(
        bytes.len() >= hashes_at + tx_count * HASH_SIZE,
        "block row advertises {} transactions but holds {} bytes",
        tx_count,
        bytes.len()
    );

    let mut tx_hashes = Vec::with_capacity(tx_count);
    for i in 0..tx_count {
        let at = hashes_at + i * HASH_SIZE;
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes[at..at + HASH_SIZE]);
        tx_hashes.push(hash);
    }

    Ok(BlockRow {
        header,
        height,
        tx_hashes,
    })
}
