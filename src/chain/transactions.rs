//! # Transaction Table
//!
//! Transactions by hash in a slab hash file. The slab value is
//! `[ height: u32 ][ index: u32 ][ serialized tx ]`; the transaction's
//! own framing delimits it inside the variable-size slab.

use std::path::Path;

use eyre::Result;

use crate::storage::{load_u32, store_u32};
use crate::table::SlabMap;

use super::primitives::{Hash, Transaction, HASH_SIZE};

/// A stored transaction with its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    pub height: u32,
    pub index: u32,
    pub transaction: Transaction,
}

#[derive(Debug)]
pub struct TransactionTable {
    map: SlabMap<HASH_SIZE>,
}

impl TransactionTable {
    pub fn create<P: AsRef<Path>>(path: P, bucket_count: u32) -> Result<Self> {
        let map = SlabMap::create(path, bucket_count)?;
        Ok(Self { map })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let map = SlabMap::open(path)?;
        Ok(Self { map })
    }

    /// Stores `tx` at its chain position and returns its hash.
    pub fn store(&mut self, height: u32, index: u32, tx: &Transaction) -> Result<Hash> {
        let bytes = tx.to_bytes();
        let hash = super::primitives::sha256d(&bytes);
        self.map.store(&hash, 8 + bytes.len(), |value| {
            store_u32(value, 0, height);
            store_u32(value, 4, index);
            value[8..].copy_from_slice(&bytes);
        })?;
        Ok(hash)
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<TxEntry>> {
        match self.map.get(hash)? {
            Some(value) => {
                let height = load_u32(value, 0);
                let index = load_u32(value, 4);
                let transaction = Transaction::from_bytes(&value[8..])?;
                Ok(Some(TxEntry {
                    height,
                    index,
                    transaction,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&mut self, hash: &Hash) -> Result<bool> {
        self.map.unlink(hash)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.map.sync()
    }
}
