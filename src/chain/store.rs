//! # Chain Store
//!
//! `ChainStore` binds the five tables into the push/pop engine. A push
//! writes every sub-table row, syncs the sub-tables, and syncs the block
//! table last: a crash in between leaves the block header absent, so on
//! restart the block is re-downloaded and re-pushed over the orphaned
//! rows. A pop undoes a push in reverse transaction order and truncates
//! the stealth shard and height index.
//!
//! `ChainDatabase` is the concurrent facade: mutations run on one writer
//! at a time behind a write lock inside a sequence write section, reads
//! take optimistic snapshots and retry when a write intervened.

use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::seqlock::Sequence;
use crate::shard::BitPrefix;

use super::primitives::{
    extract_address_hash, extract_stealth_metadata, AddressHash, Block, Hash, InputPoint,
    OutPoint, TxInput, TxOutput,
};
use super::{
    BlockRow, BlockTable, ChainPaths, DirectoryLock, HistoryRow, HistoryTable, SpendTable,
    StealthRow, StealthTable, StoreSettings, TransactionTable, TxEntry,
};

pub struct ChainStore {
    _lock: DirectoryLock,
    settings: StoreSettings,
    blocks: BlockTable,
    spends: SpendTable,
    transactions: TransactionTable,
    history: HistoryTable,
    stealth: StealthTable,
}

impl ChainStore {
    /// Creates a store in an existing directory, touching and laying out
    /// every table file. Destroys any previous contents.
    pub fn create<P: AsRef<Path>>(prefix: P, settings: StoreSettings) -> Result<Self> {
        let paths = ChainPaths::new(&prefix);
        paths.touch_all()?;
        let lock = DirectoryLock::acquire(&paths.lock)?;

        let store = Self {
            _lock: lock,
            settings,
            blocks: BlockTable::create(
                &paths.blocks_lookup,
                &paths.blocks_rows,
                settings.block_buckets,
            )?,
            spends: SpendTable::create(&paths.spends, settings.spend_buckets)?,
            transactions: TransactionTable::create(
                &paths.transactions,
                settings.transaction_buckets,
            )?,
            history: HistoryTable::create(
                &paths.history_lookup,
                &paths.history_rows,
                settings.history_buckets,
            )?,
            stealth: StealthTable::create(
                &paths.stealth_index,
                &paths.stealth_rows,
                settings.stealth_max_entries,
            )?,
        };
        info!(path = %prefix.as_ref().display(), "created chain store");
        Ok(store)
    }

    /// Opens an existing store, acquiring its directory lock.
    pub fn open<P: AsRef<Path>>(prefix: P, settings: StoreSettings) -> Result<Self> {
        let paths = ChainPaths::new(&prefix);
        let lock = DirectoryLock::acquire(&paths.lock)?;

        let store = Self {
            _lock: lock,
            settings,
            blocks: BlockTable::open(&paths.blocks_lookup, &paths.blocks_rows)?,
            spends: SpendTable::open(&paths.spends)?,
            transactions: TransactionTable::open(&paths.transactions)?,
            history: HistoryTable::open(&paths.history_lookup, &paths.history_rows)?,
            stealth: StealthTable::open(
                &paths.stealth_index,
                &paths.stealth_rows,
                settings.stealth_max_entries,
            )?,
        };
        info!(
            path = %prefix.as_ref().display(),
            height = ?store.last_height(),
            "opened chain store"
        );
        Ok(store)
    }

    /// The height of the chain top, `None` before the genesis push.
    pub fn last_height(&self) -> Option<u32> {
        self.blocks.last_height()
    }

    /// Appends `block` on top of the chain. Sub-tables sync before the
    /// block table so a crash never publishes a block whose rows are
    /// incomplete.
    pub fn push(&mut self, block: &Block) -> Result<u32> {
        let height = match self.blocks.last_height() {
            Some(top) => top + 1,
            None => 0,
        };

        for (index, tx) in block.transactions.iter().enumerate() {
            let tx_hash = tx.hash();

            if !tx.is_coinbase() {
                self.push_inputs(&tx_hash, height, &tx.inputs)?;
            }
            self.push_outputs(&tx_hash, height, &tx.outputs)?;
            self.push_stealth_outputs(&tx_hash, &tx.outputs)?;

            self.transactions.store(height, index as u32, tx)?;
        }

        self.blocks.store(block)?;

        self.spends.sync()?;
        self.transactions.sync()?;
        self.history.sync()?;
        self.stealth.sync(height as usize)?;
        self.blocks.sync()?;

        debug!(height, txs = block.transactions.len(), "pushed block");
        Ok(height)
    }

    /// Removes and returns the top block, byte-identical to what was
    /// pushed. Every sub-table row the block added is removed.
    pub fn pop(&mut self) -> Result<Block> {
        let height = self
            .last_height()
            .ok_or_else(|| eyre!("cannot pop an empty chain"))?;
        ensure!(height > 0, "cannot pop the genesis block");

        let row = self
            .blocks
            .get(height)?
            .ok_or_else(|| eyre!("chain top row missing at height {}", height))?;

        let mut transactions = Vec::with_capacity(row.tx_hashes.len());
        for (index, tx_hash) in row.tx_hashes.iter().enumerate().rev() {
            let entry = self
                .transactions
                .get(tx_hash)?
                .ok_or_else(|| eyre!("transaction missing for popped block"))?;
            ensure!(
                entry.height == height && entry.index as usize == index,
                "transaction at height {} index {} found at {} index {}",
                height,
                index,
                entry.height,
                entry.index
            );
            let tx = entry.transaction;

            self.transactions.remove(tx_hash)?;
            self.pop_outputs(height, &tx.outputs)?;
            if !tx.is_coinbase() {
                self.pop_inputs(height, &tx.inputs)?;
            }
            transactions.push(tx);
        }
        transactions.reverse();

        self.stealth.unlink(height as usize)?;
        self.blocks.unlink(height)?;

        self.spends.sync()?;
        self.transactions.sync()?;
        self.history.sync()?;
        self.blocks.sync()?;

        debug!(height, "popped block");
        Ok(Block {
            header: row.header,
            transactions,
        })
    }

    pub fn block_by_height(&self, height: u32) -> Result<Option<BlockRow>> {
        self.blocks.get(height)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<BlockRow>> {
        self.blocks.get_by_hash(hash)
    }

    pub fn transaction(&self, hash: &Hash) -> Result<Option<TxEntry>> {
        self.transactions.get(hash)
    }

    /// The input point spending `outpoint`, or `None` while unspent.
    pub fn spend(&self, outpoint: &OutPoint) -> Result<Option<InputPoint>> {
        self.spends.get(outpoint)
    }

    /// Output and spend rows for an address, newest first.
    pub fn history(&self, address: &AddressHash, from_height: u32) -> Result<Vec<HistoryRow>> {
        self.history.fetch(address, from_height)
    }

    /// Stealth rows whose prefix key starts with `prefix`.
    pub fn stealth(&self, prefix: &BitPrefix, from_height: usize) -> Result<Vec<StealthRow>> {
        self.stealth.scan(prefix, from_height)
    }

    fn push_inputs(&mut self, tx_hash: &Hash, height: u32, inputs: &[TxInput]) -> Result<()> {
        for (index, input) in inputs.iter().enumerate() {
            let spend = InputPoint {
                hash: *tx_hash,
                index: index as u32,
            };
            self.spends.store(&input.previous_output, &spend)?;

            if height < self.settings.history_height {
                continue;
            }
            if let Some(address) = extract_address_hash(&input.script) {
                self.history
                    .add_spend(&address, &input.previous_output, &spend, height)?;
            }
        }
        Ok(())
    }

    fn push_outputs(&mut self, tx_hash: &Hash, height: u32, outputs: &[TxOutput]) -> Result<()> {
        if height < self.settings.history_height {
            return Ok(());
        }
        for (index, output) in outputs.iter().enumerate() {
            let outpoint = OutPoint {
                hash: *tx_hash,
                index: index as u32,
            };
            if let Some(address) = extract_address_hash(&output.script) {
                self.history
                    .add_output(&address, &outpoint, height, output.value)?;
            }
        }
        Ok(())
    }

    /// A stealth payment is an OP_RETURN metadata output immediately
    /// followed by the paying output, so the last output cannot start one.
    fn push_stealth_outputs(&mut self, tx_hash: &Hash, outputs: &[TxOutput]) -> Result<()> {
        for index in 0..outputs.len().saturating_sub(1) {
            let Some((prefix, ephemeral_key)) = extract_stealth_metadata(&outputs[index].script)
            else {
                continue;
            };
            let Some(address_hash) = extract_address_hash(&outputs[index + 1].script) else {
                continue;
            };
            self.stealth.store(
                prefix,
                &StealthRow {
                    ephemeral_key,
                    address_hash,
                    tx_hash: *tx_hash,
                },
            )?;
        }
        Ok(())
    }

    fn pop_inputs(&mut self, height: u32, inputs: &[TxInput]) -> Result<()> {
        for input in inputs.iter().rev() {
            self.spends.remove(&input.previous_output)?;

            if height < self.settings.history_height {
                continue;
            }
            if let Some(address) = extract_address_hash(&input.script) {
                self.history.delete_last(&address)?;
            }
        }
        Ok(())
    }

    fn pop_outputs(&mut self, height: u32, outputs: &[TxOutput]) -> Result<()> {
        if height < self.settings.history_height {
            return Ok(());
        }
        for output in outputs.iter().rev() {
            if let Some(address) = extract_address_hash(&output.script) {
                self.history.delete_last(&address)?;
            }
        }
        Ok(())
    }
}

/// Thread-safe handle over a [`ChainStore`]: one writer at a time, readers
/// validated by the sequence counter and retried when a write intervenes.
#[derive(Clone)]
pub struct ChainDatabase {
    shared: Arc<Shared>,
}

struct Shared {
    store: RwLock<ChainStore>,
    sequence: Sequence,
}

impl ChainDatabase {
    pub fn create<P: AsRef<Path>>(prefix: P, settings: StoreSettings) -> Result<Self> {
        Ok(Self::wrap(ChainStore::create(prefix, settings)?))
    }

    pub fn open<P: AsRef<Path>>(prefix: P, settings: StoreSettings) -> Result<Self> {
        Ok(Self::wrap(ChainStore::open(prefix, settings)?))
    }

    fn wrap(store: ChainStore) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: RwLock::new(store),
                sequence: Sequence::new(),
            }),
        }
    }

    pub fn push(&self, block: &Block) -> Result<u32> {
        let mut store = self.shared.store.write();
        let _scope = self.shared.sequence.write_scope();
        store.push(block)
    }

    pub fn pop(&self) -> Result<Block> {
        let mut store = self.shared.store.write();
        let _scope = self.shared.sequence.write_scope();
        store.pop()
    }

    pub fn fetch_last_height(&self) -> Option<u32> {
        self.read(|store| store.last_height())
    }

    pub fn fetch_block_by_height(&self, height: u32) -> Result<Option<BlockRow>> {
        self.read(|store| store.block_by_height(height))
    }

    pub fn fetch_block_by_hash(&self, hash: &Hash) -> Result<Option<BlockRow>> {
        self.read(|store| store.block_by_hash(hash))
    }

    pub fn fetch_transaction(&self, hash: &Hash) -> Result<Option<TxEntry>> {
        self.read(|store| store.transaction(hash))
    }

    pub fn fetch_spend(&self, outpoint: &OutPoint) -> Result<Option<InputPoint>> {
        self.read(|store| store.spend(outpoint))
    }

    pub fn fetch_history(
        &self,
        address: &AddressHash,
        from_height: u32,
    ) -> Result<Vec<HistoryRow>> {
        self.read(|store| store.history(address, from_height))
    }

    pub fn fetch_stealth(
        &self,
        prefix: &BitPrefix,
        from_height: usize,
    ) -> Result<Vec<StealthRow>> {
        self.read(|store| store.stealth(prefix, from_height))
    }

    fn read<R>(&self, read: impl Fn(&ChainStore) -> R) -> R {
        self.shared.sequence.read_retry(|| {
            let store = self.shared.store.read();
            read(&store)
        })
    }
}
