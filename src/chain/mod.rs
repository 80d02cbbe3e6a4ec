//! # Chain Engine
//!
//! The blockchain database assembled from the substrate tables. A store
//! is a directory of files, one per table, each touched with a single
//! byte before its first map:
//!
//! ```text
//! store_dir/
//! ├── db-lock          # advisory exclusive lock, held for the process
//! ├── blocks_lookup    # block hash -> block row (header, height, txids)
//! ├── blocks_rows      # height -> block row offset
//! ├── spends           # outpoint -> spending input point
//! ├── transactions     # tx hash -> height, index, serialized tx
//! ├── history_lookup   # address hash -> history list head
//! ├── history_rows     # per-address output/spend rows
//! ├── stealth_index    # shard height table
//! └── stealth_rows     # shard entries
//! ```
//!
//! [`ChainStore`] is the single-writer core: `push`/`pop` mutate through
//! `&mut self`, queries through `&self`. [`ChainDatabase`](store::ChainDatabase)
//! wraps it for concurrent use with a write lock and a sequence counter,
//! giving readers optimistic validated snapshots.

mod blocks;
mod history;
pub mod primitives;
mod spends;
mod stealth;
mod store;
mod transactions;

pub use blocks::{BlockRow, BlockTable};
pub use history::{HistoryKind, HistoryRow, HistoryTable, HISTORY_ROW_SIZE};
pub use spends::SpendTable;
pub use stealth::{stealth_shard_settings, StealthRow, StealthTable, STEALTH_ROW_SIZE};
pub use store::{ChainDatabase, ChainStore};
pub use transactions::{TransactionTable, TxEntry};

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};

use crate::shard::ShardSettings;

/// Table sizing, chosen at creation. Bucket counts are persisted in each
/// lookup file's header; primes spread the hash fingerprints.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub block_buckets: u32,
    pub transaction_buckets: u32,
    pub spend_buckets: u32,
    pub history_buckets: u32,
    /// Capacity of the stealth height index.
    pub stealth_max_entries: usize,
    /// Blocks below this height skip per-address history indexing.
    pub history_height: u32,
}

impl StoreSettings {
    pub fn stealth_settings(&self) -> ShardSettings {
        stealth_shard_settings(self.stealth_max_entries)
    }

    /// Small tables for tests and tools that touch a handful of blocks.
    pub fn minimal() -> Self {
        Self {
            block_buckets: 101,
            transaction_buckets: 101,
            spend_buckets: 101,
            history_buckets: 101,
            stealth_max_entries: 1000,
            history_height: 0,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            block_buckets: 100_003,
            transaction_buckets: 400_009,
            spend_buckets: 400_009,
            history_buckets: 100_003,
            stealth_max_entries: 1_000_000,
            history_height: 0,
        }
    }
}

/// The file set of a store directory.
#[derive(Debug, Clone)]
pub struct ChainPaths {
    pub blocks_lookup: PathBuf,
    pub blocks_rows: PathBuf,
    pub spends: PathBuf,
    pub transactions: PathBuf,
    pub history_lookup: PathBuf,
    pub history_rows: PathBuf,
    pub stealth_index: PathBuf,
    pub stealth_rows: PathBuf,
    pub lock: PathBuf,
}

impl ChainPaths {
    pub fn new<P: AsRef<Path>>(prefix: P) -> Self {
        let prefix = prefix.as_ref();
        Self {
            blocks_lookup: prefix.join("blocks_lookup"),
            blocks_rows: prefix.join("blocks_rows"),
            spends: prefix.join("spends"),
            transactions: prefix.join("transactions"),
            history_lookup: prefix.join("history_lookup"),
            history_rows: prefix.join("history_rows"),
            stealth_index: prefix.join("stealth_index"),
            stealth_rows: prefix.join("stealth_rows"),
            lock: prefix.join("db-lock"),
        }
    }

    /// Creates every table file with a single byte so it is mappable.
    pub fn touch_all(&self) -> Result<()> {
        for path in [
            &self.blocks_lookup,
            &self.blocks_rows,
            &self.spends,
            &self.transactions,
            &self.history_lookup,
            &self.history_rows,
            &self.stealth_index,
            &self.stealth_rows,
        ] {
            touch_file(path)?;
        }
        Ok(())
    }
}

fn touch_file(path: &Path) -> Result<()> {
    let mut file = File::create(path)
        .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
    file.write_all(b"H")
        .wrap_err_with(|| format!("failed to touch '{}'", path.display()))?;
    Ok(())
}

/// Advisory exclusive lock on the store directory, held until drop. A
/// second process opening the same store fails fast instead of corrupting
/// it.
#[derive(Debug)]
pub struct DirectoryLock {
    file: File,
}

impl DirectoryLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            ensure!(
                result == 0,
                "store at '{}' is locked by another process",
                path.display()
            );
        }

        Ok(Self { file })
    }
}

#[cfg(unix)]
impl Drop for DirectoryLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Creates the store directory and files, then pushes `genesis` as height
/// zero. The one-time setup step for a new chain.
pub fn initialize<P: AsRef<Path>>(
    prefix: P,
    settings: StoreSettings,
    genesis: &primitives::Block,
) -> Result<ChainStore> {
    fs::create_dir_all(prefix.as_ref()).wrap_err_with(|| {
        format!(
            "failed to create store directory '{}'",
            prefix.as_ref().display()
        )
    })?;
    let mut store = ChainStore::create(prefix, settings)?;
    store.push(genesis)?;
    Ok(store)
}
