//! # coindb - Embedded Blockchain Store
//!
//! coindb is an embedded, memory-mapped database for Bitcoin-style
//! blockchains: blocks, transactions, spent outputs, per-address history,
//! and stealth payment indexes, persisted in a directory of grow-only
//! mapped files with indexed lookups suitable for a full-node query
//! interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  ChainDatabase (RwLock + sequence reads)  │
//! ├───────────────────────────────────────────┤
//! │  ChainStore: push / pop / queries         │
//! ├──────────┬──────────┬──────────┬──────────┤
//! │  blocks  │ txs,     │ history  │ stealth  │
//! │  table   │ spends   │ multimap │ shard    │
//! ├──────────┴──────────┴──────────┴──────────┤
//! │  SlabMap / RecordMap / RecordMultimap     │
//! ├───────────────────────────────────────────┤
//! │  SlabManager / RecordManager / DiskArray  │
//! ├───────────────────────────────────────────┤
//! │  MemoryMap (grow-only mmap)               │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Every byte of persistence flows through [`storage::MemoryMap`]. The
//! allocators append; the hash tables chain through bucket heads; commit
//! points are the append cursors, always published after the bytes they
//! make reachable. One writer mutates at a time; readers of the
//! [`ChainDatabase`](chain::ChainDatabase) facade take optimistic
//! snapshots validated by a sequence counter.
//!
//! ## Quick Start
//!
//! ```ignore
//! use coindb::chain::{initialize, StoreSettings};
//!
//! let mut store = initialize("./chain", StoreSettings::default(), &genesis)?;
//! store.push(&block_one)?;
//!
//! let top = store.last_height();
//! let entry = store.transaction(&txid)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: memory map, slab/record allocators, bucket arrays
//! - [`table`]: chained hash tables and the linked record multimap
//! - [`shard`]: height-indexed prefix-scannable log
//! - [`seqlock`]: writer/reader sequence coordination
//! - [`chain`]: the blockchain engine built on all of the above

pub mod chain;
pub mod seqlock;
pub mod shard;
pub mod storage;
pub mod table;

pub use chain::primitives::{
    sha256d, AddressHash, Block, BlockHeader, Hash, InputPoint, OutPoint, Transaction, TxInput,
    TxOutput,
};
pub use chain::{initialize, ChainDatabase, ChainStore, StoreSettings};
pub use seqlock::Sequence;
pub use shard::{BitPrefix, Shard, ShardSettings};
