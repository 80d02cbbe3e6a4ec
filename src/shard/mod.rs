//! # Height Shard
//!
//! A height-addressable append log supporting range scans over a bit
//! prefix of a key, used for stealth payment lookups. Two files:
//!
//! ```text
//! index file: [ entries_end: u64 ][ heights[max_entries]: u64 ... ]
//! data file:  [ entry ][ entry ] ...
//! ```
//!
//! `heights[h]` holds the data-file offset of the entry written for block
//! height `h`; `entries_end` bounds the log and doubles as the truncate
//! pointer. Each entry is:
//!
//! ```text
//! [ row_count: u16 ]
//! [ cumulative[bucket_count]: u16 ... ]
//! [ row_count x ( scan_key[scan_size] || value[row_value_size] ) ]
//! ```
//!
//! Rows are sorted by scan key, compared as raw bytes (so bit order is
//! big-endian, most significant bit first). `cumulative[b]` is the index
//! of the first row whose leading `bucket_bitsize` bits are >= `b`; the
//! buckets past the last row hold `row_count`. A scan therefore jumps
//! straight to its prefix's bucket and touches the matching rows plus one
//! mismatch per entry.
//!
//! Rows are buffered in memory by `add` and written out by `sync(height)`,
//! which publishes `entries_end` as its final write: a crash mid-sync
//! discards the whole entry. `unlink(height)` truncates every entry for
//! heights at or above `height` with a single pointer write, which is how
//! the chain engine drops stealth rows on reorganization.

use std::path::Path;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::storage::{load_u16, load_u64, store_u16, store_u64, MemoryMap};

/// Geometry of a shard, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSettings {
    /// Full key size in bytes before sharding bits are peeled off.
    pub total_key_size: usize,
    /// Leading bits consumed by outer shard routing (not stored here).
    pub sharded_bitsize: usize,
    /// log2 of the per-entry bucket count.
    pub bucket_bitsize: usize,
    /// Bytes of value stored per row.
    pub row_value_size: usize,
    /// Capacity of the height index, fixing the index file size.
    pub max_entries: usize,
}

impl ShardSettings {
    pub fn scan_bitsize(&self) -> usize {
        self.total_key_size * 8 - self.sharded_bitsize
    }

    pub fn scan_size(&self) -> usize {
        (self.scan_bitsize() - 1) / 8 + 1
    }

    pub fn bucket_count(&self) -> usize {
        1 << self.bucket_bitsize
    }

    pub fn row_size(&self) -> usize {
        self.scan_size() + self.row_value_size
    }

    fn entry_header_size(&self) -> usize {
        2 + 2 * self.bucket_count()
    }

    fn index_size(&self) -> u64 {
        8 + 8 * self.max_entries as u64
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.total_key_size * 8 > self.sharded_bitsize,
            "sharded bits {} consume the whole {}-byte key",
            self.sharded_bitsize,
            self.total_key_size
        );
        ensure!(
            self.bucket_bitsize > 0 && self.bucket_bitsize <= 16,
            "bucket bitsize {} outside supported range 1..=16",
            self.bucket_bitsize
        );
        ensure!(self.max_entries > 0, "shard capacity must be nonzero");
        Ok(())
    }
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            total_key_size: 20,
            sharded_bitsize: 8,
            bucket_bitsize: 8,
            row_value_size: 49,
            max_entries: 1_000_000,
        }
    }
}

/// A key prefix of an arbitrary number of leading bits, most significant
/// bit first over raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitPrefix {
    bytes: SmallVec<[u8; 20]>,
    bit_len: usize,
}

impl BitPrefix {
    pub fn new(bytes: &[u8], bit_len: usize) -> Result<Self> {
        ensure!(
            bit_len <= bytes.len() * 8,
            "prefix of {} bits needs more than {} bytes",
            bit_len,
            bytes.len()
        );
        Ok(Self {
            bytes: SmallVec::from_slice(bytes),
            bit_len,
        })
    }

    /// The empty prefix, matching every key.
    pub fn empty() -> Self {
        Self {
            bytes: SmallVec::new(),
            bit_len: 0,
        }
    }

    /// The leading `bit_len` bits of a 32-bit stealth prefix, taken in
    /// big-endian byte order.
    pub fn from_u32(prefix: u32, bit_len: usize) -> Result<Self> {
        Self::new(&prefix.to_be_bytes(), bit_len)
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Whether `key` shares all `bit_len` leading bits with this prefix.
    pub fn matches(&self, key: &[u8]) -> bool {
        debug_assert!(key.len() * 8 >= self.bit_len);
        let full = self.bit_len / 8;
        if self.bytes[..full] != key[..full] {
            return false;
        }
        let rem = self.bit_len % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem);
        (self.bytes[full] ^ key[full]) & mask == 0
    }

    /// The bucket this prefix selects: its leading `bucket_bits` bits,
    /// zero-padded when the prefix is shorter.
    fn bucket(&self, bucket_bits: usize) -> usize {
        leading_bits(&self.bytes, self.bit_len, bucket_bits)
    }
}

/// The first `nbits` bits of `bytes` as an integer, MSB first, reading
/// zeros past `avail_bits`.
fn leading_bits(bytes: &[u8], avail_bits: usize, nbits: usize) -> usize {
    let mut value = 0usize;
    for i in 0..nbits {
        let bit = if i < avail_bits {
            (bytes[i / 8] >> (7 - i % 8)) & 1
        } else {
            0
        };
        value = (value << 1) | bit as usize;
    }
    value
}

#[derive(Debug)]
struct BufferedRow {
    key: SmallVec<[u8; 20]>,
    value: Vec<u8>,
}

#[derive(Debug)]
pub struct Shard {
    index: MemoryMap,
    data: MemoryMap,
    settings: ShardSettings,
    entries_end: u64,
    rows: Vec<BufferedRow>,
}

impl Shard {
    /// Initializes a new shard: zeroed height table, empty log.
    pub fn create<P: AsRef<Path>>(
        index_path: P,
        data_path: P,
        settings: ShardSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let mut index = MemoryMap::open(index_path)?;
        index.resize(settings.index_size())?;
        index
            .slice_mut(0, settings.index_size() as usize)?
            .fill(0);
        index.flush()?;

        let data = MemoryMap::open(data_path)?;
        Ok(Self {
            index,
            data,
            settings,
            entries_end: 0,
            rows: Vec::new(),
        })
    }

    /// Opens an existing shard, reading and validating `entries_end`.
    pub fn open<P: AsRef<Path>>(
        index_path: P,
        data_path: P,
        settings: ShardSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let index = MemoryMap::open(index_path)?;
        ensure!(
            index.size() >= settings.index_size(),
            "shard index file too small for {} heights",
            settings.max_entries
        );

        let data = MemoryMap::open(data_path)?;
        let entries_end = load_u64(index.slice(0, 8)?, 0);
        ensure!(
            entries_end <= data.size(),
            "shard is corrupt: entries_end {} past data size {}",
            entries_end,
            data.size()
        );

        Ok(Self {
            index,
            data,
            settings,
            entries_end,
            rows: Vec::new(),
        })
    }

    pub fn settings(&self) -> &ShardSettings {
        &self.settings
    }

    /// Buffers a row in memory until the next `sync`.
    pub fn add(&mut self, scan_key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(
            scan_key.len() == self.settings.scan_size(),
            "scan key of {} bytes, expected {}",
            scan_key.len(),
            self.settings.scan_size()
        );
        ensure!(
            value.len() == self.settings.row_value_size,
            "row value of {} bytes, expected {}",
            value.len(),
            self.settings.row_value_size
        );
        self.rows.push(BufferedRow {
            key: SmallVec::from_slice(scan_key),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Writes the buffered rows as the entry for `height` and clears the
    /// buffer. `entries_end` is published as the final write, so a crash
    /// anywhere earlier discards the entry wholesale.
    pub fn sync(&mut self, height: usize) -> Result<()> {
        ensure!(
            height < self.settings.max_entries,
            "height {} past shard capacity {}",
            height,
            self.settings.max_entries
        );
        ensure!(
            self.rows.len() <= u16::MAX as usize,
            "{} rows exceed the per-entry limit",
            self.rows.len()
        );

        self.rows.sort_by(|a, b| a.key.cmp(&b.key));

        let settings = self.settings;
        let row_size = settings.row_size();
        let scan_size = settings.scan_size();
        let header_size = settings.entry_header_size();
        let bucket_count = settings.bucket_count();
        let entry_size = header_size + row_size * self.rows.len();

        let required = self.entries_end + entry_size as u64;
        if required > self.data.size() {
            self.data.resize(required + required / 2)?;
        }

        {
            let entry = self.data.slice_mut(self.entries_end, entry_size)?;
            store_u16(entry, 0, self.rows.len() as u16);

            // Each bucket gets the index of its first row; buckets with no
            // rows inherit the next row's index, trailing ones row_count.
            let mut begin = 0usize;
            for (i, row) in self.rows.iter().enumerate() {
                let end = leading_bits(&row.key, scan_size * 8, settings.bucket_bitsize) + 1;
                for bucket in begin..end {
                    store_u16(entry, 2 + 2 * bucket, i as u16);
                }
                begin = end;
            }
            for bucket in begin..bucket_count {
                store_u16(entry, 2 + 2 * bucket, self.rows.len() as u16);
            }

            let mut offset = header_size;
            for row in &self.rows {
                entry[offset..offset + scan_size].copy_from_slice(&row.key);
                entry[offset + scan_size..offset + row_size].copy_from_slice(&row.value);
                offset += row_size;
            }
        }
        self.data.flush()?;

        store_u64(
            self.index.slice_mut(Self::height_slot(height), 8)?,
            0,
            self.entries_end,
        );
        self.entries_end += entry_size as u64;
        store_u64(self.index.slice_mut(0, 8)?, 0, self.entries_end);
        self.index.flush()?;

        self.rows.clear();
        Ok(())
    }

    /// Truncates every entry for heights at or above `height`.
    pub fn unlink(&mut self, height: usize) -> Result<()> {
        ensure!(height > 0, "cannot unlink height 0");
        ensure!(
            height < self.settings.max_entries,
            "height {} past shard capacity {}",
            height,
            self.settings.max_entries
        );

        let previous = self.height_offset(height - 1)?;
        let new_end = previous + self.entry_size_at(previous)? as u64;
        ensure!(
            new_end <= self.entries_end,
            "unlink would extend the log: {} > {}",
            new_end,
            self.entries_end
        );

        self.entries_end = new_end;
        store_u64(self.index.slice_mut(0, 8)?, 0, self.entries_end);
        self.index.flush()
    }

    /// Invokes `read` with the value of every row whose scan key starts
    /// with `prefix`, entry by entry from `from_height` to the end of the
    /// log. The empty prefix visits every row.
    pub fn scan(
        &self,
        prefix: &BitPrefix,
        mut read: impl FnMut(&[u8]) -> Result<()>,
        from_height: usize,
    ) -> Result<()> {
        ensure!(
            prefix.bit_len() <= self.settings.scan_bitsize(),
            "prefix of {} bits exceeds scan key of {} bits",
            prefix.bit_len(),
            self.settings.scan_bitsize()
        );

        if self.entries_end == 0 {
            return Ok(());
        }

        let settings = &self.settings;
        let row_size = settings.row_size();
        let scan_size = settings.scan_size();
        let header_size = settings.entry_header_size();
        let bucket = prefix.bucket(settings.bucket_bitsize);

        let mut entry = self.height_offset(from_height)?;
        while entry < self.entries_end {
            let row_count = load_u16(self.data.slice(entry, 2)?, 0) as usize;
            let entry_size = header_size + row_size * row_count;
            ensure!(
                entry + entry_size as u64 <= self.entries_end,
                "shard entry at {} runs past entries_end {}",
                entry,
                self.entries_end
            );

            let first = load_u16(self.data.slice(entry + 2 + 2 * bucket as u64, 2)?, 0) as usize;
            let rows_sector = entry + header_size as u64;

            for row in first..row_count {
                let row_offset = rows_sector + (row * row_size) as u64;
                let key = self.data.slice(row_offset, scan_size)?;
                if !prefix.matches(key) {
                    break;
                }
                let value = self.data.slice(row_offset + scan_size as u64, row_size - scan_size)?;
                read(value)?;
            }

            entry += entry_size as u64;
        }
        Ok(())
    }

    fn height_slot(height: usize) -> u64 {
        8 + 8 * height as u64
    }

    fn height_offset(&self, height: usize) -> Result<u64> {
        ensure!(
            height < self.settings.max_entries,
            "height {} past shard capacity {}",
            height,
            self.settings.max_entries
        );
        Ok(load_u64(self.index.slice(Self::height_slot(height), 8)?, 0))
    }

    fn entry_size_at(&self, offset: u64) -> Result<usize> {
        let row_count = load_u16(self.data.slice(offset, 2)?, 0) as usize;
        Ok(self.settings.entry_header_size() + self.settings.row_size() * row_count)
    }
}
