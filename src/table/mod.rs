//! # On-Disk Tables
//!
//! Disk-resident chained hash tables assembled from the storage substrate.
//! Each table owns one [`MemoryMap`](crate::storage::MemoryMap) (two for
//! the multimap) laid out as a bucket array followed by an allocator
//! region:
//!
//! ```text
//! [ DiskArray: bucket heads ][ SlabManager | RecordManager region ]
//! ```
//!
//! - [`SlabMap`]: key to variable-size value, chain nodes in slabs.
//! - [`RecordMap`]: key to fixed-size payload, chain nodes in records,
//!   with in-place update and free-list reclamation.
//! - [`RecordList`]: singly-linked fixed-size nodes in their own file.
//! - [`RecordMultimap`]: many values per key, a `RecordMap` of list heads
//!   over a shared `RecordList`.
//!
//! A store links a new node by writing its `next` pointer before the
//! bucket head, so an interrupted write strands an orphan node and leaves
//! the previous chain fully intact. Keys hash to buckets by fingerprint:
//! the leading key bytes read as a little-endian integer, reduced modulo
//! the bucket count chosen at creation (callers pick a prime to spread
//! fingerprints).

mod multimap;
mod record_list;
mod record_map;
mod slab_map;

pub use multimap::RecordMultimap;
pub use record_list::RecordList;
pub use record_map::RecordMap;
pub use slab_map::SlabMap;

/// Bucket index for a key: leading bytes as a little-endian `u64`,
/// zero-padded, reduced modulo the bucket count.
pub(crate) fn fingerprint_bucket(key: &[u8], bucket_count: u32) -> u32 {
    let mut raw = [0u8; 8];
    let take = key.len().min(8);
    raw[..take].copy_from_slice(&key[..take]);
    (u64::from_le_bytes(raw) % bucket_count as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_uses_leading_bytes_little_endian() {
        let key = [1u8, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF];
        assert_eq!(fingerprint_bucket(&key, 100), 1);

        let key = [0u8, 1, 0, 0, 0, 0, 0, 0];
        assert_eq!(fingerprint_bucket(&key, 1000), 256 % 1000);
    }

    #[test]
    fn fingerprint_handles_short_keys() {
        assert_eq!(fingerprint_bucket(&[7u8, 0, 0, 0], 10), 7);
    }
}
