//! # Chain Primitives
//!
//! Wire-format types shared by the chain tables: hashes, outpoints, block
//! headers, transactions, and the CompactSize varint they are framed with.
//! All integers are little-endian; deserialization is byte-wise and never
//! casts mmap pointers to integer types.
//!
//! The 80-byte block header is a zerocopy struct so it can be written to
//! and parsed from table rows without an intermediate buffer. Transactions
//! are length-delimited by their own structure, so a serialized tx can be
//! read back out of a longer byte run.

use eyre::{ensure, Result};
use sha2::{Digest, Sha256};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub type Hash = [u8; 32];
pub type AddressHash = [u8; 20];

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_HASH_SIZE: usize = 20;
pub const NULL_HASH: Hash = [0u8; 32];

/// Double SHA-256 as used for txids and block hashes.
pub fn sha256d(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    Digest::update(&mut hasher, data);
    let first = hasher.finalize_reset();
    Digest::update(&mut hasher, first);
    hasher.finalize().into()
}

/// A reference to a transaction output: `(tx hash, output index)`. The
/// same 36-byte layout also serves as an input point (the spending side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

pub type InputPoint = OutPoint;

impl OutPoint {
    pub const SERIALIZED_SIZE: usize = HASH_SIZE + 4;

    pub fn null() -> Self {
        Self {
            hash: NULL_HASH,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH && self.index == u32::MAX
    }

    pub fn to_bytes(&self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut bytes = [0u8; Self::SERIALIZED_SIZE];
        bytes[..HASH_SIZE].copy_from_slice(&self.hash);
        bytes[HASH_SIZE..].copy_from_slice(&self.index.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= Self::SERIALIZED_SIZE,
            "outpoint needs {} bytes, got {}",
            Self::SERIALIZED_SIZE,
            bytes.len()
        );
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes[..HASH_SIZE]);
        let index = u32::from_le_bytes(bytes[HASH_SIZE..HASH_SIZE + 4].try_into().unwrap());
        Ok(Self { hash, index })
    }
}

/// Appends a Bitcoin CompactSize encoding of `value`.
pub fn write_compact(out: &mut Vec<u8>, value: u64) {
    if value < 0xFD {
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(0xFD);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFFFF_FFFF {
        out.push(0xFE);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xFF);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// The number of bytes `write_compact` emits for `value`.
pub fn compact_len(value: u64) -> usize {
    if value < 0xFD {
        1
    } else if value <= 0xFFFF {
        3
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// A byte-wise little-endian reader over a slice.
pub struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            len <= self.data.len() - self.position,
            "truncated read of {} bytes at {} (len {})",
            len,
            self.position,
            self.data.len()
        );
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_compact(&mut self) -> Result<u64> {
        let marker = self.read_bytes(1)?[0];
        let value = match marker {
            0xFD => u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()) as u64,
            0xFE => u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()) as u64,
            0xFF => u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()),
            direct => direct as u64,
        };
        Ok(value)
    }
}

/// The 80-byte block header in wire layout.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct BlockHeader {
    version: U32,
    previous: [u8; 32],
    merkle: [u8; 32],
    timestamp: U32,
    bits: U32,
    nonce: U32,
}

pub const BLOCK_HEADER_SIZE: usize = 80;

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

impl BlockHeader {
    pub fn new(
        version: u32,
        previous: Hash,
        merkle: Hash,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version: U32::new(version),
            previous,
            merkle,
            timestamp: U32::new(timestamp),
            bits: U32::new(bits),
            nonce: U32::new(nonce),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= BLOCK_HEADER_SIZE,
            "block header needs {} bytes, got {}",
            BLOCK_HEADER_SIZE,
            bytes.len()
        );
        Self::read_from_bytes(&bytes[..BLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse block header: {:?}", e))
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn previous(&self) -> &Hash {
        &self.previous
    }

    pub fn merkle(&self) -> &Hash {
        &self.merkle
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp.get()
    }

    pub fn bits(&self) -> u32 {
        self.bits.get()
    }

    pub fn nonce(&self) -> u32 {
        self.nonce.get()
    }

    pub fn hash(&self) -> Hash {
        sha256d(self.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        out.extend_from_slice(&self.version.to_le_bytes());

        write_compact(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(&input.previous_output.to_bytes());
            write_compact(&mut out, input.script.len() as u64);
            out.extend_from_slice(&input.script);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_compact(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_compact(&mut out, output.script.len() as u64);
            out.extend_from_slice(&output.script);
        }

        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + 4;
        size += compact_len(self.inputs.len() as u64);
        for input in &self.inputs {
            size += OutPoint::SERIALIZED_SIZE + compact_len(input.script.len() as u64);
            size += input.script.len() + 4;
        }
        size += compact_len(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8 + compact_len(output.script.len() as u64) + output.script.len();
        }
        size
    }

    /// Reads one transaction; the cursor is left just past it, so a tx
    /// can be pulled out of a longer byte run.
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        let version = cursor.read_u32()?;

        let input_count = cursor.read_compact()?;
        ensure!(input_count <= 100_000, "implausible input count {}", input_count);
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let previous_output = OutPoint::from_bytes(cursor.read_bytes(OutPoint::SERIALIZED_SIZE)?)?;
            let script_len = cursor.read_compact()? as usize;
            let script = cursor.read_bytes(script_len)?.to_vec();
            let sequence = cursor.read_u32()?;
            inputs.push(TxInput {
                previous_output,
                script,
                sequence,
            });
        }

        let output_count = cursor.read_compact()?;
        ensure!(output_count <= 100_000, "implausible output count {}", output_count);
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = cursor.read_u64()?;
            let script_len = cursor.read_compact()? as usize;
            let script = cursor.read_bytes(script_len)?.to_vec();
            outputs.push(TxOutput { value, script });
        }

        let locktime = cursor.read_u32()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Self::read(&mut cursor)
    }

    pub fn hash(&self) -> Hash {
        sha256d(&self.to_bytes())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.header.as_bytes());
        write_compact(&mut out, self.transactions.len() as u64);
        for tx in &self.transactions {
            out.extend_from_slice(&tx.to_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let header = BlockHeader::from_bytes(cursor.read_bytes(BLOCK_HEADER_SIZE)?)?;
        let tx_count = cursor.read_compact()?;
        ensure!(tx_count <= 1_000_000, "implausible transaction count {}", tx_count);
        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::read(&mut cursor)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xA9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xAC;
const OP_RETURN: u8 = 0x6A;

/// The 20-byte address hash of a standard output script, when the script
/// is pay-to-pubkey-hash or pay-to-script-hash. Anything else yields
/// `None`: unrecognized scripts simply produce no history rows.
pub fn extract_address_hash(script: &[u8]) -> Option<AddressHash> {
    // P2PKH: DUP HASH160 <20> EQUALVERIFY CHECKSIG
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return Some(script[3..23].try_into().unwrap());
    }
    // P2SH: HASH160 <20> EQUAL
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        return Some(script[2..22].try_into().unwrap());
    }
    None
}

/// Stealth metadata carried in an OP_RETURN output: a 32-bit prefix
/// followed by the 32-byte unsigned ephemeral key.
pub fn extract_stealth_metadata(script: &[u8]) -> Option<(u32, Hash)> {
    if script.len() < 2 || script[0] != OP_RETURN {
        return None;
    }
    let push_len = script[1] as usize;
    if push_len < 36 || script.len() < 2 + push_len {
        return None;
    }
    let data = &script[2..2 + push_len];
    let prefix = u32::from_le_bytes(data[..4].try_into().unwrap());
    let mut ephemeral = [0u8; HASH_SIZE];
    ephemeral.copy_from_slice(&data[4..36]);
    Some((prefix, ephemeral))
}

/// Builds a P2PKH output script for `hash`. Used by tests and tools to
/// fabricate standard outputs.
pub fn p2pkh_script(hash: &AddressHash) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Builds an OP_RETURN stealth metadata script.
pub fn stealth_script(prefix: u32, ephemeral: &Hash) -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + 36);
    script.push(OP_RETURN);
    script.push(36);
    script.extend_from_slice(&prefix.to_le_bytes());
    script.extend_from_slice(ephemeral);
    script
}

/// A checksum standing in for the spent output in a history spend row,
/// folding the outpoint into 8 bytes.
pub fn spend_checksum(point: &OutPoint) -> u64 {
    u64::from_le_bytes(point.hash[..8].try_into().unwrap()) ^ point.index as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    hash: [7u8; 32],
                    index: 3,
                },
                script: vec![0xAA, 0xBB],
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![
                TxOutput {
                    value: 50_000,
                    script: p2pkh_script(&[1u8; 20]),
                },
                TxOutput {
                    value: 7,
                    script: vec![],
                },
            ],
            locktime: 0,
        }
    }

    #[test]
    fn compact_size_boundaries() {
        for value in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, 0x1_0000_0000] {
            let mut out = Vec::new();
            write_compact(&mut out, value);
            assert_eq!(out.len(), compact_len(value));

            let mut cursor = Cursor::new(&out);
            assert_eq!(cursor.read_compact().unwrap(), value);
            assert_eq!(cursor.position(), out.len());
        }
    }

    #[test]
    fn outpoint_roundtrips() {
        let point = OutPoint {
            hash: [0xCD; 32],
            index: 42,
        };
        let bytes = point.to_bytes();
        assert_eq!(OutPoint::from_bytes(&bytes).unwrap(), point);
        assert!(OutPoint::null().is_null());
        assert!(!point.is_null());
    }

    #[test]
    fn block_header_is_80_wire_bytes() {
        assert_eq!(std::mem::size_of::<BlockHeader>(), 80);

        let header = BlockHeader::new(2, [1; 32], [2; 32], 1_234_567, 0x1D00_FFFF, 99);
        let parsed = BlockHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.version(), 2);
        assert_eq!(parsed.timestamp(), 1_234_567);
        assert_eq!(parsed.nonce(), 99);
    }

    #[test]
    fn transaction_roundtrips_byte_for_byte() {
        let tx = sample_tx();
        let bytes = tx.to_bytes();
        assert_eq!(bytes.len(), tx.serialized_size());

        let parsed = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn transaction_reads_out_of_longer_run() {
        let tx = sample_tx();
        let mut bytes = tx.to_bytes();
        let tx_len = bytes.len();
        bytes.extend_from_slice(b"trailing garbage");

        let mut cursor = Cursor::new(&bytes);
        let parsed = Transaction::read(&mut cursor).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(cursor.position(), tx_len);
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.inputs[0].previous_output = OutPoint::null();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn hashing_is_deterministic_and_double() {
        let tx = sample_tx();
        assert_eq!(tx.hash(), tx.hash());
        assert_ne!(tx.hash(), sha256d(b"something else"));

        let single: Hash = {
            let mut hasher = Sha256::new();
            Digest::update(&mut hasher, tx.to_bytes());
            hasher.finalize().into()
        };
        assert_ne!(tx.hash(), single);
    }

    #[test]
    fn address_extraction_recognizes_standard_scripts() {
        let hash = [9u8; 20];
        assert_eq!(extract_address_hash(&p2pkh_script(&hash)), Some(hash));

        let mut p2sh = vec![OP_HASH160, 20];
        p2sh.extend_from_slice(&hash);
        p2sh.push(OP_EQUAL);
        assert_eq!(extract_address_hash(&p2sh), Some(hash));

        assert_eq!(extract_address_hash(&[OP_RETURN, 0]), None);
        assert_eq!(extract_address_hash(&[]), None);
    }

    #[test]
    fn stealth_metadata_roundtrips() {
        let ephemeral = [0x5Au8; 32];
        let script = stealth_script(0xDEAD_BEEF, &ephemeral);
        assert_eq!(
            extract_stealth_metadata(&script),
            Some((0xDEAD_BEEF, ephemeral))
        );

        assert_eq!(extract_stealth_metadata(&p2pkh_script(&[1; 20])), None);
        assert_eq!(extract_stealth_metadata(&[OP_RETURN, 4, 1, 2, 3, 4]), None);
    }

    #[test]
    fn block_roundtrips() {
        let block = Block {
            header: BlockHeader::new(1, NULL_HASH, [3; 32], 1000, 0x207F_FFFF, 0),
            transactions: vec![sample_tx(), sample_tx()],
        };
        let parsed = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(parsed, block);
    }
}
