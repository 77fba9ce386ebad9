//! Persistent header index: per-hash entries carrying linkage, work and
//! status, the height-to-hash map for the active chain, and the best-block
//! pointer.

use std::fmt;
use std::sync::Arc;

use copperd_consensus::Hash256;
use copperd_primitives::block::BlockHeader;
use copperd_primitives::encoding::{Decoder, Encoder};
use copperd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::blockindex::BlockValidity;
use crate::filemeta::{meta_file_key, parse_meta_file_key, BlockFileInfo};
use crate::flatfiles::FileLocation;

pub const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

const STATUS_VALIDITY_MASK: u8 = 0b0000_0111;
const STATUS_HAVE_DATA: u8 = 0b0000_1000;
const STATUS_HAVE_UNDO: u8 = 0b0001_0000;
const STATUS_FAILED: u8 = 0b0010_0000;
const STATUS_FAILED_PARENT: u8 = 0b0100_0000;

const LOC_BLOCK_PRESENT: u8 = 0b01;
const LOC_UNDO_PRESENT: u8 = 0b10;

#[derive(Debug)]
pub enum IndexError {
    Store(StoreError),
    Corrupt(&'static str),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Store(err) => write!(f, "{err}"),
            IndexError::Corrupt(what) => write!(f, "corrupt index record: {what}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

/// One persisted block-index record, keyed by block hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderEntry {
    pub prev_hash: Hash256,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub chain_work: U256,
    pub validity: BlockValidity,
    pub have_data: bool,
    pub have_undo: bool,
    pub failed: bool,
    pub failed_parent: bool,
    pub sequence_id: u64,
    pub block_file: Option<FileLocation>,
    pub undo_file: Option<FileLocation>,
}

fn work_to_bytes(work: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, limb) in work.0.iter().enumerate() {
        out[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_le_bytes());
    }
    out
}

fn work_from_bytes(bytes: [u8; 32]) -> U256 {
    let mut limbs = [0u64; 4];
    for (i, limb) in limbs.iter_mut().enumerate() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
        *limb = u64::from_le_bytes(raw);
    }
    U256(limbs)
}

impl HeaderEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_bytes(&work_to_bytes(self.chain_work));
        encoder.write_u64_le(self.sequence_id);

        let mut status = self.validity.as_u8() & STATUS_VALIDITY_MASK;
        if self.have_data {
            status |= STATUS_HAVE_DATA;
        }
        if self.have_undo {
            status |= STATUS_HAVE_UNDO;
        }
        if self.failed {
            status |= STATUS_FAILED;
        }
        if self.failed_parent {
            status |= STATUS_FAILED_PARENT;
        }
        encoder.write_u8(status);

        let mut loc_flags = 0u8;
        if self.block_file.is_some() {
            loc_flags |= LOC_BLOCK_PRESENT;
        }
        if self.undo_file.is_some() {
            loc_flags |= LOC_UNDO_PRESENT;
        }
        encoder.write_u8(loc_flags);
        if let Some(loc) = self.block_file {
            encoder.write_bytes(&loc.encode());
        }
        if let Some(loc) = self.undo_file {
            encoder.write_bytes(&loc.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        let corrupt = |_| IndexError::Corrupt("header entry truncated");
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_i32_le().map_err(corrupt)?;
        let time = decoder.read_u32_le().map_err(corrupt)?;
        let bits = decoder.read_u32_le().map_err(corrupt)?;
        let prev_hash = decoder.read_hash_le().map_err(corrupt)?;
        let chain_work = work_from_bytes(decoder.read_fixed::<32>().map_err(corrupt)?);
        let sequence_id = decoder.read_u64_le().map_err(corrupt)?;
        let status = decoder.read_u8().map_err(corrupt)?;
        let loc_flags = decoder.read_u8().map_err(corrupt)?;

        let block_file = if loc_flags & LOC_BLOCK_PRESENT != 0 {
            let raw = decoder.read_fixed::<16>().map_err(corrupt)?;
            Some(
                FileLocation::decode(&raw)
                    .ok_or(IndexError::Corrupt("bad block file location"))?,
            )
        } else {
            None
        };
        let undo_file = if loc_flags & LOC_UNDO_PRESENT != 0 {
            let raw = decoder.read_fixed::<16>().map_err(corrupt)?;
            Some(
                FileLocation::decode(&raw)
                    .ok_or(IndexError::Corrupt("bad undo file location"))?,
            )
        } else {
            None
        };
        if !decoder.is_empty() {
            return Err(IndexError::Corrupt("trailing bytes in header entry"));
        }

        Ok(Self {
            prev_hash,
            version,
            time,
            bits,
            chain_work,
            validity: BlockValidity::from_u8(status & STATUS_VALIDITY_MASK),
            have_data: status & STATUS_HAVE_DATA != 0,
            have_undo: status & STATUS_HAVE_UNDO != 0,
            failed: status & STATUS_FAILED != 0,
            failed_parent: status & STATUS_FAILED_PARENT != 0,
            sequence_id,
            block_file,
            undo_file,
        })
    }
}

fn height_key(height: i32) -> [u8; 4] {
    // Big-endian so a prefix scan yields ascending heights.
    (height as u32).to_be_bytes()
}

/// Typed access to the index columns of the underlying key-value store.
pub struct ChainIndex<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get_entry(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, IndexError> {
        match self.store.get(Column::HeaderIndex, hash)? {
            Some(bytes) => Ok(Some(HeaderEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn scan_entries(&self) -> Result<Vec<(Hash256, HeaderEntry)>, IndexError> {
        let mut entries = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::HeaderIndex, &[])? {
            let hash: Hash256 = key
                .try_into()
                .map_err(|_| IndexError::Corrupt("header index key is not a hash"))?;
            entries.push((hash, HeaderEntry::decode(&value)?));
        }
        Ok(entries)
    }

    pub fn get_raw_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, IndexError> {
        match self.store.get(Column::BlockHeader, hash)? {
            Some(bytes) => {
                let header = BlockHeader::consensus_decode(&bytes)
                    .map_err(|_| IndexError::Corrupt("stored header undecodable"))?;
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    pub fn best_block(&self) -> Result<Option<Hash256>, IndexError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .try_into()
                    .map_err(|_| IndexError::Corrupt("best block record is not a hash"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn hash_at_height(&self, height: i32) -> Result<Option<Hash256>, IndexError> {
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .try_into()
                    .map_err(|_| IndexError::Corrupt("height record is not a hash"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn load_file_meta(&self, prefix: &[u8]) -> Result<Vec<(u32, BlockFileInfo)>, IndexError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::Meta, prefix)? {
            let file_id = match parse_meta_file_key(prefix, &key) {
                Some(file_id) => file_id,
                None => continue,
            };
            let info = BlockFileInfo::decode(&value)
                .ok_or(IndexError::Corrupt("bad file info record"))?;
            out.push((file_id, info));
        }
        Ok(out)
    }

    pub fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.store.write_batch(batch)
    }
}

pub fn stage_entry(batch: &mut WriteBatch, hash: &Hash256, entry: &HeaderEntry) {
    batch.put(Column::HeaderIndex, hash, entry.encode());
}

pub fn stage_raw_header(batch: &mut WriteBatch, hash: &Hash256, header: &BlockHeader) {
    batch.put(Column::BlockHeader, hash, header.consensus_encode());
}

pub fn stage_best_block(batch: &mut WriteBatch, hash: &Hash256) {
    batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
}

pub fn stage_height_hash(batch: &mut WriteBatch, height: i32, hash: &Hash256) {
    batch.put(Column::HeightIndex, height_key(height), hash);
}

pub fn stage_clear_height(batch: &mut WriteBatch, height: i32) {
    batch.delete(Column::HeightIndex, height_key(height));
}

pub fn stage_file_meta(batch: &mut WriteBatch, prefix: &[u8], file_id: u32, info: &BlockFileInfo) {
    batch.put(Column::Meta, meta_file_key(prefix, file_id), info.encode());
}

pub fn stage_remove_file_meta(batch: &mut WriteBatch, prefix: &[u8], file_id: u32) {
    batch.delete(Column::Meta, meta_file_key(prefix, file_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemeta::META_BLOCK_FILE_PREFIX;
    use copperd_storage::memory::MemoryStore;

    fn sample_entry() -> HeaderEntry {
        HeaderEntry {
            prev_hash: [3u8; 32],
            version: 0x2000_0000,
            time: 1_600_000_000,
            bits: 0x1d00_ffff,
            chain_work: U256::from(123_456_789u64) << 64,
            validity: BlockValidity::Scripts,
            have_data: true,
            have_undo: true,
            failed: false,
            failed_parent: false,
            sequence_id: 42,
            block_file: Some(FileLocation {
                file_id: 1,
                offset: 2048,
                len: 512,
            }),
            undo_file: None,
        }
    }

    #[test]
    fn entry_roundtrip() {
        let entry = sample_entry();
        assert_eq!(HeaderEntry::decode(&entry.encode()).expect("decode"), entry);
    }

    #[test]
    fn entry_roundtrip_without_locations() {
        let mut entry = sample_entry();
        entry.block_file = None;
        entry.have_data = false;
        entry.failed = true;
        entry.failed_parent = true;
        assert_eq!(HeaderEntry::decode(&entry.encode()).expect("decode"), entry);
    }

    #[test]
    fn entry_rejects_truncation_and_trailing() {
        let bytes = sample_entry().encode();
        assert!(HeaderEntry::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut extended = bytes;
        extended.push(0);
        assert!(HeaderEntry::decode(&extended).is_err());
    }

    #[test]
    fn work_bytes_roundtrip() {
        for work in [U256::zero(), U256::one(), U256::MAX, U256::from(7u64) << 200] {
            assert_eq!(work_from_bytes(work_to_bytes(work)), work);
        }
    }

    #[test]
    fn index_persists_through_store() {
        let store = Arc::new(MemoryStore::new());
        let index = ChainIndex::new(Arc::clone(&store));
        let hash = [9u8; 32];
        let entry = sample_entry();

        let mut batch = WriteBatch::new();
        stage_entry(&mut batch, &hash, &entry);
        stage_best_block(&mut batch, &hash);
        stage_height_hash(&mut batch, 7, &hash);
        index.commit(&batch).expect("commit");

        assert_eq!(index.get_entry(&hash).expect("get"), Some(entry));
        assert_eq!(index.best_block().expect("best"), Some(hash));
        assert_eq!(index.hash_at_height(7).expect("height"), Some(hash));
        assert_eq!(index.hash_at_height(8).expect("height"), None);
        assert_eq!(index.scan_entries().expect("scan").len(), 1);

        let mut batch = WriteBatch::new();
        stage_clear_height(&mut batch, 7);
        index.commit(&batch).expect("commit");
        assert_eq!(index.hash_at_height(7).expect("height"), None);
    }

    #[test]
    fn file_meta_roundtrip_through_store() {
        let store = Arc::new(MemoryStore::new());
        let index = ChainIndex::new(Arc::clone(&store));
        let mut info = BlockFileInfo::default();
        info.record_block(10, 4096);

        let mut batch = WriteBatch::new();
        stage_file_meta(&mut batch, META_BLOCK_FILE_PREFIX, 0, &info);
        index.commit(&batch).expect("commit");
        assert_eq!(
            index.load_file_meta(META_BLOCK_FILE_PREFIX).expect("load"),
            vec![(0, info)]
        );

        let mut batch = WriteBatch::new();
        stage_remove_file_meta(&mut batch, META_BLOCK_FILE_PREFIX, 0);
        index.commit(&batch).expect("commit");
        assert!(index
            .load_file_meta(META_BLOCK_FILE_PREFIX)
            .expect("load")
            .is_empty());
    }
}
