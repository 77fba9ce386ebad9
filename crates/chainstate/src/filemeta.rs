//! Per-file accounting for the block and undo flat files: which heights a
//! file covers and how big it is. Pruning decisions are made against this
//! registry rather than by re-reading the files.

use std::collections::BTreeMap;

use copperd_primitives::encoding::{Decoder, Encoder};

pub const META_BLOCK_FILE_PREFIX: &[u8] = b"files:block:";
pub const META_UNDO_FILE_PREFIX: &[u8] = b"files:undo:";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    pub size: u64,
    pub height_first: i32,
    pub height_last: i32,
}

impl BlockFileInfo {
    pub fn record_block(&mut self, height: i32, record_size: u64) {
        if self.blocks == 0 {
            self.height_first = height;
            self.height_last = height;
        } else {
            self.height_first = self.height_first.min(height);
            self.height_last = self.height_last.max(height);
        }
        self.blocks += 1;
        self.size += record_size;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let blocks = decoder.read_u32_le().ok()?;
        let size = decoder.read_u64_le().ok()?;
        let height_first = decoder.read_i32_le().ok()?;
        let height_last = decoder.read_i32_le().ok()?;
        if !decoder.is_empty() {
            return None;
        }
        Some(Self {
            blocks,
            size,
            height_first,
            height_last,
        })
    }
}

pub fn meta_file_key(prefix: &[u8], file_id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 4);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&file_id.to_le_bytes());
    key
}

pub fn parse_meta_file_key(prefix: &[u8], key: &[u8]) -> Option<u32> {
    if key.len() != prefix.len() + 4 || !key.starts_with(prefix) {
        return None;
    }
    let mut id_bytes = [0u8; 4];
    id_bytes.copy_from_slice(&key[prefix.len()..]);
    Some(u32::from_le_bytes(id_bytes))
}

/// In-memory registry over one family of flat files (block or undo).
#[derive(Default)]
pub struct FileMetaRegistry {
    files: BTreeMap<u32, BlockFileInfo>,
}

impl FileMetaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (u32, BlockFileInfo)>) -> Self {
        Self {
            files: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, file_id: u32) -> Option<&BlockFileInfo> {
        self.files.get(&file_id)
    }

    pub fn record_block(&mut self, file_id: u32, height: i32, record_size: u64) -> BlockFileInfo {
        let info = self.files.entry(file_id).or_default();
        info.record_block(height, record_size);
        *info
    }

    pub fn remove(&mut self, file_id: u32) -> Option<BlockFileInfo> {
        self.files.remove(&file_id)
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|info| info.size).sum()
    }

    /// Files in ascending id order, i.e. oldest data first.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &BlockFileInfo)> {
        self.files.iter().map(|(id, info)| (*id, info))
    }
}
