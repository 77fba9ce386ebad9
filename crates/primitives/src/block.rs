//! Block header and block types.
//!
//! Transaction contents are opaque to the chain-state core; a transaction is
//! carried as its raw serialized bytes and identified by its double-SHA256.

use copperd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

pub const HEADER_ENCODED_LEN: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

/// Raw serialized transaction bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction(pub Vec<u8>);

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            encoder.write_var_bytes(tx.as_bytes());
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let count = decoder.read_varint()? as usize;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction(decoder.read_var_bytes()?));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}
