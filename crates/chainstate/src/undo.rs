//! Undo records written at connect time. On disconnect the record lists
//! the transactions the block carried so they can be offered back to the
//! mempool.

use copperd_consensus::Hash256;
use copperd_primitives::block::Block;
use copperd_primitives::encoding::{DecodeError, Decoder, Encoder};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub txids: Vec<Hash256>,
}

impl BlockUndo {
    pub fn for_block(block: &Block) -> Self {
        Self {
            txids: block.txids(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.txids.len() as u64);
        for txid in &self.txids {
            encoder.write_hash_le(txid);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()? as usize;
        let mut txids = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            txids.push(decoder.read_hash_le()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copperd_primitives::block::{BlockHeader, Transaction};

    #[test]
    fn roundtrip() {
        let undo = BlockUndo {
            txids: vec![[1u8; 32], [2u8; 32]],
        };
        assert_eq!(BlockUndo::decode(&undo.encode()).expect("decode"), undo);
    }

    #[test]
    fn captures_block_txids() {
        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![Transaction(vec![1]), Transaction(vec![2, 3])],
        };
        let undo = BlockUndo::for_block(&block);
        assert_eq!(undo.txids, block.txids());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = BlockUndo::default().encode();
        bytes.push(9);
        assert_eq!(
            BlockUndo::decode(&bytes).unwrap_err(),
            DecodeError::TrailingBytes
        );
    }
}
