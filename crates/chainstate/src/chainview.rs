//! Active-chain view: the node ids from genesis to the current tip, plus
//! the immutable snapshot handed out to readers.

use copperd_consensus::Hash256;
use primitive_types::U256;

use crate::blockindex::{BlockIndexGraph, NodeId};

#[derive(Default)]
pub struct ActiveChainView {
    chain: Vec<NodeId>,
}

impl ActiveChainView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> i32 {
        self.chain.len() as i32 - 1
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.chain.last().copied()
    }

    pub fn at_height(&self, height: i32) -> Option<NodeId> {
        if height < 0 {
            return None;
        }
        self.chain.get(height as usize).copied()
    }

    /// A node is on the active chain iff it sits at its own height in it.
    pub fn contains(&self, graph: &BlockIndexGraph, id: NodeId) -> bool {
        let height = graph.node(id).height;
        self.at_height(height) == Some(id)
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.chain
    }

    /// Points the view at a new tip, reusing the shared prefix with the
    /// previous chain.
    pub fn set_tip(&mut self, graph: &BlockIndexGraph, tip: Option<NodeId>) {
        let tip = match tip {
            Some(tip) => tip,
            None => {
                self.chain.clear();
                return;
            }
        };
        let tip_height = graph.node(tip).height;
        debug_assert!(tip_height >= 0);
        let mut suffix = Vec::new();
        let mut current = Some(tip);
        while let Some(id) = current {
            let height = graph.node(id).height as usize;
            if self.chain.get(height) == Some(&id) {
                break;
            }
            suffix.push(id);
            current = graph.node(id).parent;
        }
        let shared = (tip_height as usize + 1) - suffix.len();
        self.chain.truncate(shared);
        self.chain.extend(suffix.into_iter().rev());
    }
}

/// Point-in-time copy of the active chain, published atomically so readers
/// never observe a half-applied reorg.
#[derive(Clone, Debug)]
pub struct ChainSnapshot {
    pub tip_hash: Hash256,
    pub tip_height: i32,
    pub tip_work: U256,
    pub tip_time: u32,
    /// Block hash per height, genesis first.
    pub hashes: Vec<Hash256>,
}

impl ChainSnapshot {
    pub fn empty() -> Self {
        Self {
            tip_hash: [0u8; 32],
            tip_height: -1,
            tip_work: U256::zero(),
            tip_time: 0,
            hashes: Vec::new(),
        }
    }

    pub fn capture(graph: &BlockIndexGraph, view: &ActiveChainView) -> Self {
        let hashes: Vec<Hash256> = view.ids().iter().map(|id| graph.node(*id).hash).collect();
        match view.tip() {
            Some(tip) => {
                let node = graph.node(tip);
                Self {
                    tip_hash: node.hash,
                    tip_height: node.height,
                    tip_work: node.chain_work,
                    tip_time: node.time,
                    hashes,
                }
            }
            None => Self::empty(),
        }
    }

    pub fn hash_at_height(&self, height: i32) -> Option<&Hash256> {
        if height < 0 {
            return None;
        }
        self.hashes.get(height as usize)
    }

    pub fn contains_hash(&self, hash: &Hash256) -> bool {
        self.hashes.iter().any(|h| h == hash)
    }
}
