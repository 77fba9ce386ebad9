//! Candidate-tip bookkeeping: the ordered set of fully-stored, not-failed
//! tips the best-chain loop picks from.

use std::collections::{BTreeMap, HashMap};

use primitive_types::U256;

use crate::blockindex::NodeId;

/// Total order over candidates. More cumulative work wins; on equal work
/// the lower sequence id (seen first) wins. Encoded so the best candidate
/// is the maximum key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CandidateKey {
    pub chain_work: U256,
    pub sequence_id: u64,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.chain_work
            .cmp(&other.chain_work)
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct CandidateTipSet {
    ordered: BTreeMap<CandidateKey, NodeId>,
    by_id: HashMap<NodeId, CandidateKey>,
}

impl CandidateTipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn insert(&mut self, id: NodeId, chain_work: U256, sequence_id: u64) {
        let key = CandidateKey {
            chain_work,
            sequence_id,
        };
        if let Some(old) = self.by_id.insert(id, key) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(key, id);
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.by_id.remove(&id) {
            Some(key) => {
                self.ordered.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Highest-work candidate, first-seen winning ties.
    pub fn best(&self) -> Option<NodeId> {
        self.ordered.iter().next_back().map(|(_, id)| *id)
    }

    /// Drops every candidate that can no longer beat the active tip. The
    /// tip itself is kept so the set never goes empty.
    pub fn prune_below_tip(&mut self, tip: NodeId, tip_work: U256, tip_sequence: u64) {
        let tip_key = CandidateKey {
            chain_work: tip_work,
            sequence_id: tip_sequence,
        };
        let stale: Vec<(CandidateKey, NodeId)> = self
            .ordered
            .range(..tip_key)
            .map(|(key, id)| (*key, *id))
            .filter(|(_, id)| *id != tip)
            .collect();
        for (key, id) in stale {
            self.ordered.remove(&key);
            self.by_id.remove(&id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ordered.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockindex::{BlockIndexGraph, NodeId};
    use copperd_consensus::ZERO_HASH;
    use copperd_primitives::block::BlockHeader;

    fn ids(n: u32) -> Vec<NodeId> {
        // Real NodeIds can only come from a graph.
        let mut graph = BlockIndexGraph::new();
        let mut prev = ZERO_HASH;
        let mut out = Vec::new();
        for nonce in 0..n {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: nonce,
                bits: 0x207f_ffff,
                nonce,
            };
            prev = header.hash();
            out.push(graph.insert_or_get(&header));
        }
        out
    }

    #[test]
    fn best_prefers_more_work() {
        let ids = ids(3);
        let mut set = CandidateTipSet::new();
        set.insert(ids[0], U256::from(10u32), 0);
        set.insert(ids[1], U256::from(30u32), 1);
        set.insert(ids[2], U256::from(20u32), 2);
        assert_eq!(set.best(), Some(ids[1]));
    }

    #[test]
    fn equal_work_prefers_first_seen() {
        let ids = ids(2);
        let mut set = CandidateTipSet::new();
        set.insert(ids[0], U256::from(50u32), 7);
        set.insert(ids[1], U256::from(50u32), 3);
        assert_eq!(set.best(), Some(ids[1]));
    }

    #[test]
    fn reinsert_replaces_key() {
        let ids = ids(1);
        let mut set = CandidateTipSet::new();
        set.insert(ids[0], U256::from(5u32), 0);
        set.insert(ids[0], U256::from(9u32), 0);
        assert_eq!(set.len(), 1);
        assert_eq!(set.best(), Some(ids[0]));
    }

    #[test]
    fn prune_keeps_tip_and_better() {
        let ids = ids(4);
        let mut set = CandidateTipSet::new();
        set.insert(ids[0], U256::from(10u32), 0);
        set.insert(ids[1], U256::from(20u32), 1);
        set.insert(ids[2], U256::from(20u32), 2);
        set.insert(ids[3], U256::from(30u32), 3);
        // Active tip is ids[1]; ids[0] is strictly worse and ids[2] loses
        // the tie-break, so both go. ids[3] still beats the tip.
        set.prune_below_tip(ids[1], U256::from(20u32), 1);
        assert!(set.contains(ids[1]));
        assert!(set.contains(ids[3]));
        assert!(!set.contains(ids[0]));
        assert!(!set.contains(ids[2]));
    }

    #[test]
    fn remove_missing_is_noop() {
        let ids = ids(1);
        let mut set = CandidateTipSet::new();
        assert!(!set.remove(ids[0]));
        set.insert(ids[0], U256::from(1u32), 0);
        assert!(set.remove(ids[0]));
        assert!(set.is_empty());
    }
}
