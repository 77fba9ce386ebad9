//! Tracks blocks whose full data arrived before the data of one of their
//! ancestors. Each such block is filed under the nearest ancestor still
//! missing data and promoted once the gap closes.

use std::collections::HashMap;

use crate::blockindex::{BlockIndexGraph, NodeId};

#[derive(Default)]
pub struct UnlinkedBlockIndex {
    by_gap: HashMap<NodeId, Vec<NodeId>>,
}

impl UnlinkedBlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gap.is_empty()
    }

    pub fn waiting_on(&self, gap: NodeId) -> &[NodeId] {
        self.by_gap.get(&gap).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Files `id` under its nearest missing-data ancestor, if any. Returns
    /// true when the block had to wait.
    pub fn record_if_unlinked(&mut self, graph: &BlockIndexGraph, id: NodeId) -> bool {
        match graph.nearest_data_gap(id) {
            Some(gap) => {
                let waiting = self.by_gap.entry(gap).or_default();
                if !waiting.contains(&id) {
                    waiting.push(id);
                }
                true
            }
            None => false,
        }
    }

    /// Re-files everything that was waiting on `id` now that its data is
    /// present. Blocks whose whole ancestor path is now stored are returned
    /// as promoted; a promoted block may itself unblock further waiters, so
    /// the walk cascades.
    pub fn on_data_arrived(&mut self, graph: &BlockIndexGraph, id: NodeId) -> Vec<NodeId> {
        let mut promoted = Vec::new();
        let mut queue = vec![id];
        while let Some(ready) = queue.pop() {
            let waiting = match self.by_gap.remove(&ready) {
                Some(waiting) => waiting,
                None => continue,
            };
            for blocked in waiting {
                match graph.nearest_data_gap(blocked) {
                    Some(gap) => {
                        self.by_gap.entry(gap).or_default().push(blocked);
                    }
                    None => {
                        promoted.push(blocked);
                        queue.push(blocked);
                    }
                }
            }
        }
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copperd_consensus::ZERO_HASH;
    use copperd_primitives::block::BlockHeader;

    fn build_chain(graph: &mut BlockIndexGraph, len: u32) -> Vec<NodeId> {
        let mut prev = ZERO_HASH;
        let mut ids = Vec::new();
        for nonce in 0..len {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1_600_000_000 + nonce,
                bits: 0x207f_ffff,
                nonce,
            };
            prev = header.hash();
            ids.push(graph.insert_or_get(&header));
        }
        ids
    }

    #[test]
    fn block_with_complete_ancestry_is_not_recorded() {
        let mut graph = BlockIndexGraph::new();
        let ids = build_chain(&mut graph, 2);
        graph.node_mut(ids[0]).have_data = true;
        graph.node_mut(ids[1]).have_data = true;

        let mut unlinked = UnlinkedBlockIndex::new();
        assert!(!unlinked.record_if_unlinked(&graph, ids[1]));
        assert!(unlinked.is_empty());
    }

    #[test]
    fn gap_fill_promotes_cascade() {
        let mut graph = BlockIndexGraph::new();
        let ids = build_chain(&mut graph, 4);
        // Data arrives for heights 0, 2, 3 but not 1.
        graph.node_mut(ids[0]).have_data = true;
        graph.node_mut(ids[2]).have_data = true;
        graph.node_mut(ids[3]).have_data = true;

        let mut unlinked = UnlinkedBlockIndex::new();
        assert!(unlinked.record_if_unlinked(&graph, ids[2]));
        assert!(unlinked.record_if_unlinked(&graph, ids[3]));
        assert_eq!(unlinked.waiting_on(ids[1]).len(), 2);

        graph.node_mut(ids[1]).have_data = true;
        let mut promoted = unlinked.on_data_arrived(&graph, ids[1]);
        promoted.sort();
        let mut expected = vec![ids[2], ids[3]];
        expected.sort();
        assert_eq!(promoted, expected);
        assert!(unlinked.is_empty());
    }

    #[test]
    fn still_gapped_blocks_are_refiled() {
        let mut graph = BlockIndexGraph::new();
        let ids = build_chain(&mut graph, 4);
        // Only the tip has data; gaps at heights 1 and 2.
        graph.node_mut(ids[0]).have_data = true;
        graph.node_mut(ids[3]).have_data = true;

        let mut unlinked = UnlinkedBlockIndex::new();
        assert!(unlinked.record_if_unlinked(&graph, ids[3]));
        assert_eq!(unlinked.waiting_on(ids[2]).len(), 1);

        // Height 2 arrives, but height 1 is still missing: the tip moves to
        // the new nearest gap instead of being promoted.
        graph.node_mut(ids[2]).have_data = true;
        let promoted = unlinked.on_data_arrived(&graph, ids[2]);
        assert!(promoted.is_empty());
        assert_eq!(unlinked.waiting_on(ids[1]), &[ids[3]]);

        graph.node_mut(ids[1]).have_data = true;
        let promoted = unlinked.on_data_arrived(&graph, ids[1]);
        assert_eq!(promoted, vec![ids[3]]);
    }

    #[test]
    fn duplicate_record_is_deduplicated() {
        let mut graph = BlockIndexGraph::new();
        let ids = build_chain(&mut graph, 3);
        graph.node_mut(ids[0]).have_data = true;
        graph.node_mut(ids[2]).have_data = true;

        let mut unlinked = UnlinkedBlockIndex::new();
        assert!(unlinked.record_if_unlinked(&graph, ids[2]));
        assert!(unlinked.record_if_unlinked(&graph, ids[2]));
        assert_eq!(unlinked.waiting_on(ids[1]).len(), 1);
    }
}
