//! In-memory block index: an arena of header nodes keyed by hash, with
//! parent/skip linkage, cumulative work, and validity tracking.

use std::collections::HashMap;

use copperd_consensus::constants::MEDIAN_TIME_SPAN;
use copperd_consensus::{Hash256, ZERO_HASH};
use copperd_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::flatfiles::FileLocation;

/// Stable handle into the arena. Nodes are never removed while the graph
/// lives, so ids stay valid for the lifetime of the graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How far a block has been validated. Advances monotonically unless the
/// node is marked failed, which is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum BlockValidity {
    Unknown = 0,
    Header = 1,
    Tree = 2,
    Transactions = 3,
    Chain = 4,
    Scripts = 5,
}

impl BlockValidity {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Header,
            2 => Self::Tree,
            3 => Self::Transactions,
            4 => Self::Chain,
            5 => Self::Scripts,
            _ => Self::Unknown,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub parent_hash: Hash256,
    pub parent: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Ancestor count from genesis; -1 until the node links to genesis.
    pub height: i32,
    pub chain_work: U256,
    pub validity: BlockValidity,
    pub failed: bool,
    pub failed_parent: bool,
    pub have_data: bool,
    pub have_undo: bool,
    pub sequence_id: u64,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub block_file: Option<FileLocation>,
    pub undo_file: Option<FileLocation>,
    pub dirty: bool,
}

impl BlockIndexNode {
    pub fn is_linked(&self) -> bool {
        self.height >= 0
    }

    pub fn candidate_eligible(&self) -> bool {
        !self.failed
            && !self.failed_parent
            && self.have_data
            && self.validity >= BlockValidity::Transactions
    }

    /// Block data was stored at some point. Validity only reaches
    /// `Transactions` once the data arrived and is never lowered, so this
    /// stays true after pruning drops the data itself.
    pub fn data_ever_stored(&self) -> bool {
        self.have_data || self.validity >= BlockValidity::Transactions
    }
}

/// Fields needed to rebuild a node from its persisted index entry.
#[derive(Clone, Debug)]
pub struct RestoredNode {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub validity: BlockValidity,
    pub failed: bool,
    pub failed_parent: bool,
    pub have_data: bool,
    pub have_undo: bool,
    pub sequence_id: u64,
    pub block_file: Option<FileLocation>,
    pub undo_file: Option<FileLocation>,
}

#[derive(Default)]
pub struct BlockIndexGraph {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, NodeId>,
    /// Children inserted before their parent hash was known, keyed by that
    /// parent hash.
    awaiting_parent: HashMap<Hash256, Vec<NodeId>>,
    next_sequence: u64,
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height of the skip-pointer target for a node at `height`.
pub fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

fn compact_to_target(bits: u32) -> U256 {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 || (bits & 0x0080_0000) != 0 || exponent > 34 {
        return U256::zero();
    }
    if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        U256::from(mantissa) << (8 * (exponent - 3))
    }
}

/// Expected work of one block at the given compact target: `2^256 / (target+1)`.
pub fn block_proof(bits: u32) -> U256 {
    let target = compact_to_target(bits);
    if target.is_zero() {
        return U256::zero();
    }
    (!target / (target + U256::one())) + U256::one()
}

impl BlockIndexGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node))
    }

    /// Idempotent header insertion: the first sighting of a hash allocates a
    /// node and assigns its sequence id; later sightings return the existing
    /// node untouched.
    pub fn insert_or_get(&mut self, header: &BlockHeader) -> NodeId {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let sequence_id = self.next_sequence;
        self.next_sequence += 1;
        let id = self.alloc(BlockIndexNode {
            hash,
            parent_hash: header.prev_block,
            parent: None,
            skip: None,
            children: Vec::new(),
            height: -1,
            chain_work: U256::zero(),
            validity: BlockValidity::Header,
            failed: false,
            failed_parent: false,
            have_data: false,
            have_undo: false,
            sequence_id,
            version: header.version,
            time: header.time,
            bits: header.bits,
            block_file: None,
            undo_file: None,
            dirty: true,
        });
        self.attach(id);
        id
    }

    /// Rebuilds a node from its persisted entry. Sequence ids are preserved
    /// so the first-seen tie-break survives restarts.
    pub fn restore(&mut self, restored: RestoredNode) -> NodeId {
        if let Some(id) = self.lookup(&restored.hash) {
            return id;
        }
        self.next_sequence = self.next_sequence.max(restored.sequence_id + 1);
        let id = self.alloc(BlockIndexNode {
            hash: restored.hash,
            parent_hash: restored.prev_hash,
            parent: None,
            skip: None,
            children: Vec::new(),
            height: -1,
            chain_work: U256::zero(),
            validity: restored.validity,
            failed: restored.failed,
            failed_parent: restored.failed_parent,
            have_data: restored.have_data,
            have_undo: restored.have_undo,
            sequence_id: restored.sequence_id,
            version: restored.version,
            time: restored.time,
            bits: restored.bits,
            block_file: restored.block_file,
            undo_file: restored.undo_file,
            dirty: false,
        });
        self.attach(id);
        id
    }

    fn alloc(&mut self, node: BlockIndexNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        id
    }

    /// Wires the new node into the tree and cascades linking through any
    /// descendants that were waiting on it.
    fn attach(&mut self, id: NodeId) {
        let parent_hash = self.nodes[id.index()].parent_hash;
        if parent_hash == ZERO_HASH {
            let node = &mut self.nodes[id.index()];
            node.height = 0;
            node.chain_work = block_proof(node.bits);
        } else if let Some(parent) = self.lookup(&parent_hash) {
            self.nodes[id.index()].parent = Some(parent);
            self.nodes[parent.index()].children.push(id);
            if self.nodes[parent.index()].is_linked() {
                self.link(id);
            }
        } else {
            self.awaiting_parent.entry(parent_hash).or_default().push(id);
        }

        let hash = self.nodes[id.index()].hash;
        if let Some(waiting) = self.awaiting_parent.remove(&hash) {
            for child in waiting {
                self.nodes[child.index()].parent = Some(id);
                self.nodes[id.index()].children.push(child);
            }
        }
        if self.nodes[id.index()].is_linked() {
            self.link_descendants(id);
        }
    }

    fn link(&mut self, id: NodeId) {
        let parent = match self.nodes[id.index()].parent {
            Some(parent) => parent,
            None => return,
        };
        let parent_height = self.nodes[parent.index()].height;
        let parent_work = self.nodes[parent.index()].chain_work;
        let height = parent_height + 1;
        let work = parent_work + block_proof(self.nodes[id.index()].bits);
        let skip = self.ancestor_at_height(parent, get_skip_height(height));
        let node = &mut self.nodes[id.index()];
        node.height = height;
        node.chain_work = work;
        node.skip = skip;
        node.dirty = true;
    }

    fn link_descendants(&mut self, root: NodeId) {
        let mut queue = vec![root];
        while let Some(id) = queue.pop() {
            let children = self.nodes[id.index()].children.clone();
            for child in children {
                if !self.nodes[child.index()].is_linked() {
                    self.link(child);
                    queue.push(child);
                }
            }
        }
    }

    /// Ancestor lookup along the skip-pointer chain, O(log height).
    pub fn ancestor_at_height(&self, id: NodeId, target_height: i32) -> Option<NodeId> {
        let node = self.node(id);
        if target_height < 0 || !node.is_linked() || target_height > node.height {
            return None;
        }
        let mut current = id;
        let mut height = node.height;
        while height > target_height {
            let walk = self.node(current);
            let next = match walk.skip {
                Some(skip) if get_skip_height(height) >= target_height => skip,
                _ => walk.parent?,
            };
            current = next;
            height = self.node(current).height;
        }
        Some(current)
    }

    /// Deepest node on both ancestor paths. `None` when either side is
    /// still unlinked.
    pub fn last_common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (a, b);
        if !self.node(a).is_linked() || !self.node(b).is_linked() {
            return None;
        }
        if self.node(a).height > self.node(b).height {
            a = self.ancestor_at_height(a, self.node(b).height)?;
        } else if self.node(b).height > self.node(a).height {
            b = self.ancestor_at_height(b, self.node(a).height)?;
        }
        while a != b {
            a = self.node(a).parent?;
            b = self.node(b).parent?;
        }
        Some(a)
    }

    /// Raises the validity level; lowering is silently ignored and failed
    /// nodes never advance.
    pub fn mark_validity(&mut self, id: NodeId, level: BlockValidity) {
        let node = &mut self.nodes[id.index()];
        if node.failed || level <= node.validity {
            return;
        }
        node.validity = level;
        node.dirty = true;
    }

    /// Marks a node terminally failed and flags every in-memory descendant
    /// with `failed_parent`. Returns all touched ids so the caller can drop
    /// them from candidacy.
    pub fn mark_failed(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut touched = Vec::new();
        {
            let node = &mut self.nodes[id.index()];
            if !node.failed {
                node.failed = true;
                node.dirty = true;
            }
            touched.push(id);
        }
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            let children = self.nodes[current.index()].children.clone();
            for child in children {
                let node = &mut self.nodes[child.index()];
                if !node.failed_parent {
                    node.failed_parent = true;
                    node.dirty = true;
                    touched.push(child);
                }
                queue.push(child);
            }
        }
        touched
    }

    /// Median of the last [`MEDIAN_TIME_SPAN`] block times ending at `id`.
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = Some(id);
        while let Some(node_id) = current {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(node_id);
            times.push(node.time as i64);
            current = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Nearest ancestor (self excluded) whose block data was never
    /// downloaded, walking toward genesis. Pruned ancestors had their data
    /// connected before it was deleted, so they are not gaps. `None` means
    /// every ancestor of `id` has been processed.
    pub fn nearest_data_gap(&self, id: NodeId) -> Option<NodeId> {
        let mut current = self.node(id).parent;
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if !node.data_ever_stored() {
                return Some(node_id);
            }
            current = node.parent;
        }
        None
    }

    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.dirty)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn clear_dirty(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.nodes[id.index()].dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: u32 = 0x207f_ffff;

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 0x2000_0000,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_600_000_000 + nonce,
            bits: TEST_BITS,
            nonce,
        }
    }

    fn chain(graph: &mut BlockIndexGraph, len: u32) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut prev = ZERO_HASH;
        for nonce in 0..len {
            let header = header(prev, nonce);
            prev = header.hash();
            ids.push(graph.insert_or_get(&header));
        }
        ids
    }

    #[test]
    fn skip_heights() {
        assert_eq!(get_skip_height(0), 0);
        assert_eq!(get_skip_height(1), 0);
        assert_eq!(get_skip_height(2), 0);
        for height in 2..5000 {
            let skip = get_skip_height(height);
            assert!(skip < height);
            assert!(skip >= 0);
        }
    }

    #[test]
    fn block_proof_monotonic_in_difficulty() {
        // Lower target (harder) means more work per block.
        let easy = block_proof(0x207f_ffff);
        let hard = block_proof(0x1f7f_ffff);
        assert!(hard > easy);
        assert!(easy > U256::zero());
        assert_eq!(block_proof(0x0080_0000), U256::zero());
    }

    #[test]
    fn insert_links_and_accumulates_work() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 5);
        for (height, id) in ids.iter().enumerate() {
            assert_eq!(graph.node(*id).height, height as i32);
        }
        let per_block = block_proof(TEST_BITS);
        assert_eq!(graph.node(ids[4]).chain_work, per_block * 5);
        assert_eq!(graph.node(ids[0]).sequence_id, 0);
        assert_eq!(graph.node(ids[4]).sequence_id, 4);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut graph = BlockIndexGraph::new();
        let genesis = header(ZERO_HASH, 0);
        let first = graph.insert_or_get(&genesis);
        let second = graph.insert_or_get(&genesis);
        assert_eq!(first, second);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn orphan_headers_link_when_parent_arrives() {
        let mut graph = BlockIndexGraph::new();
        let genesis = header(ZERO_HASH, 0);
        let middle = header(genesis.hash(), 1);
        let tip = header(middle.hash(), 2);

        let tip_id = graph.insert_or_get(&tip);
        assert!(!graph.node(tip_id).is_linked());
        let middle_id = graph.insert_or_get(&middle);
        assert!(!graph.node(middle_id).is_linked());

        graph.insert_or_get(&genesis);
        assert_eq!(graph.node(middle_id).height, 1);
        assert_eq!(graph.node(tip_id).height, 2);
        assert_eq!(
            graph.node(tip_id).chain_work,
            block_proof(TEST_BITS) * 3
        );
    }

    #[test]
    fn ancestor_lookup_uses_skips() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 300);
        let tip = ids[299];
        for target in [0, 1, 17, 128, 255, 298, 299] {
            let found = graph.ancestor_at_height(tip, target).expect("ancestor");
            assert_eq!(found, ids[target as usize]);
        }
        assert_eq!(graph.ancestor_at_height(tip, 300), None);
        assert_eq!(graph.ancestor_at_height(tip, -1), None);
    }

    #[test]
    fn common_ancestor_of_fork() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 10);
        let fork_parent = graph.node(ids[5]).hash;
        let side = header(fork_parent, 1000);
        let side_id = graph.insert_or_get(&side);
        let side_tip = graph.insert_or_get(&header(side.hash(), 1001));

        assert_eq!(graph.last_common_ancestor(ids[9], side_tip), Some(ids[5]));
        assert_eq!(graph.last_common_ancestor(side_id, side_tip), Some(side_id));
    }

    #[test]
    fn validity_is_monotonic() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 1);
        graph.mark_validity(ids[0], BlockValidity::Transactions);
        graph.mark_validity(ids[0], BlockValidity::Header);
        assert_eq!(graph.node(ids[0]).validity, BlockValidity::Transactions);
    }

    #[test]
    fn failure_propagates_to_descendants() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 4);
        let touched = graph.mark_failed(ids[1]);
        assert_eq!(touched.len(), 3);
        assert!(graph.node(ids[1]).failed);
        assert!(graph.node(ids[2]).failed_parent);
        assert!(graph.node(ids[3]).failed_parent);
        assert!(!graph.node(ids[0]).failed);
        assert!(!graph.node(ids[0]).failed_parent);
    }

    #[test]
    fn median_time_past_window() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 15);
        // Times are strictly increasing, so the median over the last 11
        // blocks ending at height 14 is the time at height 9.
        let expected = graph.node(ids[9]).time as i64;
        assert_eq!(graph.median_time_past(ids[14]), expected);
    }

    #[test]
    fn nearest_data_gap_walk() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 4);
        for id in &ids {
            graph.node_mut(*id).have_data = true;
        }
        graph.node_mut(ids[1]).have_data = false;
        assert_eq!(graph.nearest_data_gap(ids[3]), Some(ids[1]));
        graph.node_mut(ids[1]).have_data = true;
        assert_eq!(graph.nearest_data_gap(ids[3]), None);
    }

    #[test]
    fn pruned_ancestor_is_not_a_data_gap() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, 4);
        for id in &ids {
            graph.node_mut(*id).have_data = true;
            graph.mark_validity(*id, BlockValidity::Scripts);
        }
        // Pruning drops the data but the node keeps its validity.
        graph.node_mut(ids[1]).have_data = false;
        assert!(graph.node(ids[1]).data_ever_stored());
        assert_eq!(graph.nearest_data_gap(ids[3]), None);

        // A never-downloaded ancestor still counts as a gap.
        let never = graph.node_mut(ids[2]);
        never.have_data = false;
        never.validity = BlockValidity::Header;
        assert_eq!(graph.nearest_data_gap(ids[3]), Some(ids[2]));
    }
}
