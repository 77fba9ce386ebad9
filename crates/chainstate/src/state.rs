//! The chain-state controller: single writer over the block index, the
//! candidate set and the active chain, publishing immutable snapshots to
//! readers and driving the persistence and prune schedulers.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use copperd_consensus::deployments::DeploymentIndex;
use copperd_consensus::params::ConsensusParams;
use copperd_consensus::{Hash256, ZERO_HASH};
use copperd_log::{log_info, log_warn};
use copperd_primitives::block::{Block, BlockHeader};
use copperd_primitives::encoding::DecodeError;
use copperd_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{BlockIndexGraph, BlockIndexNode, BlockValidity, NodeId, RestoredNode};
use crate::candidates::{CandidateKey, CandidateTipSet};
use crate::chainview::{ActiveChainView, ChainSnapshot};
use crate::config::ChainStateConfig;
use crate::filemeta::{FileMetaRegistry, META_BLOCK_FILE_PREFIX, META_UNDO_FILE_PREFIX};
use crate::flatfiles::{FlatFileError, FlatFileStore};
use crate::flush::{FlushVerdict, PersistenceScheduler};
use crate::index::{
    stage_best_block, stage_clear_height, stage_entry, stage_file_meta, stage_height_hash,
    stage_raw_header, stage_remove_file_meta, ChainIndex, HeaderEntry, IndexError,
};
use crate::prune::PruneScheduler;
use crate::undo::BlockUndo;
use crate::unlinked::UnlinkedBlockIndex;
use crate::versionbits::{SoftForkActivationTracker, ThresholdState};

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Index(IndexError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    UnknownBlock(Hash256),
    InvalidHeader(&'static str),
    /// A reorg needs block or undo data that pruning already removed.
    PrunedAncestor(Hash256),
    CheckpointMismatch {
        height: i32,
    },
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "store: {err}"),
            ChainStateError::Index(err) => write!(f, "index: {err}"),
            ChainStateError::FlatFile(err) => write!(f, "flat file: {err}"),
            ChainStateError::Decode(err) => write!(f, "decode: {err}"),
            ChainStateError::UnknownBlock(hash) => {
                write!(f, "unknown block {}", hash_hex(hash))
            }
            ChainStateError::InvalidHeader(reason) => write!(f, "invalid header: {reason}"),
            ChainStateError::PrunedAncestor(hash) => {
                write!(f, "block {} required but pruned", hash_hex(hash))
            }
            ChainStateError::CheckpointMismatch { height } => {
                write!(f, "block at height {height} conflicts with checkpoint")
            }
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<IndexError> for ChainStateError {
    fn from(err: IndexError) -> Self {
        ChainStateError::Index(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

#[derive(Clone, Debug)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contextual block validation, supplied by the consensus layer. A rejection
/// is terminal for that block and its descendants.
pub trait ValidationOracle {
    fn validate_block(&self, block: &Block, height: i32) -> Result<(), ValidationError>;
}

/// Mempool notifications after a tip change. `resurrect` lists transactions
/// from disconnected blocks that did not reconfirm; `confirmed` lists
/// transactions newly buried by the connected blocks.
pub trait MempoolSync {
    fn on_chain_update(&self, resurrect: &[Hash256], confirmed: &[Hash256]);
}

pub fn hash_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct ChainInner {
    graph: BlockIndexGraph,
    candidates: CandidateTipSet,
    unlinked: UnlinkedBlockIndex,
    view: ActiveChainView,
    tracker: SoftForkActivationTracker,
    persistence: PersistenceScheduler,
    prune: PruneScheduler,
    block_files: FileMetaRegistry,
    undo_files: FileMetaRegistry,
    dirty_block_files: Vec<u32>,
    dirty_undo_files: Vec<u32>,
}

enum ConnectOutcome {
    Connected,
    Invalid(String),
}

pub struct ChainStateController<S> {
    index: ChainIndex<S>,
    blocks: FlatFileStore,
    undo: FlatFileStore,
    params: ConsensusParams,
    config: ChainStateConfig,
    oracle: Box<dyn ValidationOracle + Send + Sync>,
    mempool: Option<Box<dyn MempoolSync + Send + Sync>>,
    inner: Mutex<ChainInner>,
    snapshot: RwLock<Arc<ChainSnapshot>>,
}

impl<S: KeyValueStore> ChainStateController<S> {
    pub fn open(
        store: Arc<S>,
        data_dir: impl Into<PathBuf>,
        params: ConsensusParams,
        config: ChainStateConfig,
        oracle: Box<dyn ValidationOracle + Send + Sync>,
    ) -> Result<Self, ChainStateError> {
        let data_dir = data_dir.into();
        let blocks = FlatFileStore::open(&data_dir, "blk", config.max_block_file_size)?;
        let undo = FlatFileStore::open(&data_dir, "rev", config.max_undo_file_size)?;
        let index = ChainIndex::new(store);

        let mut graph = BlockIndexGraph::new();
        for (hash, entry) in index.scan_entries()? {
            graph.restore(RestoredNode {
                hash,
                prev_hash: entry.prev_hash,
                version: entry.version,
                time: entry.time,
                bits: entry.bits,
                validity: entry.validity,
                failed: entry.failed,
                failed_parent: entry.failed_parent,
                have_data: entry.have_data,
                have_undo: entry.have_undo,
                sequence_id: entry.sequence_id,
                block_file: entry.block_file,
                undo_file: entry.undo_file,
            });
        }

        let mut candidates = CandidateTipSet::new();
        for (id, node) in graph.iter() {
            if node.is_linked() && node.candidate_eligible() {
                candidates.insert(id, node.chain_work, node.sequence_id);
            }
        }

        let mut view = ActiveChainView::new();
        if let Some(best_hash) = index.best_block()? {
            let tip = graph
                .lookup(&best_hash)
                .ok_or(IndexError::Corrupt("best block missing from header index"))?;
            view.set_tip(&graph, Some(tip));
            let node = graph.node(tip);
            candidates.insert(tip, node.chain_work, node.sequence_id);
        }

        let block_files =
            FileMetaRegistry::from_entries(index.load_file_meta(META_BLOCK_FILE_PREFIX)?);
        let undo_files =
            FileMetaRegistry::from_entries(index.load_file_meta(META_UNDO_FILE_PREFIX)?);

        let snapshot = Arc::new(ChainSnapshot::capture(&graph, &view));
        log_info!(
            "chain state loaded: {} headers, tip height {}",
            graph.len(),
            snapshot.tip_height
        );

        Ok(Self {
            index,
            blocks,
            undo,
            params,
            config,
            oracle,
            mempool: None,
            inner: Mutex::new(ChainInner {
                graph,
                candidates,
                unlinked: UnlinkedBlockIndex::new(),
                view,
                tracker: SoftForkActivationTracker::new(),
                persistence: PersistenceScheduler::new(Instant::now()),
                prune: PruneScheduler::new(),
                block_files,
                undo_files,
                dirty_block_files: Vec::new(),
                dirty_undo_files: Vec::new(),
            }),
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn with_mempool_sync(mut self, sync: Box<dyn MempoolSync + Send + Sync>) -> Self {
        self.mempool = Some(sync);
        self
    }

    /// Accepts a header into the index. Idempotent for already-known
    /// headers; headers extending an invalid ancestor are rejected.
    pub fn accept_header(&self, header: &BlockHeader) -> Result<Hash256, ChainStateError> {
        let mut inner = self.lock_inner();
        self.accept_header_locked(&mut inner, header)
    }

    fn accept_header_locked(
        &self,
        inner: &mut ChainInner,
        header: &BlockHeader,
    ) -> Result<Hash256, ChainStateError> {
        let hash = header.hash();
        if let Some(id) = inner.graph.lookup(&hash) {
            let node = inner.graph.node(id);
            if node.failed {
                return Err(ChainStateError::InvalidHeader("header is known invalid"));
            }
            return Ok(hash);
        }

        if header.prev_block == ZERO_HASH && hash != self.params.hash_genesis_block {
            return Err(ChainStateError::InvalidHeader("unexpected genesis block"));
        }
        if let Some(parent) = inner.graph.lookup(&header.prev_block) {
            let parent_node = inner.graph.node(parent);
            if parent_node.failed || parent_node.failed_parent {
                return Err(ChainStateError::InvalidHeader(
                    "header extends an invalid chain",
                ));
            }
        }

        let id = inner.graph.insert_or_get(header);

        if self.config.enforce_checkpoints {
            let height = inner.graph.node(id).height;
            if height >= 0 {
                // The chain this header sits on must run through every
                // checkpoint at or below its height.
                let conflict = self
                    .params
                    .checkpoints
                    .iter()
                    .filter(|cp| cp.height <= height)
                    .any(|cp| {
                        inner
                            .graph
                            .ancestor_at_height(id, cp.height)
                            .map(|ancestor| inner.graph.node(ancestor).hash != cp.hash)
                            .unwrap_or(true)
                    });
                if conflict {
                    inner.graph.mark_failed(id);
                    return Err(ChainStateError::CheckpointMismatch { height });
                }
            }
        }

        // The raw header goes to disk immediately; the index entry follows
        // with the next commit.
        let mut batch = WriteBatch::new();
        stage_raw_header(&mut batch, &hash, header);
        self.index.commit(&batch)?;

        // Linking may have cascaded to orphan descendants that already hold
        // block data.
        self.refresh_subtree_candidacy(inner, id);
        Ok(hash)
    }

    /// Stores a block's data and re-evaluates the best chain. The block's
    /// header is accepted first if it is new. Validation failures during
    /// activation are terminal for the offending block but are not errors
    /// for the caller.
    pub fn accept_block(&self, block: &Block) -> Result<Hash256, ChainStateError> {
        let mut inner = self.lock_inner();
        let hash = self.accept_header_locked(&mut inner, &block.header)?;
        let id = match inner.graph.lookup(&hash) {
            Some(id) => id,
            None => return Err(ChainStateError::UnknownBlock(hash)),
        };

        if !inner.graph.node(id).have_data {
            let raw = block.consensus_encode();
            let location = self.blocks.append(&raw)?;
            let height = inner.graph.node(id).height;
            inner
                .block_files
                .record_block(location.file_id, height, 4 + raw.len() as u64);
            if !inner.dirty_block_files.contains(&location.file_id) {
                inner.dirty_block_files.push(location.file_id);
            }
            {
                let node = inner.graph.node_mut(id);
                node.have_data = true;
                node.block_file = Some(location);
                node.dirty = true;
            }
            inner.graph.mark_validity(id, BlockValidity::Transactions);
            self.on_block_data(&mut inner, id);
            if self.config.prune_enabled {
                inner.prune.request_check();
            }
        }

        self.activate_best_chain_locked(&mut inner, Vec::new())?;
        Ok(hash)
    }

    /// Re-runs best-chain selection; a no-op when the tip already has the
    /// most work.
    pub fn activate_best_chain(&self) -> Result<(), ChainStateError> {
        let mut inner = self.lock_inner();
        self.activate_best_chain_locked(&mut inner, Vec::new())
    }

    /// Marks a block invalid by operator decision. If the block is on the
    /// active chain the tip is first rewound to its parent, then the best
    /// remaining branch is activated.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        let mut inner = self.lock_inner();
        let inner = &mut *inner;
        let id = inner
            .graph
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;

        let mut resurrect = Vec::new();
        if inner.view.contains(&inner.graph, id) {
            let parent = inner.graph.node(id).parent;
            let stop_height = inner.graph.node(id).height - 1;
            let mut walk = inner.view.tip();
            while let Some(walk_id) = walk {
                if inner.graph.node(walk_id).height <= stop_height {
                    break;
                }
                resurrect.extend(self.disconnect_block(inner, walk_id)?);
                walk = inner.graph.node(walk_id).parent;
            }
            inner.view.set_tip(&inner.graph, parent);
            inner.tracker.on_reorg(&inner.graph, stop_height);
            if let Some(parent_id) = parent {
                self.force_candidate(inner, parent_id);
            }
        }

        let touched = inner.graph.mark_failed(id);
        for node_id in &touched {
            inner.candidates.remove(*node_id);
        }
        log_warn!("block {} marked invalid by request", hash_hex(hash));

        // Alternative branches pruned from the candidate set earlier may now
        // be the best chain again.
        self.rebuild_candidates(inner);
        self.activate_best_chain_locked(inner, resurrect)
    }

    pub fn tip_snapshot(&self) -> Arc<ChainSnapshot> {
        Arc::clone(&self.snapshot.read().expect("snapshot lock"))
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let location = {
            let inner = self.lock_inner();
            match inner.graph.lookup(hash) {
                Some(id) => inner.graph.node(id).block_file,
                None => return Err(ChainStateError::UnknownBlock(*hash)),
            }
        };
        let location = match location {
            Some(location) => location,
            None => return Ok(None),
        };
        let bytes = self.blocks.read(location)?;
        Ok(Some(Block::consensus_decode(&bytes)?))
    }

    /// Header lookup from the persistent header store. Headers are kept for
    /// every known block, so this works where [`get_block`](Self::get_block)
    /// returns `None` because the data was pruned.
    pub fn get_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ChainStateError> {
        Ok(self.index.get_raw_header(hash)?)
    }

    /// Active-chain header at a height, resolved through the persisted
    /// height-to-hash map.
    pub fn header_at_height(&self, height: i32) -> Result<Option<BlockHeader>, ChainStateError> {
        match self.index.hash_at_height(height)? {
            Some(hash) => self.get_header(&hash),
            None => Ok(None),
        }
    }

    pub fn deployment_state(&self, idx: DeploymentIndex) -> ThresholdState {
        let mut inner = self.lock_inner();
        let inner = &mut *inner;
        let tip = inner.view.tip();
        inner.tracker.state_for(&inner.graph, &self.params, idx, tip)
    }

    pub fn unknown_signal_warning(&self) -> bool {
        self.lock_inner().tracker.unknown_signal_warning()
    }

    /// Periodic block-index write: persists dirty index entries and file
    /// metadata when the write interval has elapsed.
    pub fn maybe_write_index(&self, now: Instant) -> Result<bool, ChainStateError> {
        let mut inner = self.lock_inner();
        if !inner.persistence.should_write_index(now, &self.config) {
            return Ok(false);
        }
        let snapshot = self.tip_snapshot();
        self.commit_chain_state(&mut inner, &snapshot)?;
        inner.persistence.note_index_written(now);
        Ok(true)
    }

    /// Full-flush policy check. `cache_usage_bytes` is the caller's current
    /// UTXO cache footprint; a forced verdict means the cache must be
    /// written out now.
    pub fn maybe_flush(
        &self,
        now: Instant,
        cache_usage_bytes: u64,
    ) -> Result<FlushVerdict, ChainStateError> {
        let mut inner = self.lock_inner();
        let verdict = inner
            .persistence
            .flush_verdict(now, cache_usage_bytes, &self.config);
        if verdict != FlushVerdict::Skip {
            let snapshot = self.tip_snapshot();
            self.commit_chain_state(&mut inner, &snapshot)?;
            inner.persistence.note_flushed(now);
            log_info!("chain state flushed ({verdict:?}, cache {cache_usage_bytes} bytes)");
        }
        Ok(verdict)
    }

    /// Deletes prunable flat files if a prune check is pending. Individual
    /// deletion failures are logged and retried on the next call; metadata
    /// is only updated for files that were actually removed.
    pub fn maybe_prune(&self) -> Result<usize, ChainStateError> {
        let mut inner = self.lock_inner();
        let inner = &mut *inner;
        if !inner.prune.take_request() {
            return Ok(0);
        }
        let tip_height = inner.view.height();
        let plan = inner.prune.plan(
            &self.config,
            tip_height,
            &inner.block_files,
            &inner.undo_files,
        );
        if plan.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        let mut deleted = 0usize;
        for file_id in &plan.block_files {
            match self.blocks.delete_file(*file_id) {
                Ok(()) => {
                    let affected: Vec<NodeId> = inner
                        .graph
                        .iter()
                        .filter(|(_, node)| {
                            node.block_file.map(|loc| loc.file_id) == Some(*file_id)
                        })
                        .map(|(id, _)| id)
                        .collect();
                    for id in affected {
                        let node = inner.graph.node_mut(id);
                        node.have_data = false;
                        node.block_file = None;
                        node.dirty = true;
                        inner.candidates.remove(id);
                    }
                    inner.block_files.remove(*file_id);
                    stage_remove_file_meta(&mut batch, META_BLOCK_FILE_PREFIX, *file_id);
                    deleted += 1;
                }
                Err(err) => {
                    log_warn!("prune: failed to delete block file {file_id}: {err}");
                    inner.prune.request_check();
                }
            }
        }
        for file_id in &plan.undo_files {
            match self.undo.delete_file(*file_id) {
                Ok(()) => {
                    let affected: Vec<NodeId> = inner
                        .graph
                        .iter()
                        .filter(|(_, node)| {
                            node.undo_file.map(|loc| loc.file_id) == Some(*file_id)
                        })
                        .map(|(id, _)| id)
                        .collect();
                    for id in affected {
                        let node = inner.graph.node_mut(id);
                        node.have_undo = false;
                        node.undo_file = None;
                        node.dirty = true;
                    }
                    inner.undo_files.remove(*file_id);
                    stage_remove_file_meta(&mut batch, META_UNDO_FILE_PREFIX, *file_id);
                    deleted += 1;
                }
                Err(err) => {
                    log_warn!("prune: failed to delete undo file {file_id}: {err}");
                    inner.prune.request_check();
                }
            }
        }

        let dirty = inner.graph.dirty_nodes();
        for id in &dirty {
            let node = inner.graph.node(*id);
            stage_entry(&mut batch, &node.hash, &entry_from_node(node));
        }
        self.index.commit(&batch)?;
        inner.graph.clear_dirty(&dirty);
        if deleted > 0 {
            log_info!("pruned {deleted} flat files, tip height {tip_height}");
        }
        Ok(deleted)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner.lock().expect("chain state lock")
    }

    /// Candidate bookkeeping after `id` (or a descendant) gained block
    /// data or became linked.
    fn refresh_subtree_candidacy(&self, inner: &mut ChainInner, root: NodeId) {
        if !inner.graph.node(root).is_linked() {
            return;
        }
        let mut queue = vec![root];
        while let Some(id) = queue.pop() {
            let node = inner.graph.node(id);
            if node.have_data && node.candidate_eligible() {
                self.on_block_data(inner, id);
            }
            queue.extend(inner.graph.node(id).children.iter().copied());
        }
    }

    fn on_block_data(&self, inner: &mut ChainInner, id: NodeId) {
        if !inner.graph.node(id).is_linked() {
            return;
        }
        if inner.graph.nearest_data_gap(id).is_some() {
            inner.unlinked.record_if_unlinked(&inner.graph, id);
            return;
        }
        self.add_candidate(inner, id);
        let promoted = inner.unlinked.on_data_arrived(&inner.graph, id);
        for promoted_id in promoted {
            self.add_candidate(inner, promoted_id);
        }
    }

    fn add_candidate(&self, inner: &mut ChainInner, id: NodeId) {
        let node = inner.graph.node(id);
        if node.candidate_eligible() {
            inner
                .candidates
                .insert(id, node.chain_work, node.sequence_id);
        }
    }

    /// Tip insertion skips the eligibility check: a block that was just
    /// connected is a valid candidate even if pruning later drops its data.
    fn force_candidate(&self, inner: &mut ChainInner, id: NodeId) {
        let node = inner.graph.node(id);
        inner
            .candidates
            .insert(id, node.chain_work, node.sequence_id);
    }

    fn rebuild_candidates(&self, inner: &mut ChainInner) {
        let eligible: Vec<(NodeId, &BlockIndexNode)> = inner
            .graph
            .iter()
            .filter(|(_, node)| node.is_linked() && node.candidate_eligible())
            .collect();
        let staged: Vec<(NodeId, primitive_types::U256, u64)> = eligible
            .into_iter()
            .filter(|(id, _)| inner.graph.nearest_data_gap(*id).is_none())
            .map(|(id, node)| (id, node.chain_work, node.sequence_id))
            .collect();
        for (id, work, sequence) in staged {
            inner.candidates.insert(id, work, sequence);
        }
    }

    fn candidate_key(graph: &BlockIndexGraph, id: NodeId) -> CandidateKey {
        let node = graph.node(id);
        CandidateKey {
            chain_work: node.chain_work,
            sequence_id: node.sequence_id,
        }
    }

    fn activate_best_chain_locked(
        &self,
        inner: &mut ChainInner,
        carried_resurrect: Vec<Hash256>,
    ) -> Result<(), ChainStateError> {
        let old_snapshot = self.tip_snapshot();
        let mut resurrect = carried_resurrect;
        let mut confirmed: Vec<Hash256> = Vec::new();
        let mut lowest_fork_height: Option<i32> = None;

        loop {
            let tip = inner.view.tip();
            let best = match inner.candidates.best() {
                Some(best) => best,
                None => break,
            };
            if Some(best) == tip {
                break;
            }
            if let Some(tip_id) = tip {
                // An invalidated tip loses the work comparison outright; the
                // chain must move off it whatever the candidate's work.
                let tip_node = inner.graph.node(tip_id);
                if !tip_node.failed && !tip_node.failed_parent {
                    let tip_key = Self::candidate_key(&inner.graph, tip_id);
                    let best_key = Self::candidate_key(&inner.graph, best);
                    if best_key <= tip_key {
                        break;
                    }
                }
            }

            let fork = tip.and_then(|tip_id| inner.graph.last_common_ancestor(best, tip_id));
            let fork_height = fork.map(|f| inner.graph.node(f).height).unwrap_or(-1);

            // Disconnect the stale branch, collecting transactions to hand
            // back to the mempool.
            if let Some(tip_id) = tip {
                if inner.graph.node(tip_id).height > fork_height {
                    let mut walk = Some(tip_id);
                    while let Some(id) = walk {
                        if inner.graph.node(id).height <= fork_height {
                            break;
                        }
                        // A block connected earlier in this activation and
                        // rolled back again was never confirmed.
                        let txids = self.disconnect_block(inner, id)?;
                        confirmed.retain(|txid| !txids.contains(txid));
                        resurrect.extend(txids);
                        walk = inner.graph.node(id).parent;
                    }
                    inner.view.set_tip(&inner.graph, fork);
                    lowest_fork_height = Some(
                        lowest_fork_height.map_or(fork_height, |height| height.min(fork_height)),
                    );
                }
            }

            // Connect toward the candidate, stopping at the first invalid
            // block; the blocks connected before it remain on the chain.
            let mut path = Vec::new();
            let mut walk = Some(best);
            while let Some(id) = walk {
                if inner.graph.node(id).height <= fork_height {
                    break;
                }
                path.push(id);
                walk = inner.graph.node(id).parent;
            }
            path.reverse();

            for id in path {
                match self.connect_block(inner, id, &mut confirmed)? {
                    ConnectOutcome::Connected => {
                        inner.view.set_tip(&inner.graph, Some(id));
                    }
                    ConnectOutcome::Invalid(reason) => {
                        let hash = inner.graph.node(id).hash;
                        log_warn!("invalid block {}: {reason}", hash_hex(&hash));
                        let touched = inner.graph.mark_failed(id);
                        for node_id in touched {
                            inner.candidates.remove(node_id);
                        }
                        break;
                    }
                }
            }

            // Keep the current tip in the candidate set so the next round
            // compares against it.
            if let Some(tip_id) = inner.view.tip() {
                self.force_candidate(inner, tip_id);
            }
        }

        if let Some(tip_id) = inner.view.tip() {
            let (tip_work, tip_sequence) = {
                let node = inner.graph.node(tip_id);
                (node.chain_work, node.sequence_id)
            };
            inner
                .candidates
                .prune_below_tip(tip_id, tip_work, tip_sequence);
            if let Some(fork_height) = lowest_fork_height {
                inner.tracker.on_reorg(&inner.graph, fork_height);
            }
        }

        let new_tip_hash = inner
            .view
            .tip()
            .map(|id| inner.graph.node(id).hash)
            .unwrap_or(ZERO_HASH);
        if new_tip_hash == old_snapshot.tip_hash {
            return Ok(());
        }

        // Index, height map and best-block pointer go to disk in one batch;
        // a failure here is fatal for the controller.
        self.commit_chain_state(inner, &old_snapshot)?;

        let snapshot = Arc::new(ChainSnapshot::capture(&inner.graph, &inner.view));
        *self.snapshot.write().expect("snapshot lock") = Arc::clone(&snapshot);
        log_info!(
            "new tip {} height {} ({} candidates)",
            hash_hex(&snapshot.tip_hash),
            snapshot.tip_height,
            inner.candidates.len()
        );

        if let Some(tip_id) = inner.view.tip() {
            inner
                .tracker
                .update_unknown_signal_warning(&inner.graph, &self.params, tip_id);
        }
        if self.config.prune_enabled {
            inner.prune.request_check();
        }

        if let Some(mempool) = &self.mempool {
            let resurrect: Vec<Hash256> = resurrect
                .into_iter()
                .filter(|txid| !confirmed.contains(txid))
                .collect();
            if !resurrect.is_empty() || !confirmed.is_empty() {
                mempool.on_chain_update(&resurrect, &confirmed);
            }
        }
        Ok(())
    }

    /// Rolls one block off the active chain, returning its transactions so
    /// the caller can hand them back to the mempool.
    fn disconnect_block(
        &self,
        inner: &mut ChainInner,
        id: NodeId,
    ) -> Result<Vec<Hash256>, ChainStateError> {
        let (hash, undo_location) = {
            let node = inner.graph.node(id);
            (node.hash, node.undo_file)
        };
        let location = undo_location.ok_or(ChainStateError::PrunedAncestor(hash))?;
        let bytes = self.undo.read(location)?;
        let undo = BlockUndo::decode(&bytes)?;
        Ok(undo.txids)
    }

    fn connect_block(
        &self,
        inner: &mut ChainInner,
        id: NodeId,
        confirmed: &mut Vec<Hash256>,
    ) -> Result<ConnectOutcome, ChainStateError> {
        let (hash, height, block_location, undo_missing) = {
            let node = inner.graph.node(id);
            (node.hash, node.height, node.block_file, node.undo_file.is_none())
        };
        let location = block_location.ok_or(ChainStateError::PrunedAncestor(hash))?;
        let bytes = self.blocks.read(location)?;
        let block = Block::consensus_decode(&bytes)?;

        if let Err(err) = self.oracle.validate_block(&block, height) {
            return Ok(ConnectOutcome::Invalid(err.0));
        }

        if undo_missing {
            let undo = BlockUndo::for_block(&block).encode();
            let location = self.undo.append(&undo)?;
            inner
                .undo_files
                .record_block(location.file_id, height, 4 + undo.len() as u64);
            if !inner.dirty_undo_files.contains(&location.file_id) {
                inner.dirty_undo_files.push(location.file_id);
            }
            let node = inner.graph.node_mut(id);
            node.undo_file = Some(location);
            node.have_undo = true;
            node.dirty = true;
        }
        inner.graph.mark_validity(id, BlockValidity::Scripts);
        confirmed.extend(block.txids());
        Ok(ConnectOutcome::Connected)
    }

    fn commit_chain_state(
        &self,
        inner: &mut ChainInner,
        old_snapshot: &ChainSnapshot,
    ) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();

        let dirty = inner.graph.dirty_nodes();
        batch.reserve(dirty.len());
        for id in &dirty {
            let node = inner.graph.node(*id);
            stage_entry(&mut batch, &node.hash, &entry_from_node(node));
        }

        for file_id in &inner.dirty_block_files {
            if let Some(info) = inner.block_files.get(*file_id) {
                stage_file_meta(&mut batch, META_BLOCK_FILE_PREFIX, *file_id, info);
            }
        }
        for file_id in &inner.dirty_undo_files {
            if let Some(info) = inner.undo_files.get(*file_id) {
                stage_file_meta(&mut batch, META_UNDO_FILE_PREFIX, *file_id, info);
            }
        }

        let new_hashes: Vec<Hash256> = inner
            .view
            .ids()
            .iter()
            .map(|id| inner.graph.node(*id).hash)
            .collect();
        for (height, hash) in new_hashes.iter().enumerate() {
            if old_snapshot.hashes.get(height) != Some(hash) {
                stage_height_hash(&mut batch, height as i32, hash);
            }
        }
        for height in new_hashes.len()..old_snapshot.hashes.len() {
            stage_clear_height(&mut batch, height as i32);
        }
        if let Some(tip_id) = inner.view.tip() {
            let tip_hash = inner.graph.node(tip_id).hash;
            stage_best_block(&mut batch, &tip_hash);
        }

        if !batch.is_empty() {
            self.index.commit(&batch)?;
        }
        inner.graph.clear_dirty(&dirty);
        inner.dirty_block_files.clear();
        inner.dirty_undo_files.clear();
        Ok(())
    }
}

fn entry_from_node(node: &BlockIndexNode) -> HeaderEntry {
    HeaderEntry {
        prev_hash: node.parent_hash,
        version: node.version,
        time: node.time,
        bits: node.bits,
        chain_work: node.chain_work,
        validity: node.validity,
        have_data: node.have_data,
        have_undo: node.have_undo,
        failed: node.failed,
        failed_parent: node.failed_parent,
        sequence_id: node.sequence_id,
        block_file: node.block_file,
        undo_file: node.undo_file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copperd_consensus::params::{consensus_params, Network};
    use copperd_storage::memory::MemoryStore;
    use tempfile::TempDir;

    struct AcceptAll;

    impl ValidationOracle for AcceptAll {
        fn validate_block(&self, _block: &Block, _height: i32) -> Result<(), ValidationError> {
            Ok(())
        }
    }

    fn make_block(prev: Hash256, nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 0x2000_0000,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1_600_000_000 + nonce,
                bits: 0x207f_ffff,
                nonce,
            },
            transactions: vec![],
        }
    }

    fn open_controller(
        store: Arc<MemoryStore>,
        dir: &TempDir,
        genesis: &Block,
    ) -> ChainStateController<MemoryStore> {
        let mut params = consensus_params(Network::Regtest);
        params.hash_genesis_block = genesis.header.hash();
        ChainStateController::open(
            store,
            dir.path(),
            params,
            ChainStateConfig::default(),
            Box::new(AcceptAll),
        )
        .expect("open")
    }

    #[test]
    fn genesis_then_extension() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let genesis = make_block(ZERO_HASH, 0);
        let controller = open_controller(store, &dir, &genesis);

        controller.accept_block(&genesis).expect("genesis");
        assert_eq!(controller.tip_snapshot().tip_height, 0);

        let next = make_block(genesis.header.hash(), 1);
        controller.accept_block(&next).expect("block 1");
        let snapshot = controller.tip_snapshot();
        assert_eq!(snapshot.tip_height, 1);
        assert_eq!(snapshot.tip_hash, next.header.hash());
    }

    #[test]
    fn wrong_genesis_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let genesis = make_block(ZERO_HASH, 0);
        let controller = open_controller(store, &dir, &genesis);

        let rogue = make_block(ZERO_HASH, 999);
        assert!(matches!(
            controller.accept_block(&rogue),
            Err(ChainStateError::InvalidHeader(_))
        ));
    }

    #[test]
    fn header_accept_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let genesis = make_block(ZERO_HASH, 0);
        let controller = open_controller(store, &dir, &genesis);

        let first = controller.accept_header(&genesis.header).expect("accept");
        let second = controller.accept_header(&genesis.header).expect("accept");
        assert_eq!(first, second);
    }

    #[test]
    fn restart_restores_tip() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let genesis = make_block(ZERO_HASH, 0);
        let tip_hash;
        {
            let controller = open_controller(Arc::clone(&store), &dir, &genesis);
            controller.accept_block(&genesis).expect("genesis");
            let next = make_block(genesis.header.hash(), 1);
            tip_hash = controller.accept_block(&next).expect("block 1");
        }
        let controller = open_controller(store, &dir, &genesis);
        let snapshot = controller.tip_snapshot();
        assert_eq!(snapshot.tip_height, 1);
        assert_eq!(snapshot.tip_hash, tip_hash);
        let block = controller.get_block(&tip_hash).expect("get");
        assert!(block.is_some());
    }

    #[test]
    fn checkpoint_conflict_rejected() {
        use copperd_consensus::params::Checkpoint;

        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let genesis = make_block(ZERO_HASH, 0);
        let pinned = make_block(genesis.header.hash(), 1);

        let mut params = consensus_params(Network::Regtest);
        params.hash_genesis_block = genesis.header.hash();
        params.checkpoints = vec![Checkpoint {
            height: 1,
            hash: pinned.header.hash(),
        }];
        let controller = ChainStateController::open(
            store,
            dir.path(),
            params,
            ChainStateConfig::default(),
            Box::new(AcceptAll),
        )
        .expect("open");

        controller.accept_block(&genesis).expect("genesis");
        controller.accept_block(&pinned).expect("pinned");

        // A sibling at the checkpointed height is rejected outright.
        let rogue = make_block(genesis.header.hash(), 777);
        assert!(matches!(
            controller.accept_header(&rogue.header),
            Err(ChainStateError::CheckpointMismatch { height: 1 })
        ));

        // So is any descendant of it, even above the checkpoint.
        let rogue_child = make_block(rogue.header.hash(), 778);
        assert!(matches!(
            controller.accept_header(&rogue_child.header),
            Err(ChainStateError::InvalidHeader(_))
        ));

        // The checkpointed chain itself keeps extending.
        let good = make_block(pinned.header.hash(), 2);
        controller.accept_block(&good).expect("extend");
        assert_eq!(controller.tip_snapshot().tip_height, 2);
    }

    #[test]
    fn hash_hex_is_big_endian() {
        let mut hash = [0u8; 32];
        hash[31] = 0xab;
        assert!(hash_hex(&hash).starts_with("ab"));
        assert_eq!(hash_hex(&hash).len(), 64);
    }
}
