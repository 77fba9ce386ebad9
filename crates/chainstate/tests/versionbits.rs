//! Soft-fork activation observed through the controller as the chain grows.

use std::sync::Arc;

use copperd_chainstate::{
    ChainStateConfig, ChainStateController, ThresholdState, ValidationError, ValidationOracle,
};
use copperd_consensus::deployments::{DeploymentIndex, DeploymentParams, NO_TIMEOUT};
use copperd_consensus::params::{consensus_params, ConsensusParams, Network};
use copperd_consensus::{Hash256, ZERO_HASH};
use copperd_primitives::block::{Block, BlockHeader};
use copperd_storage::memory::MemoryStore;
use tempfile::TempDir;

const WINDOW: u32 = 4;
const SIGNAL: i32 = 0x2000_0001;
const NO_SIGNAL: i32 = 0x2000_0000;

struct AcceptAll;

impl ValidationOracle for AcceptAll {
    fn validate_block(&self, _block: &Block, _height: i32) -> Result<(), ValidationError> {
        Ok(())
    }
}

fn make_block(prev: Hash256, version: i32, nonce: u32) -> Block {
    Block {
        header: BlockHeader {
            version,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_600_000_000 + nonce,
            bits: 0x207f_ffff,
            nonce,
        },
        transactions: vec![],
    }
}

fn params_with_csv(genesis: &Block, timeout: i64) -> ConsensusParams {
    let mut params = consensus_params(Network::Regtest);
    params.hash_genesis_block = genesis.header.hash();
    params.miner_confirmation_window = WINDOW;
    params.deployments[DeploymentIndex::Csv.as_usize()] = DeploymentParams {
        bit: 0,
        start_time: 0,
        timeout,
        threshold: 3,
    };
    params
}

fn open(dir: &TempDir, params: ConsensusParams) -> ChainStateController<MemoryStore> {
    ChainStateController::open(
        Arc::new(MemoryStore::new()),
        dir.path(),
        params,
        ChainStateConfig::default(),
        Box::new(AcceptAll),
    )
    .expect("open")
}

fn grow(
    controller: &ChainStateController<MemoryStore>,
    from: Hash256,
    count: u32,
    version: i32,
    salt: u32,
) -> Hash256 {
    let mut prev = from;
    for i in 0..count {
        let block = make_block(prev, version, salt * 1_000 + i + 1);
        prev = block.header.hash();
        controller.accept_block(&block).expect("accept");
    }
    prev
}

#[test]
fn signalling_chain_locks_in_and_activates() {
    let dir = TempDir::new().expect("tempdir");
    let genesis = make_block(ZERO_HASH, SIGNAL, 0);
    let controller = open(&dir, params_with_csv(&genesis, NO_TIMEOUT));
    controller.accept_block(&genesis).expect("genesis");

    let csv = DeploymentIndex::Csv;
    assert_eq!(
        controller.deployment_state(csv),
        ThresholdState::Defined
    );

    // Crossing the first boundary (height 3) starts the count.
    let tip = grow(&controller, genesis.header.hash(), 4, SIGNAL, 1);
    assert_eq!(controller.deployment_state(csv), ThresholdState::Started);

    // A fully signalling period locks in at the next boundary.
    let tip = grow(&controller, tip, 4, SIGNAL, 2);
    assert_eq!(controller.deployment_state(csv), ThresholdState::LockedIn);

    // One more period and the deployment is active.
    grow(&controller, tip, 4, SIGNAL, 3);
    assert_eq!(controller.deployment_state(csv), ThresholdState::Active);
}

#[test]
fn silent_chain_never_locks_in() {
    let dir = TempDir::new().expect("tempdir");
    let genesis = make_block(ZERO_HASH, NO_SIGNAL, 0);
    let controller = open(&dir, params_with_csv(&genesis, NO_TIMEOUT));
    controller.accept_block(&genesis).expect("genesis");

    grow(&controller, genesis.header.hash(), 12, NO_SIGNAL, 1);
    assert_eq!(
        controller.deployment_state(DeploymentIndex::Csv),
        ThresholdState::Started
    );
}

#[test]
fn expired_deployment_fails() {
    let dir = TempDir::new().expect("tempdir");
    let genesis = make_block(ZERO_HASH, SIGNAL, 0);
    // Timeout far in the past relative to the block timestamps.
    let controller = open(&dir, params_with_csv(&genesis, 1_000));
    controller.accept_block(&genesis).expect("genesis");

    grow(&controller, genesis.header.hash(), 4, SIGNAL, 1);
    assert_eq!(
        controller.deployment_state(DeploymentIndex::Csv),
        ThresholdState::Failed
    );
}

#[test]
fn reorg_recomputes_deployment_state() {
    let dir = TempDir::new().expect("tempdir");
    let genesis = make_block(ZERO_HASH, SIGNAL, 0);
    let controller = open(&dir, params_with_csv(&genesis, NO_TIMEOUT));
    controller.accept_block(&genesis).expect("genesis");

    // Signalling main chain reaches lock-in.
    grow(&controller, genesis.header.hash(), 8, SIGNAL, 1);
    assert_eq!(
        controller.deployment_state(DeploymentIndex::Csv),
        ThresholdState::LockedIn
    );

    // A heavier silent fork from genesis replaces it; the deployment state
    // must follow the new branch.
    grow(&controller, genesis.header.hash(), 12, NO_SIGNAL, 2);
    assert_eq!(controller.tip_snapshot().tip_height, 12);
    assert_eq!(
        controller.deployment_state(DeploymentIndex::Csv),
        ThresholdState::Started
    );
}
