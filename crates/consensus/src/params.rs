//! Per-network consensus parameter definitions.

use crate::deployments::{DeploymentIndex, DeploymentParams, MAX_DEPLOYMENTS, NO_TIMEOUT};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    /// Highest admissible proof-of-work target.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    /// Retarget period length; also the version-bits signalling window.
    pub miner_confirmation_window: u32,
    pub deployments: [DeploymentParams; MAX_DEPLOYMENTS],
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn deployment(&self, idx: DeploymentIndex) -> &DeploymentParams {
        &self.deployments[idx.as_usize()]
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by_key(|cp| cp.height)
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses a big-endian hex string into the internal little-endian hash layout,
/// zero-padding short input on the left.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet(),
        Network::Testnet => testnet(),
        Network::Regtest => regtest(),
    }
}

fn mainnet() -> ConsensusParams {
    let mut deployments = [DeploymentParams::disabled(); MAX_DEPLOYMENTS];
    deployments[DeploymentIndex::TestDummy.as_usize()] = DeploymentParams {
        bit: 28,
        start_time: 1_199_145_601,
        timeout: 1_230_767_999,
        threshold: 1916,
    };
    deployments[DeploymentIndex::Csv.as_usize()] = DeploymentParams {
        bit: 0,
        start_time: 1_462_060_800,
        timeout: 1_493_596_800,
        threshold: 1916,
    };
    deployments[DeploymentIndex::Segwit.as_usize()] = DeploymentParams {
        bit: 1,
        start_time: 1_479_168_000,
        timeout: 1_510_704_000,
        threshold: 1916,
    };

    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .unwrap_or([0u8; 32]),
        genesis_time: 1_231_006_505,
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap_or([0u8; 32]),
        pow_target_spacing: 600,
        miner_confirmation_window: 2016,
        deployments,
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash256_from_hex(
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            )
            .unwrap_or([0u8; 32]),
        }],
    }
}

fn testnet() -> ConsensusParams {
    let mut params = mainnet();
    params.network = Network::Testnet;
    params.hash_genesis_block = hash256_from_hex(
        "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
    )
    .unwrap_or([0u8; 32]);
    params.genesis_time = 1_296_688_602;
    params.pow_limit = hash256_from_hex(
        "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
    )
    .unwrap_or([0u8; 32]);
    params.deployments[DeploymentIndex::TestDummy.as_usize()].threshold = 1512;
    params.deployments[DeploymentIndex::Csv.as_usize()].threshold = 1512;
    params.deployments[DeploymentIndex::Segwit.as_usize()].threshold = 1512;
    params.checkpoints = vec![Checkpoint {
        height: 0,
        hash: params.hash_genesis_block,
    }];
    params
}

fn regtest() -> ConsensusParams {
    let mut deployments = [DeploymentParams::disabled(); MAX_DEPLOYMENTS];
    deployments[DeploymentIndex::TestDummy.as_usize()] = DeploymentParams {
        bit: 28,
        start_time: 0,
        timeout: NO_TIMEOUT,
        threshold: 108,
    };
    deployments[DeploymentIndex::Csv.as_usize()] = DeploymentParams {
        bit: 0,
        start_time: 0,
        timeout: NO_TIMEOUT,
        threshold: 108,
    };
    deployments[DeploymentIndex::Segwit.as_usize()] = DeploymentParams {
        bit: 1,
        start_time: 0,
        timeout: NO_TIMEOUT,
        threshold: 108,
    };

    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: [0u8; 32],
        genesis_time: 1_296_688_602,
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap_or([0u8; 32]),
        pow_target_spacing: 600,
        miner_confirmation_window: 144,
        deployments,
        checkpoints: Vec::new(),
    }
}
