//! Consensus constants, chain parameters, and soft-fork deployment schedule.

pub mod constants;
pub mod deployments;
pub mod params;

pub use deployments::{
    DeploymentIndex, DeploymentParams, ALL_DEPLOYMENTS, MAX_DEPLOYMENTS, VERSIONBITS_NUM_BITS,
    VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK,
};
pub use params::{consensus_params, Checkpoint, ConsensusParams, Network};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];
