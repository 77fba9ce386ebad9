//! Version-bits soft-fork deployment schedule.

/// Block versions carrying deployment signals use this prefix in the top bits.
pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
/// Mask selecting the version prefix.
pub const VERSIONBITS_TOP_MASK: u32 = 0xE000_0000;
/// Number of bits usable for independent deployments.
pub const VERSIONBITS_NUM_BITS: u8 = 29;

/// Special start time marking a deployment as always signalling.
pub const ALWAYS_ACTIVE_START_TIME: i64 = -1;
/// Special timeout marking a deployment as never expiring.
pub const NO_TIMEOUT: i64 = i64::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DeploymentIndex {
    TestDummy = 0,
    Csv = 1,
    Segwit = 2,
}

pub const MAX_DEPLOYMENTS: usize = 3;

pub const ALL_DEPLOYMENTS: [DeploymentIndex; MAX_DEPLOYMENTS] = [
    DeploymentIndex::TestDummy,
    DeploymentIndex::Csv,
    DeploymentIndex::Segwit,
];

impl DeploymentIndex {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            DeploymentIndex::TestDummy => "testdummy",
            DeploymentIndex::Csv => "csv",
            DeploymentIndex::Segwit => "segwit",
        }
    }
}

/// One soft-fork deployment as configured for a network.
#[derive(Clone, Copy, Debug)]
pub struct DeploymentParams {
    /// The bit position in `nVersion` miners use to signal readiness.
    pub bit: u8,
    /// Median-time-past at or after which signalling is counted.
    pub start_time: i64,
    /// Median-time-past at or after which the deployment fails if not locked in.
    pub timeout: i64,
    /// Signalling blocks required within one retarget period to lock in.
    pub threshold: u32,
}

impl DeploymentParams {
    pub const fn disabled() -> Self {
        Self {
            bit: 28,
            start_time: 0,
            timeout: 0,
            threshold: u32::MAX,
        }
    }
}

/// Whether `version` carries the version-bits prefix at all.
pub fn has_versionbits_prefix(version: i32) -> bool {
    (version as u32 & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS as u32
}

/// Whether `version` signals the given deployment bit.
pub fn signals_bit(version: i32, bit: u8) -> bool {
    has_versionbits_prefix(version) && (version >> bit) & 1 != 0
}

/// Mask of all bits claimed by known deployments.
pub fn known_deployment_mask(deployments: &[DeploymentParams; MAX_DEPLOYMENTS]) -> u32 {
    deployments
        .iter()
        .fold(0u32, |mask, deployment| mask | (1 << deployment.bit))
}
