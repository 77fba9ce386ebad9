//! Chain-state management: block index, best-chain selection, and the
//! persistence/pruning schedulers around them.

pub mod blockindex;
pub mod candidates;
pub mod chainview;
pub mod config;
pub mod filemeta;
pub mod flatfiles;
pub mod flush;
pub mod index;
pub mod prune;
pub mod state;
pub mod undo;
pub mod unlinked;
pub mod versionbits;

pub use config::ChainStateConfig;
pub use flush::FlushVerdict;
pub use state::{
    ChainStateController, ChainStateError, MempoolSync, ValidationError, ValidationOracle,
};
pub use versionbits::ThresholdState;
