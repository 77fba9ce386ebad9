//! Block primitives and the canonical serialization codec.

pub mod block;
pub mod encoding;
pub mod hash;

pub use block::{Block, BlockHeader, Transaction};
