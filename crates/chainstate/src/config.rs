//! Runtime knobs for the chain-state controller.

use copperd_consensus::constants::{
    DATABASE_FLUSH_INTERVAL_SECS, DATABASE_WRITE_INTERVAL_SECS, DEFAULT_CHECKPOINTS_ENABLED,
    DEFAULT_COIN_CACHE_USAGE, MAX_BLOCKFILE_SIZE, MIN_BLOCKS_TO_KEEP, MIN_PRUNE_TARGET_BYTES,
    UNDOFILE_CHUNK_SIZE,
};

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    /// In-memory UTXO cache budget, in bytes. Crossing it forces a flush.
    pub utxo_cache_limit_bytes: u64,
    /// Seconds between periodic block-index writes.
    pub index_write_interval_secs: u64,
    /// Seconds between periodic full flushes.
    pub flush_interval_secs: u64,
    pub prune_enabled: bool,
    /// Total on-disk budget for block and undo files once pruning is on.
    pub prune_target_bytes: u64,
    /// Blocks below the tip that must stay on disk whatever the target says.
    pub prune_retention_blocks: i32,
    pub enforce_checkpoints: bool,
    pub max_block_file_size: u64,
    pub max_undo_file_size: u64,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            utxo_cache_limit_bytes: DEFAULT_COIN_CACHE_USAGE,
            index_write_interval_secs: DATABASE_WRITE_INTERVAL_SECS,
            flush_interval_secs: DATABASE_FLUSH_INTERVAL_SECS,
            prune_enabled: false,
            prune_target_bytes: MIN_PRUNE_TARGET_BYTES,
            prune_retention_blocks: MIN_BLOCKS_TO_KEEP,
            enforce_checkpoints: DEFAULT_CHECKPOINTS_ENABLED,
            max_block_file_size: MAX_BLOCKFILE_SIZE,
            // Undo records are far smaller than blocks; one chunk per file
            // keeps deletion granularity useful.
            max_undo_file_size: UNDOFILE_CHUNK_SIZE * 16,
        }
    }
}

impl ChainStateConfig {
    /// Clamps user-supplied values into their supported ranges.
    pub fn sanitized(mut self) -> Self {
        if self.prune_enabled && self.prune_target_bytes < MIN_PRUNE_TARGET_BYTES {
            self.prune_target_bytes = MIN_PRUNE_TARGET_BYTES;
        }
        if self.prune_retention_blocks < MIN_BLOCKS_TO_KEEP {
            self.prune_retention_blocks = MIN_BLOCKS_TO_KEEP;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_pruning() {
        let config = ChainStateConfig::default();
        assert!(!config.prune_enabled);
        assert!(config.enforce_checkpoints);
        assert_eq!(config.index_write_interval_secs, 3600);
        assert_eq!(config.flush_interval_secs, 86_400);
    }

    #[test]
    fn sanitize_raises_small_prune_target() {
        let config = ChainStateConfig {
            prune_enabled: true,
            prune_target_bytes: 1,
            prune_retention_blocks: 10,
            ..ChainStateConfig::default()
        }
        .sanitized();
        assert_eq!(config.prune_target_bytes, MIN_PRUNE_TARGET_BYTES);
        assert_eq!(config.prune_retention_blocks, MIN_BLOCKS_TO_KEEP);
    }
}
