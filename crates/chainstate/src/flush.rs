//! Decides when the block index and the UTXO cache go to disk: periodic
//! timers, plus cache-pressure overrides in both directions.

use std::time::Instant;

use copperd_consensus::constants::{
    DB_PEAK_USAGE_FACTOR, HIGH_USAGE_THRESHOLD_NUM, LOW_USAGE_THRESHOLD_NUM,
    USAGE_THRESHOLD_DENOM,
};

use crate::config::ChainStateConfig;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushVerdict {
    Skip,
    Periodic,
    /// Cache pressure: flush regardless of the timer.
    Forced,
}

pub struct PersistenceScheduler {
    last_index_write: Instant,
    last_flush: Instant,
}

impl PersistenceScheduler {
    pub fn new(now: Instant) -> Self {
        Self {
            last_index_write: now,
            last_flush: now,
        }
    }

    pub fn should_write_index(&self, now: Instant, config: &ChainStateConfig) -> bool {
        now.duration_since(self.last_index_write).as_secs() >= config.index_write_interval_secs
    }

    pub fn note_index_written(&mut self, now: Instant) {
        self.last_index_write = now;
    }

    /// Flush policy for the UTXO cache. Memory headroom is measured against
    /// the configured budget scaled by the flush-time peak factor.
    pub fn flush_verdict(
        &self,
        now: Instant,
        cache_usage_bytes: u64,
        config: &ChainStateConfig,
    ) -> FlushVerdict {
        let scaled_budget = config.utxo_cache_limit_bytes * DB_PEAK_USAGE_FACTOR;
        if cache_usage_bytes * USAGE_THRESHOLD_DENOM
            >= scaled_budget * HIGH_USAGE_THRESHOLD_NUM
        {
            return FlushVerdict::Forced;
        }
        let due = now.duration_since(self.last_flush).as_secs() >= config.flush_interval_secs;
        if !due {
            return FlushVerdict::Skip;
        }
        // A periodic flush is pointless while the cache is still mostly
        // empty; wait for either pressure or more accumulated state.
        if cache_usage_bytes * USAGE_THRESHOLD_DENOM
            < scaled_budget * LOW_USAGE_THRESHOLD_NUM
        {
            return FlushVerdict::Skip;
        }
        FlushVerdict::Periodic
    }

    pub fn note_flushed(&mut self, now: Instant) {
        self.last_flush = now;
        self.last_index_write = now;
    }
}
