//! Chain-state-wide constants shared across scheduling and validation.

/// The maximum size of a blk?????.dat block file.
pub const MAX_BLOCKFILE_SIZE: u64 = 0x800_0000; // 128 MiB
/// The pre-allocation chunk size for blk?????.dat files.
pub const BLOCKFILE_CHUNK_SIZE: u64 = 0x100_0000; // 16 MiB
/// The pre-allocation chunk size for rev?????.dat undo files.
pub const UNDOFILE_CHUNK_SIZE: u64 = 0x10_0000; // 1 MiB

/// Time to wait (in seconds) between periodic block-index writes to disk.
pub const DATABASE_WRITE_INTERVAL_SECS: u64 = 60 * 60;
/// Time to wait (in seconds) between full chainstate flushes to disk.
pub const DATABASE_FLUSH_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Compensate for the extra memory peak (x1.5-x1.9) seen at flush time.
pub const DB_PEAK_USAGE_FACTOR: u64 = 2;
/// No periodic flush needed while at least this fraction of the cache budget
/// is still free (numerator over [`USAGE_THRESHOLD_DENOM`]).
pub const LOW_USAGE_THRESHOLD_NUM: u64 = 1;
/// Always flush once usage crosses this fraction of the scaled cache budget.
pub const HIGH_USAGE_THRESHOLD_NUM: u64 = 9;
pub const USAGE_THRESHOLD_DENOM: u64 = 10;

/// Default in-memory UTXO cache budget, in bytes.
pub const DEFAULT_COIN_CACHE_USAGE: u64 = 5000 * 300;

/// Blocks that must always be retained on disk below the active tip when
/// pruning; deep enough to serve any reorg accepted under normal rules.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;
/// The smallest prune target accepted from configuration, in bytes.
pub const MIN_PRUNE_TARGET_BYTES: u64 = 550 * 1024 * 1024;

/// Number of ancestor timestamps used for the median-time-past computation.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Whether header checkpoints are enforced unless configured otherwise.
pub const DEFAULT_CHECKPOINTS_ENABLED: bool = true;
