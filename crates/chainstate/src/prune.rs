//! Prune planning: picks whole flat files to delete once total disk usage
//! exceeds the configured target, never touching recent blocks.

use crate::config::ChainStateConfig;
use crate::filemeta::FileMetaRegistry;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub block_files: Vec<u32>,
    pub undo_files: Vec<u32>,
}

impl PrunePlan {
    pub fn is_empty(&self) -> bool {
        self.block_files.is_empty() && self.undo_files.is_empty()
    }
}

/// Latches prune requests between best-chain updates and carries them over
/// when a deletion attempt fails, so failures are retried on the next pass.
#[derive(Default)]
pub struct PruneScheduler {
    check_requested: bool,
}

impl PruneScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_check(&mut self) {
        self.check_requested = true;
    }

    pub fn take_request(&mut self) -> bool {
        std::mem::take(&mut self.check_requested)
    }

    /// Selects files to delete, oldest first, until usage falls back under
    /// the target. A file is eligible only when every block in it is deeper
    /// than the retention window below the tip.
    pub fn plan(
        &self,
        config: &ChainStateConfig,
        tip_height: i32,
        block_files: &FileMetaRegistry,
        undo_files: &FileMetaRegistry,
    ) -> PrunePlan {
        if !config.prune_enabled || tip_height < 0 {
            return PrunePlan::default();
        }
        let mut total = block_files.total_size() + undo_files.total_size();
        if total <= config.prune_target_bytes {
            return PrunePlan::default();
        }
        let prune_below = tip_height - config.prune_retention_blocks;
        let mut plan = PrunePlan::default();
        select_files(
            block_files,
            prune_below,
            config.prune_target_bytes,
            &mut total,
            &mut plan.block_files,
        );
        select_files(
            undo_files,
            prune_below,
            config.prune_target_bytes,
            &mut total,
            &mut plan.undo_files,
        );
        plan
    }
}

fn select_files(
    registry: &FileMetaRegistry,
    prune_below: i32,
    target: u64,
    total: &mut u64,
    out: &mut Vec<u32>,
) {
    for (file_id, info) in registry.iter() {
        if *total <= target {
            break;
        }
        if info.height_last > prune_below {
            // Files fill in height order, so the first protected file ends
            // the eligible range.
            break;
        }
        out.push(file_id);
        *total = total.saturating_sub(info.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemeta::BlockFileInfo;

    fn file(height_first: i32, height_last: i32, size: u64) -> BlockFileInfo {
        let mut info = BlockFileInfo::default();
        for height in height_first..=height_last {
            info.record_block(height, 0);
        }
        info.size = size;
        info
    }

    fn config(target: u64, retention: i32) -> ChainStateConfig {
        ChainStateConfig {
            prune_enabled: true,
            prune_target_bytes: target,
            prune_retention_blocks: retention,
            ..ChainStateConfig::default()
        }
    }

    #[test]
    fn under_target_prunes_nothing() {
        let blocks = FileMetaRegistry::from_entries([(0, file(0, 99, 500))]);
        let undo = FileMetaRegistry::new();
        let scheduler = PruneScheduler::new();
        assert!(scheduler
            .plan(&config(1_000, 10), 200, &blocks, &undo)
            .is_empty());
    }

    #[test]
    fn oldest_files_go_first_until_under_target() {
        let blocks = FileMetaRegistry::from_entries([
            (0, file(0, 99, 400)),
            (1, file(100, 199, 400)),
            (2, file(200, 299, 400)),
        ]);
        let undo = FileMetaRegistry::new();
        let scheduler = PruneScheduler::new();
        let plan = scheduler.plan(&config(500, 10), 400, &blocks, &undo);
        assert_eq!(plan.block_files, vec![0, 1]);
    }

    #[test]
    fn retention_window_protects_recent_files() {
        let blocks = FileMetaRegistry::from_entries([
            (0, file(0, 99, 400)),
            (1, file(100, 199, 400)),
        ]);
        let undo = FileMetaRegistry::new();
        let scheduler = PruneScheduler::new();
        // Tip 250 with retention 200 protects everything above height 50,
        // so even over target only file 0 is still not eligible either.
        let plan = scheduler.plan(&config(100, 200), 250, &blocks, &undo);
        assert!(plan.block_files.is_empty());

        let plan = scheduler.plan(&config(100, 100), 250, &blocks, &undo);
        assert_eq!(plan.block_files, vec![0]);
    }

    #[test]
    fn disabled_config_never_plans() {
        let blocks = FileMetaRegistry::from_entries([(0, file(0, 99, 400))]);
        let undo = FileMetaRegistry::new();
        let scheduler = PruneScheduler::new();
        let mut config = config(10, 10);
        config.prune_enabled = false;
        assert!(scheduler.plan(&config, 400, &blocks, &undo).is_empty());
    }

    #[test]
    fn undo_files_counted_and_selected() {
        let blocks = FileMetaRegistry::from_entries([(0, file(0, 99, 300))]);
        let undo = FileMetaRegistry::from_entries([(0, file(0, 99, 300))]);
        let scheduler = PruneScheduler::new();
        let plan = scheduler.plan(&config(400, 10), 500, &blocks, &undo);
        assert_eq!(plan.block_files, vec![0]);
        assert!(plan.undo_files.is_empty());

        let plan = scheduler.plan(&config(200, 10), 500, &blocks, &undo);
        assert_eq!(plan.block_files, vec![0]);
        assert_eq!(plan.undo_files, vec![0]);
    }

    #[test]
    fn request_latch() {
        let mut scheduler = PruneScheduler::new();
        assert!(!scheduler.take_request());
        scheduler.request_check();
        assert!(scheduler.take_request());
        assert!(!scheduler.take_request());
    }
}
