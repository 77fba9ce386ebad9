//! Version-bits soft-fork state machine with a per-branch boundary cache,
//! plus the unknown-signal warning check run at tip changes.

use std::collections::HashMap;

use copperd_consensus::deployments::{
    has_versionbits_prefix, known_deployment_mask, signals_bit, DeploymentIndex,
    ALWAYS_ACTIVE_START_TIME, MAX_DEPLOYMENTS, VERSIONBITS_TOP_MASK,
};
use copperd_consensus::params::ConsensusParams;
use copperd_log::log_warn;

use crate::blockindex::{BlockIndexGraph, NodeId};

/// Recent blocks examined for version bits no known deployment claims.
pub const UNKNOWN_SIGNAL_WINDOW: usize = 100;
/// Unexpected-version count within the window that raises the warning.
pub const UNKNOWN_SIGNAL_THRESHOLD: usize = 50;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

/// Caches the threshold state at each signalling-period boundary block.
/// Keys are index nodes, so states computed on one branch never leak onto
/// another.
#[derive(Default)]
pub struct SoftForkActivationTracker {
    cache: [HashMap<NodeId, ThresholdState>; MAX_DEPLOYMENTS],
    unknown_signal: bool,
}

impl SoftForkActivationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threshold state of a deployment as of the given tip. State changes
    /// only at period boundaries; between boundaries the boundary state
    /// applies.
    pub fn state_for(
        &mut self,
        graph: &BlockIndexGraph,
        params: &ConsensusParams,
        idx: DeploymentIndex,
        tip: Option<NodeId>,
    ) -> ThresholdState {
        let deployment = *params.deployment(idx);
        if deployment.start_time == ALWAYS_ACTIVE_START_TIME {
            return ThresholdState::Active;
        }
        let period = params.miner_confirmation_window as i32;

        let mut boundary = tip.and_then(|tip| {
            let height = graph.node(tip).height;
            let target = height - ((height + 1) % period);
            if target < 0 {
                None
            } else {
                graph.ancestor_at_height(tip, target)
            }
        });

        // Walk back period by period until a cached boundary, the schedule
        // start, or genesis.
        let mut to_compute = Vec::new();
        let mut state = ThresholdState::Defined;
        while let Some(node_id) = boundary {
            if let Some(cached) = self.cache[idx.as_usize()].get(&node_id) {
                state = *cached;
                break;
            }
            if graph.median_time_past(node_id) < deployment.start_time {
                self.cache[idx.as_usize()].insert(node_id, ThresholdState::Defined);
                break;
            }
            to_compute.push(node_id);
            let prev_height = graph.node(node_id).height - period;
            boundary = if prev_height < 0 {
                None
            } else {
                graph.ancestor_at_height(node_id, prev_height)
            };
        }

        // Replay the transitions forward, caching each boundary.
        while let Some(node_id) = to_compute.pop() {
            state = match state {
                ThresholdState::Defined => {
                    let mtp = graph.median_time_past(node_id);
                    if mtp >= deployment.timeout {
                        ThresholdState::Failed
                    } else if mtp >= deployment.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    if graph.median_time_past(node_id) >= deployment.timeout {
                        ThresholdState::Failed
                    } else {
                        let mut signalling = 0u32;
                        let mut walk = Some(node_id);
                        for _ in 0..period {
                            if let Some(current) = walk {
                                let node = graph.node(current);
                                if signals_bit(node.version, deployment.bit) {
                                    signalling += 1;
                                }
                                walk = node.parent;
                            }
                        }
                        if signalling >= deployment.threshold {
                            ThresholdState::LockedIn
                        } else {
                            ThresholdState::Started
                        }
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                ThresholdState::Active => ThresholdState::Active,
                ThresholdState::Failed => ThresholdState::Failed,
            };
            self.cache[idx.as_usize()].insert(node_id, state);
        }
        state
    }

    /// First height at which the deployment is active as of `tip`, if any.
    pub fn activation_height(
        &mut self,
        graph: &BlockIndexGraph,
        params: &ConsensusParams,
        idx: DeploymentIndex,
        tip: Option<NodeId>,
    ) -> Option<i32> {
        if self.state_for(graph, params, idx, tip) != ThresholdState::Active {
            return None;
        }
        let period = params.miner_confirmation_window as i32;
        let mut tip = tip?;
        loop {
            let height = graph.node(tip).height;
            let prev_boundary = height - ((height + 1) % period) - period;
            let prev_tip = if prev_boundary < 0 {
                None
            } else {
                graph.ancestor_at_height(tip, prev_boundary)
            };
            if self.state_for(graph, params, idx, prev_tip) != ThresholdState::Active {
                return Some(height - ((height + 1) % period) + 1);
            }
            tip = prev_tip?;
        }
    }

    /// Drops cached boundary states above the reorg fork point.
    pub fn on_reorg(&mut self, graph: &BlockIndexGraph, fork_height: i32) {
        for per_deployment in &mut self.cache {
            per_deployment.retain(|id, _| graph.node(*id).height <= fork_height);
        }
    }

    /// Re-examines the recent window for version-bits signals no known
    /// deployment claims and updates the warning flag.
    pub fn update_unknown_signal_warning(
        &mut self,
        graph: &BlockIndexGraph,
        params: &ConsensusParams,
        tip: NodeId,
    ) -> bool {
        let known = known_deployment_mask(&params.deployments);
        let mut unexpected = 0usize;
        let mut walk = Some(tip);
        for _ in 0..UNKNOWN_SIGNAL_WINDOW {
            let id = match walk {
                Some(id) => id,
                None => break,
            };
            let node = graph.node(id);
            if has_versionbits_prefix(node.version)
                && (node.version as u32) & !VERSIONBITS_TOP_MASK & !known != 0
            {
                unexpected += 1;
            }
            walk = node.parent;
        }
        let warn = unexpected >= UNKNOWN_SIGNAL_THRESHOLD;
        if warn && !self.unknown_signal {
            log_warn!(
                "unknown version bits signalled in {unexpected} of the last {UNKNOWN_SIGNAL_WINDOW} blocks"
            );
        }
        self.unknown_signal = warn;
        warn
    }

    pub fn unknown_signal_warning(&self) -> bool {
        self.unknown_signal
    }
}
