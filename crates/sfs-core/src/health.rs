//! Point-in-time health snapshot.

use crate::checkpoint::CheckpointState;
use crate::engine::{Counters, Shared};
use serde::Serialize;
use sfs_alloc::DeviceUsage;
use sfs_block::{DeviceHealth, DeviceStats};
use sfs_btree::TreeStats;
use sfs_error::{Result, SfsError};
use sfs_journal::JournalStats;
use sfs_types::DeviceId;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub read_only: bool,
    pub failed_devices: Vec<DeviceId>,
    pub devices: Vec<DeviceStats>,
    pub usage: Vec<DeviceUsage>,
    /// Allocations that placed fewer replicas than asked.
    pub degraded_allocations: u64,
    /// Writes where some placed replicas failed to land.
    pub degraded_writes: u64,
    /// Reads served by a replica other than the first, or rebuilt from
    /// parity.
    pub replica_fallbacks: u64,
    pub stale_pointers: u64,
    pub backpressure_waits: u64,
    pub commits: u64,
    pub condition_failures: u64,
    pub checkpoints: u64,
    pub copygc_passes: u64,
    pub extents_moved: u64,
    pub last_checkpoint: CheckpointState,
    pub journal: JournalStats,
    pub tree: TreeStats,
}

impl HealthReport {
    pub(crate) fn collect(shared: &Shared) -> Self {
        let devices = shared.devices.stats();
        let c = &shared.counters;
        Self {
            read_only: shared.read_only.load(Ordering::Acquire),
            failed_devices: devices
                .iter()
                .filter(|d| d.health == DeviceHealth::Failed)
                .map(|d| d.device)
                .collect(),
            devices,
            usage: shared.alloc.usage(),
            degraded_allocations: shared.alloc.degraded_allocations(),
            degraded_writes: Counters::get(&c.degraded_writes),
            replica_fallbacks: Counters::get(&c.replica_fallbacks),
            stale_pointers: Counters::get(&c.stale_pointers),
            backpressure_waits: Counters::get(&c.backpressure_waits),
            commits: Counters::get(&c.commits),
            condition_failures: Counters::get(&c.condition_failures),
            checkpoints: Counters::get(&c.checkpoints),
            copygc_passes: Counters::get(&c.copygc_passes),
            extents_moved: Counters::get(&c.extents_moved),
            last_checkpoint: **shared.durable.load(),
            journal: shared.journal.stats(),
            tree: shared.tree.stats(),
        }
    }

    /// Writable, every device online, full redundancy everywhere, and every
    /// node readable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.read_only
            && self.tree.unreadable_nodes == 0
            && self.devices.iter().all(|d| d.health == DeviceHealth::Online)
            && self.degraded_allocations == 0
            && self.degraded_writes == 0
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SfsError::Format(format!("health report: {e}")))
    }
}
