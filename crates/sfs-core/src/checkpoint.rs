//! Checkpoint: persist the tree and publish a superblock that points at it.
//!
//! ```text
//! gate (exclusive)
//!   1. flush journal                  every commit so far is durable
//!   2. seal allocator epoch E
//!   3. write dirty nodes (COW)        new locations, old ones freed in E+1
//!   4. sync devices
//!   5. superblock sb_seq+1            slot (sb_seq+1) % 2, on every device
//!   6. release journal through seq
//!   7. release buckets freed in E-1
//! ```
//!
//! Buckets freed before the previous checkpoint are released, not those
//! freed before this one: the other superblock slot still names the
//! previous tree, and its space must survive until that slot is
//! overwritten.

use crate::engine::{Counters, Shared};
use crate::layout;
use serde::{Deserialize, Serialize};
use sfs_error::Result;
use sfs_types::{Cx, Epoch};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::info;

/// What the newest superblock on disk describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub sb_seq: u64,
    pub checkpoint_seq: u64,
    /// Root node id; `None` before the first checkpoint.
    pub root: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointReport {
    pub sb_seq: u64,
    pub checkpoint_seq: u64,
    pub nodes_written: usize,
    pub nodes_freed: usize,
    pub superblocks_written: usize,
    pub buckets_released: usize,
    pub root: u64,
    pub height: u8,
}

impl Shared {
    pub(crate) fn checkpoint(&self, cx: &Cx) -> Result<CheckpointReport> {
        self.ensure_writable()?;
        let _gate = self.gate.write();
        self.checkpoint_requested.store(false, Ordering::Release);
        let started = Instant::now();

        let through = self.flush_journal(cx)?;
        let sealed = self.alloc.advance_epoch();
        let wb = self.tree.writeback(cx, &self.meta_io())?;
        self.devices.sync_all(cx)?;

        let prev = **self.durable.load();
        let sb_seq = prev.sb_seq + 1;
        let sb = layout::template(
            &self.opts,
            self.uuid,
            &self.device_buckets,
            sb_seq,
            through,
            self.tree.next_node_id(),
            Some(wb.root.clone()),
        )?;
        let superblocks_written =
            layout::write_superblocks(cx, &self.devices, &sb, |dev| self.alloc.gens(dev))?;

        self.durable.store(Arc::new(CheckpointState {
            sb_seq,
            checkpoint_seq: through.0,
            root: Some(wb.root.id.0),
        }));
        self.journal.release_through(through);
        let buckets_released = self
            .alloc
            .release_pending(Epoch(sealed.0.saturating_sub(1)));
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);

        let report = CheckpointReport {
            sb_seq,
            checkpoint_seq: through.0,
            nodes_written: wb.written,
            nodes_freed: wb.freed,
            superblocks_written,
            buckets_released,
            root: wb.root.id.0,
            height: wb.root.level + 1,
        };
        info!(
            target: "sfs::core",
            event = "checkpoint",
            sb_seq,
            checkpoint_seq = through.0,
            nodes_written = wb.written,
            nodes_freed = wb.freed,
            superblocks = superblocks_written,
            buckets_released,
            total = Counters::get(&self.counters.checkpoints),
            elapsed_us = started.elapsed().as_micros()
        );
        Ok(report)
    }
}
