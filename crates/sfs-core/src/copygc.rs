//! Copying garbage collection.
//!
//! Buckets are never reused while anything in them is live, so a bucket
//! holding a few live ranges among dead space stays out of circulation.
//! Copygc moves the live ranges elsewhere:
//!
//! - node ranges: the node is marked dirty and the next checkpoint writes
//!   it to a fresh location;
//! - extent ranges: the stored bytes are copied to new replicas and the
//!   key is re-pointed by a conditional commit, which loses harmlessly to
//!   any concurrent overwrite.
//!
//! The emptied bucket becomes `PendingFree` and is released by a later
//! checkpoint like any other.

use crate::engine::Shared;
use crate::txn::{CommitOutcome, Transaction};
use serde::{Deserialize, Serialize};
use sfs_alloc::SpaceOwner;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{ExtentValue, Key, ReplicaPtr, Value};
use sfs_types::Cx;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopygcReport {
    pub buckets: usize,
    pub nodes_marked: usize,
    pub extents_moved: usize,
    /// Ranges whose owner no longer references them.
    pub skipped: usize,
    pub bytes_moved: u64,
    pub checkpointed: bool,
}

impl Shared {
    pub(crate) fn run_copygc(&self, cx: &Cx) -> Result<CopygcReport> {
        self.ensure_writable()?;
        let started = Instant::now();
        let candidates = self
            .alloc
            .copygc_candidates(self.opts.copygc_threshold_pct, self.opts.copygc_max_buckets);
        let mut report = CopygcReport {
            buckets: candidates.len(),
            ..CopygcReport::default()
        };
        for cand in &candidates {
            debug!(
                target: "sfs::copygc",
                event = "evacuate_bucket",
                device = cand.device.0,
                bucket = cand.bucket.0,
                live_bytes = cand.live_bytes,
                ranges = cand.live.len()
            );
            for live in &cand.live {
                cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
                match live.owner {
                    SpaceOwner::Node(id) => {
                        if self.tree.mark_dirty(id) {
                            report.nodes_marked += 1;
                        } else {
                            report.skipped += 1;
                        }
                    }
                    SpaceOwner::Extent(key) => match self.move_extent(cx, key, &live.ptr)? {
                        Some(bytes) => {
                            report.extents_moved += 1;
                            report.bytes_moved += bytes;
                        }
                        None => report.skipped += 1,
                    },
                }
            }
        }
        if report.nodes_marked > 0 {
            self.checkpoint(cx)?;
            report.checkpointed = true;
        }
        self.counters.copygc_passes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .extents_moved
            .fetch_add(report.extents_moved as u64, Ordering::Relaxed);
        info!(
            target: "sfs::copygc",
            event = "copygc_pass",
            buckets = report.buckets,
            nodes_marked = report.nodes_marked,
            extents_moved = report.extents_moved,
            skipped = report.skipped,
            bytes_moved = report.bytes_moved,
            elapsed_us = started.elapsed().as_micros()
        );
        Ok(report)
    }

    /// Copy the extent under `key` off `ptr`'s bucket. `None` when the key
    /// no longer references `ptr` or was overwritten meanwhile.
    fn move_extent(&self, cx: &Cx, key: Key, ptr: &ReplicaPtr) -> Result<Option<u64>> {
        let Some(Value::Extent(old)) = self.tree.lookup(&key)? else {
            return Ok(None);
        };
        if !old.replicas.contains(ptr) {
            return Ok(None);
        }
        let stored = self.read_stored(cx, &old)?;
        let (layout, replicas) = self.place(cx, key, &stored)?;
        let moved = ExtentValue {
            layout,
            replicas,
            ..old.clone()
        };
        let new_replicas = moved.replicas.clone();

        let mut txn = Transaction::new();
        txn.expect(key, Some(Value::Extent(old)));
        txn.upsert(key, Value::Extent(moved));
        match self.commit(cx, txn) {
            Ok(CommitOutcome::Committed(_)) => Ok(Some(stored.len() as u64)),
            Ok(CommitOutcome::ConditionFailed { .. }) => {
                self.alloc.free_all(&new_replicas);
                Ok(None)
            }
            Err(err) => {
                self.alloc.free_all(&new_replicas);
                Err(err)
            }
        }
    }
}
