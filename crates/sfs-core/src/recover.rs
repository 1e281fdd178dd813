//! Last-resort recovery by full device scan.
//!
//! Node pages describe themselves (id, level, key range, journal sequence)
//! and carry their own checksum, so the leaf level can be rebuilt without
//! a root pointer: read every data bucket, keep each leaf that decodes,
//! and let newer leaves shadow older copies of the same key range.
//!
//! The result is a sorted entry list to [`Engine::import`] into a freshly
//! formatted filesystem. Commits that only reached the journal are not
//! included.
//!
//! [`Engine::import`]: crate::Engine::import

use crate::layout;
use crate::options::EngineOptions;
use serde::{Deserialize, Serialize};
use sfs_block::{ByteDevice, DeviceSet};
use sfs_error::{Result, SfsError};
use sfs_ondisk::{ALLOC_ALIGN, Bset, Key, NodePage, NodeRange, Value, align_alloc, merge_runs};
use sfs_types::{Cx, JOURNAL_FIRST_BUCKET, JournalSeq};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub buckets_scanned: u64,
    pub pages_found: u64,
    pub pages_rejected: u64,
    pub leaves_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredTree {
    /// Live entries in key order; whiteouts resolved.
    pub entries: Vec<(Key, Value)>,
    pub stats: ScanStats,
}

/// Distinct leaf copies: the same node may appear at several sequences
/// and, across a split, with several ranges.
type LeafCopies = BTreeMap<(u64, JournalSeq, Key, Key), NodePage>;

fn scan_bucket(buf: &[u8], leaves: &mut LeafCopies, stats: &mut ScanStats) {
    let step = ALLOC_ALIGN as usize;
    let mut off = 0_usize;
    while off + step <= buf.len() {
        let Some(len) = NodePage::declared_len(&buf[off..]) else {
            off += step;
            continue;
        };
        if off + len > buf.len() {
            stats.pages_rejected += 1;
            off += step;
            continue;
        }
        match NodePage::decode(&buf[off..off + len], None) {
            Ok(page) => {
                stats.pages_found += 1;
                if page.level == 0 {
                    leaves
                        .entry((page.id.0, page.journal_seq, page.range.min, page.range.max))
                        .or_insert(page);
                }
                off += usize::try_from(align_alloc(len as u64)).unwrap_or(len).max(step);
            }
            Err(_) => {
                stats.pages_rejected += 1;
                off += step;
            }
        }
    }
}

/// Newest first: a key belongs to the newest leaf copy whose range covers
/// it, even when that copy no longer holds the key.
fn resolve(leaves: LeafCopies) -> (Vec<(Key, Value)>, u64) {
    let mut ordered: Vec<NodePage> = leaves.into_values().collect();
    ordered.sort_by(|a, b| b.journal_seq.cmp(&a.journal_seq).then(b.id.cmp(&a.id)));
    let mut claimed: Vec<NodeRange> = Vec::new();
    let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
    let mut used = 0_u64;
    for page in &ordered {
        let runs: Vec<&[(Key, Value)]> = page.runs.iter().map(Bset::entries).collect();
        let mut contributed = false;
        for (key, value) in merge_runs(&runs, false) {
            if claimed.iter().any(|r| r.contains(&key)) {
                continue;
            }
            contributed = true;
            merged.insert(key, value);
        }
        if contributed {
            used += 1;
        }
        claimed.push(page.range);
    }
    let entries = merged.into_iter().filter(|(_, v)| !v.is_whiteout()).collect();
    (entries, used)
}

/// Rebuild the newest leaf contents found anywhere on `devices`.
pub fn scan_recover(
    cx: &Cx,
    devices: Vec<Arc<dyn ByteDevice>>,
    opts: &EngineOptions,
) -> Result<RecoveredTree> {
    let set = DeviceSet::new(devices, opts.retry_policy(), 0)?;
    let mut geometry = opts.clone();
    if let Some(sb) = set
        .ids()
        .find_map(|dev| layout::read_device_superblock(cx, &set, dev, opts.bucket_size).ok())
    {
        geometry.adopt_geometry(&sb);
    }
    let bucket_size = u64::from(geometry.bucket_size);
    let first_data = JOURNAL_FIRST_BUCKET + u64::from(geometry.journal_buckets);

    let mut stats = ScanStats::default();
    let mut leaves = LeafCopies::new();
    let mut buf = vec![0_u8; geometry.bucket_size as usize];
    for dev in set.ids() {
        let buckets = set.len_bytes(dev)? / bucket_size;
        for bucket in first_data..buckets {
            cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
            if let Err(err) = set.read(cx, dev, bucket * bucket_size, &mut buf) {
                warn!(
                    target: "sfs::core",
                    event = "recover_bucket_unreadable",
                    device = dev.0,
                    bucket,
                    error = %err
                );
                continue;
            }
            stats.buckets_scanned += 1;
            scan_bucket(&buf, &mut leaves, &mut stats);
        }
    }

    let (entries, leaves_used) = resolve(leaves);
    stats.leaves_used = leaves_used;
    info!(
        target: "sfs::core",
        event = "scan_recover",
        buckets = stats.buckets_scanned,
        pages = stats.pages_found,
        rejected = stats.pages_rejected,
        leaves_used = stats.leaves_used,
        entries = entries.len()
    );
    Ok(RecoveredTree { entries, stats })
}
