#![forbid(unsafe_code)]
//! Copy-on-write B-tree over sorted-run nodes.
//!
//! ```text
//!                  root (interior, level 2)
//!                 /                        \
//!        interior (level 1)          interior (level 1)
//!        /      |       \              /          \
//!     leaf    leaf     leaf         leaf         leaf
//!  [runs..][open]                  each leaf: sealed runs + open run
//! ```
//!
//! Nodes live in an arena keyed by [`NodeId`]; parents name children by
//! id, and each node carries its own inclusive key range. Leaf ranges tile
//! the key space, which is what every lock-free-of-structure path relies
//! on: whoever locks a node re-checks that it is alive and still covers the
//! key, and restarts otherwise.
//!
//! Concurrency at a glance:
//!
//! | path            | locks                                     |
//! |-----------------|-------------------------------------------|
//! | lookup / scan   | read, lock-coupled top-down               |
//! | commit          | intent on covered leaves, then write      |
//! | split / merge   | structure mutex, parent + children intent |
//! | writeback       | structure mutex, write per node           |
//!
//! Disk locations change only at writeback ([`Btree::writeback`]).

mod batch;
mod cursor;
mod iter;
mod node;
mod persist;
mod store;
mod structure;

pub use batch::{ApplyOutcome, LeafBatch};
pub use cursor::Cursor;
pub use iter::RangeIter;
pub use node::{ChildRef, NodeData};
pub use persist::{NodeIo, WritebackOutcome};
pub use store::BtreeNode;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_lock::{LockWaitSnapshot, LockWaitStats};
use sfs_ondisk::key::MAX_PAYLOAD_LEN;
use sfs_ondisk::node::{NODE_HEADER_LEN, NODE_TRAILER_LEN, RUN_HEADER_LEN};
use sfs_ondisk::{Key, NodePtr, NodeRange, Value, entry_len};
use sfs_types::{JournalSeq, NodeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use store::NodeStore;
use tracing::warn;

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Maximum encoded page size.
    pub node_size: u32,
    /// Replicas per node pointer; sizes interior fanout.
    pub metadata_replicas: u8,
    /// Sealed runs a leaf may carry before it is compacted.
    pub max_runs_per_node: usize,
    /// Open-run entries that trigger sealing a new run.
    pub open_run_max_entries: usize,
    /// Nodes below this fill percentage look for a sibling to merge with.
    pub merge_threshold_pct: u8,
    /// Lock waits longer than this are counted and logged.
    pub long_lock_wait: Duration,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            node_size: 16 * 1024,
            metadata_replicas: 1,
            max_runs_per_node: 4,
            open_run_max_entries: 64,
            merge_threshold_pct: 25,
            long_lock_wait: Duration::from_millis(100),
        }
    }
}

impl TreeOptions {
    /// Small nodes so tests reach several levels with a few hundred keys.
    #[cfg(test)]
    pub(crate) fn small_for_tests() -> Self {
        Self {
            node_size: 1024,
            max_runs_per_node: 3,
            open_run_max_entries: 8,
            ..Self::default()
        }
    }

    /// Entry bytes a compacted leaf page can hold.
    #[must_use]
    pub fn leaf_payload_limit(&self) -> usize {
        (self.node_size as usize)
            .saturating_sub(NODE_HEADER_LEN + RUN_HEADER_LEN + NODE_TRAILER_LEN)
    }

    /// Children an interior page can hold.
    #[must_use]
    pub fn max_fanout(&self) -> usize {
        let replicas = usize::from(self.metadata_replicas.max(1));
        self.leaf_payload_limit() / entry_len(NodePtr::encoded_len_for(replicas))
    }

    /// Largest single entry a leaf accepts; a quarter page keeps byte-median
    /// splits productive.
    #[must_use]
    pub fn max_entry_len(&self) -> usize {
        (self.leaf_payload_limit() / 4).min(entry_len(MAX_PAYLOAD_LEN))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_fanout() < 4 {
            return Err(SfsError::InvalidGeometry(format!(
                "node size {} leaves room for {} children, need at least 4",
                self.node_size,
                self.max_fanout()
            )));
        }
        if self.max_runs_per_node == 0 || self.open_run_max_entries == 0 {
            return Err(SfsError::InvalidGeometry(
                "run limits must be non-zero".to_owned(),
            ));
        }
        if self.merge_threshold_pct > 45 {
            return Err(SfsError::InvalidGeometry(format!(
                "merge threshold {}% would fight with splits",
                self.merge_threshold_pct
            )));
        }
        Ok(())
    }
}

// ── Stats ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TreeCounters {
    splits: AtomicU64,
    merges: AtomicU64,
    compactions: AtomicU64,
    root_splits: AtomicU64,
    root_collapses: AtomicU64,
    restarts: AtomicU64,
    unreadable: AtomicU64,
    replay_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    pub height: u8,
    pub nodes: usize,
    pub leaves: usize,
    pub splits: u64,
    pub merges: u64,
    pub compactions: u64,
    pub root_splits: u64,
    pub root_collapses: u64,
    /// Descents that had to start over after a concurrent reshape.
    pub restarts: u64,
    /// Nodes loaded without contents because no replica could be read.
    pub unreadable_nodes: u64,
    /// Replayed mutations dropped because their range is unreadable.
    pub replay_skipped: u64,
    pub lock_waits: LockWaitSnapshot,
}

/// Result of a full invariant walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    pub height: u8,
    pub nodes: usize,
    pub leaves: usize,
    pub entries: usize,
    pub unreadable: usize,
}

// ── Tree ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Btree {
    opts: TreeOptions,
    store: NodeStore,
    root: RwLock<NodeId>,
    /// Serializes splits, merges, root changes, and writeback.
    structure: Mutex<()>,
    /// Locations of nodes merged away since the last writeback.
    retired: Mutex<Vec<NodePtr>>,
    counters: TreeCounters,
    lock_stats: Arc<LockWaitStats>,
}

impl Btree {
    /// Empty tree: a single leaf root covering the whole key space.
    pub fn new(opts: TreeOptions) -> Result<Self> {
        opts.validate()?;
        let tree = Self::bare(opts, 1);
        let id = tree.store.alloc_id();
        tree.store.insert(NodeData::new_leaf(id, NodeRange::FULL));
        *tree.root.write() = id;
        Ok(tree)
    }

    fn bare(opts: TreeOptions, first_id: u64) -> Self {
        let lock_stats = Arc::new(LockWaitStats::new(opts.long_lock_wait));
        Self {
            store: NodeStore::new(first_id, Arc::clone(&lock_stats)),
            root: RwLock::new(NodeId(0)),
            structure: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            counters: TreeCounters::default(),
            lock_stats,
            opts,
        }
    }

    #[must_use]
    pub fn options(&self) -> &TreeOptions {
        &self.opts
    }

    #[must_use]
    pub fn root_id(&self) -> NodeId {
        *self.root.read()
    }

    pub(crate) fn root_node(&self) -> Result<Arc<BtreeNode>> {
        let id = self.root_id();
        self.store.get(id).ok_or_else(|| SfsError::NodeCorrupt {
            node: id.0,
            detail: "root missing from node store".to_owned(),
        })
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<Arc<BtreeNode>> {
        self.store.get(id)
    }

    /// Smallest id never handed out; persisted so ids stay unique across
    /// mounts.
    #[must_use]
    pub fn next_node_id(&self) -> u64 {
        self.store.peek_next_id()
    }

    pub(crate) fn note_restart(&self) {
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn lock_stats(&self) -> Arc<LockWaitStats> {
        Arc::clone(&self.lock_stats)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    pub fn lookup(&self, key: &Key) -> Result<Option<Value>> {
        let leaf = self.cursor().seek(key)?;
        Ok(leaf.lookup(key))
    }

    /// Lazy scan over `[start, end]`.
    #[must_use]
    pub fn range(&self, start: Key, end: Key) -> RangeIter<'_> {
        RangeIter::new(self, start, end)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Reject entries a leaf could never hold.
    pub fn check_entry(&self, value: &Value) -> Result<()> {
        let len = entry_len(value.payload_len());
        let max = self.opts.max_entry_len();
        if len > max {
            return Err(SfsError::ValueTooLarge { len, max });
        }
        Ok(())
    }

    /// Intent-lock every leaf covering `keys`.
    pub fn lock_leaves(&self, keys: &[Key]) -> Result<LeafBatch<'_>> {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        loop {
            let mut targets: Vec<(NodeRange, NodeId, sfs_lock::SixLock<NodeData>)> = Vec::new();
            let mut cursor = self.cursor();
            for key in &sorted {
                if targets.last().is_some_and(|(r, _, _)| r.contains(key)) {
                    continue;
                }
                let leaf = cursor.seek(key)?;
                targets.push((leaf.range(), leaf.id(), leaf.lock().clone()));
            }
            targets.sort_by_key(|(r, id, _)| (r.min, *id));
            targets.dedup_by_key(|(_, id, _)| *id);

            let mut guards = Vec::with_capacity(targets.len());
            let mut valid = true;
            for (range, _, lock) in &targets {
                let g = lock.intent();
                if g.is_dead() || g.range() != *range {
                    valid = false;
                    break;
                }
                guards.push(g);
            }
            if valid {
                return LeafBatch::new(self, guards);
            }
            drop(guards);
            self.note_restart();
        }
    }

    /// Apply mutations without a journal record. Used for bulk reloads and
    /// tests; the changes reach disk only through writeback.
    pub fn apply_unjournaled(&self, mutations: &[(Key, Value)]) -> Result<Vec<Option<Value>>> {
        let keys: Vec<Key> = mutations.iter().map(|(k, _)| *k).collect();
        let mut batch = self.lock_leaves(&keys)?;
        batch.upgrade()?;
        let outcome = batch.apply(mutations, JournalSeq::ZERO)?;
        drop(batch);
        self.maintain(&outcome.needs_maintenance)?;
        Ok(outcome.old_values)
    }

    /// Re-apply one journal record during mount. Leaves already stamped
    /// with `seq` or later are left alone, so replaying twice is harmless.
    /// Mutations under an unreadable node are dropped and counted.
    pub fn replay(&self, seq: JournalSeq, mutations: &[(Key, Value)]) -> Result<usize> {
        let kept;
        let mutations = if self.counters.unreadable.load(Ordering::Relaxed) == 0 {
            mutations
        } else {
            kept = self.readable_only(seq, mutations)?;
            &kept[..]
        };
        if mutations.is_empty() {
            return Ok(0);
        }
        let keys: Vec<Key> = mutations.iter().map(|(k, _)| *k).collect();
        let mut batch = self.lock_leaves(&keys)?;
        batch.upgrade()?;
        let outcome = batch.apply_replay(mutations, seq)?;
        drop(batch);
        self.maintain(&outcome.needs_maintenance)?;
        Ok(outcome.applied)
    }

    fn readable_only(&self, seq: JournalSeq, mutations: &[(Key, Value)]) -> Result<Vec<(Key, Value)>> {
        let mut cursor = self.cursor();
        let mut kept = Vec::with_capacity(mutations.len());
        for (key, value) in mutations {
            match cursor.seek(key) {
                Ok(_) => kept.push((*key, value.clone())),
                Err(err @ SfsError::Unreadable { .. }) => {
                    self.counters.replay_skipped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "sfs::btree",
                        event = "replay_skipped_unreadable",
                        seq = seq.0,
                        key = %key,
                        error = %err
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(kept)
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let nodes = self.store.all();
        let leaves = nodes
            .iter()
            .filter(|n| {
                let g = n.lock.read();
                g.is_leaf() && !g.is_dead()
            })
            .count();
        let height = self
            .store
            .get(self.root_id())
            .map_or(0, |root| root.lock.read().level().saturating_add(1));
        let c = &self.counters;
        TreeStats {
            height,
            nodes: nodes.len(),
            leaves,
            splits: c.splits.load(Ordering::Relaxed),
            merges: c.merges.load(Ordering::Relaxed),
            compactions: c.compactions.load(Ordering::Relaxed),
            root_splits: c.root_splits.load(Ordering::Relaxed),
            root_collapses: c.root_collapses.load(Ordering::Relaxed),
            restarts: c.restarts.load(Ordering::Relaxed),
            unreadable_nodes: c.unreadable.load(Ordering::Relaxed),
            replay_skipped: c.replay_skipped.load(Ordering::Relaxed),
            lock_waits: self.lock_stats.snapshot(),
        }
    }

    /// Walk the whole tree and check its structural invariants: child
    /// ranges tile their parent, levels descend by one, every key sits
    /// inside its node's range, and run sequence numbers strictly increase.
    pub fn validate(&self) -> Result<TreeShape> {
        let _structure = self.structure.lock();
        let root = self.root_node()?;
        let height = root.lock.read().level().saturating_add(1);
        let mut shape = TreeShape {
            height,
            nodes: 0,
            leaves: 0,
            entries: 0,
            unreadable: 0,
        };
        self.validate_node(root.id(), NodeRange::FULL, height - 1, &mut shape)?;
        if shape.nodes != self.store.len() {
            warn!(
                target: "sfs::btree",
                event = "unreachable_nodes",
                reachable = shape.nodes,
                stored = self.store.len()
            );
            return Err(SfsError::NodeCorrupt {
                node: root.id().0,
                detail: format!(
                    "{} nodes stored but {} reachable",
                    self.store.len(),
                    shape.nodes
                ),
            });
        }
        Ok(shape)
    }

    fn validate_node(
        &self,
        id: NodeId,
        range: NodeRange,
        level: u8,
        shape: &mut TreeShape,
    ) -> Result<()> {
        let bad = |detail: String| SfsError::NodeCorrupt { node: id.0, detail };
        let node = self
            .store
            .get(id)
            .ok_or_else(|| bad("missing from node store".to_owned()))?;
        let g = node.lock.read();
        if g.is_dead() {
            return Err(bad("dead node still referenced".to_owned()));
        }
        if g.range() != range {
            return Err(bad(format!("range {:?} expected {range:?}", g.range())));
        }
        if g.level() != level {
            return Err(bad(format!("level {} expected {level}", g.level())));
        }
        shape.nodes += 1;
        if g.unreadable.is_some() {
            shape.unreadable += 1;
            return Ok(());
        }

        if g.is_leaf() {
            shape.leaves += 1;
            if g.runs.windows(2).any(|w| w[0].seq() >= w[1].seq()) {
                return Err(bad("run sequence numbers not strictly increasing".to_owned()));
            }
            if g.runs.last().is_some_and(|r| r.seq() >= g.next_seq) {
                return Err(bad("next run sequence already used".to_owned()));
            }
            let stray = g
                .runs
                .iter()
                .flat_map(|r| r.entries().iter().map(|(k, _)| k))
                .chain(g.open.keys())
                .any(|k| !range.contains(k));
            if stray {
                return Err(bad("key outside node range".to_owned()));
            }
            shape.entries += g.entries().len();
            return Ok(());
        }

        let children = g.children();
        if children.is_empty() {
            return Err(bad("interior node without children".to_owned()));
        }
        if children.windows(2).any(|w| w[0].max_key >= w[1].max_key) {
            return Err(bad("child max keys not ascending".to_owned()));
        }
        let plan: Vec<(NodeId, NodeRange)> = (0..children.len())
            .map(|i| (children[i].id, g.child_range(i)))
            .collect();
        drop(g);
        for (child, child_range) in plan {
            self.validate_node(child, child_range, level - 1, shape)?;
        }
        Ok(())
    }
}
