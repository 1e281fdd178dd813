//! Engine handle: mount, format, and the shared state every operation
//! runs against.

use crate::checkpoint::{CheckpointReport, CheckpointState};
use crate::copygc::CopygcReport;
use crate::health::HealthReport;
use crate::io::{MetaIo, ReplicaIo};
use crate::layout::{self, journal_nonce};
use crate::options::{Collaborators, EngineOptions};
use crate::txn::{CommitOutcome, Transaction};
use crate::worker::{TaskMsg, Worker};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use sfs_alloc::{Allocator, MarkOutcome, SpaceOwner};
use sfs_block::{ByteDevice, DeviceSet};
use sfs_btree::{Btree, RangeIter, TreeShape};
use sfs_error::{Result, SfsError};
use sfs_journal::{Journal, JournalGeometry};
use sfs_ondisk::{ExtentLayout, ExtentValue, Key, Value};
use sfs_types::{Cx, JournalSeq};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::time::Instant;
use tracing::{error, info, warn};

// ── Shared state ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) commits: AtomicU64,
    pub(crate) condition_failures: AtomicU64,
    pub(crate) replica_fallbacks: AtomicU64,
    pub(crate) stale_pointers: AtomicU64,
    pub(crate) degraded_writes: AtomicU64,
    pub(crate) backpressure_waits: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
    pub(crate) copygc_passes: AtomicU64,
    pub(crate) extents_moved: AtomicU64,
}

impl Counters {
    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub(crate) struct Shared {
    pub(crate) opts: EngineOptions,
    pub(crate) collab: Collaborators,
    pub(crate) devices: Arc<DeviceSet>,
    pub(crate) alloc: Allocator,
    pub(crate) journal: Journal,
    pub(crate) tree: Btree,
    pub(crate) uuid: [u8; 16],
    pub(crate) device_buckets: Vec<u64>,
    /// Commits hold it shared from leaf locking until their mutations are
    /// applied; a checkpoint holds it exclusively.
    pub(crate) gate: RwLock<()>,
    pub(crate) durable: ArcSwap<CheckpointState>,
    pub(crate) read_only: AtomicBool,
    pub(crate) checkpoint_requested: AtomicBool,
    pub(crate) counters: Counters,
    pub(crate) tasks: Mutex<Option<Sender<TaskMsg>>>,
}

impl Shared {
    pub(crate) fn replica_io(&self) -> ReplicaIo<'_> {
        ReplicaIo {
            devices: &self.devices,
            alloc: &self.alloc,
            counters: &self.counters,
            opts: &self.opts,
        }
    }

    pub(crate) fn meta_io(&self) -> MetaIo<'_> {
        MetaIo {
            io: self.replica_io(),
            mounting: false,
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            Err(SfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Stop accepting writes for the rest of this mount. Reads keep
    /// working against the in-memory tree.
    pub(crate) fn enter_read_only(&self, reason: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            error!(target: "sfs::core", event = "emergency_read_only", reason);
        }
    }

    /// Flush the journal, turning a lost journal into read-only mode.
    pub(crate) fn flush_journal(&self, cx: &Cx) -> Result<JournalSeq> {
        self.journal.flush(cx).map_err(|err| {
            if self.journal.is_failed() {
                self.enter_read_only(&err.to_string());
                SfsError::ReadOnly
            } else {
                err
            }
        })
    }

    pub(crate) fn task_sender(&self) -> Option<Sender<TaskMsg>> {
        self.tasks.lock().clone()
    }

    /// Queue background work. False when no worker is running.
    pub(crate) fn request(&self, msg: TaskMsg) -> bool {
        self.task_sender().is_some_and(|tx| tx.send(msg).is_ok())
    }

    /// Ask for an early checkpoint once per low-watermark crossing.
    pub(crate) fn nudge_checkpoint(&self) {
        if self.journal.free_buckets() >= self.opts.journal_low_watermark_buckets {
            return;
        }
        if !self.checkpoint_requested.swap(true, Ordering::AcqRel)
            && !self.request(TaskMsg::Checkpoint { reply: None })
        {
            self.checkpoint_requested.store(false, Ordering::Release);
        }
    }

    /// Journal entries exist past the last checkpoint.
    pub(crate) fn needs_checkpoint(&self) -> bool {
        !self.read_only.load(Ordering::Acquire)
            && self.journal.last_seq().0 > self.durable.load().checkpoint_seq
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// A mounted filesystem.
///
/// All operations take `&self`; the engine is `Sync` and meant to be shared
/// across threads behind an `Arc`. Dropping it stops the background worker
/// without checkpointing; committed work is still durable in the journal.
pub struct Engine {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.shared.devices.len())
            .field("read_only", &self.is_read_only())
            .field("checkpoint", &**self.shared.durable.load())
            .finish_non_exhaustive()
    }
}

fn mark_extent(alloc: &Allocator, key: &Key, ext: &ExtentValue) -> Result<MarkOutcome> {
    let len = match ext.layout {
        ExtentLayout::Replicated => u64::from(ext.stored_size.max(1)),
        ExtentLayout::Parity { shard_len, .. } => u64::from(shard_len),
    };
    let mut outcome = MarkOutcome::Marked;
    for r in &ext.replicas {
        if alloc.mark_allocated(r, len, SpaceOwner::Extent(*key))? == MarkOutcome::Stale {
            outcome = MarkOutcome::Stale;
        }
    }
    Ok(outcome)
}

impl Engine {
    /// Write an empty filesystem across `devices`. Returns its uuid.
    pub fn format(cx: &Cx, devices: &[Arc<dyn ByteDevice>], opts: &EngineOptions) -> Result<[u8; 16]> {
        let set = DeviceSet::new(devices.to_vec(), opts.retry_policy(), 0)?;
        layout::format(cx, &set, opts)
    }

    /// Format, then mount.
    pub fn create(
        cx: &Cx,
        devices: Vec<Arc<dyn ByteDevice>>,
        opts: EngineOptions,
        collab: Collaborators,
    ) -> Result<Self> {
        Self::format(cx, &devices, &opts)?;
        Self::open(cx, devices, opts, collab)
    }

    /// Mount an existing filesystem.
    ///
    /// Recovery sequence:
    /// 1. Pick the newest valid superblock; adopt its geometry.
    /// 2. Rebuild the bucket table from the persisted generations.
    /// 3. Load the tree from the checkpoint root, marking node space live.
    /// 4. Replay journal records past the checkpoint.
    /// 5. Mark the space of every extent the tree now references.
    /// 6. Start the background worker.
    pub fn open(
        cx: &Cx,
        devices: Vec<Arc<dyn ByteDevice>>,
        opts: EngineOptions,
        collab: Collaborators,
    ) -> Result<Self> {
        let started = Instant::now();
        opts.validate()?;
        let devices = Arc::new(DeviceSet::new(
            devices,
            opts.retry_policy(),
            opts.read_cache_pages,
        )?);
        let view = layout::read_superblocks(cx, &devices, opts.bucket_size)?;
        for (dev, reason) in &view.missing {
            if !opts.allow_degraded {
                return Err(SfsError::Format(format!("{dev}: {reason}")));
            }
            devices.mark_failed(*dev, "no valid superblock");
        }
        let mut opts = opts;
        opts.adopt_geometry(&view.best);
        opts.validate()?;
        let sb = view.best;

        let alloc = Allocator::from_gens(sb.bucket_size, sb.journal_buckets, &sb.device_buckets, &view.gens)?;
        let counters = Counters::default();
        let tree = {
            let io = MetaIo {
                io: ReplicaIo {
                    devices: &devices,
                    alloc: &alloc,
                    counters: &counters,
                    opts: &opts,
                },
                mounting: true,
            };
            Btree::load(cx, &io, sb.root.as_ref(), sb.next_node_id, opts.tree_options())?
        };

        let (journal, records) = Journal::open(
            cx,
            Arc::clone(&devices),
            JournalGeometry {
                bucket_size: sb.bucket_size,
                nr_buckets: sb.journal_buckets,
            },
            journal_nonce(&sb.uuid),
            sb.checkpoint_seq,
        )?;
        let mut replayed = 0_usize;
        for rec in &records {
            replayed += tree.replay(rec.seq, &rec.mutations)?;
        }

        let mut stale_extents = 0_u64;
        let mut bad_extents = 0_u64;
        tree.for_each_leaf_entry(|key, value| {
            if let Value::Extent(ext) = value {
                match mark_extent(&alloc, key, ext) {
                    Ok(MarkOutcome::Stale) => stale_extents += 1,
                    Ok(_) => {}
                    Err(err) => {
                        bad_extents += 1;
                        warn!(
                            target: "sfs::core",
                            event = "extent_pointer_invalid",
                            key = %key,
                            error = %err
                        );
                    }
                }
            }
        });
        counters
            .stale_pointers
            .fetch_add(stale_extents, Ordering::Relaxed);

        let root_id = tree.root_id().0;
        let shape = tree.stats();
        let shared = Arc::new(Shared {
            durable: ArcSwap::from_pointee(CheckpointState {
                sb_seq: sb.sb_seq,
                checkpoint_seq: sb.checkpoint_seq.0,
                root: sb.root.as_ref().map(|r| r.id.0),
            }),
            opts,
            collab,
            devices,
            alloc,
            journal,
            tree,
            uuid: sb.uuid,
            device_buckets: sb.device_buckets.clone(),
            gate: RwLock::new(()),
            read_only: AtomicBool::new(false),
            checkpoint_requested: AtomicBool::new(false),
            counters,
            tasks: Mutex::new(None),
        });
        let worker = if shared.opts.background_tasks {
            Some(Worker::start(Arc::clone(&shared))?)
        } else {
            None
        };
        info!(
            target: "sfs::core",
            event = "mount",
            devices = shared.devices.len(),
            sb_seq = sb.sb_seq,
            checkpoint_seq = sb.checkpoint_seq.0,
            records = records.len(),
            replayed,
            root = root_id,
            height = shape.height,
            nodes = shape.nodes,
            stale_extents,
            bad_extents,
            elapsed_us = started.elapsed().as_micros()
        );
        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.shared.opts
    }

    #[must_use]
    pub fn uuid(&self) -> [u8; 16] {
        self.shared.uuid
    }

    #[must_use]
    pub fn device_buckets(&self) -> &[u64] {
        &self.shared.device_buckets
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Newest committed value for `key`. Whiteouts read as absent.
    pub fn lookup(&self, key: &Key) -> Result<Option<Value>> {
        self.shared.tree.lookup(key)
    }

    /// Committed entries with `start <= key <= end` in key order.
    ///
    /// Each leaf is read under its own lock, so the scan observes every
    /// leaf at some committed state but not necessarily all at the same
    /// one.
    pub fn range_scan(&self, start: Key, end: Key) -> RangeIter<'_> {
        self.shared.tree.range(start, end)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Apply a transaction atomically. See [`Transaction`].
    pub fn commit(&self, cx: &Cx, txn: Transaction) -> Result<CommitOutcome> {
        self.shared.commit(cx, txn)
    }

    /// Single-key upsert; returns the value it replaced.
    pub fn upsert(&self, cx: &Cx, key: Key, value: Value) -> Result<Option<Value>> {
        let mut txn = Transaction::new();
        txn.upsert(key, value);
        Ok(self.commit(cx, txn)?.into_committed().and_then(|mut info| {
            info.old_values.pop().and_then(|(_, old)| old)
        }))
    }

    /// Single-key delete; returns the value it removed.
    pub fn delete(&self, cx: &Cx, key: Key) -> Result<Option<Value>> {
        self.upsert(cx, key, Value::Whiteout)
    }

    /// Store `data` under `key`: inline when small, otherwise as an extent.
    /// Returns the value it replaced.
    pub fn put_data(&self, cx: &Cx, key: Key, data: &[u8]) -> Result<Option<Value>> {
        if data.len() <= self.inline_limit() {
            return self.upsert(cx, key, Value::Inline(data.to_vec()));
        }
        let ext = self.shared.write_extent(cx, key, data)?;
        let replicas = ext.replicas.clone();
        self.upsert(cx, key, Value::Extent(ext)).inspect_err(|_| {
            self.shared.alloc.free_all(&replicas);
        })
    }

    /// Bytes stored under `key`, read through its extent when it has one.
    pub fn get_data(&self, cx: &Cx, key: &Key) -> Result<Option<Vec<u8>>> {
        match self.lookup(key)? {
            None | Some(Value::Whiteout) => Ok(None),
            Some(Value::Inline(bytes)) => Ok(Some(bytes)),
            Some(Value::Extent(ext)) => self.shared.read_extent(cx, &ext).map(Some),
            Some(Value::Node(_)) => Err(SfsError::CorruptKey(format!("{key} holds a node pointer"))),
        }
    }

    /// Largest payload `put_data` keeps inline.
    #[must_use]
    pub fn inline_limit(&self) -> usize {
        self.shared.tree.options().max_entry_len() / 4
    }

    /// Write out-of-node data and return its extent value. Nothing
    /// references the space until a committed transaction stores the value.
    pub fn write_extent(&self, cx: &Cx, owner: Key, data: &[u8]) -> Result<ExtentValue> {
        self.shared.write_extent(cx, owner, data)
    }

    /// Read and verify an extent, falling back across replicas or
    /// rebuilding a lost parity shard.
    pub fn read_extent(&self, cx: &Cx, ext: &ExtentValue) -> Result<Vec<u8>> {
        self.shared.read_extent(cx, ext)
    }

    /// Bulk load: commits `entries` in batches that fit one journal record.
    pub fn import(&self, cx: &Cx, entries: impl IntoIterator<Item = (Key, Value)>) -> Result<usize> {
        let batch = self.shared.opts.open_run_max_entries.max(1);
        let mut txn = Transaction::new();
        let mut total = 0_usize;
        for (key, value) in entries {
            txn.upsert(key, value);
            if txn.pending_writes() >= batch {
                total += txn.pending_writes();
                self.commit(cx, std::mem::take(&mut txn))?;
            }
        }
        if !txn.is_empty() {
            total += txn.pending_writes();
            self.commit(cx, txn)?;
        }
        Ok(total)
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Make every committed transaction durable in the journal.
    pub fn sync(&self, cx: &Cx) -> Result<JournalSeq> {
        self.shared.flush_journal(cx)
    }

    /// Persist the tree and publish a new superblock.
    pub fn checkpoint(&self, cx: &Cx) -> Result<CheckpointReport> {
        self.shared.checkpoint(cx)
    }

    /// Evacuate sparse buckets now.
    pub fn run_copygc(&self, cx: &Cx) -> Result<CopygcReport> {
        self.shared.run_copygc(cx)
    }

    /// Hand a task to the background worker without waiting. False when
    /// background tasks are disabled.
    pub fn schedule(&self, task: MaintenanceTask) -> bool {
        self.shared.request(match task {
            MaintenanceTask::Checkpoint => TaskMsg::Checkpoint { reply: None },
            MaintenanceTask::Copygc => TaskMsg::Copygc { reply: None },
            MaintenanceTask::FlushJournal => TaskMsg::FlushJournal,
        })
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport::collect(&self.shared)
    }

    /// Walk the tree and check every structural invariant.
    pub fn validate(&self) -> Result<TreeShape> {
        self.shared.tree.validate()
    }

    #[must_use]
    pub fn tree(&self) -> &Btree {
        &self.shared.tree
    }

    #[must_use]
    pub fn devices(&self) -> &DeviceSet {
        &self.shared.devices
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.shared.alloc
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.shared.journal
    }

    fn stop_worker(&self) {
        *self.shared.tasks.lock() = None;
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
    }

    /// Clean unmount: stop background work and write a final checkpoint.
    /// A read-only engine skips the checkpoint.
    pub fn shutdown(self, cx: &Cx) -> Result<Option<CheckpointReport>> {
        self.stop_worker();
        if self.is_read_only() {
            info!(target: "sfs::core", event = "unmount", checkpointed = false);
            return Ok(None);
        }
        let report = self.shared.checkpoint(cx)?;
        info!(target: "sfs::core", event = "unmount", checkpointed = true, sb_seq = report.sb_seq);
        Ok(Some(report))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Work that can be queued on the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    Checkpoint,
    Copygc,
    FlushJournal,
}
