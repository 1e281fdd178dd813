#![forbid(unsafe_code)]
//! Bucket allocation across devices.
//!
//! Every device is cut into fixed-size buckets. Bucket 0 holds the
//! superblock slots and the next `journal_buckets` hold the journal ring;
//! both are `Reserved` and never handed out. The rest cycle through:
//!
//! ```text
//!            open (gen += 1)          last live byte freed
//!   Free ─────────────────▶ Allocated ─────────────────────▶ PendingFree
//!    ▲                                                            │
//!    └──────────── release_pending(epoch) after checkpoint ───────┘
//! ```
//!
//! Buckets are append-only: each device has at most one open bucket that
//! allocations are carved from, aligned to `ALLOC_ALIGN`. Freed space is
//! not reused inside a bucket; the bucket returns to `Free` only once all of
//! it is dead and a checkpoint has sealed the epoch of the last free. That
//! delay keeps space referenced by a crash-replay path from being reused.
//!
//! Each carved range remembers its owner (a node id or an extent key) so
//! copygc can find what is still live in a sparse bucket.
//!
//! Locking is per device; nothing here touches tree locks.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_ondisk::{Key, ReplicaPtr, align_alloc};
use sfs_types::{BucketIndex, DeviceId, Epoch, Generation, JOURNAL_FIRST_BUCKET, NodeId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketState {
    Free,
    Allocated,
    PendingFree,
    Reserved,
}

/// Who holds a carved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceOwner {
    Node(NodeId),
    Extent(Key),
}

/// Fewer replicas were placed than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degraded {
    pub wanted: u8,
    pub got: u8,
}

impl Degraded {
    #[must_use]
    pub fn to_error(self) -> SfsError {
        SfsError::DegradedReplication {
            wanted: self.wanted,
            got: self.got,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// One pointer per placed replica, each on a distinct device.
    pub ptrs: Vec<ReplicaPtr>,
    /// Aligned length carved from each bucket.
    pub len: u32,
    pub degraded: Option<Degraded>,
}

/// Result of marking an on-disk pointer live at mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    /// The bucket was reused after the last persisted generation table;
    /// its generation was taken from the pointer.
    Adopted,
    /// The pointer predates the bucket's current generation.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUsage {
    pub device: DeviceId,
    pub buckets: u64,
    pub free: u64,
    pub allocated: u64,
    pub pending_free: u64,
    pub reserved: u64,
    pub live_bytes: u64,
}

/// One live range inside a copygc candidate bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSpace {
    pub ptr: ReplicaPtr,
    pub len: u32,
    pub owner: SpaceOwner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopygcCandidate {
    pub device: DeviceId,
    pub bucket: BucketIndex,
    pub live_bytes: u32,
    pub live: Vec<LiveSpace>,
}

// ── Per-device table ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Bucket {
    state: BucketState,
    generation: Generation,
    /// Append cursor.
    fill: u32,
    live: u32,
    /// Epoch of the most recent free inside this bucket.
    free_epoch: Epoch,
    owners: BTreeMap<u32, (u32, SpaceOwner)>,
}

impl Bucket {
    fn new(state: BucketState, generation: Generation) -> Self {
        Self {
            state,
            generation,
            fill: 0,
            live: 0,
            free_epoch: Epoch(0),
            owners: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
struct DeviceBuckets {
    device: DeviceId,
    buckets: Vec<Bucket>,
    open: Option<usize>,
    free_count: u64,
    /// Where the next free-bucket search starts.
    rotor: usize,
}

impl DeviceBuckets {
    fn new(device: DeviceId, nr_buckets: u64, reserved: u64, gens: Option<&[u32]>) -> Result<Self> {
        let nr = usize::try_from(nr_buckets)
            .map_err(|_| SfsError::InvalidGeometry(format!("{device}: bucket count overflows")))?;
        if nr_buckets <= reserved {
            return Err(SfsError::InvalidGeometry(format!(
                "{device}: {nr_buckets} buckets leave no room after {reserved} reserved"
            )));
        }
        if let Some(g) = gens {
            if g.len() != nr {
                return Err(SfsError::Format(format!(
                    "{device}: generation table has {} entries, device has {nr} buckets",
                    g.len()
                )));
            }
        }
        let buckets: Vec<Bucket> = (0..nr)
            .map(|i| {
                let generation = Generation(gens.map_or(0, |g| g[i]));
                if (i as u64) < reserved {
                    Bucket::new(BucketState::Reserved, generation)
                } else {
                    Bucket::new(BucketState::Free, generation)
                }
            })
            .collect();
        Ok(Self {
            device,
            free_count: nr_buckets - reserved,
            buckets,
            open: None,
            rotor: 0,
        })
    }

    fn bucket(&self, idx: BucketIndex) -> Option<(usize, &Bucket)> {
        let i = usize::try_from(idx.0).ok()?;
        self.buckets.get(i).map(|b| (i, b))
    }

    fn free_bytes(&self, bucket_size: u32) -> u64 {
        let open_left = self
            .open
            .map_or(0, |i| u64::from(bucket_size - self.buckets[i].fill));
        self.free_count * u64::from(bucket_size) + open_left
    }

    fn close_open(&mut self) {
        if let Some(i) = self.open.take() {
            let b = &mut self.buckets[i];
            if b.live == 0 {
                b.state = BucketState::PendingFree;
            }
        }
    }

    fn open_free_bucket(&mut self) -> Option<usize> {
        let n = self.buckets.len();
        let start = self.rotor % n.max(1);
        let idx = (0..n)
            .map(|k| (start + k) % n)
            .find(|&i| self.buckets[i].state == BucketState::Free)?;
        let b = &mut self.buckets[idx];
        b.generation = b.generation.next();
        b.state = BucketState::Allocated;
        b.fill = 0;
        b.live = 0;
        b.owners.clear();
        self.free_count -= 1;
        self.open = Some(idx);
        self.rotor = idx + 1;
        Some(idx)
    }

    fn carve(&mut self, len: u32, owner: SpaceOwner, bucket_size: u32) -> Option<ReplicaPtr> {
        let fits = |b: &Bucket| bucket_size - b.fill >= len;
        let idx = match self.open {
            Some(i) if fits(&self.buckets[i]) => i,
            _ => {
                self.close_open();
                self.open_free_bucket()?
            }
        };
        let b = &mut self.buckets[idx];
        let offset = b.fill;
        b.fill += len;
        b.live += len;
        b.owners.insert(offset, (len, owner));
        Some(ReplicaPtr {
            device: self.device,
            bucket: BucketIndex(idx as u64),
            offset,
            generation: b.generation,
        })
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Allocator {
    bucket_size: u32,
    reserved: u64,
    devices: Vec<Mutex<DeviceBuckets>>,
    epoch: AtomicU64,
    degraded_allocations: AtomicU64,
}

impl Allocator {
    /// Fresh table: every non-reserved bucket free at generation 0.
    pub fn new(bucket_size: u32, journal_buckets: u32, device_buckets: &[u64]) -> Result<Self> {
        Self::build(bucket_size, journal_buckets, device_buckets, None)
    }

    /// Table restored from persisted generations; every bucket starts free
    /// and mount marks live space with [`Allocator::mark_allocated`].
    pub fn from_gens(
        bucket_size: u32,
        journal_buckets: u32,
        device_buckets: &[u64],
        gens: &[Vec<u32>],
    ) -> Result<Self> {
        if gens.len() != device_buckets.len() {
            return Err(SfsError::Format(format!(
                "generation tables for {} devices, {} devices present",
                gens.len(),
                device_buckets.len()
            )));
        }
        Self::build(bucket_size, journal_buckets, device_buckets, Some(gens))
    }

    fn build(
        bucket_size: u32,
        journal_buckets: u32,
        device_buckets: &[u64],
        gens: Option<&[Vec<u32>]>,
    ) -> Result<Self> {
        if bucket_size == 0 || u64::from(bucket_size) % sfs_ondisk::ALLOC_ALIGN != 0 {
            return Err(SfsError::InvalidGeometry(format!(
                "bucket size {bucket_size} is not a multiple of {}",
                sfs_ondisk::ALLOC_ALIGN
            )));
        }
        let reserved = JOURNAL_FIRST_BUCKET + u64::from(journal_buckets);
        let devices = device_buckets
            .iter()
            .enumerate()
            .map(|(i, &nr)| {
                let id = DeviceId(u32::try_from(i).map_err(|_| {
                    SfsError::InvalidGeometry("too many devices".to_owned())
                })?);
                let g = gens.map(|g| g[i].as_slice());
                DeviceBuckets::new(id, nr, reserved, g).map(Mutex::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bucket_size,
            reserved,
            devices,
            epoch: AtomicU64::new(1),
            degraded_allocations: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, id: DeviceId) -> Result<&Mutex<DeviceBuckets>> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.devices.get(i))
            .ok_or_else(|| SfsError::NotFound(format!("device {id}")))
    }

    /// Carve `size` bytes (rounded up to `ALLOC_ALIGN`) on up to `replicas`
    /// distinct devices drawn from `usable`.
    ///
    /// Strategy:
    /// 1. Rank usable devices by free bytes, most first.
    /// 2. Take one range from each until enough replicas are placed.
    /// 3. Placing fewer than wanted (but at least one) succeeds with
    ///    `degraded` set; placing none is `NoSpace`.
    pub fn allocate(
        &self,
        size: u64,
        replicas: u8,
        usable: &[DeviceId],
        owner: SpaceOwner,
    ) -> Result<Allocation> {
        if replicas == 0 {
            return Err(SfsError::InvalidGeometry("replica count is zero".to_owned()));
        }
        let aligned = align_alloc(size.max(1));
        if aligned > u64::from(self.bucket_size) {
            return Err(SfsError::ValueTooLarge {
                len: usize::try_from(size).unwrap_or(usize::MAX),
                max: usize::try_from(self.bucket_size).unwrap_or(usize::MAX),
            });
        }
        let len = u32::try_from(aligned).map_err(|_| SfsError::NoSpace)?;

        let mut ranked: Vec<(u64, DeviceId)> = usable
            .iter()
            .filter_map(|&id| {
                let dev = self.device(id).ok()?;
                Some((dev.lock().free_bytes(self.bucket_size), id))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked.dedup_by_key(|(_, id)| *id);

        let mut ptrs = Vec::with_capacity(usize::from(replicas));
        for (_, id) in ranked {
            if ptrs.len() == usize::from(replicas) {
                break;
            }
            let dev = self.device(id)?;
            if let Some(ptr) = dev.lock().carve(len, owner, self.bucket_size) {
                trace!(
                    target: "sfs::alloc",
                    event = "carve",
                    device = ptr.device.0,
                    bucket = ptr.bucket.0,
                    offset = ptr.offset,
                    generation = ptr.generation.0,
                    len
                );
                ptrs.push(ptr);
            }
        }

        if ptrs.is_empty() {
            warn!(target: "sfs::alloc", event = "no_space", size, replicas);
            return Err(SfsError::NoSpace);
        }
        let got = u8::try_from(ptrs.len()).unwrap_or(u8::MAX);
        let degraded = (got < replicas).then(|| {
            self.degraded_allocations.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "sfs::alloc",
                event = "degraded_replication",
                wanted = replicas,
                got
            );
            Degraded {
                wanted: replicas,
                got,
            }
        });
        Ok(Allocation {
            ptrs,
            len,
            degraded,
        })
    }

    /// Release the range at `ptr`. Returns false (and logs) for a pointer
    /// that does not name a live range.
    pub fn free(&self, ptr: &ReplicaPtr) -> bool {
        let Ok(dev) = self.device(ptr.device) else {
            return false;
        };
        let epoch = self.current_epoch();
        let mut d = dev.lock();
        let open = d.open;
        let Some((idx, bucket)) = d.bucket(ptr.bucket) else {
            return false;
        };
        if bucket.state != BucketState::Allocated || bucket.generation != ptr.generation {
            warn!(
                target: "sfs::alloc",
                event = "free_stale",
                device = ptr.device.0,
                bucket = ptr.bucket.0,
                ptr_gen = ptr.generation.0,
                bucket_gen = bucket.generation.0
            );
            return false;
        }
        let b = &mut d.buckets[idx];
        let Some((len, _)) = b.owners.remove(&ptr.offset) else {
            return false;
        };
        b.live -= len;
        b.free_epoch = epoch;
        if b.live == 0 && open != Some(idx) {
            b.state = BucketState::PendingFree;
            debug!(
                target: "sfs::alloc",
                event = "bucket_pending_free",
                device = ptr.device.0,
                bucket = ptr.bucket.0,
                epoch = epoch.0
            );
        }
        true
    }

    pub fn free_all(&self, ptrs: &[ReplicaPtr]) -> usize {
        ptrs.iter().filter(|p| self.free(p)).count()
    }

    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::Acquire))
    }

    /// Start a new free epoch and return the one just sealed. Frees tagged
    /// with the sealed epoch become releasable once the checkpoint that
    /// sealed it is durable.
    pub fn advance_epoch(&self) -> Epoch {
        Epoch(self.epoch.fetch_add(1, Ordering::AcqRel))
    }

    /// Turn pending buckets whose last free is at or before `through` back
    /// into free buckets.
    pub fn release_pending(&self, through: Epoch) -> usize {
        let mut released = 0;
        for dev in &self.devices {
            let mut d = dev.lock();
            let mut n = 0_u64;
            for b in &mut d.buckets {
                if b.state == BucketState::PendingFree && b.free_epoch <= through {
                    b.state = BucketState::Free;
                    b.fill = 0;
                    b.owners.clear();
                    n += 1;
                }
            }
            d.free_count += n;
            released += usize::try_from(n).unwrap_or(usize::MAX);
        }
        if released > 0 {
            debug!(
                target: "sfs::alloc",
                event = "release_pending",
                through = through.0,
                buckets = released
            );
        }
        released
    }

    /// Mount-time: record that `ptr` (of `len` bytes) is referenced by the
    /// tree.
    pub fn mark_allocated(&self, ptr: &ReplicaPtr, len: u64, owner: SpaceOwner) -> Result<MarkOutcome> {
        let dev = self.device(ptr.device)?;
        let mut d = dev.lock();
        let Some((idx, bucket)) = d.bucket(ptr.bucket) else {
            return Err(SfsError::Format(format!(
                "pointer to bucket {} beyond {}",
                ptr.bucket, ptr.device
            )));
        };
        if bucket.state == BucketState::Reserved {
            return Err(SfsError::Format(format!(
                "pointer into reserved bucket {} on {}",
                ptr.bucket, ptr.device
            )));
        }
        let len = u32::try_from(align_alloc(len)).map_err(|_| SfsError::NoSpace)?;
        let was_free = bucket.state == BucketState::Free;
        let outcome = match ptr.generation.cmp(&bucket.generation) {
            std::cmp::Ordering::Less => {
                warn!(
                    target: "sfs::alloc",
                    event = "stale_pointer",
                    device = ptr.device.0,
                    bucket = ptr.bucket.0,
                    ptr_gen = ptr.generation.0,
                    bucket_gen = bucket.generation.0
                );
                return Ok(MarkOutcome::Stale);
            }
            std::cmp::Ordering::Equal => MarkOutcome::Marked,
            std::cmp::Ordering::Greater => MarkOutcome::Adopted,
        };
        let bucket_size = self.bucket_size;
        let b = &mut d.buckets[idx];
        if outcome == MarkOutcome::Adopted && !b.owners.is_empty() {
            warn!(
                target: "sfs::alloc",
                event = "stale_pointer",
                device = ptr.device.0,
                bucket = ptr.bucket.0,
                dropped = b.owners.len()
            );
            b.owners.clear();
            b.live = 0;
        }
        b.generation = ptr.generation;
        b.state = BucketState::Allocated;
        if b.owners.insert(ptr.offset, (len, owner)).is_none() {
            b.live += len;
        }
        b.fill = b.fill.max(ptr.offset.saturating_add(len)).min(bucket_size);
        if was_free {
            d.free_count -= 1;
        }
        Ok(outcome)
    }

    /// `StaleGeneration` unless `ptr` names live space at its generation.
    pub fn check_ptr(&self, ptr: &ReplicaPtr) -> Result<()> {
        let dev = self.device(ptr.device)?;
        let d = dev.lock();
        let Some((_, b)) = d.bucket(ptr.bucket) else {
            return Err(SfsError::NotFound(format!("bucket {} on {}", ptr.bucket, ptr.device)));
        };
        let live = matches!(b.state, BucketState::Allocated | BucketState::PendingFree);
        if !live || b.generation != ptr.generation {
            return Err(SfsError::StaleGeneration {
                device: ptr.device.0,
                bucket: ptr.bucket.0,
                expected: b.generation.0,
                found: ptr.generation.0,
            });
        }
        Ok(())
    }

    pub fn bucket_state(&self, device: DeviceId, bucket: BucketIndex) -> Result<(BucketState, Generation)> {
        let dev = self.device(device)?;
        let d = dev.lock();
        d.bucket(bucket)
            .map(|(_, b)| (b.state, b.generation))
            .ok_or_else(|| SfsError::NotFound(format!("bucket {bucket} on {device}")))
    }

    /// Generation table for the superblock of `device`.
    pub fn gens(&self, device: DeviceId) -> Result<Vec<u32>> {
        let dev = self.device(device)?;
        Ok(dev.lock().buckets.iter().map(|b| b.generation.0).collect())
    }

    /// Close every open bucket so later allocations start fresh buckets.
    pub fn close_open_buckets(&self) {
        for dev in &self.devices {
            dev.lock().close_open();
        }
    }

    #[must_use]
    pub fn degraded_allocations(&self) -> u64 {
        self.degraded_allocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn usage(&self) -> Vec<DeviceUsage> {
        self.devices
            .iter()
            .map(|dev| {
                let d = dev.lock();
                let mut u = DeviceUsage {
                    device: d.device,
                    buckets: d.buckets.len() as u64,
                    free: 0,
                    allocated: 0,
                    pending_free: 0,
                    reserved: 0,
                    live_bytes: 0,
                };
                for b in &d.buckets {
                    match b.state {
                        BucketState::Free => u.free += 1,
                        BucketState::Allocated => u.allocated += 1,
                        BucketState::PendingFree => u.pending_free += 1,
                        BucketState::Reserved => u.reserved += 1,
                    }
                    u.live_bytes += u64::from(b.live);
                }
                u
            })
            .collect()
    }

    /// Sparse buckets worth evacuating: allocated, not open, and with live
    /// density below `threshold_pct`. Emptiest first, at most `max`.
    #[must_use]
    pub fn copygc_candidates(&self, threshold_pct: u8, max: usize) -> Vec<CopygcCandidate> {
        let limit = u64::from(self.bucket_size) * u64::from(threshold_pct.min(100)) / 100;
        let mut out = Vec::new();
        for dev in &self.devices {
            let d = dev.lock();
            for (i, b) in d.buckets.iter().enumerate() {
                if b.state != BucketState::Allocated
                    || d.open == Some(i)
                    || b.live == 0
                    || u64::from(b.live) >= limit
                {
                    continue;
                }
                let live = b
                    .owners
                    .iter()
                    .map(|(&offset, &(len, owner))| LiveSpace {
                        ptr: ReplicaPtr {
                            device: d.device,
                            bucket: BucketIndex(i as u64),
                            offset,
                            generation: b.generation,
                        },
                        len,
                        owner,
                    })
                    .collect();
                out.push(CopygcCandidate {
                    device: d.device,
                    bucket: BucketIndex(i as u64),
                    live_bytes: b.live,
                    live,
                });
            }
        }
        out.sort_by_key(|c| (c.live_bytes, c.device, c.bucket));
        out.truncate(max);
        out
    }

    /// Number of buckets at the start of every device that are never
    /// allocated (superblock plus journal).
    #[must_use]
    pub fn reserved_buckets(&self) -> u64 {
        self.reserved
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BS: u32 = 4096;

    fn devs(n: u32) -> Vec<DeviceId> {
        (0..n).map(DeviceId).collect()
    }

    fn node(id: u64) -> SpaceOwner {
        SpaceOwner::Node(NodeId(id))
    }

    #[test]
    fn reserved_buckets_are_never_handed_out() {
        let a = Allocator::new(BS, 2, &[8]).expect("alloc");
        assert_eq!(a.reserved_buckets(), 3);
        for i in 0..3 {
            let (state, _) = a.bucket_state(DeviceId(0), BucketIndex(i)).expect("state");
            assert_eq!(state, BucketState::Reserved);
        }
        let got = a.allocate(100, 1, &devs(1), node(1)).expect("allocate");
        assert!(got.ptrs[0].bucket.0 >= 3);
        assert_eq!(got.len, 512);
        assert_eq!(got.ptrs[0].generation, Generation(1));
    }

    #[test]
    fn replicas_land_on_distinct_devices() {
        let a = Allocator::new(BS, 1, &[16, 16, 16]).expect("alloc");
        let got = a.allocate(1000, 3, &devs(3), node(1)).expect("allocate");
        assert_eq!(got.degraded, None);
        let mut ids: Vec<u32> = got.ptrs.iter().map(|p| p.device.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn three_replicas_on_two_devices_degrade() {
        let a = Allocator::new(BS, 1, &[16, 16]).expect("alloc");
        let got = a.allocate(512, 3, &devs(2), node(1)).expect("degraded, not failed");
        assert_eq!(got.ptrs.len(), 2);
        assert_eq!(got.degraded, Some(Degraded { wanted: 3, got: 2 }));
        assert!(matches!(
            got.degraded.map(Degraded::to_error),
            Some(SfsError::DegradedReplication { wanted: 3, got: 2 })
        ));
        assert_eq!(a.degraded_allocations(), 1);
    }

    #[test]
    fn unusable_devices_are_skipped() {
        let a = Allocator::new(BS, 1, &[16, 16]).expect("alloc");
        let got = a.allocate(512, 2, &[DeviceId(1)], node(1)).expect("allocate");
        assert_eq!(got.ptrs.len(), 1);
        assert_eq!(got.ptrs[0].device, DeviceId(1));
        let err = a.allocate(512, 1, &[], node(2)).expect_err("nothing usable");
        assert!(matches!(err, SfsError::NoSpace));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let a = Allocator::new(BS, 1, &[8]).expect("alloc");
        let err = a.allocate(u64::from(BS) + 1, 1, &devs(1), node(1)).expect_err("too big");
        assert!(matches!(err, SfsError::ValueTooLarge { .. }));
    }

    #[test]
    fn allocations_pack_then_move_to_new_bucket() {
        let a = Allocator::new(BS, 1, &[8]).expect("alloc");
        let first = a.allocate(2048, 1, &devs(1), node(1)).expect("a");
        let second = a.allocate(2048, 1, &devs(1), node(2)).expect("b");
        assert_eq!(first.ptrs[0].bucket, second.ptrs[0].bucket);
        assert_eq!(second.ptrs[0].offset, 2048);
        let third = a.allocate(512, 1, &devs(1), node(3)).expect("c");
        assert_ne!(third.ptrs[0].bucket, first.ptrs[0].bucket);
    }

    #[test]
    fn exhausting_space_is_no_space() {
        // 4 buckets, 2 reserved: two usable buckets.
        let a = Allocator::new(BS, 1, &[4]).expect("alloc");
        a.allocate(u64::from(BS), 1, &devs(1), node(1)).expect("a");
        a.allocate(u64::from(BS), 1, &devs(1), node(2)).expect("b");
        let err = a.allocate(512, 1, &devs(1), node(3)).expect_err("full");
        assert!(matches!(err, SfsError::NoSpace));
    }

    #[test]
    fn free_is_delayed_until_epoch_release() {
        let a = Allocator::new(BS, 1, &[4]).expect("alloc");
        let first = a.allocate(u64::from(BS), 1, &devs(1), node(1)).expect("a");
        let ptr = first.ptrs[0];
        // Roll the open bucket over so the first one is closed.
        a.allocate(512, 1, &devs(1), node(2)).expect("b");
        assert!(a.free(&ptr));
        let (state, _) = a.bucket_state(ptr.device, ptr.bucket).expect("state");
        assert_eq!(state, BucketState::PendingFree);
        a.check_ptr(&ptr).expect("pending space is still readable");

        let sealed = a.advance_epoch();
        assert_eq!(a.release_pending(Epoch(sealed.0 - 1)), 0);
        assert_eq!(a.release_pending(sealed), 1);
        assert!(matches!(a.check_ptr(&ptr), Err(SfsError::StaleGeneration { .. })));

        // Reuse bumps the generation, so the old pointer stays stale.
        let again = a.allocate(u64::from(BS), 1, &devs(1), node(3)).expect("reuse");
        assert_eq!(again.ptrs[0].bucket, ptr.bucket);
        assert_eq!(again.ptrs[0].generation, ptr.generation.next());
        let err = a.check_ptr(&ptr).expect_err("stale");
        assert!(matches!(
            err,
            SfsError::StaleGeneration { expected: 2, found: 1, .. }
        ));
        assert!(!a.free(&ptr), "stale free is ignored");
    }

    #[test]
    fn frees_after_sealing_wait_for_next_epoch() {
        let a = Allocator::new(BS, 1, &[6]).expect("alloc");
        let p = a.allocate(u64::from(BS), 1, &devs(1), node(1)).expect("a").ptrs[0];
        a.close_open_buckets();
        let sealed = a.advance_epoch();
        assert!(a.free(&p));
        assert_eq!(a.release_pending(sealed), 0);
        let next = a.advance_epoch();
        assert_eq!(a.release_pending(next), 1);
    }

    #[test]
    fn mount_marking_adopts_newer_and_rejects_older_generations() {
        let gens = vec![vec![0, 0, 4, 4, 4, 0]];
        let a = Allocator::from_gens(BS, 1, &[6], &gens).expect("alloc");
        let at = |bucket: u64, generation: u32| ReplicaPtr {
            device: DeviceId(0),
            bucket: BucketIndex(bucket),
            offset: 0,
            generation: Generation(generation),
        };
        assert_eq!(a.mark_allocated(&at(2, 4), 600, node(1)).expect("mark"), MarkOutcome::Marked);
        assert_eq!(a.mark_allocated(&at(3, 5), 512, node(2)).expect("mark"), MarkOutcome::Adopted);
        assert_eq!(a.mark_allocated(&at(4, 3), 512, node(3)).expect("mark"), MarkOutcome::Stale);
        assert!(a.mark_allocated(&at(1, 0), 512, node(4)).is_err(), "journal bucket");

        let usage = &a.usage()[0];
        assert_eq!(usage.allocated, 2);
        assert_eq!(usage.free, 2);
        assert_eq!(usage.live_bytes, 1024 + 512);
        assert_eq!(a.gens(DeviceId(0)).expect("gens"), vec![0, 0, 4, 5, 4, 0]);
        a.check_ptr(&at(3, 5)).expect("adopted pointer is live");

        // New allocations never land in marked buckets.
        let p = a.allocate(512, 1, &devs(1), node(5)).expect("allocate").ptrs[0];
        assert!(p.bucket.0 == 4 || p.bucket.0 == 5);
        assert!(p.generation.0 == 5 || p.generation.0 == 1);
    }

    #[test]
    fn generation_table_size_must_match() {
        let err = Allocator::from_gens(BS, 1, &[6], &[vec![0; 5]]).expect_err("mismatch");
        assert!(matches!(err, SfsError::Format(_)));
    }

    #[test]
    fn copygc_candidates_are_sparse_closed_buckets_emptiest_first() {
        let a = Allocator::new(BS, 1, &[8]).expect("alloc");
        let mut ptrs = Vec::new();
        for i in 0..8 {
            ptrs.push(a.allocate(512, 1, &devs(1), node(i)).expect("a").ptrs[0]);
        }
        // Bucket A now full; B open with 1 range.
        let b2: Vec<_> = (8..16)
            .map(|i| a.allocate(512, 1, &devs(1), node(i)).expect("b").ptrs[0])
            .collect();
        a.allocate(512, 1, &devs(1), SpaceOwner::Extent(Key::new(1, 2, 0))).expect("c");

        for p in &ptrs[1..] {
            assert!(a.free(p));
        }
        for p in &b2[4..] {
            assert!(a.free(p));
        }
        let c = a.copygc_candidates(75, 8);
        assert_eq!(c.len(), 2, "open bucket excluded");
        assert_eq!(c[0].live_bytes, 512);
        assert_eq!(c[0].live[0].owner, node(0));
        assert_eq!(c[0].live[0].ptr, ptrs[0]);
        assert_eq!(c[1].live_bytes, 2048);
        assert_eq!(c[1].live.len(), 4);
        assert_eq!(a.copygc_candidates(75, 1).len(), 1);
        assert!(a.copygc_candidates(10, 8).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn live_bytes_track_outstanding_ranges(ops in proptest::collection::vec((1_u64..2048, any::<bool>()), 1..80)) {
            let a = Allocator::new(BS, 1, &[64, 64]).expect("alloc");
            let mut held: Vec<(ReplicaPtr, u64)> = Vec::new();
            for (i, (size, free_one)) in ops.into_iter().enumerate() {
                if free_one && !held.is_empty() {
                    let (p, _) = held.swap_remove(i % held.len());
                    prop_assert!(a.free(&p));
                } else if let Ok(got) = a.allocate(size, 1, &devs(2), node(i as u64)) {
                    held.push((got.ptrs[0], u64::from(got.len)));
                }
            }
            let live: u64 = a.usage().iter().map(|u| u.live_bytes).sum();
            prop_assert_eq!(live, held.iter().map(|(_, l)| l).sum::<u64>());
            for (p, _) in &held {
                prop_assert!(a.check_ptr(p).is_ok());
            }
        }
    }
}
