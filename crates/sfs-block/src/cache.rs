//! ARC (Adaptive Replacement Cache) over a [`ByteDevice`].
//!
//! Entries are whole reads keyed by `(offset, len)`. Reads populate the
//! cache; writes go straight to the device and drop every resident entry
//! they overlap, so a read never returns bytes older than the medium.
//! A miss only fills the cache if no write landed while it was reading.

use crate::{ByteDevice, cx_checkpoint};
use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::Cx;
use std::collections::{BTreeSet, HashMap, VecDeque};

type CacheKey = (u64, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<CacheKey>,
    t2: VecDeque<CacheKey>,
    b1: VecDeque<CacheKey>,
    b2: VecDeque<CacheKey>,
    loc: HashMap<CacheKey, ArcList>,
    resident: HashMap<CacheKey, Vec<u8>>,
    /// Resident keys ordered by offset for overlap queries.
    by_offset: BTreeSet<CacheKey>,
    max_len: usize,
    /// Bumped by every invalidation.
    write_epoch: u64,
    hits: u64,
    misses: u64,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
            by_offset: BTreeSet::new(),
            max_len: 0,
            write_epoch: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn remove_from_list(list: &mut VecDeque<CacheKey>, key: CacheKey) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    fn evict_resident(&mut self, key: CacheKey) {
        let _ = self.resident.remove(&key);
        let _ = self.by_offset.remove(&key);
    }

    fn insert_resident(&mut self, key: CacheKey, bytes: Vec<u8>) {
        self.max_len = self.max_len.max(key.1);
        self.by_offset.insert(key);
        self.resident.insert(key, bytes);
    }

    fn touch_mru(&mut self, key: CacheKey) {
        let Some(list) = self.loc.get(&key).copied() else {
            return;
        };

        match list {
            ArcList::T1 => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            ArcList::T2 => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            ArcList::B1 | ArcList::B2 => {}
        }
    }

    fn replace(&mut self, incoming: CacheKey) {
        let t1_len = self.t1.len();
        if t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p))
        {
            if let Some(victim) = self.t1.pop_front() {
                self.loc.insert(victim, ArcList::B1);
                self.evict_resident(victim);
                self.b1.push_back(victim);
            }
        } else if let Some(victim) = self.t2.pop_front() {
            self.loc.insert(victim, ArcList::B2);
            self.evict_resident(victim);
            self.b2.push_back(victim);
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    fn on_miss_or_ghost_hit(&mut self, key: CacheKey) {
        if matches!(self.loc.get(&key), Some(ArcList::B1)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b2_len / b1_len).max(1);
            self.p = (self.p + delta).min(self.capacity);
            let _ = Self::remove_from_list(&mut self.b1, key);
            self.replace(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        if matches!(self.loc.get(&key), Some(ArcList::B2)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b1_len / b2_len).max(1);
            self.p = self.p.saturating_sub(delta);
            let _ = Self::remove_from_list(&mut self.b2, key);
            self.replace(key);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        if self.t1.len() + self.b1.len() == self.capacity {
            if self.t1.len() < self.capacity {
                let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                self.replace(key);
            } else if let Some(victim) = self.t1.pop_front() {
                let _ = self.loc.remove(&victim);
                self.evict_resident(victim);
            }
        } else if (self.t1.len() + self.b1.len()) < self.capacity
            && (self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len())
                >= self.capacity.saturating_mul(2)
        {
            let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
        }

        if self.t1.len() + self.t2.len() >= self.capacity {
            self.replace(key);
        }
        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
    }

    /// Drop every resident entry overlapping `[offset, offset + len)`.
    fn invalidate(&mut self, offset: u64, len: usize) {
        self.write_epoch = self.write_epoch.wrapping_add(1);
        let end = offset.saturating_add(len as u64);
        let lo = offset.saturating_sub(self.max_len as u64);
        let victims: Vec<CacheKey> = self
            .by_offset
            .range((lo, 0)..(end, 0))
            .filter(|(o, l)| o.saturating_add(*l as u64) > offset)
            .copied()
            .collect();
        for key in victims {
            self.evict_resident(key);
            let _ = Self::remove_from_list(&mut self.t1, key);
            let _ = Self::remove_from_list(&mut self.t2, key);
            let _ = self.loc.remove(&key);
        }
    }
}

/// ARC-cached wrapper around a [`ByteDevice`].
#[derive(Debug)]
pub struct ArcCache<D: ByteDevice> {
    inner: D,
    state: Mutex<ArcState>,
}

impl<D: ByteDevice> ArcCache<D> {
    pub fn new(inner: D, capacity_entries: usize) -> Result<Self> {
        if capacity_entries == 0 {
            return Err(SfsError::InvalidGeometry(
                "ArcCache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(ArcState::new(capacity_entries)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub fn hit_stats(&self) -> (u64, u64) {
        let guard = self.state.lock();
        (guard.hits, guard.misses)
    }
}

impl<D: ByteDevice> ByteDevice for ArcCache<D> {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let key = (offset, buf.len());
        let epoch = {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.resident.get(&key) {
                buf.copy_from_slice(bytes);
                guard.hits += 1;
                guard.touch_mru(key);
                drop(guard);
                return Ok(());
            }
            guard.misses += 1;
            guard.write_epoch
        };

        self.inner.read_exact_at(cx, offset, buf)?;

        let mut guard = self.state.lock();
        if guard.write_epoch != epoch {
            return Ok(());
        }
        // Another reader may have filled the same key meanwhile.
        if !matches!(guard.loc.get(&key), Some(ArcList::T1 | ArcList::T2)) {
            guard.on_miss_or_ghost_hit(key);
            guard.insert_resident(key, buf.to_vec());
        }
        drop(guard);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        self.state.lock().invalidate(offset, buf.len());
        let written = self.inner.write_all_at(cx, offset, buf);
        // Again once the bytes are on the medium, for misses that read
        // around the write.
        self.state.lock().invalidate(offset, buf.len());
        written
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}
