#![forbid(unsafe_code)]
//! Six-state node lock.
//!
//! Three acquirable states layered on an upgradable reader/writer lock:
//!
//! | held \ wanted | read | intent | write |
//! |---------------|------|--------|-------|
//! | read          | ok   | ok     | wait  |
//! | intent        | ok   | wait   | wait  |
//! | write         | wait | wait   | wait  |
//!
//! Escalation follows read -> intent -> write only. Intent is exclusive
//! among intent holders, so two would-be writers serialize at the intent
//! step and never deadlock on the upgrade. The typestate guards make every
//! other escalation unrepresentable; [`LockState`] carries the same rules
//! for callers that track lock state at runtime.
//!
//! Every write acquire and every write release bumps the lock sequence
//! number (odd while write is held). A [`RelockHandle`] remembers the
//! sequence seen under a dropped lock and re-locks only if no writer got in
//! between, which is how cursors revalidate a cached path.

mod stats;

pub use stats::{MeanAndVariance, MeanAndVarianceStats, MeanAndVarianceWeighted};

use parking_lot::{
    ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock,
    RwLock,
};
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

// ── Runtime state machine ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    Read,
    Intent,
    Write,
}

impl LockState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::Read => "read",
            Self::Intent => "intent",
            Self::Write => "write",
        }
    }

    /// Validate a transition from `self` to `to`.
    ///
    /// Legal moves: acquire any state from unlocked, release any state,
    /// read -> intent, intent -> write, write -> intent, intent -> read.
    pub fn transition(self, to: Self) -> Result<Self> {
        use LockState::{Intent, Read, Unlocked, Write};
        let legal = matches!(
            (self, to),
            (Unlocked, Read | Intent | Write)
                | (Read | Intent | Write, Unlocked)
                | (Read, Intent)
                | (Intent, Write | Read)
                | (Write, Intent)
        );
        if legal {
            Ok(to)
        } else {
            Err(SfsError::IllegalLockTransition {
                from: self.name(),
                to: to.name(),
            })
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Wait statistics ─────────────────────────────────────────────────────────

/// Blocking-acquire wait times shared by every lock of one tree.
///
/// Long waits are counted and logged; nothing is ever cancelled.
#[derive(Debug)]
pub struct LockWaitStats {
    long_wait: Duration,
    contended: AtomicU64,
    long_waits: AtomicU64,
    waits: Mutex<(MeanAndVariance, MeanAndVarianceWeighted)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockWaitSnapshot {
    pub contended: u64,
    pub long_waits: u64,
    pub mean_wait_us: i64,
    pub stddev_wait_us: u64,
    pub recent_mean_wait_us: i64,
}

impl LockWaitStats {
    #[must_use]
    pub fn new(long_wait: Duration) -> Self {
        Self {
            long_wait,
            contended: AtomicU64::new(0),
            long_waits: AtomicU64::new(0),
            waits: Mutex::new((MeanAndVariance::default(), MeanAndVarianceWeighted::new(8))),
        }
    }

    fn record(&self, state: LockState, waited: Duration) {
        self.contended.fetch_add(1, Ordering::Relaxed);
        let us = i64::try_from(waited.as_micros()).unwrap_or(i64::MAX);
        {
            let mut waits = self.waits.lock();
            waits.0.update(us);
            waits.1.update(us);
        }
        if waited >= self.long_wait {
            self.long_waits.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "sfs::lock",
                event = "long_lock_wait",
                state = state.name(),
                waited_us = us
            );
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LockWaitSnapshot {
        let waits = self.waits.lock();
        LockWaitSnapshot {
            contended: self.contended.load(Ordering::Relaxed),
            long_waits: self.long_waits.load(Ordering::Relaxed),
            mean_wait_us: waits.0.mean(),
            stddev_wait_us: waits.0.stddev(),
            recent_mean_wait_us: waits.1.mean(),
        }
    }
}

// ── Lock ────────────────────────────────────────────────────────────────────

/// A six-state lock protecting `T`. Cloning shares the lock.
pub struct SixLock<T> {
    data: Arc<RwLock<T>>,
    seq: Arc<AtomicU64>,
    stats: Option<Arc<LockWaitStats>>,
}

impl<T> Clone for SixLock<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            seq: Arc::clone(&self.seq),
            stats: self.stats.clone(),
        }
    }
}

impl<T> fmt::Debug for SixLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SixLock")
            .field("seq", &self.seq())
            .field("locked", &self.data.is_locked())
            .finish_non_exhaustive()
    }
}

impl<T> SixLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            data: Arc::new(RwLock::new(value)),
            seq: Arc::new(AtomicU64::new(0)),
            stats: None,
        }
    }

    pub fn with_stats(value: T, stats: Arc<LockWaitStats>) -> Self {
        Self {
            stats: Some(stats),
            ..Self::new(value)
        }
    }

    /// Current sequence number; odd while a writer holds the lock.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    fn timed<G>(&self, state: LockState, fast: impl FnOnce() -> Option<G>, slow: impl FnOnce() -> G) -> G {
        if let Some(guard) = fast() {
            return guard;
        }
        let start = Instant::now();
        let guard = slow();
        if let Some(stats) = &self.stats {
            stats.record(state, start.elapsed());
        }
        guard
    }

    pub fn read(&self) -> ReadGuard<T> {
        let guard = self.timed(LockState::Read, || self.data.try_read_arc(), || self.data.read_arc());
        self.read_guard(guard)
    }

    pub fn intent(&self) -> IntentGuard<T> {
        let guard = self.timed(
            LockState::Intent,
            || self.data.try_upgradable_read_arc(),
            || self.data.upgradable_read_arc(),
        );
        self.intent_guard(guard)
    }

    pub fn write(&self) -> WriteGuard<T> {
        let guard = self.timed(LockState::Write, || self.data.try_write_arc(), || self.data.write_arc());
        self.write_guard(guard)
    }

    pub fn try_read(&self) -> Option<ReadGuard<T>> {
        self.data.try_read_arc().map(|g| self.read_guard(g))
    }

    pub fn try_intent(&self) -> Option<IntentGuard<T>> {
        self.data.try_upgradable_read_arc().map(|g| self.intent_guard(g))
    }

    pub fn try_write(&self) -> Option<WriteGuard<T>> {
        self.data.try_write_arc().map(|g| self.write_guard(g))
    }

    fn read_guard(&self, guard: ArcRwLockReadGuard<RawRwLock, T>) -> ReadGuard<T> {
        ReadGuard {
            guard,
            lock: self.clone(),
        }
    }

    fn intent_guard(&self, guard: ArcRwLockUpgradableReadGuard<RawRwLock, T>) -> IntentGuard<T> {
        IntentGuard {
            guard,
            lock: self.clone(),
        }
    }

    fn write_guard(&self, guard: ArcRwLockWriteGuard<RawRwLock, T>) -> WriteGuard<T> {
        self.seq.fetch_add(1, Ordering::AcqRel);
        WriteGuard {
            guard: Some(guard),
            lock: self.clone(),
        }
    }
}

// ── Guards ──────────────────────────────────────────────────────────────────

/// Shared read access.
pub struct ReadGuard<T> {
    guard: ArcRwLockReadGuard<RawRwLock, T>,
    lock: SixLock<T>,
}

impl<T> ReadGuard<T> {
    #[must_use]
    pub fn relock_handle(&self) -> RelockHandle<T> {
        RelockHandle {
            lock: self.lock.clone(),
            seq: self.lock.seq(),
        }
    }

    /// Read -> intent without blocking.
    ///
    /// The read lock is released first. Fails if another intent holder
    /// exists or a writer got in between; the returned handle may still be
    /// used to re-take read.
    pub fn try_upgrade(self) -> std::result::Result<IntentGuard<T>, RelockHandle<T>> {
        let handle = self.relock_handle();
        drop(self);
        handle.try_intent().ok_or(handle)
    }

    #[must_use]
    pub fn lock(&self) -> &SixLock<T> {
        &self.lock
    }
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Intent: readers may coexist, other intents and writers wait.
pub struct IntentGuard<T> {
    guard: ArcRwLockUpgradableReadGuard<RawRwLock, T>,
    lock: SixLock<T>,
}

impl<T> IntentGuard<T> {
    /// Intent -> write, waiting for readers to drain.
    pub fn upgrade(self) -> WriteGuard<T> {
        let Self { guard, lock } = self;
        let guard = match ArcRwLockUpgradableReadGuard::try_upgrade(guard) {
            Ok(w) => w,
            Err(guard) => {
                let start = Instant::now();
                let w = ArcRwLockUpgradableReadGuard::upgrade(guard);
                if let Some(stats) = &lock.stats {
                    stats.record(LockState::Write, start.elapsed());
                }
                w
            }
        };
        lock.write_guard(guard)
    }

    pub fn try_upgrade(self) -> std::result::Result<WriteGuard<T>, Self> {
        let Self { guard, lock } = self;
        match ArcRwLockUpgradableReadGuard::try_upgrade(guard) {
            Ok(w) => Ok(lock.write_guard(w)),
            Err(guard) => Err(Self { guard, lock }),
        }
    }

    /// Intent -> read.
    pub fn downgrade(self) -> ReadGuard<T> {
        let Self { guard, lock } = self;
        ReadGuard {
            guard: ArcRwLockUpgradableReadGuard::downgrade(guard),
            lock,
        }
    }

    #[must_use]
    pub fn relock_handle(&self) -> RelockHandle<T> {
        RelockHandle {
            lock: self.lock.clone(),
            seq: self.lock.seq(),
        }
    }

    #[must_use]
    pub fn lock(&self) -> &SixLock<T> {
        &self.lock
    }
}

impl<T> Deref for IntentGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive access. Releasing (or downgrading) bumps the sequence.
pub struct WriteGuard<T> {
    guard: Option<ArcRwLockWriteGuard<RawRwLock, T>>,
    lock: SixLock<T>,
}

impl<T> WriteGuard<T> {
    /// Write -> intent. Readers may enter again; other intents still wait.
    pub fn downgrade(mut self) -> IntentGuard<T> {
        let lock = self.lock.clone();
        let guard = self.guard.take();
        drop(self);
        match guard {
            Some(g) => IntentGuard {
                guard: ArcRwLockWriteGuard::downgrade_to_upgradable(g),
                lock,
            },
            None => unreachable!("write guard used after release"),
        }
    }

    #[must_use]
    pub fn lock(&self) -> &SixLock<T> {
        &self.lock
    }
}

impl<T> Drop for WriteGuard<T> {
    fn drop(&mut self) {
        self.lock.seq.fetch_add(1, Ordering::AcqRel);
        drop(self.guard.take());
    }
}

impl<T> Deref for WriteGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(g) => &**g,
            None => unreachable!("write guard used after release"),
        }
    }
}

impl<T> DerefMut for WriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(g) => &mut **g,
            None => unreachable!("write guard used after release"),
        }
    }
}

// ── Relock ──────────────────────────────────────────────────────────────────

/// Sequence captured while a lock was held; re-locks only if unchanged.
pub struct RelockHandle<T> {
    lock: SixLock<T>,
    seq: u64,
}

impl<T> Clone for RelockHandle<T> {
    fn clone(&self) -> Self {
        Self {
            lock: self.lock.clone(),
            seq: self.seq,
        }
    }
}

impl<T> fmt::Debug for RelockHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelockHandle")
            .field("seq", &self.seq)
            .field("current", &self.lock.seq())
            .finish()
    }
}

impl<T> RelockHandle<T> {
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// True while no write has been taken since the handle was made.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lock.seq() == self.seq
    }

    pub fn try_read(&self) -> Option<ReadGuard<T>> {
        let guard = self.lock.try_read()?;
        self.is_valid().then_some(guard)
    }

    pub fn try_intent(&self) -> Option<IntentGuard<T>> {
        let guard = self.lock.try_intent()?;
        self.is_valid().then_some(guard)
    }

    /// Blocking read, then validate.
    pub fn read(&self) -> Option<ReadGuard<T>> {
        let guard = self.lock.read();
        self.is_valid().then_some(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn readers_share_with_intent() {
        let lock = SixLock::new(5_u32);
        let r1 = lock.read();
        let r2 = lock.try_read().expect("second reader");
        let i = lock.try_intent().expect("intent beside readers");
        assert_eq!((*r1, *r2, *i), (5, 5, 5));
        assert!(lock.try_intent().is_none(), "intent is exclusive");
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn intent_upgrade_waits_for_readers() {
        let lock = SixLock::new(0_u32);
        let reader = lock.read();
        let intent = lock.intent();
        let intent = match intent.try_upgrade() {
            Ok(_) => panic!("upgrade must fail while a reader is active"),
            Err(intent) => intent,
        };
        drop(reader);
        let mut w = intent.upgrade();
        *w = 9;
        assert!(lock.try_read().is_none());
        drop(w);
        assert_eq!(*lock.read(), 9);
    }

    #[test]
    fn sequence_is_odd_only_while_writing() {
        let lock = SixLock::new(());
        assert_eq!(lock.seq(), 0);
        let w = lock.write();
        assert_eq!(lock.seq(), 1);
        drop(w);
        assert_eq!(lock.seq(), 2);
        let w = lock.intent().upgrade();
        assert_eq!(lock.seq(), 3);
        let i = w.downgrade();
        assert_eq!(lock.seq(), 4);
        assert!(lock.try_read().is_some(), "readers enter after downgrade");
        assert!(lock.try_intent().is_none(), "intent still held");
        drop(i);
        assert_eq!(lock.seq(), 4);
    }

    #[test]
    fn relock_fails_after_intervening_write() {
        let lock = SixLock::new(1_u32);
        let handle = lock.read().relock_handle();
        assert!(handle.try_read().is_some());
        *lock.write() = 2;
        assert!(!handle.is_valid());
        assert!(handle.try_read().is_none());
        assert!(handle.try_intent().is_none());
        assert!(handle.read().is_none());
    }

    #[test]
    fn read_try_upgrade() {
        let lock = SixLock::new(0_u32);
        let r = lock.read();
        let i = r.try_upgrade().expect("no competing intent");
        let other = lock.read();
        let Err(handle) = other.try_upgrade() else {
            panic!("second intent must fail");
        };
        assert!(handle.is_valid());
        drop(i);
        assert!(handle.try_intent().is_some());
    }

    #[test]
    fn intent_downgrade_to_read() {
        let lock = SixLock::new(3_u32);
        let r = lock.intent().downgrade();
        assert!(lock.try_intent().is_some());
        assert_eq!(*r, 3);
    }

    #[test]
    fn state_machine_rejects_illegal_escalations() {
        use LockState::{Intent, Read, Unlocked, Write};
        assert_eq!(Unlocked.transition(Read).expect("acquire"), Read);
        assert_eq!(Read.transition(Intent).expect("upgrade"), Intent);
        assert_eq!(Intent.transition(Write).expect("upgrade"), Write);
        assert_eq!(Write.transition(Intent).expect("downgrade"), Intent);
        assert_eq!(Intent.transition(Read).expect("downgrade"), Read);
        for (from, to) in [(Read, Write), (Write, Read), (Read, Read), (Unlocked, Unlocked), (Intent, Intent)] {
            let err = from.transition(to).expect_err("illegal");
            assert!(matches!(err, SfsError::IllegalLockTransition { .. }), "{from}->{to}");
        }
    }

    #[test]
    fn concurrent_intent_holders_serialize() {
        let lock = SixLock::with_stats(0_u64, Arc::new(LockWaitStats::new(Duration::from_secs(60))));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..500 {
                        let intent = lock.intent();
                        let seen = *intent;
                        let mut w = intent.upgrade();
                        *w = seen + 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(*lock.read(), 2000);
        assert_eq!(lock.seq(), 4000);
    }

    #[test]
    fn long_waits_are_counted_not_cancelled() {
        let stats = Arc::new(LockWaitStats::new(Duration::from_millis(5)));
        let lock = SixLock::with_stats(0_u32, Arc::clone(&stats));
        let w = lock.write();
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || *lock.read())
        };
        thread::sleep(Duration::from_millis(30));
        drop(w);
        assert_eq!(waiter.join().expect("join"), 0);
        let snap = stats.snapshot();
        assert_eq!(snap.contended, 1);
        assert_eq!(snap.long_waits, 1);
        assert!(snap.mean_wait_us >= 5_000);
    }
}
