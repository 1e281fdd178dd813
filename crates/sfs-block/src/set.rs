//! Multi-device I/O with retry and health tracking.

use crate::{ArcCache, ByteDevice, cx_checkpoint};
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_types::{Cx, DeviceId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceHealth {
    Online,
    /// Had errors but still serving I/O.
    Degraded,
    /// Permanently failed; never read, written, or allocated from again
    /// during this mount.
    Failed,
}

impl DeviceHealth {
    fn to_raw(self) -> u8 {
        match self {
            Self::Online => 0,
            Self::Degraded => 1,
            Self::Failed => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Online,
            1 => Self::Degraded,
            _ => Self::Failed,
        }
    }
}

/// Transient-error retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub device: DeviceId,
    pub health: DeviceHealth,
    pub len_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub transient_retries: u64,
    pub errors: u64,
}

struct Member {
    id: DeviceId,
    raw: Arc<dyn ByteDevice>,
    cache: Option<ArcCache<Arc<dyn ByteDevice>>>,
    health: AtomicU8,
    reads: AtomicU64,
    writes: AtomicU64,
    transient_retries: AtomicU64,
    errors: AtomicU64,
}

impl Member {
    fn device(&self) -> &dyn ByteDevice {
        match &self.cache {
            Some(cache) => cache,
            None => &self.raw,
        }
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("len_bytes", &self.raw.len_bytes())
            .field("health", &DeviceHealth::from_raw(self.health.load(Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}

/// The member devices of one filesystem, indexed by [`DeviceId`].
#[derive(Debug)]
pub struct DeviceSet {
    members: Vec<Member>,
    policy: RetryPolicy,
}

impl DeviceSet {
    /// `cache_entries == 0` disables the per-device read cache.
    pub fn new(
        devices: Vec<Arc<dyn ByteDevice>>,
        policy: RetryPolicy,
        cache_entries: usize,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(SfsError::InvalidGeometry("device set is empty".to_owned()));
        }
        let mut members = Vec::with_capacity(devices.len());
        for (i, raw) in devices.into_iter().enumerate() {
            let id = DeviceId(u32::try_from(i).map_err(|_| {
                SfsError::InvalidGeometry("too many devices".to_owned())
            })?);
            let cache = if cache_entries == 0 {
                None
            } else {
                Some(ArcCache::new(Arc::clone(&raw), cache_entries)?)
            };
            members.push(Member {
                id,
                raw,
                cache,
                health: AtomicU8::new(DeviceHealth::Online.to_raw()),
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                transient_retries: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            });
        }
        Ok(Self { members, policy })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    fn member(&self, id: DeviceId) -> Result<&Member> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.members.get(i))
            .ok_or_else(|| SfsError::NotFound(format!("device {id}")))
    }

    pub fn len_bytes(&self, id: DeviceId) -> Result<u64> {
        Ok(self.member(id)?.raw.len_bytes())
    }

    #[must_use]
    pub fn health(&self, id: DeviceId) -> DeviceHealth {
        self.member(id).map_or(DeviceHealth::Failed, |m| {
            DeviceHealth::from_raw(m.health.load(Ordering::Acquire))
        })
    }

    #[must_use]
    pub fn is_usable(&self, id: DeviceId) -> bool {
        self.health(id) != DeviceHealth::Failed
    }

    /// Devices that have not failed, in id order.
    #[must_use]
    pub fn usable_devices(&self) -> Vec<DeviceId> {
        self.ids().filter(|id| self.is_usable(*id)).collect()
    }

    pub fn mark_failed(&self, id: DeviceId, reason: &str) {
        if let Ok(m) = self.member(id) {
            let prev = m.health.swap(DeviceHealth::Failed.to_raw(), Ordering::AcqRel);
            if prev != DeviceHealth::Failed.to_raw() {
                error!(
                    target: "sfs::block",
                    event = "device_failed",
                    device = id.0,
                    reason
                );
            }
        }
    }

    fn mark_degraded(&self, m: &Member) {
        let _ = m.health.compare_exchange(
            DeviceHealth::Online.to_raw(),
            DeviceHealth::Degraded.to_raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn with_id(id: DeviceId, err: SfsError) -> SfsError {
        match err {
            SfsError::DeviceIo {
                transient, detail, ..
            } => SfsError::DeviceIo {
                device: id.0,
                transient,
                detail,
            },
            other => other,
        }
    }

    /// Run `op` against member `id`, retrying transient failures with
    /// exponential backoff. A permanent device error marks the member
    /// failed.
    fn run<T>(
        &self,
        cx: &Cx,
        id: DeviceId,
        what: &'static str,
        mut op: impl FnMut(&dyn ByteDevice) -> Result<T>,
    ) -> Result<T> {
        let m = self.member(id)?;
        if DeviceHealth::from_raw(m.health.load(Ordering::Acquire)) == DeviceHealth::Failed {
            return Err(SfsError::DeviceIo {
                device: id.0,
                transient: false,
                detail: "device marked failed".to_owned(),
            });
        }
        let mut delay = self.policy.backoff;
        let mut attempt = 0_u32;
        loop {
            match op(m.device()) {
                Ok(v) => return Ok(v),
                Err(SfsError::DeviceIo {
                    transient: true,
                    detail,
                    ..
                }) if attempt < self.policy.retries => {
                    attempt += 1;
                    m.transient_retries.fetch_add(1, Ordering::Relaxed);
                    self.mark_degraded(m);
                    warn!(
                        target: "sfs::block",
                        event = "transient_retry",
                        device = id.0,
                        op = what,
                        attempt,
                        detail = %detail
                    );
                    cx_checkpoint(cx)?;
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(err) => {
                    let err = Self::with_id(id, err);
                    if let SfsError::DeviceIo { transient, .. } = &err {
                        m.errors.fetch_add(1, Ordering::Relaxed);
                        if *transient {
                            self.mark_degraded(m);
                        } else {
                            self.mark_failed(id, what);
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    pub fn read(&self, cx: &Cx, id: DeviceId, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.run(cx, id, "read", |dev| dev.read_exact_at(cx, offset, buf))?;
        let m = self.member(id)?;
        m.reads.fetch_add(1, Ordering::Relaxed);
        trace!(target: "sfs::block", event = "read", device = id.0, offset, len = buf.len());
        Ok(())
    }

    pub fn write(&self, cx: &Cx, id: DeviceId, offset: u64, buf: &[u8]) -> Result<()> {
        self.run(cx, id, "write", |dev| dev.write_all_at(cx, offset, buf))?;
        let m = self.member(id)?;
        m.writes.fetch_add(1, Ordering::Relaxed);
        trace!(target: "sfs::block", event = "write", device = id.0, offset, len = buf.len());
        Ok(())
    }

    pub fn sync(&self, cx: &Cx, id: DeviceId) -> Result<()> {
        self.run(cx, id, "sync", |dev| dev.sync(cx))
    }

    /// Sync every usable member. Succeeds if at least one did; failing
    /// members are marked failed.
    pub fn sync_all(&self, cx: &Cx) -> Result<usize> {
        let mut ok = 0_usize;
        let mut last_err = None;
        for id in self.usable_devices() {
            match self.sync(cx, id) {
                Ok(()) => ok += 1,
                Err(SfsError::Cancelled) => return Err(SfsError::Cancelled),
                Err(err) => last_err = Some(err),
            }
        }
        if ok == 0 {
            return Err(last_err.unwrap_or_else(|| SfsError::DeviceIo {
                device: u32::MAX,
                transient: false,
                detail: "no usable device".to_owned(),
            }));
        }
        Ok(ok)
    }

    #[must_use]
    pub fn stats(&self) -> Vec<DeviceStats> {
        self.members
            .iter()
            .map(|m| DeviceStats {
                device: m.id,
                health: DeviceHealth::from_raw(m.health.load(Ordering::Acquire)),
                len_bytes: m.raw.len_bytes(),
                reads: m.reads.load(Ordering::Relaxed),
                writes: m.writes.load(Ordering::Relaxed),
                transient_retries: m.transient_retries.load(Ordering::Relaxed),
                errors: m.errors.load(Ordering::Relaxed),
            })
            .collect()
    }
}
