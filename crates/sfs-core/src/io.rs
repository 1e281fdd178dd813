//! Replica I/O shared by node pages and extents.
//!
//! Reads try each replica in order and stop at the first copy that passes
//! verification; a stale generation, a device error, or a checksum mismatch
//! moves on to the next copy. Only when every replica failed does the caller
//! see `Unreadable`. Writes go to every placed replica and tolerate losing
//! some of them as long as one landed.

use crate::engine::Counters;
use crate::options::EngineOptions;
use sfs_alloc::{Allocator, MarkOutcome, SpaceOwner};
use sfs_block::DeviceSet;
use sfs_btree::NodeIo;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{NodePage, NodePtr, ReplicaPtr};
use sfs_types::{Cx, NodeId};
use std::sync::atomic::Ordering;
use tracing::{trace, warn};

#[derive(Clone, Copy)]
pub(crate) struct ReplicaIo<'a> {
    pub(crate) devices: &'a DeviceSet,
    pub(crate) alloc: &'a Allocator,
    pub(crate) counters: &'a Counters,
    pub(crate) opts: &'a EngineOptions,
}

impl ReplicaIo<'_> {
    fn bucket_size(&self) -> u64 {
        u64::from(self.alloc.bucket_size())
    }

    /// Read one replica without falling back. `None` when the copy is
    /// stale or its device failed; the reason is logged.
    pub(crate) fn read_one(
        &self,
        cx: &Cx,
        what: &str,
        ptr: &ReplicaPtr,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        if let Err(err) = self.alloc.check_ptr(ptr) {
            self.counters.stale_pointers.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "sfs::core",
                event = "stale_replica",
                what,
                device = ptr.device.0,
                bucket = ptr.bucket.0,
                error = %err
            );
            return Ok(None);
        }
        let mut buf = vec![0_u8; len];
        match self
            .devices
            .read(cx, ptr.device, ptr.byte_addr(self.bucket_size()), &mut buf)
        {
            Ok(()) => Ok(Some(buf)),
            Err(SfsError::Cancelled) => Err(SfsError::Cancelled),
            Err(err) => {
                warn!(
                    target: "sfs::core",
                    event = "replica_read_failed",
                    what,
                    device = ptr.device.0,
                    error = %err
                );
                Ok(None)
            }
        }
    }

    /// First replica whose bytes `accept` approves.
    pub(crate) fn read(
        &self,
        cx: &Cx,
        what: &str,
        ptrs: &[ReplicaPtr],
        len: usize,
        mut accept: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<Vec<u8>> {
        let mut last = String::from("no replicas");
        for (i, ptr) in ptrs.iter().enumerate() {
            let Some(buf) = self.read_one(cx, what, ptr, len)? else {
                last = format!("replica {i} on {} unavailable", ptr.device);
                continue;
            };
            match accept(&buf) {
                Ok(()) => {
                    if i > 0 {
                        self.counters.replica_fallbacks.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target: "sfs::core",
                            event = "replica_fallback",
                            what,
                            replica = i,
                            device = ptr.device.0
                        );
                    }
                    return Ok(buf);
                }
                Err(err) => {
                    warn!(
                        target: "sfs::core",
                        event = "replica_corrupt",
                        what,
                        replica = i,
                        device = ptr.device.0,
                        error = %err
                    );
                    last = err.to_string();
                }
            }
        }
        Err(SfsError::Unreadable {
            what: what.to_owned(),
            detail: format!("all {} replicas failed, last: {last}", ptrs.len()),
        })
    }

    /// Write `bytes` to every placed replica. Replicas whose write failed
    /// are released; the rest are returned. Fewer than `wanted` is a
    /// degraded write, refused unless `allow_degraded`.
    pub(crate) fn write(
        &self,
        cx: &Cx,
        placed: Vec<ReplicaPtr>,
        wanted: u8,
        bytes: &[u8],
    ) -> Result<Vec<ReplicaPtr>> {
        let placed_len = placed.len();
        let mut landed = Vec::with_capacity(placed_len);
        let mut last_err = None;
        for ptr in placed {
            match self
                .devices
                .write(cx, ptr.device, ptr.byte_addr(self.bucket_size()), bytes)
            {
                Ok(()) => landed.push(ptr),
                Err(SfsError::Cancelled) => {
                    self.alloc.free(&ptr);
                    self.alloc.free_all(&landed);
                    return Err(SfsError::Cancelled);
                }
                Err(err) => {
                    warn!(
                        target: "sfs::core",
                        event = "replica_write_failed",
                        device = ptr.device.0,
                        error = %err
                    );
                    self.alloc.free(&ptr);
                    last_err = Some(err);
                }
            }
        }
        if landed.is_empty() {
            return Err(last_err.unwrap_or(SfsError::NoSpace));
        }
        if landed.len() < placed_len {
            self.counters.degraded_writes.fetch_add(1, Ordering::Relaxed);
        }
        let got = u8::try_from(landed.len()).unwrap_or(u8::MAX);
        if got < wanted && !self.opts.allow_degraded {
            self.alloc.free_all(&landed);
            return Err(SfsError::DegradedReplication { wanted, got });
        }
        Ok(landed)
    }
}

/// Node persistence over the device set.
///
/// In mount mode every pointer met while loading is first marked live in
/// the allocator, which is how the bucket table learns what the on-disk
/// tree references.
pub(crate) struct MetaIo<'a> {
    pub(crate) io: ReplicaIo<'a>,
    pub(crate) mounting: bool,
}

impl NodeIo for MetaIo<'_> {
    fn read_node(&self, cx: &Cx, ptr: &NodePtr) -> Result<Vec<u8>> {
        if self.mounting {
            for r in &ptr.replicas {
                match self
                    .io
                    .alloc
                    .mark_allocated(r, u64::from(ptr.size), SpaceOwner::Node(ptr.id))
                {
                    Ok(MarkOutcome::Marked | MarkOutcome::Adopted | MarkOutcome::Stale) => {}
                    Err(err) => warn!(
                        target: "sfs::core",
                        event = "node_pointer_invalid",
                        node = ptr.id.0,
                        device = r.device.0,
                        error = %err
                    ),
                }
            }
        }
        let len = usize::try_from(ptr.size)
            .map_err(|_| SfsError::Format("node size overflows usize".to_owned()))?;
        self.io.read(cx, "node", &ptr.replicas, len, |bytes| {
            if !ptr.checksum.verify(bytes) {
                return Err(SfsError::NodeCorrupt {
                    node: ptr.id.0,
                    detail: "page checksum mismatch".to_owned(),
                });
            }
            NodePage::decode(bytes, Some(ptr.id)).map(|_| ())
        })
    }

    fn write_node(&self, cx: &Cx, id: NodeId, level: u8, page: &[u8]) -> Result<NodePtr> {
        let size = u32::try_from(page.len()).map_err(|_| SfsError::ValueTooLarge {
            len: page.len(),
            max: u32::MAX as usize,
        })?;
        let wanted = self.io.opts.metadata_replicas;
        let placed = self.io.alloc.allocate(
            u64::from(size),
            wanted,
            &self.io.devices.usable_devices(),
            SpaceOwner::Node(id),
        )?;
        let replicas = self.io.write(cx, placed.ptrs, wanted, page)?;
        trace!(
            target: "sfs::core",
            event = "node_placed",
            node = id.0,
            level,
            size,
            replicas = replicas.len()
        );
        Ok(NodePtr {
            id,
            level,
            size,
            checksum: self.io.opts.checksum.compute(page),
            replicas,
        })
    }

    fn free_node(&self, ptr: &NodePtr) {
        self.io.alloc.free_all(&ptr.replicas);
    }
}
