//! Out-of-node data.
//!
//! An extent's bytes are optionally compressed, checksummed, and then
//! stored either as full copies on `data_replicas` devices or as a parity
//! stripe of `erasure_data_shards` data shards plus the codec's parity on
//! distinct devices. The checksum always covers the stored bytes, so
//! verification happens before decompression.

use crate::engine::Shared;
use sfs_alloc::SpaceOwner;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{Compression, ExtentLayout, ExtentValue, Key, ReplicaPtr};
use sfs_types::Cx;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

fn too_large(len: usize) -> SfsError {
    SfsError::ValueTooLarge {
        len,
        max: u32::MAX as usize,
    }
}

fn mismatch(ext: &ExtentValue) -> impl Fn(&[u8]) -> Result<()> + '_ {
    move |bytes| {
        if ext.checksum.verify(bytes) {
            Ok(())
        } else {
            Err(SfsError::Unreadable {
                what: "extent".to_owned(),
                detail: "checksum mismatch".to_owned(),
            })
        }
    }
}

impl Shared {
    pub(crate) fn write_extent(&self, cx: &Cx, owner: Key, data: &[u8]) -> Result<ExtentValue> {
        self.ensure_writable()?;
        let size = u32::try_from(data.len()).map_err(|_| too_large(data.len()))?;
        let (stored, compression) = self.compress(data)?;
        let stored_size = u32::try_from(stored.len()).map_err(|_| too_large(stored.len()))?;
        let checksum = self.opts.checksum.compute(&stored);
        let (layout, replicas) = self.place(cx, owner, &stored)?;
        trace!(
            target: "sfs::core",
            event = "extent_written",
            key = %owner,
            size,
            stored_size,
            replicas = replicas.len()
        );
        Ok(ExtentValue {
            size,
            stored_size,
            checksum,
            compression,
            layout,
            replicas,
        })
    }

    pub(crate) fn read_extent(&self, cx: &Cx, ext: &ExtentValue) -> Result<Vec<u8>> {
        let stored = self.read_stored(cx, ext)?;
        match ext.compression {
            None => Ok(stored),
            Some(c) => {
                let out = self
                    .collab
                    .compressor
                    .decompress(c.algorithm, &stored, ext.size as usize)?;
                if out.len() != ext.size as usize {
                    return Err(SfsError::DecompressFailed(format!(
                        "algorithm {} produced {} bytes, expected {}",
                        c.algorithm,
                        out.len(),
                        ext.size
                    )));
                }
                Ok(out)
            }
        }
    }

    fn compress(&self, data: &[u8]) -> Result<(Vec<u8>, Option<Compression>)> {
        let algorithm = self.opts.compression;
        if algorithm == 0 {
            return Ok((data.to_vec(), None));
        }
        match self.collab.compressor.compress(algorithm, data)? {
            Some(packed) if packed.len() < data.len() => Ok((packed, Some(Compression { algorithm }))),
            _ => Ok((data.to_vec(), None)),
        }
    }

    /// Put `stored` on disk in the configured layout and sync every device
    /// written, so the data is durable before any journal record names it.
    pub(crate) fn place(&self, cx: &Cx, owner: Key, stored: &[u8]) -> Result<(ExtentLayout, Vec<ReplicaPtr>)> {
        let shards = self.opts.erasure_data_shards;
        let placed = if shards >= 2 {
            match self.place_striped(cx, owner, stored, shards) {
                Ok(striped) => Some(striped),
                Err(SfsError::Cancelled) => return Err(SfsError::Cancelled),
                Err(err) => {
                    debug!(
                        target: "sfs::core",
                        event = "stripe_fallback",
                        key = %owner,
                        error = %err
                    );
                    None
                }
            }
        } else {
            None
        };
        let (layout, replicas) = match placed {
            Some(striped) => striped,
            None => (ExtentLayout::Replicated, self.place_copies(cx, owner, stored)?),
        };
        let written: BTreeSet<_> = replicas.iter().map(|r| r.device).collect();
        for dev in written {
            if let Err(err) = self.devices.sync(cx, dev) {
                self.alloc.free_all(&replicas);
                return Err(err);
            }
        }
        Ok((layout, replicas))
    }

    fn place_copies(&self, cx: &Cx, owner: Key, stored: &[u8]) -> Result<Vec<ReplicaPtr>> {
        let wanted = self.opts.data_replicas;
        let placed = self.alloc.allocate(
            (stored.len() as u64).max(1),
            wanted,
            &self.devices.usable_devices(),
            SpaceOwner::Extent(owner),
        )?;
        self.replica_io().write(cx, placed.ptrs, wanted, stored)
    }

    /// Stripe over `k` data shards plus one parity shard. Any shortfall in
    /// placement or a failed shard write gives up the stripe; the caller
    /// falls back to full copies.
    fn place_striped(&self, cx: &Cx, owner: Key, stored: &[u8], k: u8) -> Result<(ExtentLayout, Vec<ReplicaPtr>)> {
        let parity = self.collab.parity.parity_shards();
        if parity != 1 {
            return Err(SfsError::InvalidGeometry(format!(
                "extent stripes hold one parity shard, codec produces {parity}"
            )));
        }
        let shard_len = stored.len().div_ceil(usize::from(k)).max(1);
        let mut shards: Vec<Vec<u8>> = stored
            .chunks(shard_len)
            .map(<[u8]>::to_vec)
            .collect();
        shards.resize(usize::from(k), Vec::new());
        for s in &mut shards {
            s.resize(shard_len, 0);
        }
        let refs: Vec<&[u8]> = shards.iter().map(Vec::as_slice).collect();
        shards.extend(self.collab.parity.compute_parity(&refs)?);

        let wanted = k + 1;
        let shard_len_u32 = u32::try_from(shard_len).map_err(|_| too_large(shard_len))?;
        let placed = self.alloc.allocate(
            u64::from(shard_len_u32),
            wanted,
            &self.devices.usable_devices(),
            SpaceOwner::Extent(owner),
        )?;
        if placed.ptrs.len() < usize::from(wanted) {
            self.alloc.free_all(&placed.ptrs);
            return Err(SfsError::DegradedReplication {
                wanted,
                got: u8::try_from(placed.ptrs.len()).unwrap_or(u8::MAX),
            });
        }
        let bucket_size = u64::from(self.alloc.bucket_size());
        for (ptr, shard) in placed.ptrs.iter().zip(&shards) {
            if let Err(err) = self.devices.write(cx, ptr.device, ptr.byte_addr(bucket_size), shard) {
                self.alloc.free_all(&placed.ptrs);
                return Err(err);
            }
        }
        Ok((
            ExtentLayout::Parity {
                data_shards: k,
                shard_len: shard_len_u32,
            },
            placed.ptrs,
        ))
    }

    /// Verified stored (still compressed) bytes of an extent.
    pub(crate) fn read_stored(&self, cx: &Cx, ext: &ExtentValue) -> Result<Vec<u8>> {
        match ext.layout {
            ExtentLayout::Replicated => {
                self.replica_io()
                    .read(cx, "extent", &ext.replicas, ext.stored_size as usize, mismatch(ext))
            }
            ExtentLayout::Parity {
                data_shards,
                shard_len,
            } => self.read_striped(cx, ext, usize::from(data_shards), shard_len as usize),
        }
    }

    fn read_striped(&self, cx: &Cx, ext: &ExtentValue, k: usize, shard_len: usize) -> Result<Vec<u8>> {
        let io = self.replica_io();
        let mut shards = Vec::with_capacity(ext.replicas.len());
        for ptr in &ext.replicas {
            shards.push(io.read_one(cx, "extent shard", ptr, shard_len)?);
        }
        let verify = mismatch(ext);
        let assemble = |shards: &[Option<Vec<u8>>]| -> Option<Vec<u8>> {
            let mut out = Vec::with_capacity(k * shard_len);
            for s in shards.iter().take(k) {
                out.extend_from_slice(s.as_deref()?);
            }
            out.truncate(ext.stored_size as usize);
            Some(out)
        };

        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing == 0 {
            if let Some(out) = assemble(&shards) {
                if verify(&out).is_ok() {
                    return Ok(out);
                }
            }
        }
        // Rebuild the lost shard, or when nothing is missing but the
        // checksum failed, try each data shard in turn as the bad one.
        let suspects: Vec<Option<usize>> = if missing == 0 {
            (0..k).map(Some).collect()
        } else {
            vec![None]
        };
        for suspect in suspects {
            let mut trial = shards.clone();
            if let Some(i) = suspect {
                trial[i] = None;
            }
            if self.collab.parity.reconstruct(&mut trial).is_err() {
                continue;
            }
            if let Some(out) = assemble(&trial) {
                if verify(&out).is_ok() {
                    self.counters.replica_fallbacks.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "sfs::core",
                        event = "extent_reconstructed",
                        missing,
                        shard = suspect.map_or(-1, |i| i64::try_from(i).unwrap_or(-1))
                    );
                    return Ok(out);
                }
            }
        }
        Err(SfsError::Unreadable {
            what: "extent".to_owned(),
            detail: format!("parity stripe unrecoverable ({missing} shards missing)"),
        })
    }
}
