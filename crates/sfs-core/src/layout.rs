//! Format and superblock I/O.
//!
//! ```text
//! device:  | bucket 0            | buckets 1..=J | buckets J+1.. |
//!          | sb slot 0 | slot 1  | journal ring  | data buckets  |
//! ```
//!
//! Every device carries its own superblock copy with its own generation
//! table; the tree root, geometry, and `sb_seq` are the same on all of them
//! after a successful checkpoint. Mount takes the valid slot with the
//! highest `sb_seq`.

use crate::options::EngineOptions;
use sfs_block::DeviceSet;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{NodePtr, Superblock};
use sfs_types::{
    Cx, DeviceId, JOURNAL_FIRST_BUCKET, JournalSeq, SUPERBLOCK_MAGIC, read_le_u32, read_le_u64,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const SB_HEADER_LEN: usize = 16;

/// Fresh filesystem identity. Uniqueness comes from hashing the clock,
/// the process, a per-process counter, and the device geometry.
pub(crate) fn new_uuid(device_buckets: &[u64]) -> [u8; 16] {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"stratafs uuid");
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    for n in device_buckets {
        hasher.update(&n.to_le_bytes());
    }
    let mut uuid = [0_u8; 16];
    uuid.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    uuid
}

/// Journal record nonce derived from the uuid, so records left behind by an
/// earlier filesystem on the same device never replay.
pub(crate) fn journal_nonce(uuid: &[u8; 16]) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&uuid[..8]);
    u64::from_le_bytes(raw)
}

/// Superblock fields shared by every device; `device_index` and `gens` are
/// filled in per device.
pub(crate) fn template(
    opts: &EngineOptions,
    uuid: [u8; 16],
    device_buckets: &[u64],
    sb_seq: u64,
    checkpoint_seq: JournalSeq,
    next_node_id: u64,
    root: Option<NodePtr>,
) -> Result<Superblock> {
    Ok(Superblock {
        sb_seq,
        uuid,
        device_index: 0,
        nr_devices: u32::try_from(device_buckets.len())
            .map_err(|_| SfsError::InvalidGeometry("too many devices".to_owned()))?,
        bucket_size: opts.bucket_size,
        node_size: opts.node_size,
        journal_buckets: opts.journal_buckets,
        metadata_replicas: opts.metadata_replicas,
        data_replicas: opts.data_replicas,
        checksum: opts.checksum,
        checkpoint_seq,
        next_node_id,
        device_buckets: device_buckets.to_vec(),
        root,
        gens: Vec::new(),
    })
}

/// Write `sb` to its slot on every usable device, each copy carrying that
/// device's generation table. Returns how many devices took it; zero is an
/// error.
pub(crate) fn write_superblocks(
    cx: &Cx,
    devices: &DeviceSet,
    sb: &Superblock,
    mut gens: impl FnMut(DeviceId) -> Result<Vec<u32>>,
) -> Result<usize> {
    let offset = Superblock::slot_offset(Superblock::slot_for_seq(sb.sb_seq), u64::from(sb.bucket_size));
    let mut written = 0_usize;
    let mut last_err = None;
    for dev in devices.usable_devices() {
        let mut copy = sb.clone();
        copy.device_index = dev.0;
        copy.gens = gens(dev)?;
        let bytes = copy.encode()?;
        let res = devices
            .write(cx, dev, offset, &bytes)
            .and_then(|()| devices.sync(cx, dev));
        match res {
            Ok(()) => written += 1,
            Err(SfsError::Cancelled) => return Err(SfsError::Cancelled),
            Err(err) => {
                warn!(
                    target: "sfs::core",
                    event = "superblock_write_failed",
                    device = dev.0,
                    sb_seq = sb.sb_seq,
                    error = %err
                );
                last_err = Some(err);
            }
        }
    }
    if written == 0 {
        return Err(last_err.unwrap_or_else(|| SfsError::DeviceIo {
            device: u32::MAX,
            transient: false,
            detail: "no usable device for superblock".to_owned(),
        }));
    }
    debug!(
        target: "sfs::core",
        event = "superblock_written",
        sb_seq = sb.sb_seq,
        devices = written
    );
    Ok(written)
}

/// Lay down an empty filesystem: zeroed journal ring, superblock
/// `sb_seq = 0` in slot 0, and a wiped slot 1.
pub(crate) fn format(cx: &Cx, devices: &DeviceSet, opts: &EngineOptions) -> Result<[u8; 16]> {
    opts.validate()?;
    let lens = devices
        .ids()
        .map(|id| devices.len_bytes(id))
        .collect::<Result<Vec<u64>>>()?;
    let device_buckets = opts.device_buckets(&lens)?;
    let uuid = new_uuid(&device_buckets);
    let bucket_size = u64::from(opts.bucket_size);

    let zero = vec![0_u8; opts.bucket_size as usize];
    for dev in devices.ids() {
        for ring in 0..u64::from(opts.journal_buckets) {
            devices.write(cx, dev, (JOURNAL_FIRST_BUCKET + ring) * bucket_size, &zero)?;
        }
        let half = &zero[..zero.len() / 2];
        devices.write(cx, dev, Superblock::slot_offset(1, bucket_size), half)?;
    }

    let sb = template(opts, uuid, &device_buckets, 0, JournalSeq::ZERO, 1, None)?;
    write_superblocks(cx, devices, &sb, |dev| {
        let n = device_buckets
            .get(dev.0 as usize)
            .copied()
            .unwrap_or_default();
        Ok(vec![0; usize::try_from(n).unwrap_or(0)])
    })?;
    devices.sync_all(cx)?;
    info!(
        target: "sfs::core",
        event = "format",
        devices = device_buckets.len(),
        bucket_size = opts.bucket_size,
        node_size = opts.node_size,
        journal_buckets = opts.journal_buckets
    );
    Ok(uuid)
}

fn read_slot(cx: &Cx, devices: &DeviceSet, dev: DeviceId, offset: u64, max_len: u64) -> Result<Superblock> {
    let mut header = [0_u8; SB_HEADER_LEN];
    devices.read(cx, dev, offset, &mut header)?;
    let magic = read_le_u64(&header, 0).map_err(|e| SfsError::Format(format!("superblock: {e}")))?;
    if magic != SUPERBLOCK_MAGIC {
        return Err(SfsError::Format(format!("no superblock at offset {offset}")));
    }
    let sb_len = u64::from(read_le_u32(&header, 12).map_err(|e| SfsError::Format(format!("superblock: {e}")))?);
    if sb_len < SB_HEADER_LEN as u64 || sb_len > max_len {
        return Err(SfsError::Format(format!(
            "superblock length {sb_len} outside slot of {max_len} bytes"
        )));
    }
    let mut buf = vec![0_u8; usize::try_from(sb_len).map_err(|_| SfsError::Format("superblock length".to_owned()))?];
    devices.read(cx, dev, offset, &mut buf)?;
    Superblock::decode(&buf)
}

/// Newest valid superblock on one device, or why there is none.
pub(crate) fn read_device_superblock(
    cx: &Cx,
    devices: &DeviceSet,
    dev: DeviceId,
    bucket_size_hint: u32,
) -> Result<Superblock> {
    let dev_len = devices.len_bytes(dev)?;
    let slot0 = read_slot(cx, devices, dev, 0, dev_len);
    if let Err(SfsError::Cancelled) = slot0 {
        return Err(SfsError::Cancelled);
    }
    let bucket_size = slot0
        .as_ref()
        .map_or(u64::from(bucket_size_hint), |sb| u64::from(sb.bucket_size));
    let half = bucket_size / 2;
    let slot1 = if half + SB_HEADER_LEN as u64 <= dev_len {
        read_slot(cx, devices, dev, Superblock::slot_offset(1, bucket_size), half.min(dev_len - half))
    } else {
        Err(SfsError::Format("device too small for superblock slot 1".to_owned()))
    };
    match (slot0, slot1) {
        (Ok(a), Ok(b)) => Ok(if b.sb_seq > a.sb_seq && b.bucket_size == a.bucket_size { b } else { a }),
        (Ok(sb), Err(err)) | (Err(err), Ok(sb)) => {
            debug!(
                target: "sfs::core",
                event = "superblock_slot_invalid",
                device = dev.0,
                sb_seq = sb.sb_seq,
                error = %err
            );
            Ok(sb)
        }
        (Err(_), Err(err)) => Err(err),
    }
}

/// What mount learned from the superblocks.
#[derive(Debug)]
pub(crate) struct MountView {
    pub(crate) best: Superblock,
    /// Generation table per device; zeros for devices without a valid copy.
    pub(crate) gens: Vec<Vec<u32>>,
    pub(crate) missing: Vec<(DeviceId, String)>,
}

/// Read every device's superblock and agree on one filesystem.
pub(crate) fn read_superblocks(cx: &Cx, devices: &DeviceSet, bucket_size_hint: u32) -> Result<MountView> {
    let mut found: Vec<Option<Superblock>> = Vec::with_capacity(devices.len());
    let mut missing = Vec::new();
    for dev in devices.ids() {
        match read_device_superblock(cx, devices, dev, bucket_size_hint) {
            Ok(sb) => found.push(Some(sb)),
            Err(SfsError::Cancelled) => return Err(SfsError::Cancelled),
            Err(err) => {
                warn!(
                    target: "sfs::core",
                    event = "superblock_missing",
                    device = dev.0,
                    error = %err
                );
                missing.push((dev, err.to_string()));
                found.push(None);
            }
        }
    }
    let best = found
        .iter()
        .flatten()
        .max_by_key(|sb| sb.sb_seq)
        .cloned()
        .ok_or_else(|| SfsError::Format("no valid superblock on any device".to_owned()))?;

    if best.nr_devices as usize != devices.len() {
        return Err(SfsError::Format(format!(
            "filesystem has {} devices, {} given",
            best.nr_devices,
            devices.len()
        )));
    }
    let mut gens = Vec::with_capacity(found.len());
    for (i, sb) in found.iter().enumerate() {
        let expected = best.device_buckets.get(i).copied().unwrap_or(0);
        let expected = usize::try_from(expected).map_err(|_| SfsError::Format("bucket count".to_owned()))?;
        match sb {
            Some(sb) => {
                if sb.uuid != best.uuid {
                    return Err(SfsError::Format(format!("device {i} belongs to another filesystem")));
                }
                if sb.device_index as usize != i {
                    return Err(SfsError::Format(format!(
                        "device {i} is member {} of this filesystem",
                        sb.device_index
                    )));
                }
                if sb.gens.len() != expected {
                    return Err(SfsError::Format(format!(
                        "device {i} generation table has {} entries, expected {expected}",
                        sb.gens.len()
                    )));
                }
                gens.push(sb.gens.clone());
            }
            None => gens.push(vec![0; expected]),
        }
    }
    Ok(MountView { best, gens, missing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_block::{ByteDevice, MemoryByteDevice};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryByteDevice>, DeviceSet, EngineOptions) {
        let opts = EngineOptions::small_for_tests();
        let dev = Arc::new(MemoryByteDevice::new(1 << 20));
        let set = DeviceSet::new(vec![Arc::clone(&dev) as Arc<dyn ByteDevice>], opts.retry_policy(), 0)
            .expect("set");
        (dev, set, opts)
    }

    fn publish(set: &DeviceSet, opts: &EngineOptions, uuid: [u8; 16], sb_seq: u64) {
        let cx = Cx::for_testing();
        let lens = vec![set.len_bytes(DeviceId(0)).expect("len")];
        let buckets = opts.device_buckets(&lens).expect("buckets");
        let n = usize::try_from(buckets[0]).expect("fits");
        let sb = template(opts, uuid, &buckets, sb_seq, JournalSeq(sb_seq), 1, None).expect("template");
        write_superblocks(&cx, set, &sb, |_| Ok(vec![0; n])).expect("write");
    }

    #[test]
    fn format_writes_sequence_zero() {
        let (_dev, set, opts) = setup();
        let cx = Cx::for_testing();
        let uuid = format(&cx, &set, &opts).expect("format");
        let view = read_superblocks(&cx, &set, opts.bucket_size).expect("read");
        assert_eq!(view.best.sb_seq, 0);
        assert_eq!(view.best.uuid, uuid);
        assert!(view.missing.is_empty());
        assert!(view.gens[0].iter().all(|&g| g == 0));
    }

    #[test]
    fn newer_slot_wins_until_it_is_torn() {
        let (dev, set, opts) = setup();
        let cx = Cx::for_testing();
        let uuid = format(&cx, &set, &opts).expect("format");
        publish(&set, &opts, uuid, 1);
        let sb = read_device_superblock(&cx, &set, DeviceId(0), opts.bucket_size).expect("read");
        assert_eq!(sb.sb_seq, 1);

        dev.corrupt(Superblock::slot_offset(1, u64::from(opts.bucket_size)) + 20, 8);
        let sb = read_device_superblock(&cx, &set, DeviceId(0), opts.bucket_size).expect("read");
        assert_eq!(sb.sb_seq, 0);
    }

    #[test]
    fn oversized_length_field_is_rejected() {
        let (dev, set, opts) = setup();
        let cx = Cx::for_testing();
        format(&cx, &set, &opts).expect("format");
        let slot1 = Superblock::slot_offset(1, u64::from(opts.bucket_size));
        let mut header = [0_u8; SB_HEADER_LEN];
        header[..8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        header[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        dev.write_all_at(&cx, slot1, &header).expect("write");
        let sb = read_device_superblock(&cx, &set, DeviceId(0), opts.bucket_size).expect("read");
        assert_eq!(sb.sb_seq, 0);
    }

    #[test]
    fn nonce_follows_uuid() {
        let a = new_uuid(&[64]);
        let b = new_uuid(&[64]);
        assert_ne!(a, b);
        assert_ne!(journal_nonce(&a), journal_nonce(&b));
    }
}
