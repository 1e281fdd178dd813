#![forbid(unsafe_code)]
//! Write-ahead journal.
//!
//! The journal occupies buckets `[1, 1 + nr_buckets)` of every device and is
//! mirrored: each flush writes the same bytes at the same offsets on every
//! usable device and succeeds if at least one device took them. Records
//! never span buckets; each bucket remembers the highest sequence it holds
//! and becomes reusable once a checkpoint covers that sequence.
//!
//! Commit protocol:
//! 1. [`Journal::append`] assigns the next sequence and buffers the record.
//! 2. [`Journal::flush`] writes buffered records, syncs, and wakes every
//!    waiter up to the last flushed sequence (group commit).
//! 3. After a checkpoint makes the tree durable through `seq`,
//!    [`Journal::release_through`] lets the buckets below it be reused.
//!
//! Replay ([`Journal::open`]) reads every journal bucket on every readable
//! device, unions the records, and returns those above the checkpoint. They
//! must be contiguous; a gap is fatal because a later transaction would be
//! replayed without an earlier one. A torn final record is the normal crash
//! tail and is dropped.

mod notify;
pub mod record;

pub use notify::{DurabilityNotifier, DurabilityOutcome};
pub use record::{DecodeResult, JournalRecord, RECORD_OVERHEAD, decode_record, encode_record};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_block::DeviceSet;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{Key, Value};
use sfs_types::{Cx, DeviceId, JOURNAL_FIRST_BUCKET, JournalSeq, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalGeometry {
    pub bucket_size: u32,
    pub nr_buckets: u32,
}

impl JournalGeometry {
    /// Device byte offset of ring slot `ring`.
    #[must_use]
    pub fn bucket_offset(&self, ring: usize) -> u64 {
        (JOURNAL_FIRST_BUCKET + ring as u64) * u64::from(self.bucket_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStats {
    pub next_seq: u64,
    pub durable_seq: u64,
    pub released_seq: u64,
    pub free_buckets: u32,
    pub total_buckets: u32,
    pub flushes: u64,
    pub bytes_written: u64,
}

/// Buffered bytes destined for one contiguous range of one ring slot.
#[derive(Debug)]
struct Segment {
    ring: usize,
    offset: u32,
    bytes: Vec<u8>,
    last_seq: JournalSeq,
}

#[derive(Debug)]
struct JournalState {
    next_seq: JournalSeq,
    cur: Option<usize>,
    /// Bytes assigned in `cur`, flushed or not.
    cur_fill: u32,
    pending: Vec<Segment>,
    bucket_max: Vec<JournalSeq>,
    released: JournalSeq,
    failed: Option<String>,
}

impl JournalState {
    fn is_free(&self, ring: usize) -> bool {
        self.cur != Some(ring) && self.bucket_max[ring] <= self.released
    }

    fn free_buckets(&self) -> u32 {
        let n = (0..self.bucket_max.len()).filter(|&i| self.is_free(i)).count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    fn next_free(&self) -> Option<usize> {
        let n = self.bucket_max.len();
        let start = self.cur.map_or(0, |c| c + 1);
        (0..n).map(|k| (start + k) % n).find(|&i| self.is_free(i))
    }
}

#[derive(Debug)]
pub struct Journal {
    devices: Arc<DeviceSet>,
    geo: JournalGeometry,
    nonce: u64,
    state: Mutex<JournalState>,
    flush_lock: Mutex<()>,
    notifier: DurabilityNotifier,
    flushes: AtomicU64,
    bytes_written: AtomicU64,
}

impl Journal {
    /// Journal for a freshly formatted filesystem; the first record gets
    /// `start.next()`.
    pub fn create(devices: Arc<DeviceSet>, geo: JournalGeometry, nonce: u64, start: JournalSeq) -> Result<Self> {
        Self::with_state(devices, geo, nonce, start, vec![JournalSeq::ZERO; geo.nr_buckets as usize], start)
    }

    fn with_state(
        devices: Arc<DeviceSet>,
        geo: JournalGeometry,
        nonce: u64,
        last_seq: JournalSeq,
        bucket_max: Vec<JournalSeq>,
        released: JournalSeq,
    ) -> Result<Self> {
        if geo.nr_buckets == 0 || geo.bucket_size == 0 {
            return Err(SfsError::InvalidGeometry("journal needs at least one bucket".to_owned()));
        }
        Ok(Self {
            devices,
            geo,
            nonce,
            state: Mutex::new(JournalState {
                next_seq: last_seq.next(),
                cur: None,
                cur_fill: 0,
                pending: Vec::new(),
                bucket_max,
                released,
                failed: None,
            }),
            flush_lock: Mutex::new(()),
            notifier: DurabilityNotifier::new(last_seq),
            flushes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Mount: read the journal back and return every record above
    /// `checkpoint`, in sequence order, plus a journal positioned to append
    /// after them.
    pub fn open(
        cx: &Cx,
        devices: Arc<DeviceSet>,
        geo: JournalGeometry,
        nonce: u64,
        checkpoint: JournalSeq,
    ) -> Result<(Self, Vec<JournalRecord>)> {
        let nr = geo.nr_buckets as usize;
        let mut records: BTreeMap<JournalSeq, JournalRecord> = BTreeMap::new();
        let mut bucket_max = vec![JournalSeq::ZERO; nr];
        let mut readable = 0_usize;

        for dev in devices.usable_devices() {
            match scan_device(cx, &devices, geo, nonce, dev, &mut records, &mut bucket_max) {
                Ok(()) => readable += 1,
                Err(SfsError::Cancelled) => return Err(SfsError::Cancelled),
                Err(err) => warn!(
                    target: "sfs::journal",
                    event = "journal_device_unreadable",
                    device = dev.0,
                    error = %err
                ),
            }
        }
        if readable == 0 {
            error!(target: "sfs::journal", event = "journal_unreadable");
            return Err(SfsError::JournalCorrupt("no readable journal device".to_owned()));
        }

        let last_seen = records.keys().next_back().copied().unwrap_or(JournalSeq::ZERO);
        let live: Vec<JournalRecord> = records
            .into_iter()
            .filter(|(seq, _)| *seq > checkpoint)
            .map(|(_, rec)| rec)
            .collect();
        let mut expected = checkpoint.next();
        for rec in &live {
            if rec.seq != expected {
                error!(
                    target: "sfs::journal",
                    event = "journal_gap",
                    expected = expected.0,
                    found = rec.seq.0
                );
                return Err(SfsError::JournalCorrupt(format!(
                    "journal gap: expected seq {expected}, found {}",
                    rec.seq
                )));
            }
            expected = expected.next();
        }

        let last_seq = last_seen.max(checkpoint);
        info!(
            target: "sfs::journal",
            event = "journal_replay",
            checkpoint = checkpoint.0,
            records = live.len(),
            next_seq = last_seq.next().0,
            devices = readable
        );
        let journal = Self::with_state(devices, geo, nonce, last_seq, bucket_max, checkpoint)?;
        Ok((journal, live))
    }

    #[must_use]
    pub fn geometry(&self) -> JournalGeometry {
        self.geo
    }

    /// Largest record that fits in one journal bucket.
    #[must_use]
    pub fn max_record_len(&self) -> usize {
        self.geo.bucket_size as usize
    }

    /// Buffer a record for `mutations` and return its sequence. Nothing is
    /// durable until [`flush`](Self::flush) covers the sequence.
    ///
    /// `JournalFull` when the record does not fit in the current bucket and
    /// no bucket is free; the caller should checkpoint and retry.
    pub fn append(&self, mutations: &[(Key, Value)], touched: &[NodeId]) -> Result<JournalSeq> {
        let mut st = self.state.lock();
        if st.failed.is_some() {
            return Err(SfsError::ReadOnly);
        }
        let seq = st.next_seq;
        let bytes = record::encode_parts(self.nonce, seq, mutations, touched)?;
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        if len > self.geo.bucket_size {
            return Err(SfsError::ValueTooLarge {
                len: bytes.len(),
                max: self.max_record_len(),
            });
        }

        let fits = st.cur.is_some() && self.geo.bucket_size - st.cur_fill >= len;
        if !fits {
            let Some(next) = st.next_free() else {
                debug!(
                    target: "sfs::journal",
                    event = "journal_full",
                    released = st.released.0,
                    next_seq = seq.0
                );
                return Err(SfsError::JournalFull);
            };
            trace!(target: "sfs::journal", event = "journal_bucket_switch", ring = next);
            st.cur = Some(next);
            st.cur_fill = 0;
        }
        let ring = st.cur.unwrap_or_default();
        let offset = st.cur_fill;
        st.cur_fill += len;
        st.bucket_max[ring] = seq;
        st.next_seq = seq.next();

        match st.pending.last_mut() {
            Some(seg) if seg.ring == ring && seg.offset + seg.bytes.len() as u32 == offset => {
                seg.bytes.extend_from_slice(&bytes);
                seg.last_seq = seq;
            }
            _ => st.pending.push(Segment {
                ring,
                offset,
                bytes,
                last_seq: seq,
            }),
        }
        trace!(
            target: "sfs::journal",
            event = "journal_append",
            seq = seq.0,
            ring,
            offset,
            len,
            mutations = mutations.len()
        );
        Ok(seq)
    }

    /// Write every buffered record to all usable devices and sync them.
    /// Returns the highest durable sequence.
    pub fn flush(&self, cx: &Cx) -> Result<JournalSeq> {
        let _serial = self.flush_lock.lock();
        let segments = std::mem::take(&mut self.state.lock().pending);
        let Some(last) = segments.last().map(|s| s.last_seq) else {
            return Ok(self.notifier.durable());
        };

        let mut written = 0_usize;
        let mut last_err = None;
        for dev in self.devices.usable_devices() {
            match self.write_segments(cx, dev, &segments) {
                Ok(()) => written += 1,
                Err(SfsError::Cancelled) => {
                    self.requeue(segments);
                    return Err(SfsError::Cancelled);
                }
                Err(err) => {
                    // A mirror that missed records must not be written again.
                    self.devices.mark_failed(dev, "journal write");
                    warn!(
                        target: "sfs::journal",
                        event = "journal_mirror_lost",
                        device = dev.0,
                        error = %err
                    );
                    last_err = Some(err);
                }
            }
        }

        if written == 0 {
            let err = last_err.unwrap_or_else(|| SfsError::DeviceIo {
                device: u32::MAX,
                transient: false,
                detail: "no usable journal device".to_owned(),
            });
            let msg = err.to_string();
            error!(target: "sfs::journal", event = "journal_write_failed", seq = last.0, error = %msg);
            self.state.lock().failed = Some(msg.clone());
            self.notifier.notify_failed(last, msg);
            return Err(err);
        }

        let bytes: usize = segments.iter().map(|s| s.bytes.len()).sum();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.notifier.notify_durable(last);
        trace!(
            target: "sfs::journal",
            event = "journal_flush",
            seq = last.0,
            bytes,
            devices = written
        );
        Ok(last)
    }

    fn write_segments(&self, cx: &Cx, dev: DeviceId, segments: &[Segment]) -> Result<()> {
        for seg in segments {
            let offset = self.geo.bucket_offset(seg.ring) + u64::from(seg.offset);
            self.devices.write(cx, dev, offset, &seg.bytes)?;
        }
        self.devices.sync(cx, dev)
    }

    fn requeue(&self, mut segments: Vec<Segment>) {
        let mut st = self.state.lock();
        segments.append(&mut st.pending);
        st.pending = segments;
    }

    /// Block until `seq` is durable.
    pub fn wait_durable(&self, seq: JournalSeq) -> Result<()> {
        match self.notifier.await_seq(seq) {
            DurabilityOutcome::Durable => Ok(()),
            DurabilityOutcome::Failed(_) => Err(SfsError::ReadOnly),
        }
    }

    #[must_use]
    pub fn notifier(&self) -> &DurabilityNotifier {
        &self.notifier
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Highest sequence handed out so far.
    #[must_use]
    pub fn last_seq(&self) -> JournalSeq {
        JournalSeq(self.state.lock().next_seq.0.saturating_sub(1))
    }

    #[must_use]
    pub fn durable_seq(&self) -> JournalSeq {
        self.notifier.durable()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state.lock().failed.is_some()
    }

    /// A checkpoint made everything through `seq` durable in the tree.
    pub fn release_through(&self, seq: JournalSeq) {
        let mut st = self.state.lock();
        if seq > st.released {
            st.released = seq;
        }
        debug!(
            target: "sfs::journal",
            event = "journal_release",
            through = st.released.0,
            free_buckets = st.free_buckets()
        );
    }

    #[must_use]
    pub fn free_buckets(&self) -> u32 {
        self.state.lock().free_buckets()
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        let st = self.state.lock();
        JournalStats {
            next_seq: st.next_seq.0,
            durable_seq: self.notifier.durable().0,
            released_seq: st.released.0,
            free_buckets: st.free_buckets(),
            total_buckets: self.geo.nr_buckets,
            flushes: self.flushes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

fn scan_device(
    cx: &Cx,
    devices: &DeviceSet,
    geo: JournalGeometry,
    nonce: u64,
    dev: DeviceId,
    records: &mut BTreeMap<JournalSeq, JournalRecord>,
    bucket_max: &mut [JournalSeq],
) -> Result<()> {
    let mut buf = vec![0_u8; geo.bucket_size as usize];
    for (ring, max) in bucket_max.iter_mut().enumerate() {
        devices.read(cx, dev, geo.bucket_offset(ring), &mut buf)?;
        let mut offset = 0;
        loop {
            match decode_record(nonce, &buf[offset..]) {
                DecodeResult::Record(rec, used) => {
                    *max = (*max).max(rec.seq);
                    records.entry(rec.seq).or_insert(rec);
                    offset += used;
                }
                DecodeResult::NeedMore(_) => {
                    debug!(target: "sfs::journal", event = "journal_torn_tail", device = dev.0, ring, offset);
                    break;
                }
                DecodeResult::Corrupted(reason) => {
                    debug!(
                        target: "sfs::journal",
                        event = "journal_bucket_end",
                        device = dev.0,
                        ring,
                        offset,
                        reason = %reason
                    );
                    break;
                }
                DecodeResult::EndOfData => break,
            }
        }
    }
    Ok(())
}
