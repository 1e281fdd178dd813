//! Engine configuration.
//!
//! `EngineOptions` is plain data: it round-trips through JSON and carries
//! every tunable the engine reads. Geometry fields (`bucket_size`,
//! `node_size`, `journal_buckets`, replica counts, `checksum`) are fixed at
//! format time and recorded in the superblock; on mount the superblock wins
//! and the remaining fields tune the running engine.
//!
//! Collaborators that cannot be serialized (codecs) travel separately in
//! [`Collaborators`].

use serde::{Deserialize, Serialize};
use sfs_block::{ParityCodec, RetryPolicy, XorParity};
use sfs_btree::TreeOptions;
use sfs_error::{Result, SfsError};
use sfs_ondisk::value::MAX_REPLICAS;
use sfs_ondisk::{ALLOC_ALIGN, ChecksumKind, Compressor, NoCompression, Superblock};
use sfs_types::JOURNAL_FIRST_BUCKET;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    // ── Geometry (fixed at format) ──────────────────────────────────────
    pub bucket_size: u32,
    pub node_size: u32,
    pub journal_buckets: u32,
    pub metadata_replicas: u8,
    pub data_replicas: u8,
    /// Data shards per parity stripe for extents; 0 stores full replicas.
    pub erasure_data_shards: u8,
    pub checksum: ChecksumKind,
    /// Compression algorithm id handed to the collaborator; 0 = none.
    pub compression: u8,

    // ── Tree ────────────────────────────────────────────────────────────
    pub max_runs_per_node: usize,
    pub open_run_max_entries: usize,
    pub merge_threshold_pct: u8,
    pub long_lock_wait_ms: u64,

    // ── Journal ─────────────────────────────────────────────────────────
    /// Each committer flushes the journal itself instead of waiting for
    /// the background flusher.
    pub sync_on_commit: bool,
    /// Free journal buckets below which a checkpoint is requested early.
    pub journal_low_watermark_buckets: u32,

    // ── Copygc ──────────────────────────────────────────────────────────
    pub copygc_threshold_pct: u8,
    pub copygc_max_buckets: usize,

    // ── Background work ─────────────────────────────────────────────────
    pub background_tasks: bool,
    pub checkpoint_interval_ms: u64,
    pub copygc_interval_ms: u64,
    pub journal_flush_interval_ms: u64,

    // ── Devices ─────────────────────────────────────────────────────────
    pub io_retries: u32,
    pub io_backoff_ms: u64,
    /// Per-device ARC read cache entries; 0 disables the cache.
    pub read_cache_pages: usize,
    /// Accept writes that placed fewer replicas than configured.
    pub allow_degraded: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bucket_size: 256 * 1024,
            node_size: 16 * 1024,
            journal_buckets: 8,
            metadata_replicas: 1,
            data_replicas: 1,
            erasure_data_shards: 0,
            checksum: ChecksumKind::Crc32c,
            compression: 0,
            max_runs_per_node: 4,
            open_run_max_entries: 64,
            merge_threshold_pct: 25,
            long_lock_wait_ms: 100,
            sync_on_commit: true,
            journal_low_watermark_buckets: 2,
            copygc_threshold_pct: 25,
            copygc_max_buckets: 16,
            background_tasks: true,
            checkpoint_interval_ms: 5_000,
            copygc_interval_ms: 30_000,
            journal_flush_interval_ms: 5,
            io_retries: 3,
            io_backoff_ms: 1,
            read_cache_pages: 256,
            allow_degraded: true,
        }
    }
}

fn geometry(msg: String) -> SfsError {
    SfsError::InvalidGeometry(msg)
}

impl EngineOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let opts: Self = serde_json::from_str(json)
            .map_err(|e| SfsError::Format(format!("engine options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SfsError::Format(format!("engine options: {e}")))
    }

    /// Device-independent checks.
    pub fn validate(&self) -> Result<()> {
        if !self.bucket_size.is_power_of_two() || u64::from(self.bucket_size) < 8 * ALLOC_ALIGN {
            return Err(geometry(format!(
                "bucket size {} must be a power of two of at least {}",
                self.bucket_size,
                8 * ALLOC_ALIGN
            )));
        }
        if !self.node_size.is_power_of_two() {
            return Err(geometry(format!(
                "node size {} is not a power of two",
                self.node_size
            )));
        }
        if self.node_size > self.bucket_size / 2 {
            return Err(geometry(format!(
                "node size {} exceeds half the bucket size {}",
                self.node_size, self.bucket_size
            )));
        }
        if self.journal_buckets < 2 {
            return Err(geometry(
                "journal needs at least two buckets to rotate".to_owned(),
            ));
        }
        for (what, n) in [
            ("metadata", self.metadata_replicas),
            ("data", self.data_replicas),
        ] {
            if n == 0 || usize::from(n) > MAX_REPLICAS {
                return Err(geometry(format!(
                    "{what} replicas must be within 1..={MAX_REPLICAS}, got {n}"
                )));
            }
        }
        if self.erasure_data_shards == 1
            || usize::from(self.erasure_data_shards) + 1 > MAX_REPLICAS
        {
            return Err(geometry(format!(
                "erasure stripes need 2..={} data shards, got {}",
                MAX_REPLICAS - 1,
                self.erasure_data_shards
            )));
        }
        if self.copygc_threshold_pct > 100 {
            return Err(geometry(format!(
                "copygc threshold {}% is not a percentage",
                self.copygc_threshold_pct
            )));
        }
        if self.background_tasks
            && (self.checkpoint_interval_ms == 0
                || self.copygc_interval_ms == 0
                || self.journal_flush_interval_ms == 0)
        {
            return Err(geometry(
                "background intervals must be non-zero".to_owned(),
            ));
        }
        self.tree_options().validate()
    }

    /// Bucket count of every device, checked against the on-disk layout:
    /// each device must hold the reserved region plus some data buckets, and
    /// its generation table must fit in one superblock slot.
    pub fn device_buckets(&self, device_lens: &[u64]) -> Result<Vec<u64>> {
        if device_lens.is_empty() {
            return Err(geometry("no devices".to_owned()));
        }
        let reserved = JOURNAL_FIRST_BUCKET + u64::from(self.journal_buckets);
        let bucket_size = u64::from(self.bucket_size);
        let buckets: Vec<u64> = device_lens.iter().map(|len| len / bucket_size).collect();
        for (i, &n) in buckets.iter().enumerate() {
            if n < reserved + 2 {
                return Err(geometry(format!(
                    "device {i} holds {n} buckets; superblock and journal need {reserved} plus at least 2 for data"
                )));
            }
        }
        let widest = buckets.iter().copied().max().unwrap_or(0);
        let widest = usize::try_from(widest).map_err(|_| geometry("device too large".to_owned()))?;
        let sb_len =
            Superblock::encoded_len_for(buckets.len(), widest, usize::from(self.metadata_replicas));
        if sb_len as u64 > bucket_size / 2 {
            return Err(geometry(format!(
                "superblock with {widest} bucket generations needs {sb_len} bytes, slot holds {}",
                bucket_size / 2
            )));
        }
        Ok(buckets)
    }

    #[must_use]
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            node_size: self.node_size,
            metadata_replicas: self.metadata_replicas,
            max_runs_per_node: self.max_runs_per_node,
            open_run_max_entries: self.open_run_max_entries,
            merge_threshold_pct: self.merge_threshold_pct,
            long_lock_wait: Duration::from_millis(self.long_lock_wait_ms),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.io_retries,
            backoff: Duration::from_millis(self.io_backoff_ms),
        }
    }

    /// Take the geometry recorded in a superblock.
    pub(crate) fn adopt_geometry(&mut self, sb: &Superblock) {
        self.bucket_size = sb.bucket_size;
        self.node_size = sb.node_size;
        self.journal_buckets = sb.journal_buckets;
        self.metadata_replicas = sb.metadata_replicas;
        self.data_replicas = sb.data_replicas;
        self.checksum = sb.checksum;
    }

    /// Small geometry for tests: tiny buckets and nodes, no background
    /// thread.
    #[must_use]
    pub fn small_for_tests() -> Self {
        Self {
            bucket_size: 16 * 1024,
            node_size: 2048,
            journal_buckets: 4,
            open_run_max_entries: 16,
            background_tasks: false,
            read_cache_pages: 0,
            io_backoff_ms: 0,
            ..Self::default()
        }
    }
}

/// External interfaces the engine calls but does not implement.
#[derive(Clone)]
pub struct Collaborators {
    pub compressor: Arc<dyn Compressor>,
    pub parity: Arc<dyn ParityCodec>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            compressor: Arc::new(NoCompression),
            parity: Arc::new(XorParity),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("parity_shards", &self.parity.parity_shards())
            .finish_non_exhaustive()
    }
}
