//! Superblock format.
//!
//! Bucket 0 of every device holds two superblock slots at offsets 0 and
//! `bucket_size / 2`. Checkpoint `n` writes slot `n % 2`, so a torn write
//! can only damage the slot being replaced; mount picks the valid slot with
//! the highest `sb_seq` across all devices.
//!
//! ```text
//! magic u64 | version u16 | reserved u16 | sb_len u32
//! sb_seq u64 | uuid [16] | device_index u32 | nr_devices u32
//! bucket_size u32 | node_size u32 | journal_buckets u32
//! metadata_replicas u8 | data_replicas u8 | checksum u8 | reserved u8
//! checkpoint_seq u64 | next_node_id u64
//! device_buckets u64 × nr_devices
//! root_len u16 | root NodePtr (root_len bytes, 0 = empty tree)
//! nr_gens u64 | gen u32 × nr_gens
//! crc32c u32
//! ```

use crate::checksum::ChecksumKind;
use crate::value::NodePtr;
use sfs_error::{Result, SfsError};
use sfs_types::{
    ByteReader, JournalSeq, ParseError, SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION, read_le_u32,
    read_le_u64,
};

/// Fixed prefix before the per-device tables.
const FIXED_LEN: usize = 8 + 2 + 2 + 4 + 8 + 16 + 4 + 4 + 4 + 4 + 4 + 4 + 8 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub sb_seq: u64,
    pub uuid: [u8; 16],
    pub device_index: u32,
    pub nr_devices: u32,
    pub bucket_size: u32,
    pub node_size: u32,
    pub journal_buckets: u32,
    pub metadata_replicas: u8,
    pub data_replicas: u8,
    pub checksum: ChecksumKind,
    /// Every journal entry up to and including this one is reflected by
    /// `root`.
    pub checkpoint_seq: JournalSeq,
    pub next_node_id: u64,
    /// Bucket count of every member device, indexed by device id.
    pub device_buckets: Vec<u64>,
    pub root: Option<NodePtr>,
    /// Bucket generations of the device this copy lives on.
    pub gens: Vec<u32>,
}

fn format_err(e: &ParseError) -> SfsError {
    SfsError::Format(format!("superblock: {e}"))
}

impl Superblock {
    /// Encoded size for a given geometry; used to validate that the gens
    /// table fits half a bucket.
    #[must_use]
    pub fn encoded_len_for(nr_devices: usize, nr_gens: usize, root_replicas: usize) -> usize {
        FIXED_LEN
            + nr_devices * 8
            + 2
            + NodePtr::encoded_len_for(root_replicas)
            + 8
            + nr_gens * 4
            + 4
    }

    /// Byte offset of `slot` (0 or 1) inside bucket 0.
    #[must_use]
    pub fn slot_offset(slot: u64, bucket_size: u64) -> u64 {
        (slot % 2) * (bucket_size / 2)
    }

    /// Slot a checkpoint with this sequence number writes.
    #[must_use]
    pub fn slot_for_seq(sb_seq: u64) -> u64 {
        sb_seq % 2
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut root_bytes = Vec::new();
        if let Some(root) = &self.root {
            root.encode(&mut root_bytes);
        }
        let root_len = u16::try_from(root_bytes.len())
            .map_err(|_| SfsError::Format("root pointer too large".to_owned()))?;

        let mut buf = Vec::with_capacity(Self::encoded_len_for(
            self.device_buckets.len(),
            self.gens.len(),
            self.root.as_ref().map_or(0, |r| r.replicas.len()),
        ));
        buf.extend_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        buf.extend_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
        buf.extend_from_slice(&0_u16.to_le_bytes());
        buf.extend_from_slice(&0_u32.to_le_bytes()); // sb_len, patched below
        buf.extend_from_slice(&self.sb_seq.to_le_bytes());
        buf.extend_from_slice(&self.uuid);
        buf.extend_from_slice(&self.device_index.to_le_bytes());
        buf.extend_from_slice(&self.nr_devices.to_le_bytes());
        buf.extend_from_slice(&self.bucket_size.to_le_bytes());
        buf.extend_from_slice(&self.node_size.to_le_bytes());
        buf.extend_from_slice(&self.journal_buckets.to_le_bytes());
        buf.push(self.metadata_replicas);
        buf.push(self.data_replicas);
        buf.push(self.checksum.to_raw());
        buf.push(0);
        buf.extend_from_slice(&self.checkpoint_seq.0.to_le_bytes());
        buf.extend_from_slice(&self.next_node_id.to_le_bytes());
        for n in &self.device_buckets {
            buf.extend_from_slice(&n.to_le_bytes());
        }
        buf.extend_from_slice(&root_len.to_le_bytes());
        buf.extend_from_slice(&root_bytes);
        buf.extend_from_slice(&(self.gens.len() as u64).to_le_bytes());
        for g in &self.gens {
            buf.extend_from_slice(&g.to_le_bytes());
        }
        let sb_len = u32::try_from(buf.len() + 4)
            .map_err(|_| SfsError::Format("superblock too large".to_owned()))?;
        buf[12..16].copy_from_slice(&sb_len.to_le_bytes());
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let magic = read_le_u64(bytes, 0).map_err(|e| format_err(&e))?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(format_err(&ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            }));
        }
        let sb_len = usize::try_from(read_le_u32(bytes, 12).map_err(|e| format_err(&e))?)
            .map_err(|_| SfsError::Format("superblock length overflow".to_owned()))?;
        if sb_len < FIXED_LEN + 4 || sb_len > bytes.len() {
            return Err(SfsError::Format(format!(
                "superblock length {sb_len} out of range (have {} bytes)",
                bytes.len()
            )));
        }
        let body = &bytes[..sb_len - 4];
        let stored = read_le_u32(bytes, sb_len - 4).map_err(|e| format_err(&e))?;
        let computed = crc32c::crc32c(body);
        if stored != computed {
            return Err(format_err(&ParseError::ChecksumMismatch {
                what: "superblock",
                stored: u64::from(stored),
                computed: u64::from(computed),
            }));
        }

        Self::decode_body(body).map_err(|e| format_err(&e))
    }

    fn decode_body(body: &[u8]) -> std::result::Result<Self, ParseError> {
        let mut r = ByteReader::new(body);
        let _magic = r.u64()?;
        let version = r.u16()?;
        if version != SUPERBLOCK_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported superblock version",
            });
        }
        let _reserved = r.u16()?;
        let _sb_len = r.u32()?;
        let sb_seq = r.u64()?;
        let mut uuid = [0_u8; 16];
        uuid.copy_from_slice(r.bytes(16)?);
        let device_index = r.u32()?;
        let nr_devices = r.u32()?;
        let bucket_size = r.u32()?;
        let node_size = r.u32()?;
        let journal_buckets = r.u32()?;
        let metadata_replicas = r.u8()?;
        let data_replicas = r.u8()?;
        let checksum = ChecksumKind::from_raw(r.u8()?)?;
        let _pad = r.u8()?;
        let checkpoint_seq = JournalSeq(r.u64()?);
        let next_node_id = r.u64()?;
        if nr_devices == 0 || device_index >= nr_devices || nr_devices > 64 {
            return Err(ParseError::InvalidField {
                field: "nr_devices",
                reason: "device index out of range",
            });
        }
        let mut device_buckets = Vec::with_capacity(nr_devices as usize);
        for _ in 0..nr_devices {
            device_buckets.push(r.u64()?);
        }
        let root_len = usize::from(r.u16()?);
        let root = if root_len == 0 {
            None
        } else {
            let root_bytes = r.bytes(root_len)?;
            let mut rr = ByteReader::new(root_bytes);
            let ptr = NodePtr::decode_from(&mut rr)?;
            if rr.remaining() != 0 {
                return Err(ParseError::InvalidField {
                    field: "root",
                    reason: "trailing bytes after root pointer",
                });
            }
            Some(ptr)
        };
        let nr_gens = sfs_types::u64_to_usize(r.u64()?, "nr_gens")?;
        if nr_gens.saturating_mul(4) != r.remaining() {
            return Err(ParseError::InvalidField {
                field: "nr_gens",
                reason: "generation table length mismatch",
            });
        }
        let mut gens = Vec::with_capacity(nr_gens);
        for _ in 0..nr_gens {
            gens.push(r.u32()?);
        }
        Ok(Self {
            sb_seq,
            uuid,
            device_index,
            nr_devices,
            bucket_size,
            node_size,
            journal_buckets,
            metadata_replicas,
            data_replicas,
            checksum,
            checkpoint_seq,
            next_node_id,
            device_buckets,
            root,
            gens,
        })
    }
}
