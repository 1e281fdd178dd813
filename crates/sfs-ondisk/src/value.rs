//! Typed values and device pointers.
//!
//! ```text
//! ReplicaPtr (20 bytes): device u32 | bucket u64 | offset u32 | gen u32
//! Checksum   (9 bytes):  kind u8 | digest u64
//! NodePtr:     id u64 | level u8 | size u32 | checksum | nr u8 | replicas
//! ExtentValue: size u32 | stored_size u32 | checksum | algo u8
//!              | layout u8 | data_shards u8 | shard_len u32 | nr u8 | replicas
//! ```
//!
//! All integers are little-endian. Payload decoders consume exactly the
//! payload; trailing bytes are corruption.

use crate::checksum::Checksum;
use crate::corrupt_key;
use sfs_error::{Result, SfsError};
use sfs_types::{BucketIndex, ByteReader, DeviceId, Generation, NodeId, ParseError};

pub const TAG_WHITEOUT: u8 = 1;
pub const TAG_INLINE: u8 = 2;
pub const TAG_EXTENT: u8 = 3;
pub const TAG_NODE: u8 = 4;

pub const REPLICA_PTR_LEN: usize = 20;
/// Upper bound on replicas per pointer (parity stripes included).
pub const MAX_REPLICAS: usize = 16;

/// One copy of some bytes on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaPtr {
    pub device: DeviceId,
    pub bucket: BucketIndex,
    /// Byte offset inside the bucket.
    pub offset: u32,
    pub generation: Generation,
}

impl ReplicaPtr {
    /// Absolute byte address on the device.
    #[must_use]
    pub fn byte_addr(&self, bucket_size: u64) -> u64 {
        self.bucket.0 * bucket_size + u64::from(self.offset)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.device.0.to_le_bytes());
        out.extend_from_slice(&self.bucket.0.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.generation.0.to_le_bytes());
    }

    fn decode(r: &mut ByteReader<'_>) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            device: DeviceId(r.u32()?),
            bucket: BucketIndex(r.u64()?),
            offset: r.u32()?,
            generation: Generation(r.u32()?),
        })
    }
}

fn encode_replicas(replicas: &[ReplicaPtr], out: &mut Vec<u8>) {
    // Callers cap the replica count at MAX_REPLICAS.
    out.push(u8::try_from(replicas.len()).unwrap_or(u8::MAX));
    for r in replicas {
        r.encode(out);
    }
}

fn decode_replicas(r: &mut ByteReader<'_>) -> std::result::Result<Vec<ReplicaPtr>, ParseError> {
    let nr = usize::from(r.u8()?);
    if nr == 0 || nr > MAX_REPLICAS {
        return Err(ParseError::InvalidField {
            field: "nr_replicas",
            reason: "must be 1..=16",
        });
    }
    (0..nr).map(|_| ReplicaPtr::decode(r)).collect()
}

/// Location and identity of a written node page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePtr {
    pub id: NodeId,
    pub level: u8,
    /// Page length in bytes.
    pub size: u32,
    pub checksum: Checksum,
    pub replicas: Vec<ReplicaPtr>,
}

impl NodePtr {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.replicas.len())
    }

    #[must_use]
    pub fn encoded_len_for(nr_replicas: usize) -> usize {
        8 + 1 + 4 + Checksum::ENCODED_LEN + 1 + nr_replicas * REPLICA_PTR_LEN
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.0.to_le_bytes());
        out.push(self.level);
        out.extend_from_slice(&self.size.to_le_bytes());
        self.checksum.encode(out);
        encode_replicas(&self.replicas, out);
    }

    pub fn decode_from(r: &mut ByteReader<'_>) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            id: NodeId(r.u64()?),
            level: r.u8()?,
            size: r.u32()?,
            checksum: Checksum::decode(r)?,
            replicas: decode_replicas(r)?,
        })
    }
}

/// Compression applied to an extent's stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Compression {
    /// Collaborator algorithm id; never 0.
    pub algorithm: u8,
}

/// How an extent's stored bytes are spread over its pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentLayout {
    /// Every pointer holds a full copy.
    Replicated,
    /// `data_shards` pointers hold consecutive `shard_len` slices (the last
    /// zero padded) and the final pointer holds parity.
    Parity { data_shards: u8, shard_len: u32 },
}

/// Pointer to out-of-node data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtentValue {
    /// Logical (uncompressed) length.
    pub size: u32,
    /// Length of the stored (possibly compressed) bytes.
    pub stored_size: u32,
    /// Checksum of the stored bytes.
    pub checksum: Checksum,
    pub compression: Option<Compression>,
    pub layout: ExtentLayout,
    pub replicas: Vec<ReplicaPtr>,
}

impl ExtentValue {
    fn encoded_len(&self) -> usize {
        4 + 4 + Checksum::ENCODED_LEN + 1 + 1 + 1 + 4 + 1 + self.replicas.len() * REPLICA_PTR_LEN
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.stored_size.to_le_bytes());
        self.checksum.encode(out);
        out.push(self.compression.map_or(0, |c| c.algorithm));
        match self.layout {
            ExtentLayout::Replicated => {
                out.push(0);
                out.push(0);
                out.extend_from_slice(&0_u32.to_le_bytes());
            }
            ExtentLayout::Parity {
                data_shards,
                shard_len,
            } => {
                out.push(1);
                out.push(data_shards);
                out.extend_from_slice(&shard_len.to_le_bytes());
            }
        }
        encode_replicas(&self.replicas, out);
    }

    fn decode(r: &mut ByteReader<'_>) -> std::result::Result<Self, ParseError> {
        let size = r.u32()?;
        let stored_size = r.u32()?;
        let checksum = Checksum::decode(r)?;
        let algorithm = r.u8()?;
        let layout_tag = r.u8()?;
        let data_shards = r.u8()?;
        let shard_len = r.u32()?;
        let replicas = decode_replicas(r)?;
        let layout = match layout_tag {
            0 => ExtentLayout::Replicated,
            1 => {
                if data_shards == 0 || usize::from(data_shards) + 1 != replicas.len() {
                    return Err(ParseError::InvalidField {
                        field: "data_shards",
                        reason: "parity layout needs data_shards + 1 pointers",
                    });
                }
                ExtentLayout::Parity {
                    data_shards,
                    shard_len,
                }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "layout",
                    reason: "unknown extent layout",
                });
            }
        };
        Ok(Self {
            size,
            stored_size,
            checksum,
            compression: (algorithm != 0).then_some(Compression { algorithm }),
            layout,
            replicas,
        })
    }
}

/// Typed payload stored under a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Deletion marker; suppresses older values until compaction.
    Whiteout,
    Inline(Vec<u8>),
    Extent(ExtentValue),
    /// Child pointer inside an interior node page.
    Node(NodePtr),
}

impl Value {
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Whiteout => TAG_WHITEOUT,
            Self::Inline(_) => TAG_INLINE,
            Self::Extent(_) => TAG_EXTENT,
            Self::Node(_) => TAG_NODE,
        }
    }

    #[must_use]
    pub fn is_whiteout(&self) -> bool {
        matches!(self, Self::Whiteout)
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Whiteout => 0,
            Self::Inline(bytes) => bytes.len(),
            Self::Extent(ext) => ext.encoded_len(),
            Self::Node(ptr) => ptr.encoded_len(),
        }
    }

    pub(crate) fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Whiteout => {}
            Self::Inline(bytes) => out.extend_from_slice(bytes),
            Self::Extent(ext) => ext.encode(out),
            Self::Node(ptr) => ptr.encode(out),
        }
    }

    pub(crate) fn decode_payload(tag: u8, payload: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(payload);
        let value = match tag {
            TAG_WHITEOUT => Self::Whiteout,
            TAG_INLINE => return Ok(Self::Inline(payload.to_vec())),
            TAG_EXTENT => Self::Extent(ExtentValue::decode(&mut r).map_err(|e| corrupt_key(&e))?),
            TAG_NODE => Self::Node(NodePtr::decode_from(&mut r).map_err(|e| corrupt_key(&e))?),
            other => {
                return Err(SfsError::CorruptKey(format!("unknown value tag {other}")));
            }
        };
        if r.remaining() != 0 {
            return Err(SfsError::CorruptKey(format!(
                "value tag {tag} has {} trailing payload bytes",
                r.remaining()
            )));
        }
        Ok(value)
    }

    /// Device pointers this value owns, if any.
    #[must_use]
    pub fn replicas(&self) -> &[ReplicaPtr] {
        match self {
            Self::Extent(ext) => &ext.replicas,
            Self::Node(ptr) => &ptr.replicas,
            Self::Whiteout | Self::Inline(_) => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumKind;
    use crate::key::{Key, decode_entry, encode_entry};

    fn replica(dev: u32, bucket: u64) -> ReplicaPtr {
        ReplicaPtr {
            device: DeviceId(dev),
            bucket: BucketIndex(bucket),
            offset: 512,
            generation: Generation(3),
        }
    }

    fn round_trip(value: &Value) -> Value {
        let mut buf = Vec::new();
        encode_entry(&Key::new(1, 2, 3), value, &mut buf).expect("encode");
        let ((_, decoded), used) = decode_entry(&buf).expect("decode");
        assert_eq!(used, buf.len());
        decoded
    }

    #[test]
    fn extent_with_parity_round_trips() {
        let value = Value::Extent(ExtentValue {
            size: 10_000,
            stored_size: 4_000,
            checksum: ChecksumKind::Crc32c.compute(b"abc"),
            compression: Some(Compression { algorithm: 7 }),
            layout: ExtentLayout::Parity {
                data_shards: 2,
                shard_len: 2_000,
            },
            replicas: vec![replica(0, 4), replica(1, 5), replica(2, 6)],
        });
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn node_ptr_round_trips() {
        let value = Value::Node(NodePtr {
            id: NodeId(77),
            level: 2,
            size: 4096,
            checksum: ChecksumKind::Blake3.compute(b"page"),
            replicas: vec![replica(0, 9), replica(1, 9)],
        });
        assert_eq!(value.payload_len(), NodePtr::encoded_len_for(2));
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn parity_layout_requires_matching_pointer_count() {
        let value = Value::Extent(ExtentValue {
            size: 1,
            stored_size: 1,
            checksum: Checksum::default(),
            compression: None,
            layout: ExtentLayout::Parity {
                data_shards: 3,
                shard_len: 1,
            },
            replicas: vec![replica(0, 1), replica(1, 1)],
        });
        let mut buf = Vec::new();
        encode_entry(&Key::MIN, &value, &mut buf).expect("encode");
        assert!(matches!(decode_entry(&buf), Err(SfsError::CorruptKey(_))));
    }

    #[test]
    fn trailing_payload_bytes_are_corruption() {
        let value = Value::Node(NodePtr {
            id: NodeId(1),
            level: 0,
            size: 1,
            checksum: Checksum::default(),
            replicas: vec![replica(0, 1)],
        });
        let mut buf = Vec::new();
        encode_entry(&Key::MIN, &value, &mut buf).expect("encode");
        // Grow the declared payload by one byte and append garbage.
        let len = u16::from_le_bytes([buf[2], buf[3]]) + 1;
        buf[2..4].copy_from_slice(&len.to_le_bytes());
        buf.push(0xAA);
        assert!(matches!(decode_entry(&buf), Err(SfsError::CorruptKey(_))));
    }

    #[test]
    fn zero_replicas_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1_u64.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&1_u32.to_le_bytes());
        Checksum::default().encode(&mut payload);
        payload.push(0);
        assert!(Value::decode_payload(TAG_NODE, &payload).is_err());
    }
}
