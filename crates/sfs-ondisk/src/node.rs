//! Node pages.
//!
//! ```text
//! Node page:
//! +------------------+---------+
//! | magic            | 4 bytes | NODE_MAGIC
//! | version          | 2 bytes |
//! | level            | 1 byte  | 0 = leaf
//! | flags            | 1 byte  | 0
//! | page_len         | 4 bytes | total bytes including trailer
//! | nr_runs          | 2 bytes |
//! | reserved         | 2 bytes |
//! | node_id          | 8 bytes |
//! | journal_seq      | 8 bytes | newest journal entry reflected
//! | min_key          | 20 bytes| inclusive
//! | max_key          | 20 bytes| inclusive
//! +------------------+---------+
//! | run header × nr_runs, each followed by its packed entries:
//! |   seq u64 | nr_entries u32 | data_len u32 | crc32c u32
//! +------------------+---------+
//! | page crc32c      | 4 bytes | over everything above
//! +------------------+---------+
//! ```
//!
//! Pages embed their own key range, level, and id so a device scan can
//! rebuild the tree without any pointer. Interior pages carry one run whose
//! entries map each child's max key to a `Value::Node` pointer.

use crate::bset::Bset;
use crate::key::{KEY_LEN, Key};
use crate::node_corrupt;
use crate::value::Value;
use sfs_error::{Result, SfsError};
use sfs_types::{
    ByteReader, JournalSeq, NODE_MAGIC, NODE_VERSION, NodeId, ParseError, RunSeq, read_le_u16,
    read_le_u32, read_le_u64,
};

pub const NODE_HEADER_LEN: usize = 32 + 2 * KEY_LEN;
pub const RUN_HEADER_LEN: usize = 20;
pub const NODE_TRAILER_LEN: usize = 4;

/// Inclusive key range owned by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRange {
    pub min: Key,
    pub max: Key,
}

impl NodeRange {
    pub const FULL: Self = Self {
        min: Key::MIN,
        max: Key::MAX,
    };

    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.min <= *key && *key <= self.max
    }
}

/// Decoded node page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePage {
    pub id: NodeId,
    pub level: u8,
    pub journal_seq: JournalSeq,
    pub range: NodeRange,
    /// Oldest first; sequence numbers strictly increasing.
    pub runs: Vec<Bset>,
}

/// Bytes a page holding `runs` occupies.
#[must_use]
pub fn page_len_for<'a>(runs: impl IntoIterator<Item = &'a Bset>) -> usize {
    NODE_HEADER_LEN
        + runs
            .into_iter()
            .map(|r| RUN_HEADER_LEN + r.encoded_len())
            .sum::<usize>()
        + NODE_TRAILER_LEN
}

impl NodePage {
    /// Serialize a page from borrowed runs.
    pub fn encode_parts(
        id: NodeId,
        level: u8,
        journal_seq: JournalSeq,
        range: NodeRange,
        runs: &[&Bset],
    ) -> Result<Vec<u8>> {
        if runs.windows(2).any(|w| w[0].seq() >= w[1].seq()) {
            return Err(SfsError::NodeCorrupt {
                node: id.0,
                detail: "run sequence numbers must be strictly increasing".to_owned(),
            });
        }
        let total = page_len_for(runs.iter().copied());
        let page_len = u32::try_from(total).map_err(|_| SfsError::ValueTooLarge {
            len: total,
            max: u32::MAX as usize,
        })?;
        let nr_runs = u16::try_from(runs.len()).map_err(|_| SfsError::NodeCorrupt {
            node: id.0,
            detail: format!("too many runs: {}", runs.len()),
        })?;

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&NODE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&NODE_VERSION.to_le_bytes());
        buf.push(level);
        buf.push(0);
        buf.extend_from_slice(&page_len.to_le_bytes());
        buf.extend_from_slice(&nr_runs.to_le_bytes());
        buf.extend_from_slice(&0_u16.to_le_bytes());
        buf.extend_from_slice(&id.0.to_le_bytes());
        buf.extend_from_slice(&journal_seq.0.to_le_bytes());
        buf.extend_from_slice(&range.min.to_bytes());
        buf.extend_from_slice(&range.max.to_bytes());
        for run in runs {
            let nr = u32::try_from(run.len()).map_err(|_| SfsError::ValueTooLarge {
                len: run.len(),
                max: u32::MAX as usize,
            })?;
            let data_len =
                u32::try_from(run.encoded_len()).map_err(|_| SfsError::ValueTooLarge {
                    len: run.encoded_len(),
                    max: u32::MAX as usize,
                })?;
            buf.extend_from_slice(&run.seq().0.to_le_bytes());
            buf.extend_from_slice(&nr.to_le_bytes());
            buf.extend_from_slice(&data_len.to_le_bytes());
            buf.extend_from_slice(&run.crc().to_le_bytes());
            buf.extend_from_slice(run.data());
        }
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let runs: Vec<&Bset> = self.runs.iter().collect();
        Self::encode_parts(self.id, self.level, self.journal_seq, self.range, &runs)
    }

    /// Header-only length check used by device scans: returns the declared page
    /// length when `bytes` starts with a plausible page header.
    #[must_use]
    pub fn declared_len(bytes: &[u8]) -> Option<usize> {
        let magic = read_le_u32(bytes, 0).ok()?;
        let version = read_le_u16(bytes, 4).ok()?;
        if magic != NODE_MAGIC || version != NODE_VERSION {
            return None;
        }
        let len = usize::try_from(read_le_u32(bytes, 8).ok()?).ok()?;
        (len >= NODE_HEADER_LEN + NODE_TRAILER_LEN).then_some(len)
    }

    /// Parse and fully validate a page.
    ///
    /// `expected` is the node id the caller's pointer names; a page for a
    /// different node is corruption even if its checksum is fine.
    pub fn decode(bytes: &[u8], expected: Option<NodeId>) -> Result<Self> {
        let hint = expected.map_or(0, |id| id.0);
        let page_len = Self::declared_len(bytes).ok_or_else(|| SfsError::NodeCorrupt {
            node: hint,
            detail: "bad page magic or version".to_owned(),
        })?;
        if page_len > bytes.len() {
            return Err(SfsError::NodeCorrupt {
                node: hint,
                detail: format!("page_len {page_len} exceeds {} bytes read", bytes.len()),
            });
        }
        let page = &bytes[..page_len];
        let body = &page[..page_len - NODE_TRAILER_LEN];
        let stored = read_le_u32(page, page_len - NODE_TRAILER_LEN)
            .map_err(|e| node_corrupt(hint, &e))?;
        let computed = crc32c::crc32c(body);
        if stored != computed {
            return Err(node_corrupt(
                hint,
                &ParseError::ChecksumMismatch {
                    what: "node page",
                    stored: u64::from(stored),
                    computed: u64::from(computed),
                },
            ));
        }

        let id = NodeId(read_le_u64(body, 16).map_err(|e| node_corrupt(hint, &e))?);
        if let Some(expected) = expected {
            if expected != id {
                return Err(SfsError::NodeCorrupt {
                    node: expected.0,
                    detail: format!("page belongs to {id}"),
                });
            }
        }
        Self::decode_body(body, id).map_err(|err| match err {
            SfsError::CorruptKey(detail) => SfsError::NodeCorrupt { node: id.0, detail },
            other => other,
        })
    }

    fn decode_body(body: &[u8], id: NodeId) -> Result<Self> {
        let mut r = ByteReader::new(body);
        let corrupt = |e: ParseError| node_corrupt(id.0, &e);
        let _magic = r.u32().map_err(corrupt)?;
        let _version = r.u16().map_err(corrupt)?;
        let level = r.u8().map_err(corrupt)?;
        let _flags = r.u8().map_err(corrupt)?;
        let _page_len = r.u32().map_err(corrupt)?;
        let nr_runs = r.u16().map_err(corrupt)?;
        let _reserved = r.u16().map_err(corrupt)?;
        let _id = r.u64().map_err(corrupt)?;
        let journal_seq = JournalSeq(r.u64().map_err(corrupt)?);
        let min = Key::from_bytes(r.bytes(KEY_LEN).map_err(corrupt)?).map_err(corrupt)?;
        let max = Key::from_bytes(r.bytes(KEY_LEN).map_err(corrupt)?).map_err(corrupt)?;
        let range = NodeRange { min, max };
        if min > max {
            return Err(SfsError::NodeCorrupt {
                node: id.0,
                detail: format!("inverted key range {min}..={max}"),
            });
        }

        let mut runs: Vec<Bset> = Vec::with_capacity(usize::from(nr_runs).min(64));
        for _ in 0..nr_runs {
            let seq = RunSeq(r.u64().map_err(corrupt)?);
            let nr = r.u32().map_err(corrupt)?;
            let data_len = usize::try_from(r.u32().map_err(corrupt)?).map_err(|_| {
                corrupt(ParseError::IntegerConversion { field: "data_len" })
            })?;
            let crc = r.u32().map_err(corrupt)?;
            let data = r.bytes(data_len).map_err(corrupt)?;
            if let Some(prev) = runs.last() {
                if prev.seq() >= seq {
                    return Err(SfsError::NodeCorrupt {
                        node: id.0,
                        detail: format!(
                            "run sequence {} does not follow {}",
                            seq.0,
                            prev.seq().0
                        ),
                    });
                }
            }
            runs.push(Bset::decode(seq, data, nr, crc)?);
        }
        if r.remaining() != 0 {
            return Err(SfsError::NodeCorrupt {
                node: id.0,
                detail: format!("{} trailing bytes after runs", r.remaining()),
            });
        }

        for run in &runs {
            for (k, v) in run.entries() {
                if !range.contains(k) {
                    return Err(SfsError::NodeCorrupt {
                        node: id.0,
                        detail: format!("key {k} outside node range {min}..={max}"),
                    });
                }
                let is_ptr = matches!(v, Value::Node(_));
                if is_ptr != (level > 0) {
                    return Err(SfsError::NodeCorrupt {
                        node: id.0,
                        detail: format!("value type does not match level {level} at key {k}"),
                    });
                }
            }
        }

        Ok(Self {
            id,
            level,
            journal_seq,
            range,
            runs,
        })
    }
}
