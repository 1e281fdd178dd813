//! Journal record format.
//!
//! ```text
//! Record:
//! +------------------+--------+
//! | record_len       | 4 bytes| length of record (excluding this field)
//! | magic            | 4 bytes| = JOURNAL_MAGIC
//! | nonce            | 8 bytes| per-filesystem, from the superblock uuid
//! | record_type      | 1 byte | = 1 (commit)
//! | seq              | 8 bytes| JournalSeq
//! | nr_mutations     | 4 bytes|
//! | nr_touched       | 4 bytes|
//! +------------------+--------+
//! | mutations        | packed key/value entries (see sfs_ondisk::key)
//! | touched          | nr_touched x u64 node ids
//! +------------------+--------+
//! | record_crc       | 4 bytes| CRC32C of everything after record_len
//! +------------------+--------+
//! ```
//!
//! Records never span journal buckets. A zero `record_len` or a record from
//! another filesystem (nonce mismatch) ends the bucket's data.

use sfs_error::{Result, SfsError};
use sfs_ondisk::{Key, Value, decode_entry, encode_entry};
use sfs_types::{JOURNAL_MAGIC, JournalSeq, NodeId, read_le_u32, read_le_u64};

pub const RECORD_TYPE_COMMIT: u8 = 1;

/// Fixed bytes of every record: len, magic, nonce, type, seq, two counts, crc.
pub const RECORD_OVERHEAD: usize = 4 + 4 + 8 + 1 + 8 + 4 + 4 + 4;

/// One committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub seq: JournalSeq,
    /// Mutations in commit order; a whiteout value is a delete.
    pub mutations: Vec<(Key, Value)>,
    /// Leaves the mutations were applied to when committed.
    pub touched: Vec<NodeId>,
}

pub fn encode_record(nonce: u64, record: &JournalRecord) -> Result<Vec<u8>> {
    encode_parts(nonce, record.seq, &record.mutations, &record.touched)
}

/// Encode a record without first assembling a [`JournalRecord`].
pub fn encode_parts(
    nonce: u64,
    seq: JournalSeq,
    mutations: &[(Key, Value)],
    touched: &[NodeId],
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + mutations.len() * 32);
    buf.extend_from_slice(&[0_u8; 4]);
    buf.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf.push(RECORD_TYPE_COMMIT);
    buf.extend_from_slice(&seq.0.to_le_bytes());
    let nr_mutations = u32::try_from(mutations.len())
        .map_err(|_| SfsError::Format("too many mutations in journal record".to_owned()))?;
    let nr_touched = u32::try_from(touched.len())
        .map_err(|_| SfsError::Format("too many touched nodes in journal record".to_owned()))?;
    buf.extend_from_slice(&nr_mutations.to_le_bytes());
    buf.extend_from_slice(&nr_touched.to_le_bytes());
    for (key, value) in mutations {
        encode_entry(key, value, &mut buf)?;
    }
    for node in touched {
        buf.extend_from_slice(&node.0.to_le_bytes());
    }
    let record_len = u32::try_from(buf.len())
        .map_err(|_| SfsError::Format("journal record length exceeds u32".to_owned()))?;
    buf[0..4].copy_from_slice(&record_len.to_le_bytes());
    let crc = crc32c::crc32c(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

#[derive(Debug)]
pub enum DecodeResult {
    /// A complete record and the bytes it occupied.
    Record(JournalRecord, usize),
    /// The record claims more bytes than are available (torn tail).
    NeedMore(usize),
    /// CRC mismatch or malformed body.
    Corrupted(String),
    /// Zero fill or another filesystem's leftovers.
    EndOfData,
}

#[must_use]
pub fn decode_record(nonce: u64, bytes: &[u8]) -> DecodeResult {
    if bytes.len() < 4 {
        return DecodeResult::EndOfData;
    }
    let record_len = match read_le_u32(bytes, 0) {
        Ok(0) => return DecodeResult::EndOfData,
        Ok(len) => len as usize,
        Err(e) => return DecodeResult::Corrupted(format!("record length: {e}")),
    };
    if record_len < RECORD_OVERHEAD - 4 {
        return DecodeResult::Corrupted(format!(
            "record length too small: {record_len} < {}",
            RECORD_OVERHEAD - 4
        ));
    }
    let total = 4 + record_len;
    if bytes.len() < total {
        return DecodeResult::NeedMore(total);
    }

    match read_le_u32(bytes, 4) {
        Ok(JOURNAL_MAGIC) => {}
        Ok(magic) => return DecodeResult::Corrupted(format!("bad record magic {magic:#010x}")),
        Err(e) => return DecodeResult::Corrupted(format!("record magic: {e}")),
    }
    if read_le_u64(bytes, 8).ok() != Some(nonce) {
        return DecodeResult::EndOfData;
    }

    let body = &bytes[4..total - 4];
    let stored_crc = match read_le_u32(bytes, total - 4) {
        Ok(crc) => crc,
        Err(e) => return DecodeResult::Corrupted(format!("record crc: {e}")),
    };
    let computed_crc = crc32c::crc32c(body);
    if stored_crc != computed_crc {
        return DecodeResult::Corrupted(format!(
            "CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        ));
    }

    match decode_body(&bytes[..total - 4]) {
        Ok(record) => DecodeResult::Record(record, total),
        Err(e) => DecodeResult::Corrupted(e.to_string()),
    }
}

fn decode_body(bytes: &[u8]) -> Result<JournalRecord> {
    let corrupt = |what: &str| SfsError::JournalCorrupt(format!("record body: {what}"));
    if bytes[16] != RECORD_TYPE_COMMIT {
        return Err(corrupt("unknown record type"));
    }
    let seq = JournalSeq(read_le_u64(bytes, 17).map_err(|_| corrupt("seq"))?);
    let nr_mutations = read_le_u32(bytes, 25).map_err(|_| corrupt("nr_mutations"))? as usize;
    let nr_touched = read_le_u32(bytes, 29).map_err(|_| corrupt("nr_touched"))? as usize;

    let mut offset = 33;
    let mut mutations = Vec::with_capacity(nr_mutations.min(bytes.len() / 24));
    for _ in 0..nr_mutations {
        let (entry, used) = decode_entry(&bytes[offset.min(bytes.len())..])?;
        mutations.push(entry);
        offset += used;
    }
    let touched_bytes = nr_touched
        .checked_mul(8)
        .ok_or_else(|| corrupt("nr_touched overflow"))?;
    if bytes.len() != offset + touched_bytes {
        return Err(corrupt("length does not match counts"));
    }
    let touched = (0..nr_touched)
        .map(|i| read_le_u64(bytes, offset + i * 8).map(NodeId))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| corrupt("touched"))?;
    Ok(JournalRecord {
        seq,
        mutations,
        touched,
    })
}
