//! Keys and the packed entry format.
//!
//! ```text
//! Entry:
//! +------------------+---------+
//! | tag              | 1 byte  | value type, 0 is invalid
//! | flags            | 1 byte  | must be 0
//! | payload_len      | 2 bytes | little-endian
//! | key              | 20 bytes| inode BE | offset BE | snapshot BE
//! | payload          | N bytes |
//! +------------------+---------+
//! ```
//!
//! The key is stored big-endian so a plain byte comparison of bytes
//! `4..24` orders entries exactly like [`Key`]'s `Ord`. Runs are binary
//! searched and validated with [`compare_encoded`] without decoding.

use crate::corrupt_key;
use crate::value::Value;
use sfs_error::{Result, SfsError};
use sfs_types::{ParseError, ensure_slice, read_le_u16, read_u8};
use std::cmp::Ordering;
use std::fmt;

/// Encoded key width in bytes.
pub const KEY_LEN: usize = 20;
/// Bytes preceding the key in an entry.
pub const ENTRY_HEADER_LEN: usize = 4;
/// Largest payload one entry can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Tree key: (inode/namespace, offset/field, snapshot).
///
/// Field order is the sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
}

impl Key {
    pub const MIN: Self = Self {
        inode: 0,
        offset: 0,
        snapshot: 0,
    };
    pub const MAX: Self = Self {
        inode: u64::MAX,
        offset: u64::MAX,
        snapshot: u32::MAX,
    };

    #[must_use]
    pub const fn new(inode: u64, offset: u64, snapshot: u32) -> Self {
        Self {
            inode,
            offset,
            snapshot,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        let mut out = [0_u8; KEY_LEN];
        out[0..8].copy_from_slice(&self.inode.to_be_bytes());
        out[8..16].copy_from_slice(&self.offset.to_be_bytes());
        out[16..20].copy_from_slice(&self.snapshot.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let b = ensure_slice(bytes, 0, KEY_LEN)?;
        let mut inode = [0_u8; 8];
        let mut offset = [0_u8; 8];
        let mut snapshot = [0_u8; 4];
        inode.copy_from_slice(&b[0..8]);
        offset.copy_from_slice(&b[8..16]);
        snapshot.copy_from_slice(&b[16..20]);
        Ok(Self {
            inode: u64::from_be_bytes(inode),
            offset: u64::from_be_bytes(offset),
            snapshot: u32::from_be_bytes(snapshot),
        })
    }

    /// Smallest key strictly greater than `self`, if any.
    #[must_use]
    pub fn successor(&self) -> Option<Self> {
        if let Some(snapshot) = self.snapshot.checked_add(1) {
            return Some(Self { snapshot, ..*self });
        }
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self {
                inode: self.inode,
                offset,
                snapshot: 0,
            });
        }
        self.inode.checked_add(1).map(|inode| Self {
            inode,
            offset: 0,
            snapshot: 0,
        })
    }

    /// Largest key strictly smaller than `self`, if any.
    #[must_use]
    pub fn predecessor(&self) -> Option<Self> {
        if let Some(snapshot) = self.snapshot.checked_sub(1) {
            return Some(Self { snapshot, ..*self });
        }
        if let Some(offset) = self.offset.checked_sub(1) {
            return Some(Self {
                inode: self.inode,
                offset,
                snapshot: u32::MAX,
            });
        }
        self.inode.checked_sub(1).map(|inode| Self {
            inode,
            offset: u64::MAX,
            snapshot: u32::MAX,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inode, self.offset, self.snapshot)
    }
}

/// Total encoded length of an entry carrying `payload_len` bytes.
#[must_use]
pub fn entry_len(payload_len: usize) -> usize {
    ENTRY_HEADER_LEN + KEY_LEN + payload_len
}

/// Append one packed entry to `out`.
pub fn encode_entry(key: &Key, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    let payload_len = value.payload_len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(SfsError::ValueTooLarge {
            len: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    let len16 = u16::try_from(payload_len).map_err(|_| SfsError::ValueTooLarge {
        len: payload_len,
        max: MAX_PAYLOAD_LEN,
    })?;
    out.reserve(entry_len(payload_len));
    out.push(value.tag());
    out.push(0);
    out.extend_from_slice(&len16.to_le_bytes());
    out.extend_from_slice(&key.to_bytes());
    value.encode_payload(out);
    Ok(())
}

/// Decode one entry from the front of `bytes`.
///
/// Returns the pair and the number of bytes consumed. Trailing bytes are
/// left for the caller; a short or malformed entry is `CorruptKey`.
pub fn decode_entry(bytes: &[u8]) -> Result<((Key, Value), usize)> {
    let tag = read_u8(bytes, 0).map_err(|e| corrupt_key(&e))?;
    let flags = read_u8(bytes, 1).map_err(|e| corrupt_key(&e))?;
    if flags != 0 {
        return Err(SfsError::CorruptKey(format!(
            "entry flags must be zero, got {flags:#x}"
        )));
    }
    let payload_len = usize::from(read_le_u16(bytes, 2).map_err(|e| corrupt_key(&e))?);
    let key = Key::from_bytes(&bytes[ENTRY_HEADER_LEN.min(bytes.len())..])
        .map_err(|e| corrupt_key(&e))?;
    let start = ENTRY_HEADER_LEN + KEY_LEN;
    let payload = ensure_slice(bytes, start, payload_len).map_err(|e| corrupt_key(&e))?;
    let value = Value::decode_payload(tag, payload)?;
    Ok(((key, value), start + payload_len))
}

/// Order two packed entries by key without decoding them.
///
/// Entries shorter than a full header compare by whatever key bytes they
/// carry; callers validate lengths separately.
#[must_use]
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    let end = ENTRY_HEADER_LEN + KEY_LEN;
    let ka = &a[ENTRY_HEADER_LEN.min(a.len())..end.min(a.len())];
    let kb = &b[ENTRY_HEADER_LEN.min(b.len())..end.min(b.len())];
    ka.cmp(kb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key_strategy() -> impl Strategy<Value = Key> {
        (any::<u64>(), any::<u64>(), any::<u32>()).prop_map(|(i, o, s)| Key::new(i, o, s))
    }

    #[test]
    fn successor_and_predecessor_carry() {
        let k = Key::new(1, 2, u32::MAX);
        assert_eq!(k.successor(), Some(Key::new(1, 3, 0)));
        assert_eq!(Key::new(1, 3, 0).predecessor(), Some(k));
        assert_eq!(Key::MAX.successor(), None);
        assert_eq!(Key::MIN.predecessor(), None);
        assert_eq!(
            Key::new(5, u64::MAX, u32::MAX).successor(),
            Some(Key::new(6, 0, 0))
        );
    }

    #[test]
    fn whiteout_entry_has_no_payload() {
        let mut buf = Vec::new();
        encode_entry(&Key::new(9, 9, 9), &Value::Whiteout, &mut buf).expect("encode");
        assert_eq!(buf.len(), entry_len(0));
        let ((k, v), used) = decode_entry(&buf).expect("decode");
        assert_eq!(k, Key::new(9, 9, 9));
        assert_eq!(v, Value::Whiteout);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn decode_rejects_bad_tag_and_truncation() {
        let mut buf = Vec::new();
        encode_entry(&Key::new(1, 1, 1), &Value::Inline(vec![1, 2, 3]), &mut buf)
            .expect("encode");

        let mut bad_tag = buf.clone();
        bad_tag[0] = 0;
        assert!(matches!(decode_entry(&bad_tag), Err(SfsError::CorruptKey(_))));

        let mut bad_flags = buf.clone();
        bad_flags[1] = 1;
        assert!(matches!(decode_entry(&bad_flags), Err(SfsError::CorruptKey(_))));

        let truncated = &buf[..buf.len() - 1];
        assert!(matches!(decode_entry(truncated), Err(SfsError::CorruptKey(_))));

        assert!(matches!(decode_entry(&[]), Err(SfsError::CorruptKey(_))));
    }

    #[test]
    fn oversized_inline_value_is_rejected() {
        let mut buf = Vec::new();
        let err = encode_entry(
            &Key::MIN,
            &Value::Inline(vec![0; MAX_PAYLOAD_LEN + 1]),
            &mut buf,
        )
        .expect_err("too large");
        assert!(matches!(err, SfsError::ValueTooLarge { .. }));
    }

    #[test]
    fn entries_pack_contiguously() {
        let mut buf = Vec::new();
        encode_entry(&Key::new(1, 0, 0), &Value::Inline(b"a".to_vec()), &mut buf).expect("a");
        encode_entry(&Key::new(2, 0, 0), &Value::Inline(b"bb".to_vec()), &mut buf).expect("b");
        let ((k1, _), n1) = decode_entry(&buf).expect("first");
        let ((k2, v2), n2) = decode_entry(&buf[n1..]).expect("second");
        assert_eq!(k1, Key::new(1, 0, 0));
        assert_eq!(k2, Key::new(2, 0, 0));
        assert_eq!(v2, Value::Inline(b"bb".to_vec()));
        assert_eq!(n1 + n2, buf.len());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn key_bytes_round_trip(k in key_strategy()) {
            prop_assert_eq!(Key::from_bytes(&k.to_bytes()).expect("decode"), k);
        }

        #[test]
        fn fast_comparator_matches_key_order(
            a in key_strategy(),
            b in key_strategy(),
            pa in proptest::collection::vec(any::<u8>(), 0..16),
            pb in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let mut ea = Vec::new();
            let mut eb = Vec::new();
            encode_entry(&a, &Value::Inline(pa), &mut ea).expect("a");
            encode_entry(&b, &Value::Inline(pb), &mut eb).expect("b");
            prop_assert_eq!(compare_encoded(&ea, &eb), a.cmp(&b));
        }

        #[test]
        fn successor_is_strictly_next(k in key_strategy()) {
            if let Some(next) = k.successor() {
                prop_assert!(next > k);
                prop_assert_eq!(next.predecessor(), Some(k));
            }
        }
    }
}
