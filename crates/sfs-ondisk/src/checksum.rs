//! Checksum collaborator contract.
//!
//! The engine only needs `checksum(bytes) -> digest` and
//! `verify(bytes, digest)`. Digests are stored as 64-bit values tagged with
//! the algorithm that produced them, so one filesystem can change its
//! configured algorithm without rewriting old data.

use serde::{Deserialize, Serialize};
use sfs_types::{ByteReader, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    None,
    #[default]
    Crc32c,
    /// BLAKE3 truncated to its first 8 bytes.
    Blake3,
}

impl ChecksumKind {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Crc32c => 1,
            Self::Blake3 => 2,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Crc32c),
            2 => Ok(Self::Blake3),
            _ => Err(ParseError::InvalidField {
                field: "checksum_kind",
                reason: "unknown checksum algorithm",
            }),
        }
    }

    #[must_use]
    pub fn compute(self, bytes: &[u8]) -> Checksum {
        let value = match self {
            Self::None => 0,
            Self::Crc32c => u64::from(crc32c::crc32c(bytes)),
            Self::Blake3 => {
                let hash = blake3::hash(bytes);
                let mut first = [0_u8; 8];
                first.copy_from_slice(&hash.as_bytes()[..8]);
                u64::from_le_bytes(first)
            }
        };
        Checksum { kind: self, value }
    }
}

/// Algorithm-tagged digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum {
    pub kind: ChecksumKind,
    pub value: u64,
}

impl Default for Checksum {
    fn default() -> Self {
        Self::NONE
    }
}

impl Checksum {
    pub const ENCODED_LEN: usize = 9;

    pub const NONE: Self = Self {
        kind: ChecksumKind::None,
        value: 0,
    };

    /// Recompute over `bytes` with the same algorithm and compare.
    #[must_use]
    pub fn verify(&self, bytes: &[u8]) -> bool {
        self.kind.compute(bytes).value == self.value
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind.to_raw());
        out.extend_from_slice(&self.value.to_le_bytes());
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, ParseError> {
        let kind = ChecksumKind::from_raw(r.u8()?)?;
        let value = r.u64()?;
        Ok(Self { kind, value })
    }
}

/// Checksum collaborator.
///
/// [`ChecksumKind`] is the built-in implementation; a deployment can plug
/// in hardware offload by implementing this trait.
pub trait Checksummer: Send + Sync {
    fn checksum(&self, bytes: &[u8]) -> Checksum;

    fn verify(&self, bytes: &[u8], digest: &Checksum) -> bool {
        digest.verify(bytes)
    }
}

impl Checksummer for ChecksumKind {
    fn checksum(&self, bytes: &[u8]) -> Checksum {
        self.compute(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_matches_reference() {
        let sum = ChecksumKind::Crc32c.compute(b"123456789");
        assert_eq!(sum.value, 0xE306_9283);
        assert!(sum.verify(b"123456789"));
        assert!(!sum.verify(b"123456780"));
    }

    #[test]
    fn blake3_detects_single_bit_flip() {
        let mut data = vec![0x5A_u8; 256];
        let sum = ChecksumKind::Blake3.compute(&data);
        data[100] ^= 1;
        assert!(!ChecksumKind::Blake3.verify(&data, &sum));
    }

    #[test]
    fn none_always_verifies() {
        let sum = ChecksumKind::None.compute(b"anything");
        assert!(sum.verify(b"something else"));
    }

    #[test]
    fn raw_kind_round_trips() {
        for kind in [ChecksumKind::None, ChecksumKind::Crc32c, ChecksumKind::Blake3] {
            assert_eq!(ChecksumKind::from_raw(kind.to_raw()).expect("raw"), kind);
        }
        assert!(ChecksumKind::from_raw(9).is_err());
    }

    #[test]
    fn encoded_digest_round_trips() {
        let sum = ChecksumKind::Blake3.compute(b"payload");
        let mut buf = Vec::new();
        sum.encode(&mut buf);
        assert_eq!(buf.len(), Checksum::ENCODED_LEN);
        let decoded = Checksum::decode(&mut ByteReader::new(&buf)).expect("decode");
        assert_eq!(decoded, sum);
    }
}
