#![forbid(unsafe_code)]
//! Error types for StrataFS.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `sfs-types` | Byte-level format violations |
//! | Runtime | `SfsError` | `sfs-error` (this crate) | Everything surfaced to engine callers |
//!
//! `sfs-error` does not depend on `sfs-types`. Parse failures are converted
//! at the `sfs-ondisk` boundary, which knows whether the bytes were a key
//! entry (`CorruptKey`) or a node page (`NodeCorrupt`).
//!
//! ## Recovery classes
//!
//! | Variant | Retried locally? | Surfaced as |
//! |---------|------------------|-------------|
//! | `CorruptKey`, `NodeCorrupt`, `StaleGeneration` | against the next replica | `Unreadable` once every replica failed |
//! | `DeviceIo { transient: true }` | with backoff | `DeviceIo` after the retry budget |
//! | `DeviceIo { transient: false }` | no, device marked failed | next replica |
//! | `DegradedReplication` | no | health condition, write still succeeds |
//! | `JournalFull` | caller waits for a checkpoint | never returned by `commit` |
//! | `JournalCorrupt` | no | fatal at mount |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`SfsError::to_errno`].
//! The match is exhaustive so a new variant cannot ship without one.

use thiserror::Error;

/// Unified error type for all StrataFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A member device failed a read, write, or sync.
    #[error("device {device} I/O error (transient={transient}): {detail}")]
    DeviceIo {
        device: u32,
        transient: bool,
        detail: String,
    },

    /// A packed key/value entry violated its length or tag invariants.
    #[error("corrupt key entry: {0}")]
    CorruptKey(String),

    /// A node page failed its checksum or structural validation.
    #[error("corrupt node {node}: {detail}")]
    NodeCorrupt { node: u64, detail: String },

    /// Every replica of a node or extent failed; the key range is unreadable.
    #[error("unreadable {what}: {detail}")]
    Unreadable { what: String, detail: String },

    /// A replica pointer's generation no longer matches its bucket.
    #[error("stale pointer on device {device} bucket {bucket}: pointer gen {expected}, bucket gen {found}")]
    StaleGeneration {
        device: u32,
        bucket: u64,
        expected: u32,
        found: u32,
    },

    /// Fewer replicas than requested could be placed.
    #[error("degraded replication: wanted {wanted} replicas, placed {got}")]
    DegradedReplication { wanted: u8, got: u8 },

    /// No journal bucket is free until the next checkpoint.
    #[error("journal full")]
    JournalFull,

    /// Journal contents cannot be replayed completely.
    #[error("journal corrupt: {0}")]
    JournalCorrupt(String),

    /// The compression collaborator rejected stored bytes.
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// Invalid on-disk format (bad magic, unsupported version).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error that has no better classification.
    #[error("parse error: {0}")]
    Parse(String),

    /// Device geometry or engine options are out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No bucket on any online device can satisfy the allocation.
    #[error("no space left on device")]
    NoSpace,

    /// Operation cancelled through its `Cx`.
    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    /// The engine switched to read-only after a fatal write failure.
    #[error("read-only filesystem")]
    ReadOnly,

    /// An inline value or extent exceeds what one node or bucket can hold.
    #[error("value too large: {len} bytes (max {max})")]
    ValueTooLarge { len: usize, max: usize },

    /// A six-state lock transition outside read → intent → write.
    #[error("illegal lock transition: {from} -> {to}")]
    IllegalLockTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl SfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// - `DegradedReplication` → `EIO` only when a caller chose to treat it as
    ///   an error; normally it is reported through health, not returned.
    /// - `JournalFull` → `EAGAIN`: the caller may retry after a checkpoint.
    /// - `IllegalLockTransition` → `EDEADLK`: always a programming error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::DeviceIo { .. }
            | Self::CorruptKey(_)
            | Self::NodeCorrupt { .. }
            | Self::Unreadable { .. }
            | Self::StaleGeneration { .. }
            | Self::DegradedReplication { .. }
            | Self::JournalCorrupt(_)
            | Self::DecompressFailed(_) => libc::EIO,
            Self::JournalFull => libc::EAGAIN,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::Cancelled => libc::EINTR,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
            Self::ValueTooLarge { .. } => libc::EFBIG,
            Self::IllegalLockTransition { .. } => libc::EDEADLK,
        }
    }

    /// Whether a retry of the same operation can succeed without repair.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DeviceIo {
                transient: true,
                ..
            } | Self::JournalFull
        )
    }

    /// Whether the error means the bytes read were bad (another replica may
    /// still be good).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptKey(_)
                | Self::NodeCorrupt { .. }
                | Self::StaleGeneration { .. }
                | Self::DecompressFailed(_)
        )
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(SfsError, libc::c_int)> = vec![
            (SfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                SfsError::DeviceIo {
                    device: 1,
                    transient: true,
                    detail: "timeout".into(),
                },
                libc::EIO,
            ),
            (SfsError::CorruptKey("tag 0".into()), libc::EIO),
            (
                SfsError::NodeCorrupt {
                    node: 3,
                    detail: "crc".into(),
                },
                libc::EIO,
            ),
            (
                SfsError::Unreadable {
                    what: "node 3".into(),
                    detail: "all replicas failed".into(),
                },
                libc::EIO,
            ),
            (
                SfsError::StaleGeneration {
                    device: 0,
                    bucket: 9,
                    expected: 1,
                    found: 2,
                },
                libc::EIO,
            ),
            (
                SfsError::DegradedReplication { wanted: 3, got: 2 },
                libc::EIO,
            ),
            (SfsError::JournalFull, libc::EAGAIN),
            (SfsError::JournalCorrupt("gap".into()), libc::EIO),
            (SfsError::DecompressFailed("short".into()), libc::EIO),
            (SfsError::Format("bad magic".into()), libc::EINVAL),
            (SfsError::Parse("short".into()), libc::EINVAL),
            (SfsError::InvalidGeometry("bucket_size=3".into()), libc::EINVAL),
            (SfsError::NoSpace, libc::ENOSPC),
            (SfsError::Cancelled, libc::EINTR),
            (SfsError::NotFound("key".into()), libc::ENOENT),
            (SfsError::ReadOnly, libc::EROFS),
            (SfsError::ValueTooLarge { len: 10, max: 5 }, libc::EFBIG),
            (
                SfsError::IllegalLockTransition {
                    from: "read",
                    to: "write",
                },
                libc::EDEADLK,
            ),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(SfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = SfsError::DeviceIo {
            device: 2,
            transient: false,
            detail: "offline".into(),
        };
        assert_eq!(err.to_string(), "device 2 I/O error (transient=false): offline");

        let err = SfsError::DegradedReplication { wanted: 3, got: 2 };
        assert_eq!(
            err.to_string(),
            "degraded replication: wanted 3 replicas, placed 2"
        );

        let err = SfsError::StaleGeneration {
            device: 1,
            bucket: 7,
            expected: 4,
            found: 5,
        };
        assert!(err.to_string().contains("bucket 7"));
    }

    #[test]
    fn classification_helpers() {
        assert!(
            SfsError::DeviceIo {
                device: 0,
                transient: true,
                detail: String::new()
            }
            .is_transient()
        );
        assert!(
            !SfsError::DeviceIo {
                device: 0,
                transient: false,
                detail: String::new()
            }
            .is_transient()
        );
        assert!(SfsError::CorruptKey(String::new()).is_corruption());
        assert!(!SfsError::NoSpace.is_corruption());
    }
}
