#![forbid(unsafe_code)]
//! On-disk formats for StrataFS.
//!
//! - [`key`]: fixed-width, order-preserving key encoding and the packed
//!   entry format shared by every run.
//! - [`value`]: typed values, replica pointers, node pointers, extents.
//! - [`bset`]: immutable sorted runs and the newest-wins merge.
//! - [`node`]: self-describing, self-checksummed node pages.
//! - [`superblock`]: the A/B superblock slots in bucket 0.
//! - [`checksum`] / [`compress`]: collaborator contracts consumed by the
//!   engine.
//!
//! Parsers return `SfsError::CorruptKey` for entry-level damage and
//! `SfsError::NodeCorrupt` for page-level damage; `ParseError` from
//! `sfs-types` never escapes this crate.

pub mod bset;
pub mod checksum;
pub mod compress;
pub mod key;
pub mod node;
pub mod superblock;
pub mod value;

pub use bset::{Bset, merge_runs};
pub use checksum::{Checksum, ChecksumKind, Checksummer};
pub use compress::{Compressor, NoCompression};
pub use key::{KEY_LEN, Key, compare_encoded, decode_entry, encode_entry, entry_len};
pub use node::{NodePage, NodeRange};
pub use superblock::Superblock;
pub use value::{Compression, ExtentLayout, ExtentValue, NodePtr, ReplicaPtr, Value};

use sfs_error::SfsError;
use sfs_types::ParseError;

/// Minimum alignment of every allocation inside a bucket.
///
/// Node pages always start on this boundary so a full-device scan can find
/// them without the tree.
pub const ALLOC_ALIGN: u64 = 512;

pub(crate) fn corrupt_key(err: &ParseError) -> SfsError {
    SfsError::CorruptKey(err.to_string())
}

pub(crate) fn node_corrupt(node: u64, err: &impl std::fmt::Display) -> SfsError {
    SfsError::NodeCorrupt {
        node,
        detail: err.to_string(),
    }
}

/// Round `len` up to [`ALLOC_ALIGN`].
#[must_use]
pub fn align_alloc(len: u64) -> u64 {
    len.div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN
}
