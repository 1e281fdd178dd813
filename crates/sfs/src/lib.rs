#![forbid(unsafe_code)]
//! StrataFS public API facade.
//!
//! Re-exports the engine from `sfs-core` together with the key, value,
//! device, and error types a caller needs, so downstream crates depend on
//! this crate alone.
//!
//! ```
//! use std::sync::Arc;
//! use sfs::{ByteDevice, Collaborators, Cx, Engine, EngineOptions, Key, MemoryByteDevice, Value};
//!
//! let cx = Cx::for_testing();
//! let dev: Arc<dyn ByteDevice> = Arc::new(MemoryByteDevice::new(2 << 20));
//! let engine = Engine::create(
//!     &cx,
//!     vec![dev],
//!     EngineOptions::small_for_tests(),
//!     Collaborators::default(),
//! )?;
//! engine.upsert(&cx, Key::new(1, 0, 0), Value::Inline(b"hello".to_vec()))?;
//! assert_eq!(
//!     engine.lookup(&Key::new(1, 0, 0))?,
//!     Some(Value::Inline(b"hello".to_vec()))
//! );
//! engine.shutdown(&cx)?;
//! # Ok::<(), sfs::SfsError>(())
//! ```

pub use sfs_core::*;

pub use sfs_alloc::{BucketState, DeviceUsage};
pub use sfs_block::{
    ByteDevice, DeviceHealth, DeviceStats, FileByteDevice, MemoryByteDevice, ParityCodec,
    XorParity,
};
pub use sfs_btree::{RangeIter, TreeShape, TreeStats};
pub use sfs_error::{Result, SfsError};
pub use sfs_journal::JournalStats;
pub use sfs_ondisk::{
    ChecksumKind, Compression, Compressor, ExtentLayout, ExtentValue, Key, NoCompression,
    ReplicaPtr, Value,
};
pub use sfs_types::{Cx, DeviceId, JournalSeq, NodeId};
