#![forbid(unsafe_code)]
//! StrataFS engine.
//!
//! Ties the lower layers into a mounted filesystem:
//!
//! ```text
//!            Engine (lookup / range_scan / commit / extents)
//!                 │                         │
//!        ┌────────┴───────┐          ┌──────┴───────┐
//!        │  sfs-btree     │          │  sfs-journal │  group-committed
//!        │  COW tree      │          │  record ring │  write-ahead log
//!        └────────┬───────┘          └──────┬───────┘
//!                 │ NodeIo (writeback)      │
//!        ┌────────┴───────┐                 │
//!        │  sfs-alloc     │ buckets, gens,  │
//!        │  placement     │ delayed free    │
//!        └────────┬───────┘                 │
//!                 └──────────┬──────────────┘
//!                    sfs-block DeviceSet (retry, health, ARC cache)
//! ```
//!
//! Durability: a commit is acknowledged once its journal record is on
//! disk. Checkpoints later write the dirty tree copy-on-write and publish a
//! superblock naming the new root, after which the journal prefix it
//! covers is reclaimed. Mount loads the checkpointed tree and replays the
//! rest of the journal.
//!
//! Background work (group flush, periodic checkpoint, copygc) runs on one
//! maintenance thread when `background_tasks` is set; every duty can also
//! be run directly.

mod checkpoint;
mod copygc;
mod engine;
mod extent;
mod health;
mod io;
mod layout;
mod options;
mod recover;
mod txn;
mod worker;

pub use checkpoint::{CheckpointReport, CheckpointState};
pub use copygc::CopygcReport;
pub use engine::{Engine, MaintenanceTask};
pub use health::HealthReport;
pub use options::{Collaborators, EngineOptions};
pub use recover::{RecoveredTree, ScanStats, scan_recover};
pub use txn::{CommitInfo, CommitOutcome, Transaction};
