#![forbid(unsafe_code)]
//! Crash-consistency and last-resort recovery.
//!
//! Crashes are simulated with `MemoryByteDevice::crash_after_bytes`: the
//! write that crosses the budget is torn and every later write fails. The
//! surviving image is remounted from a snapshot and compared against what
//! the engine acknowledged before the crash.
//!
//! | scenario                         | expectation                                  |
//! |----------------------------------|----------------------------------------------|
//! | crash anywhere in a commit run   | every acknowledged commit survives           |
//! | crash mid-checkpoint             | previous root plus journal still mount       |
//! | repeated mounts of one image     | replay is idempotent                         |
//! | both superblock slots destroyed  | `scan_recover` rebuilds the checkpointed tree |

use proptest::prelude::*;
use sfs_block::{ByteDevice, MemoryByteDevice};
use sfs_core::{Collaborators, Engine, EngineOptions, scan_recover};
use sfs_ondisk::{Key, Value};
use sfs_types::Cx;
use std::collections::BTreeMap;
use std::sync::Arc;

const DEVICE_LEN: usize = 2 << 20;

fn key(i: u64) -> Key {
    Key::new(i, 0, 0)
}

fn value(i: u64, round: u64) -> Value {
    let mut bytes = vec![(i % 251) as u8; 120];
    bytes[..8].copy_from_slice(&(i ^ (round << 32)).to_le_bytes());
    Value::Inline(bytes)
}

fn opts() -> EngineOptions {
    EngineOptions {
        journal_buckets: 2,
        journal_low_watermark_buckets: 1,
        ..EngineOptions::small_for_tests()
    }
}

fn dyn_dev(dev: &Arc<MemoryByteDevice>) -> Vec<Arc<dyn ByteDevice>> {
    vec![Arc::clone(dev) as Arc<dyn ByteDevice>]
}

fn create(dev: &Arc<MemoryByteDevice>) -> Engine {
    Engine::create(&Cx::for_testing(), dyn_dev(dev), opts(), Collaborators::default())
        .expect("create")
}

fn open(dev: &Arc<MemoryByteDevice>) -> Engine {
    Engine::open(&Cx::for_testing(), dyn_dev(dev), opts(), Collaborators::default())
        .expect("open after crash")
}

fn scan_all(engine: &Engine) -> Vec<(Key, Value)> {
    engine
        .range_scan(Key::MIN, Key::MAX)
        .collect::<Result<Vec<_>, _>>()
        .expect("scan")
}

/// Commit keys `0..n` one per transaction until the device dies. Returns
/// how many were acknowledged.
fn commit_until_crash(engine: &Engine, n: u64) -> u64 {
    let cx = Cx::for_testing();
    for i in 0..n {
        if engine.upsert(&cx, key(i), value(i, 0)).is_err() {
            return i;
        }
    }
    n
}

fn assert_survivors(engine: &Engine, acked: u64, attempted: u64) {
    for i in 0..acked {
        assert_eq!(
            engine.lookup(&key(i)).expect("lookup"),
            Some(value(i, 0)),
            "acknowledged key {i} lost"
        );
    }
    // The commit in flight at the crash may or may not have landed.
    if acked < attempted {
        let in_flight = engine.lookup(&key(acked)).expect("lookup");
        assert!(in_flight.is_none() || in_flight == Some(value(acked, 0)));
    }
    for i in (acked + 1)..attempted {
        assert_eq!(engine.lookup(&key(i)).expect("lookup"), None, "key {i} never committed");
    }
    engine.validate().expect("validate");
}

#[test]
fn acknowledged_commits_survive_a_crash_at_any_budget() {
    const ATTEMPTS: u64 = 400;
    for budget in [300_u64, 2_000, 9_000, 40_000, 90_000, 200_000] {
        let dev = Arc::new(MemoryByteDevice::new(DEVICE_LEN));
        let engine = create(&dev);
        dev.crash_after_bytes(budget);
        let acked = commit_until_crash(&engine, ATTEMPTS);
        drop(engine);

        let image = Arc::new(dev.snapshot());
        let engine = open(&image);
        assert_survivors(&engine, acked, ATTEMPTS);
    }
}

#[test]
fn crash_during_checkpoint_falls_back_to_previous_root() {
    let dev = Arc::new(MemoryByteDevice::new(DEVICE_LEN));
    let engine = create(&dev);
    let cx = Cx::for_testing();
    for i in 0..80 {
        engine.upsert(&cx, key(i), value(i, 0)).expect("upsert");
    }
    engine.checkpoint(&cx).expect("first checkpoint");
    for i in 0..80 {
        engine.upsert(&cx, key(i), value(i, 1)).expect("rewrite");
    }
    let durable = engine.health().last_checkpoint.sb_seq;
    // Enough for part of the node writeback, not the superblock.
    dev.crash_after_bytes(3_000);
    assert!(engine.checkpoint(&cx).is_err());
    drop(engine);

    let engine = open(&Arc::new(dev.snapshot()));
    assert_eq!(engine.health().last_checkpoint.sb_seq, durable);
    for i in 0..80 {
        assert_eq!(engine.lookup(&key(i)).expect("lookup"), Some(value(i, 1)));
    }
    engine.validate().expect("validate");
}

#[test]
fn remounting_the_same_image_replays_identically() {
    let dev = Arc::new(MemoryByteDevice::new(DEVICE_LEN));
    let cx = Cx::for_testing();
    {
        let engine = create(&dev);
        for i in 0..120 {
            engine.upsert(&cx, key(i), value(i, 0)).expect("upsert");
        }
        engine.checkpoint(&cx).expect("checkpoint");
        for i in (0..120).step_by(3) {
            engine.delete(&cx, key(i)).expect("delete");
        }
    }
    let first = scan_all(&open(&dev));
    let second = scan_all(&open(&dev));
    assert_eq!(first, second);
    assert_eq!(first.len(), 80);
}

#[test]
fn scan_recover_rebuilds_tree_without_superblocks() {
    let dev = Arc::new(MemoryByteDevice::new(DEVICE_LEN));
    let cx = Cx::for_testing();
    let engine = create(&dev);
    for i in 0..300 {
        engine.upsert(&cx, key(i), value(i, 0)).expect("upsert");
    }
    engine.checkpoint(&cx).expect("checkpoint");
    for i in (0..300).filter(|i| i % 5 == 0) {
        engine.delete(&cx, key(i)).expect("delete");
    }
    for i in (0..300).filter(|i| i % 7 == 0) {
        engine.upsert(&cx, key(i), value(i, 1)).expect("rewrite");
    }
    let expected = scan_all(&engine);
    engine.shutdown(&cx).expect("shutdown");

    let bucket = u64::from(opts().bucket_size);
    dev.corrupt(0, 64);
    dev.corrupt(bucket / 2, 64);
    assert!(
        Engine::open(&cx, dyn_dev(&dev), opts(), Collaborators::default()).is_err(),
        "mount should fail without a superblock"
    );

    let recovered = scan_recover(&cx, dyn_dev(&dev), &opts()).expect("scan");
    assert!(recovered.stats.pages_found > 0);
    assert!(recovered.stats.leaves_used > 0);
    assert_eq!(recovered.entries, expected);

    let fresh = Arc::new(MemoryByteDevice::new(DEVICE_LEN));
    let engine = create(&fresh);
    let imported = engine
        .import(&cx, recovered.entries.clone())
        .expect("import");
    assert_eq!(imported, expected.len());
    assert_eq!(scan_all(&engine), expected);
}

// ── Model check ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u64),
    Delete(u64),
    Checkpoint,
    Remount,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0_u64..64, 0_u64..1000).prop_map(|(k, r)| Op::Put(k, r)),
        3 => (0_u64..64).prop_map(Op::Delete),
        1 => Just(Op::Checkpoint),
        1 => Just(Op::Remount),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn engine_matches_ordered_map_model(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let dev = Arc::new(MemoryByteDevice::new(DEVICE_LEN));
        let cx = Cx::for_testing();
        let mut engine = create(&dev);
        let mut model: BTreeMap<Key, Value> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Put(k, round) => {
                    let old = engine.upsert(&cx, key(k), value(k, round)).expect("upsert");
                    prop_assert_eq!(old, model.insert(key(k), value(k, round)));
                }
                Op::Delete(k) => {
                    let old = engine.delete(&cx, key(k)).expect("delete");
                    prop_assert_eq!(old, model.remove(&key(k)));
                }
                Op::Checkpoint => {
                    engine.checkpoint(&cx).expect("checkpoint");
                }
                Op::Remount => {
                    drop(engine);
                    engine = open(&dev);
                }
            }
        }
        let want: Vec<(Key, Value)> = model.into_iter().collect();
        prop_assert_eq!(scan_all(&engine), want);
        engine.validate().expect("validate");
    }
}
