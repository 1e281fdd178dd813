//! Multi-leaf update batches.
//!
//! A commit first finds the leaves covering its keys with plain read
//! descents, holding nothing between them. It then takes intent on those
//! leaves in ascending `(range.min, id)` order and checks each one still has
//! the range it was found with. A node's `range.min` never changes while it
//! is alive (splits keep the left half, merges keep the left node), so every
//! thread agrees on the locking order and leaf intents cannot deadlock.
//!
//! Conditions are evaluated under intent; concurrent readers still proceed.
//! Only after the journal accepts the record are the leaves upgraded to
//! write and the mutations applied.

use crate::Btree;
use crate::node::NodeData;
use sfs_error::{Result, SfsError};
use sfs_lock::{IntentGuard, LockState, WriteGuard};
use sfs_ondisk::{Key, Value};
use sfs_types::{JournalSeq, NodeId};

enum Held {
    Intent(IntentGuard<NodeData>),
    Write(WriteGuard<NodeData>),
    Released,
}

struct LockedLeaf {
    held: Held,
    state: LockState,
}

impl LockedLeaf {
    fn data(&self) -> Option<&NodeData> {
        match &self.held {
            Held::Intent(g) => Some(&**g),
            Held::Write(g) => Some(&**g),
            Held::Released => None,
        }
    }
}

/// Outcome of applying mutations to a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Visible value each mutation replaced, in input order.
    pub old_values: Vec<Option<Value>>,
    /// Mutations actually applied (replay skips already-reflected leaves).
    pub applied: usize,
    /// Leaves that now want a split, merge, or compaction.
    pub needs_maintenance: Vec<NodeId>,
}

pub struct LeafBatch<'t> {
    tree: &'t Btree,
    leaves: Vec<LockedLeaf>,
}

impl<'t> LeafBatch<'t> {
    pub(crate) fn new(tree: &'t Btree, guards: Vec<IntentGuard<NodeData>>) -> Result<Self> {
        let mut leaves = Vec::with_capacity(guards.len());
        for g in guards {
            leaves.push(LockedLeaf {
                held: Held::Intent(g),
                state: LockState::Unlocked.transition(LockState::Intent)?,
            });
        }
        Ok(Self { tree, leaves })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    #[must_use]
    pub fn leaf_ids(&self) -> Vec<NodeId> {
        self.leaves
            .iter()
            .filter_map(LockedLeaf::data)
            .map(NodeData::id)
            .collect()
    }

    fn index_of(&self, key: &Key) -> Option<usize> {
        let idx = self
            .leaves
            .partition_point(|l| l.data().is_some_and(|d| d.range().max < *key));
        self.leaves
            .get(idx)
            .and_then(LockedLeaf::data)
            .filter(|d| d.range().contains(key))
            .map(|_| idx)
    }

    /// Current visible value of `key`, which must be covered by the batch.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.index_of(key)
            .and_then(|i| self.leaves[i].data())
            .and_then(|d| d.lookup(key))
    }

    /// Escalate every leaf from intent to write. Waits for readers to drain.
    pub fn upgrade(&mut self) -> Result<()> {
        for leaf in &mut self.leaves {
            leaf.state = leaf.state.transition(LockState::Write)?;
            leaf.held = match std::mem::replace(&mut leaf.held, Held::Released) {
                Held::Intent(g) => Held::Write(g.upgrade()),
                other => other,
            };
        }
        Ok(())
    }

    /// Apply `mutations` in order and stamp the touched leaves with `seq`.
    pub fn apply(&mut self, mutations: &[(Key, Value)], seq: JournalSeq) -> Result<ApplyOutcome> {
        self.apply_inner(mutations, seq, false)
    }

    /// Apply a journal record during replay, skipping leaves whose content
    /// already reflects `seq`.
    pub fn apply_replay(
        &mut self,
        mutations: &[(Key, Value)],
        seq: JournalSeq,
    ) -> Result<ApplyOutcome> {
        self.apply_inner(mutations, seq, true)
    }

    fn apply_inner(
        &mut self,
        mutations: &[(Key, Value)],
        seq: JournalSeq,
        skip_applied: bool,
    ) -> Result<ApplyOutcome> {
        let opts = self.tree.options().clone();
        let mut outcome = ApplyOutcome {
            old_values: Vec::with_capacity(mutations.len()),
            ..ApplyOutcome::default()
        };
        let mut touched = vec![false; self.leaves.len()];
        // Decided per leaf before anything is applied, so a record touching
        // one leaf twice is applied in full or not at all.
        let skip: Vec<bool> = self
            .leaves
            .iter()
            .map(|l| skip_applied && l.data().is_some_and(|d| d.journal_seq() >= seq))
            .collect();

        for (key, value) in mutations {
            let idx = self.index_of(key).ok_or_else(|| {
                SfsError::NotFound(format!("key {key:?} is not covered by the locked leaves"))
            })?;
            let leaf = &mut self.leaves[idx];
            let Held::Write(g) = &mut leaf.held else {
                return Err(SfsError::IllegalLockTransition {
                    from: leaf.state.name(),
                    to: LockState::Write.name(),
                });
            };
            if skip[idx] {
                outcome.old_values.push(g.lookup(key));
                continue;
            }
            outcome.old_values.push(g.insert(*key, value.clone(), &opts)?);
            outcome.applied += 1;
            touched[idx] = true;
        }

        let root = self.tree.root_id();
        for (leaf, touched) in self.leaves.iter_mut().zip(touched) {
            if !touched {
                continue;
            }
            if let Held::Write(g) = &mut leaf.held {
                if seq > g.journal_seq {
                    g.journal_seq = seq;
                }
                if self.tree.classify(&**g, g.id() == root).is_some() {
                    outcome.needs_maintenance.push(g.id());
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Btree, TreeOptions};
    use sfs_error::SfsError;
    use sfs_ondisk::{Key, Value};
    use sfs_types::JournalSeq;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn k(i: u64) -> Key {
        Key::new(i, 0, 0)
    }

    fn v(i: u64) -> Value {
        Value::Inline(i.to_le_bytes().to_vec())
    }

    fn populated() -> Btree {
        let tree = Btree::new(TreeOptions::small_for_tests()).expect("tree");
        let muts: Vec<(Key, Value)> = (0..300).map(|i| (k(i), v(i))).collect();
        for chunk in muts.chunks(32) {
            tree.apply_unjournaled(chunk).expect("apply");
        }
        tree
    }

    #[test]
    fn batch_covers_keys_across_leaves() {
        let tree = populated();
        let mut batch = tree.lock_leaves(&[k(299), k(0), k(150), k(0)]).expect("lock");
        assert!(batch.len() >= 2);
        assert_eq!(batch.get(&k(150)), Some(v(150)));
        batch.upgrade().expect("upgrade");
        let out = batch
            .apply(&[(k(0), v(7)), (k(299), Value::Whiteout)], JournalSeq(5))
            .expect("apply");
        assert_eq!(out.old_values, vec![Some(v(0)), Some(v(299))]);
        assert_eq!(out.applied, 2);
        drop(batch);
        assert_eq!(tree.lookup(&k(0)).expect("lookup"), Some(v(7)));
        assert_eq!(tree.lookup(&k(299)).expect("lookup"), None);
    }

    #[test]
    fn apply_requires_write_state() {
        let tree = populated();
        let mut batch = tree.lock_leaves(&[k(1)]).expect("lock");
        let err = batch.apply(&[(k(1), v(1))], JournalSeq(1)).expect_err("intent only");
        assert!(matches!(err, SfsError::IllegalLockTransition { from: "intent", .. }));
        batch.upgrade().expect("upgrade");
        assert!(batch.upgrade().is_err(), "write cannot escalate further");
    }

    #[test]
    fn uncovered_key_is_rejected() {
        let tree = populated();
        assert!(tree.stats().leaves > 1);
        let mut batch = tree.lock_leaves(&[k(1)]).expect("lock");
        batch.upgrade().expect("upgrade");
        let err = batch
            .apply(&[(k(299), v(1))], JournalSeq(1))
            .expect_err("key lives in another leaf");
        assert!(matches!(err, SfsError::NotFound(_)));
    }

    #[test]
    fn replay_skips_leaves_already_at_seq() {
        let tree = populated();
        let mut batch = tree.lock_leaves(&[k(3)]).expect("lock");
        batch.upgrade().expect("upgrade");
        let first = batch.apply_replay(&[(k(3), v(30))], JournalSeq(9)).expect("replay");
        assert_eq!(first.applied, 1);
        let second = batch.apply_replay(&[(k(3), v(31))], JournalSeq(9)).expect("replay");
        assert_eq!(second.applied, 0);
        drop(batch);
        assert_eq!(tree.lookup(&k(3)).expect("lookup"), Some(v(30)));
    }

    #[test]
    fn readers_proceed_while_intent_held() {
        let tree = Arc::new(populated());
        let batch_tree = Arc::clone(&tree);
        let barrier = Arc::new(Barrier::new(2));
        let b2 = Arc::clone(&barrier);
        let holder = thread::spawn(move || {
            let batch = batch_tree.lock_leaves(&[k(10)]).expect("lock");
            b2.wait();
            b2.wait();
            drop(batch);
        });
        barrier.wait();
        assert_eq!(tree.lookup(&k(10)).expect("lookup under intent"), Some(v(10)));
        barrier.wait();
        holder.join().expect("join");
    }

    #[test]
    fn concurrent_batches_on_shared_leaves_do_not_deadlock() {
        let tree = Arc::new(populated());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4_u64)
            .map(|t| {
                let tree = Arc::clone(&tree);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..200_u64 {
                        let a = (round * 7 + t) % 300;
                        let b = 299 - a;
                        tree.apply_unjournaled(&[(k(a), v(round)), (k(b), v(round))])
                            .expect("apply");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        tree.validate().expect("valid");
        assert_eq!(tree.range(k(0), k(299)).count(), 300);
    }
}
