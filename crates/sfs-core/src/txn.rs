//! Transactions.
//!
//! A [`Transaction`] is a private write set plus optional preconditions.
//! Nothing is visible to other threads until [`Engine::commit`] succeeds;
//! dropping an uncommitted transaction aborts it.
//!
//! Commit protocol:
//!
//! ```text
//! gate (shared) ─▶ intent-lock leaves ─▶ check preconditions
//!     ─▶ journal append ─▶ durable ─▶ upgrade to write ─▶ apply
//!     ─▶ release leaves ─▶ release gate ─▶ split/merge/compact
//! ```
//!
//! Mutations become visible only after their journal record is durable, so
//! a reader can never observe a write that a crash would take back. Two
//! commits touching a common leaf serialize on its intent lock; the journal
//! sequence order therefore matches the order conflicting commits were
//! applied in.
//!
//! [`Engine::commit`]: crate::Engine::commit

use crate::engine::Shared;
use crate::worker::TaskMsg;
use sfs_error::{Result, SfsError};
use sfs_journal::DurabilityOutcome;
use sfs_ondisk::{Key, Value};
use sfs_types::{Cx, JournalSeq};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    writes: BTreeMap<Key, Value>,
    expects: BTreeMap<Key, Option<Value>>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `value` for `key`; a later write to the same key wins.
    pub fn upsert(&mut self, key: Key, value: Value) -> &mut Self {
        self.writes.insert(key, value);
        self
    }

    pub fn delete(&mut self, key: Key) -> &mut Self {
        self.upsert(key, Value::Whiteout)
    }

    /// Commit only if `key` still holds `expected` (`None`: absent).
    pub fn expect(&mut self, key: Key, expected: Option<Value>) -> &mut Self {
        self.expects.insert(key, expected);
        self
    }

    /// What this transaction would write to `key`.
    #[must_use]
    pub fn staged(&self, key: &Key) -> Option<&Value> {
        self.writes.get(key)
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.expects.is_empty()
    }

    fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.writes.keys().chain(self.expects.keys()).copied().collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Journal sequence of the record; `None` for a transaction with no
    /// writes.
    pub seq: Option<JournalSeq>,
    /// Visible value each written key held before, in key order.
    pub old_values: Vec<(Key, Option<Value>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(CommitInfo),
    /// A precondition did not hold; nothing was written.
    ConditionFailed { key: Key, found: Option<Value> },
}

impl CommitOutcome {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    #[must_use]
    pub fn into_committed(self) -> Option<CommitInfo> {
        match self {
            Self::Committed(info) => Some(info),
            Self::ConditionFailed { .. } => None,
        }
    }
}

fn cancelled(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SfsError::Cancelled)
}

impl Shared {
    pub(crate) fn commit(&self, cx: &Cx, txn: Transaction) -> Result<CommitOutcome> {
        self.ensure_writable()?;
        for value in txn.writes.values() {
            self.tree.check_entry(value)?;
        }
        let keys = txn.keys();
        let muts: Vec<(Key, Value)> = txn.writes.into_iter().collect();

        loop {
            cancelled(cx)?;
            let gate = self.gate.read();
            let mut batch = self.tree.lock_leaves(&keys)?;

            for (key, expected) in &txn.expects {
                let found = batch.get(key);
                if found != *expected {
                    self.counters.condition_failures.fetch_add(1, Ordering::Relaxed);
                    trace!(target: "sfs::core", event = "commit_condition_failed", key = %key);
                    return Ok(CommitOutcome::ConditionFailed { key: *key, found });
                }
            }
            if muts.is_empty() {
                return Ok(CommitOutcome::Committed(CommitInfo {
                    seq: None,
                    old_values: Vec::new(),
                }));
            }
            cancelled(cx)?;

            let seq = match self.journal.append(&muts, &batch.leaf_ids()) {
                Ok(seq) => seq,
                Err(SfsError::JournalFull) => {
                    drop(batch);
                    drop(gate);
                    self.relieve_journal(cx)?;
                    continue;
                }
                Err(SfsError::ReadOnly) => {
                    self.enter_read_only("journal failed");
                    return Err(SfsError::ReadOnly);
                }
                Err(err) => return Err(err),
            };
            self.await_durable(cx, seq)?;

            batch.upgrade()?;
            let outcome = batch.apply(&muts, seq)?;
            drop(batch);

            let mut freed = 0_usize;
            for ((_, new), old) in muts.iter().zip(&outcome.old_values) {
                if let Some(old @ Value::Extent(_)) = old {
                    if old != new {
                        freed += self.alloc.free_all(old.replicas());
                    }
                }
            }
            drop(gate);

            self.tree.maintain(&outcome.needs_maintenance)?;
            self.counters.commits.fetch_add(1, Ordering::Relaxed);
            trace!(
                target: "sfs::core",
                event = "commit",
                seq = seq.0,
                writes = muts.len(),
                leaves = keys.len(),
                freed
            );
            self.nudge_checkpoint();
            let old_values = muts
                .into_iter()
                .map(|(k, _)| k)
                .zip(outcome.old_values)
                .collect();
            return Ok(CommitOutcome::Committed(CommitInfo {
                seq: Some(seq),
                old_values,
            }));
        }
    }

    /// Block until `seq` is on disk. Without a background flusher (or with
    /// `sync_on_commit`) the committer flushes itself; otherwise it waits
    /// for the group flush and only flushes itself if that stalls.
    fn await_durable(&self, cx: &Cx, seq: JournalSeq) -> Result<()> {
        if self.opts.sync_on_commit || self.task_sender().is_none() {
            self.flush_journal(cx)?;
            return self.journal.wait_durable(seq).inspect_err(|_| {
                self.enter_read_only("journal failed");
            });
        }
        self.request(TaskMsg::FlushJournal);
        let patience = Duration::from_millis(self.opts.journal_flush_interval_ms.max(1) * 2);
        loop {
            match self.journal.notifier().await_seq_timeout(seq, patience) {
                Some(DurabilityOutcome::Durable) => return Ok(()),
                Some(DurabilityOutcome::Failed(reason)) => {
                    self.enter_read_only(&reason);
                    return Err(SfsError::ReadOnly);
                }
                None => {
                    self.flush_journal(cx)?;
                }
            }
        }
    }

    /// The journal is out of free buckets: checkpoint so it can reclaim
    /// the ones the tree now covers.
    fn relieve_journal(&self, cx: &Cx) -> Result<()> {
        self.counters.backpressure_waits.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "sfs::core",
            event = "journal_backpressure",
            free_buckets = self.journal.free_buckets()
        );
        if let Some(tx) = self.task_sender() {
            let (reply_tx, reply_rx) = mpsc::channel();
            if tx.send(TaskMsg::Checkpoint { reply: Some(reply_tx) }).is_ok() {
                if let Ok(res) = reply_rx.recv() {
                    return res.map(|_| ());
                }
            }
        }
        self.checkpoint(cx).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(i: u64) -> Key {
        Key::new(i, 0, 0)
    }

    #[test]
    fn later_write_to_a_key_wins() {
        let mut txn = Transaction::new();
        assert!(txn.is_empty());
        txn.upsert(k(1), Value::Inline(vec![1]))
            .upsert(k(1), Value::Inline(vec![2]))
            .delete(k(2));
        assert_eq!(txn.pending_writes(), 2);
        assert_eq!(txn.staged(&k(1)), Some(&Value::Inline(vec![2])));
        assert_eq!(txn.staged(&k(2)), Some(&Value::Whiteout));
        assert_eq!(txn.staged(&k(3)), None);
    }

    #[test]
    fn lock_keys_cover_writes_and_expectations_once() {
        let mut txn = Transaction::new();
        txn.expect(k(5), None)
            .upsert(k(3), Value::Inline(vec![0]))
            .expect(k(3), Some(Value::Inline(vec![9])));
        assert!(!txn.is_empty());
        assert_eq!(txn.keys(), vec![k(3), k(5)]);
    }

    #[test]
    fn outcome_accessors() {
        let info = CommitInfo {
            seq: Some(JournalSeq(4)),
            old_values: vec![(k(1), None)],
        };
        let ok = CommitOutcome::Committed(info.clone());
        assert!(ok.is_committed());
        assert_eq!(ok.into_committed(), Some(info));
        let failed = CommitOutcome::ConditionFailed { key: k(1), found: None };
        assert!(!failed.is_committed());
        assert_eq!(failed.into_committed(), None);
    }
}
