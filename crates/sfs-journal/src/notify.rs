//! Group commit: durability notification.
//!
//! Committers append a record, then either flush themselves or wait here
//! until a flusher reports their sequence durable. One flush wakes every
//! waiter at or below the flushed sequence.

use parking_lot::{Condvar, Mutex};
use sfs_types::JournalSeq;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurabilityOutcome {
    Durable,
    Failed(String),
}

#[derive(Debug)]
struct DurabilityState {
    durable: JournalSeq,
    /// Highest sequence whose flush failed, with the error text.
    failed: Option<(JournalSeq, String)>,
}

impl DurabilityState {
    fn outcome(&self, seq: JournalSeq) -> Option<DurabilityOutcome> {
        if let Some((failed, msg)) = &self.failed {
            if seq <= *failed && seq > self.durable {
                return Some(DurabilityOutcome::Failed(msg.clone()));
            }
        }
        (seq <= self.durable).then_some(DurabilityOutcome::Durable)
    }
}

#[derive(Debug)]
pub struct DurabilityNotifier {
    state: Mutex<DurabilityState>,
    condvar: Condvar,
}

impl DurabilityNotifier {
    #[must_use]
    pub fn new(durable: JournalSeq) -> Self {
        Self {
            state: Mutex::new(DurabilityState {
                durable,
                failed: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Block until `seq` is durable or its flush failed.
    pub fn await_seq(&self, seq: JournalSeq) -> DurabilityOutcome {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.outcome(seq) {
                return outcome;
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Like [`await_seq`](Self::await_seq); `None` if `timeout` elapsed.
    pub fn await_seq_timeout(&self, seq: JournalSeq, timeout: Duration) -> Option<DurabilityOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.outcome(seq) {
                return Some(outcome);
            }
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return state.outcome(seq);
            }
        }
    }

    pub fn notify_durable(&self, seq: JournalSeq) {
        {
            let mut state = self.state.lock();
            if seq > state.durable {
                state.durable = seq;
            }
        }
        self.condvar.notify_all();
    }

    pub fn notify_failed(&self, seq: JournalSeq, error: String) {
        {
            let mut state = self.state.lock();
            match &state.failed {
                Some((prev, _)) if *prev >= seq => {}
                _ => state.failed = Some((seq, error)),
            }
        }
        self.condvar.notify_all();
    }

    #[must_use]
    pub fn durable(&self) -> JournalSeq {
        self.state.lock().durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn already_durable_returns_immediately() {
        let n = DurabilityNotifier::new(JournalSeq(5));
        assert_eq!(n.await_seq(JournalSeq(3)), DurabilityOutcome::Durable);
        assert_eq!(n.await_seq_timeout(JournalSeq(6), Duration::from_millis(1)), None);
    }

    #[test]
    fn one_flush_wakes_every_waiter() {
        let n = Arc::new(DurabilityNotifier::new(JournalSeq::ZERO));
        let waiters: Vec<_> = (1..=4)
            .map(|s| {
                let n = Arc::clone(&n);
                thread::spawn(move || n.await_seq(JournalSeq(s)))
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        n.notify_durable(JournalSeq(4));
        for w in waiters {
            assert_eq!(w.join().expect("join"), DurabilityOutcome::Durable);
        }
        assert_eq!(n.durable(), JournalSeq(4));
    }

    #[test]
    fn failure_reaches_only_undurable_waiters() {
        let n = DurabilityNotifier::new(JournalSeq(2));
        n.notify_failed(JournalSeq(4), "all journal devices failed".to_owned());
        assert_eq!(n.await_seq(JournalSeq(2)), DurabilityOutcome::Durable);
        assert!(matches!(n.await_seq(JournalSeq(3)), DurabilityOutcome::Failed(_)));
        assert_eq!(n.await_seq_timeout(JournalSeq(5), Duration::from_millis(1)), None);
    }
}
