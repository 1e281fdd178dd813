//! Background maintenance thread.
//!
//! One named thread drains a work queue and runs periodic duties:
//!
//! | duty          | trigger                                        |
//! |---------------|------------------------------------------------|
//! | journal flush | pending records, every `journal_flush_interval_ms` |
//! | checkpoint    | journal past the last checkpoint, every `checkpoint_interval_ms`, or on request |
//! | copygc        | every `copygc_interval_ms`, or on request      |
//!
//! Requests carry an optional reply channel so a committer stuck on a full
//! journal can wait for the checkpoint it asked for. The worker is idle
//! while the engine is read-only.

use crate::checkpoint::CheckpointReport;
use crate::copygc::CopygcReport;
use crate::engine::Shared;
use sfs_error::{Result, SfsError};
use sfs_types::Cx;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub(crate) enum TaskMsg {
    Checkpoint {
        reply: Option<Sender<Result<CheckpointReport>>>,
    },
    Copygc {
        reply: Option<Sender<Result<CopygcReport>>>,
    },
    FlushJournal,
    Shutdown,
}

pub(crate) struct Worker {
    tx: Sender<TaskMsg>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn start(shared: Arc<Shared>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        *shared.tasks.lock() = Some(tx.clone());
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("sfs-maintenance".into())
            .spawn(move || run(&thread_shared, &rx))
            .map_err(|e| {
                *shared.tasks.lock() = None;
                error!(target: "sfs::core", event = "worker_spawn_failed", error = %e);
                SfsError::Io(e)
            })?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit after the queued work and wait for it.
    pub(crate) fn stop(&mut self) {
        let _ = self.tx.send(TaskMsg::Shutdown);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                error!(target: "sfs::core", event = "worker_panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn interval(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

fn log_failure(duty: &str, err: &SfsError) {
    match err {
        SfsError::ReadOnly | SfsError::Cancelled => {
            debug!(target: "sfs::core", event = "worker_duty_skipped", duty, error = %err);
        }
        _ => warn!(target: "sfs::core", event = "worker_duty_failed", duty, error = %err),
    }
}

fn run(shared: &Shared, rx: &Receiver<TaskMsg>) {
    let cx = Cx::for_background();
    let flush_every = interval(shared.opts.journal_flush_interval_ms);
    let checkpoint_every = interval(shared.opts.checkpoint_interval_ms);
    let copygc_every = interval(shared.opts.copygc_interval_ms);
    let tick = flush_every.min(checkpoint_every).min(copygc_every);
    let mut last_checkpoint = Instant::now();
    let mut last_copygc = Instant::now();
    info!(
        target: "sfs::core",
        event = "worker_started",
        tick_ms = tick.as_millis(),
        checkpoint_ms = checkpoint_every.as_millis(),
        copygc_ms = copygc_every.as_millis()
    );

    loop {
        match rx.recv_timeout(tick) {
            Ok(TaskMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(TaskMsg::FlushJournal) | Err(RecvTimeoutError::Timeout) => {}
            Ok(TaskMsg::Checkpoint { reply }) => {
                let res = shared.checkpoint(&cx);
                last_checkpoint = Instant::now();
                if let Err(err) = &res {
                    log_failure("checkpoint", err);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(res);
                }
            }
            Ok(TaskMsg::Copygc { reply }) => {
                let res = shared.run_copygc(&cx);
                last_copygc = Instant::now();
                if let Err(err) = &res {
                    log_failure("copygc", err);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(res);
                }
            }
        }
        if shared.read_only.load(Ordering::Acquire) {
            continue;
        }

        if shared.journal.has_pending() {
            if let Err(err) = shared.flush_journal(&cx) {
                log_failure("flush", &err);
            }
        }
        if last_checkpoint.elapsed() >= checkpoint_every {
            last_checkpoint = Instant::now();
            if shared.needs_checkpoint() {
                if let Err(err) = shared.checkpoint(&cx) {
                    log_failure("checkpoint", &err);
                }
            }
        }
        if last_copygc.elapsed() >= copygc_every {
            last_copygc = Instant::now();
            if let Err(err) = shared.run_copygc(&cx) {
                log_failure("copygc", &err);
            }
        }
    }
    info!(target: "sfs::core", event = "worker_stopped");
}
