// =============================================================================
// Persistence Queue — non-blocking durable-store writes
// =============================================================================
//
// The tick path and the fill/cancel path never touch the store directly.
// They enqueue a `PersistCommand` (an unbounded send that never blocks) and
// a single worker task drains the queue into the store on a blocking thread.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::store::{
    GroupRangeWrite, PositionExit, PositionStore, ProtectiveStopWrite, TrailingWrite,
};

/// One queued durable-store write.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistCommand {
    ProtectiveStop(ProtectiveStopWrite),
    Trailing(TrailingWrite),
    GroupRange(GroupRangeWrite),
    Exit(PositionExit),
}

impl PersistCommand {
    /// Position id, or group id for group-level writes.
    fn key(&self) -> &str {
        match self {
            Self::ProtectiveStop(w) => &w.position_id,
            Self::Trailing(w) => &w.position_id,
            Self::GroupRange(w) => &w.group_id,
            Self::Exit(e) => &e.position_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ProtectiveStop(_) => "protective_stop",
            Self::Trailing(_) => "trailing",
            Self::GroupRange(_) => "group_range",
            Self::Exit(_) => "exit",
        }
    }

    fn apply(&self, store: &dyn PositionStore) -> anyhow::Result<()> {
        match self {
            Self::ProtectiveStop(w) => store.write_protective_stop(w),
            Self::Trailing(w) => store.write_trailing_state(w),
            Self::GroupRange(w) => store.write_group_range(w),
            Self::Exit(e) => store.record_exit(e),
        }
    }
}

/// Counters shared by the queue handle and the worker.
#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceStats {
    pub enqueued: u64,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Cloneable sending side of the queue.
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::UnboundedSender<PersistCommand>,
    counters: Arc<QueueCounters>,
}

/// Receiving side; turn it into a running worker with
/// [`PersistenceWorker::new`].
pub struct PersistenceReceiver {
    rx: mpsc::UnboundedReceiver<PersistCommand>,
    counters: Arc<QueueCounters>,
}

impl PersistenceQueue {
    pub fn new() -> (Self, PersistenceReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(QueueCounters::default());
        (
            Self {
                tx,
                counters: Arc::clone(&counters),
            },
            PersistenceReceiver { rx, counters },
        )
    }

    /// Queue a write. Returns immediately; a closed queue drops the write
    /// with an error log.
    pub fn enqueue(&self, cmd: PersistCommand) {
        let kind = cmd.kind();
        match self.tx.send(cmd) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(cmd)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    kind,
                    key = %cmd.key(),
                    "persistence queue closed — write dropped"
                );
            }
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Drains the queue into the store.
pub struct PersistenceWorker {
    rx: mpsc::UnboundedReceiver<PersistCommand>,
    counters: Arc<QueueCounters>,
    store: Arc<dyn PositionStore>,
}

impl PersistenceWorker {
    pub fn new(receiver: PersistenceReceiver, store: Arc<dyn PositionStore>) -> Self {
        Self {
            rx: receiver.rx,
            counters: receiver.counters,
            store,
        }
    }

    /// Run until every queue handle has been dropped. Spawn once at startup.
    pub async fn run(mut self) {
        info!("persistence worker started");
        while let Some(cmd) = self.rx.recv().await {
            let store = Arc::clone(&self.store);
            let result = tokio::task::spawn_blocking(move || {
                let outcome = cmd.apply(store.as_ref());
                (cmd, outcome)
            })
            .await;

            match result {
                Ok((cmd, outcome)) => self.record(&cmd, outcome),
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "persistence write task aborted");
                }
            }
        }
        info!("persistence worker stopped — queue closed");
    }

    /// Apply everything currently queued on the calling thread. Used for the
    /// shutdown flush and in tests. Returns the number of commands applied.
    pub fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(cmd) = self.rx.try_recv() {
            let outcome = cmd.apply(self.store.as_ref());
            self.record(&cmd, outcome);
            applied += 1;
        }
        applied
    }

    fn record(&self, cmd: &PersistCommand, outcome: anyhow::Result<()>) {
        match outcome {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
                debug!(kind = cmd.kind(), key = %cmd.key(), "store write applied");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = cmd.kind(),
                    key = %cmd.key(),
                    error = %e,
                    "store write failed"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
