// =============================================================================
// Event Bus — typed callback registration per domain event
// =============================================================================
//
// External monitoring registers callbacks per event kind. Dispatch happens
// after the emitting component has released its locks. A callback returning
// `Err` or panicking is logged and counted; it never aborts the state
// transition that produced the event, and the remaining callbacks still run.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, warn};

use crate::order_tracker::ExitOrder;
use crate::protection::ProtectionUpdate;

/// An exit order filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillEvent {
    pub order: ExitOrder,
    pub fill_price: f64,
    pub fill_qty: u32,
    pub fill_time: DateTime<Utc>,
    pub pnl: f64,
}

/// An exit order was cancelled by the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelEvent {
    pub order: ExitOrder,
    pub reason: String,
    pub retryable: bool,
}

/// A cancelled exit order is eligible for resubmission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryEvent {
    pub order: ExitOrder,
    pub reason: String,
    pub category: Option<String>,
}

/// An exit order reached FAILED; its position stays ACTIVE.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEvent {
    pub order: ExitOrder,
    pub reason: String,
}

pub type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

struct Subscribers<T> {
    kind: &'static str,
    callbacks: RwLock<Vec<Callback<T>>>,
}

impl<T> Subscribers<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    fn push(&self, cb: Callback<T>) {
        self.callbacks.write().push(cb);
    }

    fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Invoke every callback. Returns how many failed.
    fn emit(&self, event: &T) -> u64 {
        // Snapshot so a callback may register further callbacks.
        let callbacks: Vec<Callback<T>> = self.callbacks.read().clone();
        let mut failures = 0;

        for (idx, cb) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| cb(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(kind = self.kind, callback = idx, error = %e, "event callback failed");
                }
                Err(payload) => {
                    failures += 1;
                    error!(
                        kind = self.kind,
                        callback = idx,
                        panic = %panic_message(payload.as_ref()),
                        "event callback panicked"
                    );
                }
            }
        }
        failures
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Callback registry shared by the tracker, protection and orchestrator.
pub struct EventBus {
    fills: Subscribers<FillEvent>,
    cancels: Subscribers<CancelEvent>,
    retries: Subscribers<RetryEvent>,
    failures: Subscribers<FailedEvent>,
    protection: Subscribers<ProtectionUpdate>,
    callback_failures: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            fills: Subscribers::new("fill"),
            cancels: Subscribers::new("cancel"),
            retries: Subscribers::new("retry"),
            failures: Subscribers::new("failed"),
            protection: Subscribers::new("protection_update"),
            callback_failures: AtomicU64::new(0),
        }
    }

    pub fn on_fill(&self, cb: impl Fn(&FillEvent) -> anyhow::Result<()> + Send + Sync + 'static) {
        self.fills.push(Arc::new(cb));
    }

    pub fn on_cancel(&self, cb: impl Fn(&CancelEvent) -> anyhow::Result<()> + Send + Sync + 'static) {
        self.cancels.push(Arc::new(cb));
    }

    pub fn on_retry(&self, cb: impl Fn(&RetryEvent) -> anyhow::Result<()> + Send + Sync + 'static) {
        self.retries.push(Arc::new(cb));
    }

    pub fn on_failed(&self, cb: impl Fn(&FailedEvent) -> anyhow::Result<()> + Send + Sync + 'static) {
        self.failures.push(Arc::new(cb));
    }

    pub fn on_protection_update(
        &self,
        cb: impl Fn(&ProtectionUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.protection.push(Arc::new(cb));
    }

    pub fn emit_fill(&self, event: &FillEvent) {
        self.count(self.fills.emit(event));
    }

    pub fn emit_cancel(&self, event: &CancelEvent) {
        self.count(self.cancels.emit(event));
    }

    pub fn emit_retry(&self, event: &RetryEvent) {
        self.count(self.retries.emit(event));
    }

    pub fn emit_failed(&self, event: &FailedEvent) {
        self.count(self.failures.emit(event));
    }

    pub fn emit_protection_update(&self, event: &ProtectionUpdate) {
        self.count(self.protection.emit(event));
    }

    pub fn callback_failures(&self) -> u64 {
        self.callback_failures.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.fills.len()
            + self.cancels.len()
            + self.retries.len()
            + self.failures.len()
            + self.protection.len()
    }

    fn count(&self, failures: u64) {
        if failures > 0 {
            self.callback_failures.fetch_add(failures, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("callback_failures", &self.callback_failures())
            .finish()
    }
}
