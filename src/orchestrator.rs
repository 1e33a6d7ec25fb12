// =============================================================================
// Exit Coordinator — composes cache, evaluator, gate, tracker and protection
// =============================================================================
//
// Tick path (serial, non-blocking):
//   process_price_update
//     -> evaluate_tick under the cache lock
//     -> queue trailing-state writes
//     -> per trigger: gate claim -> executor -> tracker registration
//
// Report path (fills / cancels from the broker adapter):
//   fill   -> tracker FILLED -> cache close -> gate release -> protection
//   cancel -> tracker RETRY  -> resubmit at an adjusted price
//          -> tracker FAILED -> gate release, position re-evaluated next tick
//
// Background (tokio):
//   reconcile loop  — backup reload of the cache from the store
//   cleanup loop    — expired exit locks and stale exit orders
//
// Repeated evaluation failures switch the coordinator into degraded mode,
// where ticks go to the optional fallback handler until a reconciliation
// succeeds.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::evaluator::{evaluate_tick, ExitTrigger, TickEvaluation, TickStats};
use crate::events::{panic_message, EventBus};
use crate::execution::{ExitRequest, OrderExecutor};
use crate::exit_gate::{ClaimOutcome, ExitGate, ExitLock};
use crate::order_tracker::{
    CancelOutcome, ExitOrder, ExitOrderRequest, ExitOrderTracker, FillReport,
};
use crate::persistence::{PersistCommand, PersistenceQueue};
use crate::position_cache::{LoadSummary, PositionCache};
use crate::protection::ProfitProtection;
use crate::retry_policy::RetryPolicy;
use crate::runtime_config::EngineConfig;
use crate::store::{GroupRangeWrite, Position, PositionStore};
use crate::types::{ExitType, RangeData, TriggerSource};

// ---------------------------------------------------------------------------
// Public records
// ---------------------------------------------------------------------------

/// Last-known-good processing path used while the cache path is degraded.
pub trait FallbackHandler: Send + Sync {
    fn process_price(&self, price: f64, at: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Result of one price update. Failures are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub stats: TickStats,
    pub exits_submitted: u32,
    pub duplicates_denied: u32,
    pub submission_failures: u32,
    pub degraded: bool,
    pub error: Option<String>,
}

/// Outcome of one exit initiation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitInitiation {
    Submitted(ExitOrder),
    /// Another source already owns this exit.
    AlreadyHandled(ExitLock),
    Failed(String),
}

/// How a cancel report was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelResolution {
    /// Retried under a new broker order.
    Resubmitted(ExitOrder),
    /// Terminal; the position stays active.
    Failed(ExitOrder),
}

/// Result of one cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub locks_purged: usize,
    pub orders_purged: usize,
    pub orders_expired: usize,
}

/// Observability snapshot for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub ticks_processed: u64,
    pub stop_loss_triggers: u64,
    pub trailing_activations: u64,
    pub peak_updates: u64,
    pub trailing_exits: u64,
    pub exits_submitted: u64,
    pub duplicate_claims_denied: u64,
    pub submission_failures: u64,
    pub fills: u64,
    pub unmatched_fills: u64,
    pub cancels: u64,
    pub retries: u64,
    pub failed_orders: u64,
    pub protection_updates: u64,
    pub rejected_protection_updates: u64,
    pub tick_failures: u64,
    pub degraded_ticks: u64,
    /// Post-reconciliation evaluations; not counted as ticks.
    pub reconcile_rechecks: u64,
    pub degraded: bool,
    pub cached_positions: usize,
    pub live_exit_orders: usize,
    pub callback_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    stop_loss_triggers: AtomicU64,
    trailing_activations: AtomicU64,
    peak_updates: AtomicU64,
    trailing_exits: AtomicU64,
    exits_submitted: AtomicU64,
    duplicates_denied: AtomicU64,
    submission_failures: AtomicU64,
    tick_failures: AtomicU64,
    degraded_ticks: AtomicU64,
    rechecks: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u32) {
    if by > 0 {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ExitCoordinator {
    config: EngineConfig,
    store: Arc<dyn PositionStore>,
    cache: Arc<PositionCache>,
    gate: ExitGate,
    tracker: ExitOrderTracker,
    protection: ProfitProtection,
    executor: Arc<dyn OrderExecutor>,
    persistence: PersistenceQueue,
    events: Arc<EventBus>,
    fallback: Option<Arc<dyn FallbackHandler>>,
    /// Serialises fill and cancel handling.
    reports: Mutex<()>,
    /// Last successfully evaluated price. Locked only inside the cache
    /// critical section.
    last_price: Mutex<Option<f64>>,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    last_error: Mutex<Option<String>>,
    counters: Counters,
}

impl ExitCoordinator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PositionStore>,
        executor: Arc<dyn OrderExecutor>,
        persistence: PersistenceQueue,
    ) -> Self {
        let cache = Arc::new(PositionCache::new(
            config.activation_points,
            config.trailing_pullback_ratio,
        ));
        let events = Arc::new(EventBus::new());
        let gate = ExitGate::new(config.exit_lock_ttl());
        let tracker = ExitOrderTracker::new(
            &config,
            RetryPolicy::default(),
            persistence.clone(),
            Arc::clone(&events),
        );
        let protection = ProfitProtection::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
            persistence.clone(),
            Arc::clone(&events),
        );

        Self {
            config,
            store,
            cache,
            gate,
            tracker,
            protection,
            executor,
            persistence,
            events,
            fallback: None,
            reports: Mutex::new(()),
            last_price: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            last_error: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn with_fallback(mut self, handler: Arc<dyn FallbackHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PositionCache> {
        &self.cache
    }

    pub fn gate(&self) -> &ExitGate {
        &self.gate
    }

    pub fn tracker(&self) -> &ExitOrderTracker {
        &self.tracker
    }

    pub fn protection(&self) -> &ProfitProtection {
        &self.protection
    }

    /// Callback registration for monitoring.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Tick path
    // -------------------------------------------------------------------------

    /// Evaluate one price tick. Never fails; errors land in the report.
    pub fn process_price_update(&self, price: f64, ts: DateTime<Utc>) -> TickReport {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        if self.is_degraded() {
            return self.route_to_fallback(price, ts, TickReport::default());
        }

        match self.run_evaluation(Some(price), ts, TriggerSource::PriceTick) {
            Ok(report) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                report.unwrap_or_default()
            }
            Err(e) => {
                let report = self.failed_tick(price, &e);
                // A bad tick is the feed's fault, not the cache's.
                if matches!(e, EngineError::InvalidPrice(_)) {
                    return report;
                }
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures < self.config.fallback_failure_threshold.max(1) {
                    return report;
                }
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    error!(
                        failures,
                        threshold = self.config.fallback_failure_threshold,
                        "cache processing keeps failing — entering degraded mode"
                    );
                }
                self.route_to_fallback(price, ts, report)
            }
        }
    }

    /// Evaluate `price`, or the last successfully evaluated price when
    /// `None`. The price is chosen and recorded inside the cache critical
    /// section, so a re-check can never run an older price after a newer
    /// tick. Returns `None` when there is no price to re-check.
    fn run_evaluation(
        &self,
        price: Option<f64>,
        at: DateTime<Utc>,
        source: TriggerSource,
    ) -> Result<Option<TickReport>, EngineError> {
        let pending_ttl = self.config.exit_lock_ttl();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.cache.with_entries_mut(|entries| -> Result<Option<TickEvaluation>, EngineError> {
                let mut last = self.last_price.lock();
                let Some(price) = price.or(*last) else {
                    return Ok(None);
                };
                let eval = evaluate_tick(entries, price, at, pending_ttl)?;
                *last = Some(price);
                Ok(Some(eval))
            })
        }));

        let eval = match result {
            Ok(Ok(Some(eval))) => eval,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(payload) => {
                return Err(EngineError::EvaluationPanicked(panic_message(payload.as_ref())))
            }
        };
        Ok(Some(self.handle_evaluation(eval, source)))
    }

    fn failed_tick(&self, price: f64, err: &EngineError) -> TickReport {
        let message = err.to_string();
        self.counters.tick_failures.fetch_add(1, Ordering::Relaxed);
        warn!(price, error = %message, "price update failed");
        self.record_error(&message);
        TickReport {
            error: Some(message),
            degraded: self.is_degraded(),
            ..TickReport::default()
        }
    }

    fn handle_evaluation(&self, eval: TickEvaluation, source: TriggerSource) -> TickReport {
        let TickEvaluation {
            stats,
            triggers,
            trailing_writes,
        } = eval;

        if source == TriggerSource::PriceTick {
            bump(&self.counters.stop_loss_triggers, stats.stop_loss_triggers);
            bump(&self.counters.trailing_activations, stats.trailing_activations);
            bump(&self.counters.peak_updates, stats.peak_updates);
            bump(&self.counters.trailing_exits, stats.trailing_exits);
        } else {
            self.counters.rechecks.fetch_add(1, Ordering::Relaxed);
        }

        for write in trailing_writes {
            self.persistence.enqueue(PersistCommand::Trailing(write));
        }

        let mut report = TickReport {
            stats,
            degraded: self.is_degraded(),
            ..TickReport::default()
        };
        for trigger in &triggers {
            match self.initiate_exit(trigger, source) {
                ExitInitiation::Submitted(_) => report.exits_submitted += 1,
                ExitInitiation::AlreadyHandled(_) => report.duplicates_denied += 1,
                ExitInitiation::Failed(_) => report.submission_failures += 1,
            }
        }
        report
    }

    fn route_to_fallback(&self, price: f64, ts: DateTime<Utc>, mut report: TickReport) -> TickReport {
        self.counters.degraded_ticks.fetch_add(1, Ordering::Relaxed);
        report.degraded = true;

        let Some(fallback) = &self.fallback else {
            debug!(price, "degraded mode without fallback handler — tick dropped");
            report
                .error
                .get_or_insert_with(|| "degraded mode: no fallback handler".to_string());
            return report;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| fallback.process_price(price, ts)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("fallback failed: {e:#}")),
            Err(payload) => Some(format!("fallback panicked: {}", panic_message(payload.as_ref()))),
        };
        if let Some(msg) = failure {
            warn!(price, error = %msg, "fallback processing failed");
            self.record_error(&msg);
            report.error = Some(msg);
        }
        report
    }

    // -------------------------------------------------------------------------
    // Exit initiation
    // -------------------------------------------------------------------------

    /// Claim, submit and register one exit.
    pub fn initiate_exit(&self, trigger: &ExitTrigger, source: TriggerSource) -> ExitInitiation {
        let lock = match self
            .gate
            .claim_at(&trigger.position_id, source, trigger.exit_type, trigger.at)
        {
            ClaimOutcome::Granted(lock) => lock,
            ClaimOutcome::AlreadyHeld(lock) => {
                self.counters.duplicates_denied.fetch_add(1, Ordering::Relaxed);
                return ExitInitiation::AlreadyHandled(lock);
            }
        };

        // Gate lock may have expired while an order is still working.
        if let Some(live) = self.tracker.live_order_for(&trigger.position_id) {
            self.counters.duplicates_denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = %trigger.position_id,
                order_id = %live.order_id,
                status = %live.status,
                "exit order still live — not resubmitting"
            );
            return ExitInitiation::AlreadyHandled(lock);
        }

        let request = ExitRequest {
            position_id: trigger.position_id.clone(),
            direction: trigger.direction,
            quantity: trigger.quantity,
            price: trigger.trigger_price,
            product: self.config.product.clone(),
        };

        let order_id = match self.executor.submit_exit(&request) {
            Ok(id) => id,
            Err(e) => {
                let err = EngineError::Execution(
                    e.context(format!("exit submission failed for {}", trigger.position_id)),
                );
                let msg = err.to_string();
                self.abandon_exit(&trigger.position_id, &msg);
                return ExitInitiation::Failed(msg);
            }
        };

        let registered = self.tracker.register_exit_order_at(
            ExitOrderRequest {
                order_id,
                position_id: trigger.position_id.clone(),
                group_id: trigger.group_id.clone(),
                lot_number: trigger.lot_number,
                direction: trigger.direction,
                quantity: trigger.quantity,
                price: trigger.trigger_price,
                product: self.config.product.clone(),
                exit_type: trigger.exit_type,
                entry_price: trigger.entry_price,
            },
            trigger.at,
        );

        match registered {
            Ok(order) => {
                self.counters.exits_submitted.fetch_add(1, Ordering::Relaxed);
                info!(
                    id = %trigger.position_id,
                    order_id = %order.order_id,
                    exit_type = %trigger.exit_type,
                    source = %source,
                    price = trigger.trigger_price,
                    stop = trigger.stop_price,
                    breach = trigger.breach,
                    "exit initiated"
                );
                ExitInitiation::Submitted(order)
            }
            Err(e) => {
                let msg = format!("exit order registration failed: {e}");
                self.counters.submission_failures.fetch_add(1, Ordering::Relaxed);
                error!(id = %trigger.position_id, error = %e, "submitted exit could not be tracked");
                self.record_error(&msg);
                ExitInitiation::Failed(msg)
            }
        }
    }

    /// Operator / external exit request at `price`.
    pub fn request_manual_exit(
        &self,
        position_id: &str,
        price: f64,
    ) -> Result<ExitInitiation, EngineError> {
        self.request_manual_exit_at(position_id, price, Utc::now())
    }

    pub fn request_manual_exit_at(
        &self,
        position_id: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ExitInitiation, EngineError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::InvalidPrice(price));
        }
        let trigger = self
            .cache
            .entry(position_id)
            .map(|entry| ExitTrigger {
                position_id: entry.position.id.clone(),
                group_id: entry.position.group_id.clone(),
                lot_number: entry.position.lot_number,
                direction: entry.direction(),
                quantity: entry.position.quantity,
                entry_price: entry.position.entry_price,
                exit_type: ExitType::Manual,
                trigger_price: price,
                stop_price: entry.stop_price,
                breach: 0.0,
                at: now,
            })
            .ok_or_else(|| {
                EngineError::CacheInconsistent(format!("position {position_id} is not cached"))
            })?;

        let outcome = self.initiate_exit(&trigger, TriggerSource::External);
        if matches!(outcome, ExitInitiation::Submitted(_)) {
            // Only the claim holder marks the lot pending; a denied request
            // leaves the holder's timestamp alone.
            self.cache.mark_exit_pending(position_id, now);
        }
        Ok(outcome)
    }

    /// Release the claim so the still-active position is evaluated again.
    fn abandon_exit(&self, position_id: &str, reason: &str) {
        self.counters.submission_failures.fetch_add(1, Ordering::Relaxed);
        self.gate.release(position_id);
        self.cache.clear_exit_pending(position_id);
        warn!(id = position_id, reason, "exit abandoned — position stays active");
        self.record_error(reason);
    }

    // -------------------------------------------------------------------------
    // Report path
    // -------------------------------------------------------------------------

    pub fn process_fill_report(&self, fill: &FillReport) -> bool {
        self.process_fill_report_at(fill, Utc::now())
    }

    /// Apply a broker fill. Returns false when no exit order matched.
    pub fn process_fill_report_at(&self, fill: &FillReport, now: DateTime<Utc>) -> bool {
        let _serial = self.reports.lock();

        let Some(event) = self.tracker.process_fill_report_at(fill, now) else {
            return false;
        };
        let position_id = &event.order.position_id;
        let group_id = &event.order.group_id;

        self.cache.on_position_closed(position_id);
        self.gate.release(position_id);
        // Losses count toward the group's cumulative profit too.
        self.protection.record_realised(group_id, position_id, event.pnl);

        if event.pnl > 0.0 {
            let updates = self
                .protection
                .update_protective_stops_at(group_id, position_id, now);
            if !updates.is_empty() {
                info!(
                    group_id = %group_id,
                    exited = %position_id,
                    updates = updates.len(),
                    "group stops protected"
                );
            }
        }
        true
    }

    pub fn process_cancel_report(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<CancelResolution, EngineError> {
        self.process_cancel_report_at(order_id, reason, Utc::now())
    }

    /// Apply a broker cancel: resubmit when retryable, otherwise give the
    /// position back to the evaluator.
    pub fn process_cancel_report_at(
        &self,
        order_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelResolution, EngineError> {
        let _serial = self.reports.lock();

        match self.tracker.process_cancel_report_at(order_id, reason, now)? {
            CancelOutcome::Retry(order) => self.resubmit(order, now),
            CancelOutcome::Failed(order) => {
                self.gate.release(&order.position_id);
                self.cache.clear_exit_pending(&order.position_id);
                self.record_error(&format!("exit order {} failed: {reason}", order.order_id));
                Ok(CancelResolution::Failed(order))
            }
        }
    }

    /// Each retry moves the limit one `retry_price_offset` further toward
    /// the market: lower for a LONG exit, higher for a SHORT exit.
    fn resubmit(&self, order: ExitOrder, now: DateTime<Utc>) -> Result<CancelResolution, EngineError> {
        let price = order.price - order.direction.sign() * self.config.retry_price_offset;
        let request = ExitRequest {
            position_id: order.position_id.clone(),
            direction: order.direction,
            quantity: order.quantity,
            price,
            product: order.product.clone(),
        };

        match self.executor.submit_exit(&request) {
            Ok(new_id) => {
                let order = self
                    .tracker
                    .mark_resubmitted_at(&order.order_id, &new_id, price, now)?;
                Ok(CancelResolution::Resubmitted(order))
            }
            Err(e) => {
                let reason = format!("resubmission failed: {e:#}");
                let failed = self.tracker.mark_failed_at(&order.order_id, &reason, now)?;
                self.abandon_exit(&failed.position_id, &reason);
                Ok(CancelResolution::Failed(failed))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Position lifecycle
    // -------------------------------------------------------------------------

    /// Record a new group's range and derive its lots' initial stops.
    /// Repeated calls for the same group and range return 0. The range is
    /// written to the store so later reloads derive the same stops.
    pub fn setup_initial_stops_for_group(
        &self,
        group_id: &str,
        range: RangeData,
    ) -> Result<usize, EngineError> {
        self.setup_initial_stops_for_group_at(group_id, range, Utc::now())
    }

    pub fn setup_initial_stops_for_group_at(
        &self,
        group_id: &str,
        range: RangeData,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let already_set = self.cache.group_range(group_id) == Some(range);
        let updated = self.cache.set_group_range(group_id, range)?;
        if !already_set {
            self.persistence
                .enqueue(PersistCommand::GroupRange(GroupRangeWrite {
                    group_id: group_id.to_string(),
                    range,
                    at: now,
                }));
        }
        Ok(updated)
    }

    pub fn on_new_position(&self, position: Position) -> Result<(), EngineError> {
        Ok(self.cache.on_new_position(position)?)
    }

    pub fn on_position_closed(&self, position_id: &str) {
        self.cache.on_position_closed(position_id);
        self.gate.release(position_id);
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Reload the cache from the store. Blocking; run off the tick path.
    /// Success also ends degraded mode and re-checks the last price against
    /// the refreshed cache.
    pub fn reconcile(&self) -> Result<LoadSummary, EngineError> {
        self.reconcile_at(Utc::now())
    }

    pub fn reconcile_at(&self, now: DateTime<Utc>) -> Result<LoadSummary, EngineError> {
        let summary = match self.cache.load(self.store.as_ref()) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "cache reconciliation failed");
                self.record_error(&e.to_string());
                return Err(e);
            }
        };

        self.protection.sync_exited_from_store();

        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("reconciliation succeeded — leaving degraded mode");
        }

        match self.run_evaluation(None, now, TriggerSource::Reconciliation) {
            Ok(Some(report)) if report.exits_submitted > 0 => info!(
                exits = report.exits_submitted,
                "reconciled positions already through their stops"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "post-reconciliation check failed"),
        }
        Ok(summary)
    }

    pub fn cleanup(&self) -> CleanupSummary {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupSummary {
        let locks_purged = self.gate.purge_expired_at(now);
        let report = self
            .tracker
            .cleanup_expired_at(self.config.order_retention(), now);

        for order in &report.expired {
            self.gate.release(&order.position_id);
            self.cache.clear_exit_pending(&order.position_id);
        }

        let summary = CleanupSummary {
            locks_purged,
            orders_purged: report.purged_terminal,
            orders_expired: report.expired.len(),
        };
        if summary != CleanupSummary::default() {
            debug!(?summary, "cleanup sweep");
        }
        summary
    }

    pub fn stats(&self) -> EngineStats {
        let tracker = self.tracker.stats();
        let protection = self.protection.stats();
        let c = &self.counters;
        EngineStats {
            ticks_processed: c.ticks.load(Ordering::Relaxed),
            stop_loss_triggers: c.stop_loss_triggers.load(Ordering::Relaxed),
            trailing_activations: c.trailing_activations.load(Ordering::Relaxed),
            peak_updates: c.peak_updates.load(Ordering::Relaxed),
            trailing_exits: c.trailing_exits.load(Ordering::Relaxed),
            exits_submitted: c.exits_submitted.load(Ordering::Relaxed),
            duplicate_claims_denied: c.duplicates_denied.load(Ordering::Relaxed),
            submission_failures: c.submission_failures.load(Ordering::Relaxed),
            fills: tracker.fills,
            unmatched_fills: tracker.unmatched_fills,
            cancels: tracker.cancels,
            retries: tracker.retries,
            failed_orders: tracker.failed + tracker.expired,
            protection_updates: protection.applied,
            rejected_protection_updates: protection.rejected,
            tick_failures: c.tick_failures.load(Ordering::Relaxed),
            degraded_ticks: c.degraded_ticks.load(Ordering::Relaxed),
            reconcile_rechecks: c.rechecks.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
            cached_positions: self.cache.len(),
            live_exit_orders: tracker.live_orders,
            callback_failures: self.events.callback_failures(),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn record_error(&self, message: &str) {
        *self.last_error.lock() = Some(message.to_string());
    }

    // -------------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------------

    /// Spawn the reconcile and cleanup loops. Call once after the initial
    /// `reconcile()`.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let reconcile = {
            let engine = Arc::clone(self);
            let secs = self.config.reconcile_interval_secs.max(1);
            tokio::spawn(async move {
                info!(interval_secs = secs, "reconcile loop started");
                let mut ticker = interval(TokioDuration::from_secs(secs));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let e = Arc::clone(&engine);
                    match tokio::task::spawn_blocking(move || e.reconcile()).await {
                        Ok(Ok(summary)) => debug!(
                            inserted = summary.inserted,
                            removed = summary.removed,
                            "backup reconciliation done"
                        ),
                        Ok(Err(e)) => warn!(error = %e, "backup reconciliation failed"),
                        Err(e) => error!(error = %e, "reconciliation task aborted"),
                    }
                }
            })
        };

        let cleanup = {
            let engine = Arc::clone(self);
            let secs = self.config.cleanup_interval_secs.max(1);
            tokio::spawn(async move {
                info!(interval_secs = secs, "cleanup loop started");
                let mut ticker = interval(TokioDuration::from_secs(secs));
                loop {
                    ticker.tick().await;
                    engine.cleanup();
                }
            })
        };

        vec![reconcile, cleanup]
    }
}

impl std::fmt::Debug for ExitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitCoordinator")
            .field("cache", &self.cache)
            .field("gate", &self.gate)
            .field("tracker", &self.tracker)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperExecutor;
    use crate::persistence::PersistenceWorker;
    use crate::store::InMemoryStore;
    use crate::types::{Direction, PositionStatus};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn lot(id: &str, lot_number: u32, direction: Direction, entry: f64) -> Position {
        Position {
            id: id.into(),
            group_id: "g-1".into(),
            lot_number,
            direction,
            entry_price: entry,
            quantity: 1,
            range_high: 22520.0,
            range_low: 22480.0,
            stop_price: None,
            peak_price: None,
            trailing_activated: false,
            protected: false,
            pullback_ratio: None,
            status: PositionStatus::Active,
            realized_pnl: None,
        }
    }

    struct Harness {
        engine: ExitCoordinator,
        store: Arc<InMemoryStore>,
        exec: Arc<PaperExecutor>,
        worker: PersistenceWorker,
    }

    fn harness(positions: Vec<Position>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        for p in positions {
            store.insert_position(p);
        }
        let exec = Arc::new(PaperExecutor::new());
        let (queue, rx) = PersistenceQueue::new();
        let worker = PersistenceWorker::new(rx, store.clone());
        let engine = ExitCoordinator::new(EngineConfig::default(), store.clone(), exec.clone(), queue);
        engine.reconcile_at(t(0)).unwrap();
        Harness {
            engine,
            store,
            exec,
            worker,
        }
    }

    fn fill(price: f64, at: i64) -> FillReport {
        FillReport {
            order_id: None,
            product: "TM0000".into(),
            fill_price: price,
            fill_qty: 1,
            fill_time: t(at),
        }
    }

    #[derive(Default)]
    struct CountingFallback {
        calls: AtomicUsize,
    }

    impl FallbackHandler for CountingFallback {
        fn process_price(&self, _price: f64, _at: DateTime<Utc>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn long_stop_breach_submits_exactly_one_exit() {
        let mut lot1 = lot("p-1", 1, Direction::Long, 22540.0);
        lot1.range_low = 22500.0;
        lot1.range_high = 22560.0;
        let h = harness(vec![lot1]);

        let report = h.engine.process_price_update(22499.0, t(1));
        assert_eq!(report.stats.stop_loss_triggers, 1);
        assert_eq!(report.stats.trailing_activations, 0);
        assert_eq!(report.stats.peak_updates, 0);
        assert_eq!(report.exits_submitted, 1);
        assert!(report.error.is_none());

        let again = h.engine.process_price_update(22495.0, t(2));
        assert_eq!(again.exits_submitted, 0);

        let submitted = h.exec.take_submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].request.order_side(), "SELL");
        assert_eq!(submitted[0].request.price, 22499.0);
        assert_eq!(h.engine.stats().exits_submitted, 1);
    }

    #[test]
    fn manual_exit_is_denied_while_tick_exit_is_in_flight() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        h.engine.process_price_update(22479.0, t(1));

        match h.engine.request_manual_exit_at("p-1", 22478.0, t(2)).unwrap() {
            ExitInitiation::AlreadyHandled(lock) => {
                assert_eq!(lock.trigger_source, TriggerSource::PriceTick);
                assert_eq!(lock.exit_type, ExitType::InitialStop);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert_eq!(h.exec.pending(), 1);
        assert_eq!(h.engine.stats().duplicate_claims_denied, 1);
        // The denied request does not extend the holder's pending window.
        assert_eq!(h.engine.cache().entry("p-1").unwrap().exit_pending_since, Some(t(1)));
    }

    #[test]
    fn granted_manual_exit_marks_the_lot_pending() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        let outcome = h.engine.request_manual_exit_at("p-1", 22510.0, t(1)).unwrap();
        assert!(matches!(outcome, ExitInitiation::Submitted(_)));
        assert_eq!(h.engine.cache().entry("p-1").unwrap().exit_pending_since, Some(t(1)));

        let rejecting = harness(vec![lot("p-2", 1, Direction::Long, 22500.0)]);
        rejecting.exec.reject_next("market closed");
        let outcome = rejecting.engine.request_manual_exit_at("p-2", 22510.0, t(1)).unwrap();
        assert!(matches!(outcome, ExitInitiation::Failed(_)));
        assert!(rejecting.engine.cache().entry("p-2").unwrap().exit_pending_since.is_none());
    }

    #[test]
    fn profitable_trailing_exit_protects_the_rest_of_the_group() {
        let mut h = harness(vec![
            lot("p-1", 1, Direction::Long, 22500.0),
            lot("p-2", 2, Direction::Long, 22590.0),
        ]);

        h.engine.process_price_update(22515.0, t(1)); // p-1 activates
        h.engine.process_price_update(22600.0, t(2)); // p-1 peak, trailing stop 22580
        let report = h.engine.process_price_update(22578.0, t(3));
        assert_eq!(report.stats.trailing_exits, 1);
        assert_eq!(report.exits_submitted, 1);

        let submitted = h.exec.take_submitted();
        assert_eq!(submitted[0].request.position_id, "p-1");
        assert_eq!(submitted[0].request.price, 22578.0);

        assert!(h.engine.process_fill_report_at(&fill(22578.0, 4), t(4)));
        assert!(h.engine.cache().entry("p-1").is_none());
        assert!(h.engine.gate().holder_at("p-1", t(4)).is_none());

        // pnl 78, multiplier 2 -> 22590 + 156
        let p2 = h.engine.cache().entry("p-2").unwrap();
        assert_eq!(p2.stop_price, 22746.0);
        assert!(p2.position.protected);

        let stats = h.engine.stats();
        assert_eq!(stats.fills, 1);
        assert_eq!(stats.protection_updates, 1);

        // activation + peak + exit + protective stop
        assert_eq!(h.worker.drain_pending(), 4);
        let p1 = h.store.position("p-1").unwrap();
        assert_eq!(p1.status, PositionStatus::Exited);
        assert_eq!(p1.realized_pnl, Some(78.0));
        assert!(h.store.position("p-2").unwrap().protected);

        // The protected lot now exits as a protective stop.
        let report = h.engine.process_price_update(22578.0, t(5));
        assert_eq!(report.exits_submitted, 1);
        assert_eq!(
            h.engine.tracker().live_order_for("p-2").unwrap().exit_type,
            ExitType::ProtectiveStop
        );
    }

    fn exit_and_fill(h: &Harness, id: &str, price: f64, at: i64) {
        let order = match h.engine.request_manual_exit_at(id, price, t(at)).unwrap() {
            ExitInitiation::Submitted(order) => order,
            other => panic!("expected submission for {id}, got {other:?}"),
        };
        let report = FillReport {
            order_id: Some(order.order_id),
            ..fill(price, at)
        };
        assert!(h.engine.process_fill_report_at(&report, t(at)));
    }

    #[test]
    fn losing_exit_offsets_a_later_winner_before_writes_land() {
        let mut p3 = lot("p-3", 3, Direction::Long, 22500.0);
        p3.range_low = 22400.0;
        let h = harness(vec![
            lot("p-1", 1, Direction::Long, 22500.0),
            lot("p-2", 2, Direction::Long, 22500.0),
            p3,
        ]);

        exit_and_fill(&h, "p-1", 22470.0, 1); // -30
        exit_and_fill(&h, "p-2", 22520.0, 2); // +20

        // Neither exit has reached the store.
        assert_eq!(h.store.position("p-1").unwrap().status, PositionStatus::Active);
        assert_eq!(h.engine.protection().cumulative_profit("g-1"), -10.0);

        let p3 = h.engine.cache().entry("p-3").unwrap();
        assert_eq!(p3.stop_price, 22400.0);
        assert!(!p3.position.protected);
        assert!(h.engine.protection().history().is_empty());
    }

    #[test]
    fn earlier_session_exits_count_toward_protection() {
        let mut p2 = lot("p-2", 2, Direction::Long, 22500.0);
        p2.range_low = 22400.0;
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22480.0), p2]);
        // p-1 exited before this engine started; only the store knows.
        h.store.mark_exited("p-1", 20.0);
        h.engine.reconcile_at(t(1)).unwrap();
        assert_eq!(h.engine.protection().cumulative_profit("g-1"), 20.0);

        let mut p3 = lot("p-3", 3, Direction::Long, 22500.0);
        p3.range_low = 22400.0;
        h.engine.on_new_position(p3).unwrap();
        exit_and_fill(&h, "p-3", 22510.0, 2); // +10

        // (20 + 10) * 2 over entry
        assert_eq!(h.engine.cache().entry("p-2").unwrap().stop_price, 22560.0);
    }

    #[test]
    fn unmatched_fill_leaves_state_untouched() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        h.engine.process_price_update(22479.0, t(1));
        assert!(!h.engine.process_fill_report_at(&fill(22300.0, 2), t(2)));
        assert!(h.engine.cache().entry("p-1").is_some());
        assert_eq!(h.engine.stats().unmatched_fills, 1);
    }

    #[test]
    fn retryable_cancel_resubmits_toward_the_market() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        h.engine.process_price_update(22479.0, t(1));
        let first = h.exec.take_submitted().remove(0);

        let resolution = h
            .engine
            .process_cancel_report_at(&first.order_id, "FOK", t(2))
            .unwrap();
        let resubmitted = match resolution {
            CancelResolution::Resubmitted(order) => order,
            other => panic!("expected resubmission, got {other:?}"),
        };
        assert_eq!(resubmitted.retry_count, 1);
        assert_eq!(resubmitted.price, 22474.0);
        assert_eq!(resubmitted.status, crate::types::ExitOrderStatus::Submitted);

        let second = h.exec.take_submitted().remove(0);
        assert_eq!(second.order_id, resubmitted.order_id);
        assert_eq!(second.request.price, 22474.0);

        // Non-retryable: FAILED, position handed back to the evaluator.
        let resolution = h
            .engine
            .process_cancel_report_at(&second.order_id, "insufficient margin", t(3))
            .unwrap();
        assert!(matches!(resolution, CancelResolution::Failed(_)));
        assert!(h.engine.gate().holder_at("p-1", t(3)).is_none());
        assert!(h.engine.cache().entry("p-1").unwrap().exit_pending_since.is_none());

        let report = h.engine.process_price_update(22470.0, t(4));
        assert_eq!(report.exits_submitted, 1);
    }

    #[test]
    fn rejected_submission_releases_the_claim() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        h.exec.reject_next("market closed");

        let report = h.engine.process_price_update(22479.0, t(1));
        assert_eq!(report.submission_failures, 1);
        assert!(h.engine.gate().holder_at("p-1", t(1)).is_none());
        let last_error = h.engine.stats().last_error.unwrap();
        assert!(last_error.starts_with("order execution:"));
        assert!(last_error.contains("market closed"));

        let report = h.engine.process_price_update(22478.0, t(2));
        assert_eq!(report.exits_submitted, 1);
    }

    #[test]
    fn repeated_failures_switch_to_fallback_until_reconciled() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_position(lot("p-1", 1, Direction::Long, 22500.0));
        let (queue, _rx) = PersistenceQueue::new();
        let fallback = Arc::new(CountingFallback::default());
        let engine = ExitCoordinator::new(
            EngineConfig::default(),
            store.clone(),
            Arc::new(PaperExecutor::new()),
            queue,
        )
        .with_fallback(fallback.clone());
        engine.reconcile_at(t(0)).unwrap();

        // Corrupt the cache: an entry stored under the wrong key.
        let mut stray = engine.cache().entry("p-1").unwrap();
        stray.position.id = "p-x".into();
        engine.cache().with_entries_mut(|e| e.insert("p-0".into(), stray));

        for n in 1..=2 {
            let report = engine.process_price_update(22510.0, t(n));
            assert!(report.error.is_some());
            assert!(!report.degraded);
        }
        let third = engine.process_price_update(22510.0, t(3));
        assert!(third.degraded);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);

        let fourth = engine.process_price_update(22510.0, t(4));
        assert!(fourth.degraded);
        assert!(fourth.error.is_none());
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);

        let stats = engine.stats();
        assert!(stats.degraded);
        assert_eq!(stats.tick_failures, 3);
        assert_eq!(stats.degraded_ticks, 2);

        // Reconciliation drops the stray key and restores the cache path.
        engine.reconcile_at(t(5)).unwrap();
        assert!(!engine.is_degraded());
        let report = engine.process_price_update(22510.0, t(6));
        assert!(report.error.is_none());
        assert_eq!(report.stats.positions_evaluated, 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_prices_never_degrade_the_engine() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        for n in 0..5 {
            let report = h.engine.process_price_update(f64::NAN, t(n));
            assert!(report.error.is_some());
        }
        assert!(!h.engine.is_degraded());
        assert_eq!(h.engine.stats().tick_failures, 5);
    }

    #[test]
    fn group_setup_is_idempotent() {
        let h = harness(vec![
            lot("p-1", 1, Direction::Long, 22500.0),
            lot("p-2", 2, Direction::Short, 22500.0),
        ]);
        let range = RangeData {
            high: 22530.0,
            low: 22470.0,
        };
        assert_eq!(h.engine.setup_initial_stops_for_group("g-1", range).unwrap(), 2);
        assert_eq!(h.engine.setup_initial_stops_for_group("g-1", range).unwrap(), 0);
        assert_eq!(h.engine.cache().entry("p-1").unwrap().stop_price, 22470.0);
        assert_eq!(h.engine.cache().entry("p-2").unwrap().stop_price, 22530.0);
    }

    #[test]
    fn group_range_survives_reconciliation() {
        let mut h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        let range = RangeData {
            high: 22520.0,
            low: 22470.0,
        };
        h.engine.setup_initial_stops_for_group_at("g-1", range, t(1)).unwrap();
        assert_eq!(h.engine.cache().entry("p-1").unwrap().stop_price, 22470.0);

        // Range write still queued: the reload keeps the recorded range.
        h.engine.reconcile_at(t(2)).unwrap();
        assert_eq!(h.engine.cache().entry("p-1").unwrap().stop_price, 22470.0);

        // One write for the range, none for the repeat call.
        h.engine.setup_initial_stops_for_group_at("g-1", range, t(3)).unwrap();
        assert_eq!(h.worker.drain_pending(), 1);
        assert_eq!(h.store.group("g-1"), Some(range));

        h.engine.reconcile_at(t(4)).unwrap();
        assert_eq!(h.engine.cache().entry("p-1").unwrap().stop_price, 22470.0);
    }

    #[test]
    fn reconcile_exits_positions_already_through_their_stop() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        h.engine.process_price_update(22490.0, t(1));

        // A new lot lands in the store with its stop above the last price.
        let mut late = lot("p-2", 2, Direction::Long, 22520.0);
        late.range_low = 22495.0;
        h.store.insert_position(late);
        h.engine.reconcile_at(t(2)).unwrap();

        let order = h.engine.tracker().live_order_for("p-2").unwrap();
        assert_eq!(order.price, 22490.0);
        let lock = h.engine.gate().holder_at("p-2", t(2)).unwrap();
        assert_eq!(lock.trigger_source, TriggerSource::Reconciliation);
    }

    #[test]
    fn reconcile_recheck_stays_out_of_tick_counters() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        h.engine.process_price_update(22515.0, t(1)); // activates
        h.engine.reconcile_at(t(2)).unwrap();
        h.engine.reconcile_at(t(3)).unwrap();

        let stats = h.engine.stats();
        assert_eq!(stats.trailing_activations, 1);
        assert_eq!(stats.reconcile_rechecks, 2);
        assert_eq!(h.exec.pending(), 0);
    }

    #[test]
    fn concurrent_reconcile_never_replays_an_older_price() {
        // Tight pullback: any price one point under the peak is a trailing exit.
        let mut p1 = lot("p-1", 1, Direction::Long, 22500.0);
        p1.pullback_ratio = Some(0.01);
        let h = harness(vec![p1]);
        let engine = &h.engine;
        let done = AtomicBool::new(false);

        let submitted = std::thread::scope(|s| {
            s.spawn(|| loop {
                engine.reconcile_at(t(0)).unwrap();
                if done.load(Ordering::SeqCst) {
                    break;
                }
            });
            let mut submitted = 0;
            for n in 0..2000u32 {
                submitted += engine
                    .process_price_update(22515.0 + f64::from(n), t(1))
                    .exits_submitted;
            }
            done.store(true, Ordering::SeqCst);
            submitted
        });

        assert_eq!(submitted, 0);
        assert_eq!(h.exec.pending(), 0);
        let stats = h.engine.stats();
        assert_eq!(stats.trailing_exits, 0);
        assert_eq!(stats.exits_submitted, 0);
        assert!(stats.reconcile_rechecks >= 1);
    }

    #[test]
    fn cleanup_purges_expired_locks() {
        let h = harness(vec![lot("p-1", 1, Direction::Long, 22500.0)]);
        h.engine.process_price_update(22479.0, t(1));
        let summary = h.engine.cleanup_at(t(40));
        assert_eq!(summary.locks_purged, 1);
        assert_eq!(summary.orders_expired, 0);

        let summary = h.engine.cleanup_at(t(400));
        assert_eq!(summary.orders_expired, 1);
        assert!(h.engine.tracker().live_order_for("p-1").is_none());
    }
}
