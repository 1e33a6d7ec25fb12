// =============================================================================
// Exit Order Tracker — lifecycle of exit orders
// =============================================================================
//
//   PENDING -> SUBMITTED (registration)
//   SUBMITTED -> FILLED                      (matched fill report, terminal)
//   SUBMITTED -> CANCELLED -> RETRY          (retryable reason, retries left)
//   SUBMITTED -> CANCELLED -> FAILED         (otherwise, terminal)
//   RETRY -> SUBMITTED                       (resubmitted under a new order id)
//
// At most one live (non-terminal) order per position. Terminal orders leave
// the live table immediately and are kept in a short history until the
// retention sweep drops them.
//
// Fill reports either name their order or are matched FIFO: the earliest
// submitted open order with the same product and quantity, a price within
// tolerance and a submit time inside the match window.
//
// Store writes go through the persistence queue; callbacks run after the
// tracker lock is released.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TrackerError;
use crate::events::{CancelEvent, EventBus, FailedEvent, FillEvent, RetryEvent};
use crate::persistence::{PersistCommand, PersistenceQueue};
use crate::retry_policy::RetryPolicy;
use crate::runtime_config::EngineConfig;
use crate::store::PositionExit;
use crate::types::{normalize_product, Direction, ExitOrderStatus, ExitType};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitOrder {
    pub order_id: String,
    pub position_id: String,
    pub group_id: String,
    pub lot_number: u32,
    /// Direction of the position being closed.
    pub direction: Direction,
    pub quantity: u32,
    pub price: f64,
    pub product: String,
    pub exit_type: ExitType,
    pub entry_price: f64,
    pub status: ExitOrderStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_reason: Option<String>,
}

impl ExitOrder {
    /// Realised P&L in points x quantity for a fill at `fill_price`.
    pub fn pnl_at(&self, fill_price: f64, fill_qty: u32) -> f64 {
        self.direction.sign() * (fill_price - self.entry_price) * fill_qty as f64
    }
}

/// What the caller knows when registering a freshly submitted exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOrderRequest {
    pub order_id: String,
    pub position_id: String,
    pub group_id: String,
    pub lot_number: u32,
    pub direction: Direction,
    pub quantity: u32,
    pub price: f64,
    pub product: String,
    pub exit_type: ExitType,
    pub entry_price: f64,
}

/// Broker fill report. `order_id` is optional; without it the fill is
/// matched FIFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    pub order_id: Option<String>,
    pub product: String,
    pub fill_price: f64,
    pub fill_qty: u32,
    pub fill_time: DateTime<Utc>,
}

/// FIFO match constraints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchRules {
    pub price_tolerance: f64,
    pub window: Duration,
}

impl MatchRules {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            price_tolerance: config.fill_price_tolerance,
            window: config.fill_match_window(),
        }
    }
}

/// Result of a cancel report.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// Order is in RETRY and awaits resubmission.
    Retry(ExitOrder),
    /// Order is FAILED and gone from the live table.
    Failed(ExitOrder),
}

impl CancelOutcome {
    pub fn order(&self) -> &ExitOrder {
        match self {
            Self::Retry(o) | Self::Failed(o) => o,
        }
    }
}

/// Result of the retention sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Terminal orders dropped from history.
    pub purged_terminal: usize,
    /// Live orders that exceeded the retention age and were failed.
    pub expired: Vec<ExitOrder>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub registered: u64,
    pub duplicate_rejections: u64,
    pub fills: u64,
    pub unmatched_fills: u64,
    pub cancels: u64,
    pub retries: u64,
    pub failed: u64,
    pub expired: u64,
    pub live_orders: usize,
    pub history: usize,
}

// ---------------------------------------------------------------------------
// FIFO matching
// ---------------------------------------------------------------------------

/// Pick the order a fill belongs to: open, same normalised product, exact
/// quantity, price within tolerance, submitted within the window before
/// `now`. Earliest submit time wins; ties go to the smaller order id.
pub fn fifo_match<'a>(
    orders: impl IntoIterator<Item = &'a ExitOrder>,
    fill: &FillReport,
    rules: &MatchRules,
    now: DateTime<Utc>,
) -> Option<&'a ExitOrder> {
    let product = normalize_product(&fill.product);
    orders
        .into_iter()
        .filter(|o| o.status.is_open())
        .filter(|o| normalize_product(&o.product) == product)
        .filter(|o| o.quantity == fill.fill_qty)
        .filter(|o| (o.price - fill.fill_price).abs() <= rules.price_tolerance)
        .filter(|o| now.signed_duration_since(o.submitted_at) <= rules.window)
        .min_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        })
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TrackerInner {
    /// Live orders by order id (PENDING / SUBMITTED / RETRY).
    live: HashMap<String, ExitOrder>,
    /// position id -> live order id.
    by_position: HashMap<String, String>,
    /// Terminal orders awaiting the retention sweep.
    history: Vec<ExitOrder>,
}

impl TrackerInner {
    fn retire(&mut self, order: ExitOrder) {
        if self.by_position.get(&order.position_id) == Some(&order.order_id) {
            self.by_position.remove(&order.position_id);
        }
        self.history.push(order);
    }
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    duplicate_rejections: AtomicU64,
    fills: AtomicU64,
    unmatched_fills: AtomicU64,
    cancels: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
}

pub struct ExitOrderTracker {
    inner: Mutex<TrackerInner>,
    rules: MatchRules,
    max_retries: u32,
    policy: RetryPolicy,
    persistence: PersistenceQueue,
    events: Arc<EventBus>,
    counters: Counters,
}

impl ExitOrderTracker {
    pub fn new(
        config: &EngineConfig,
        policy: RetryPolicy,
        persistence: PersistenceQueue,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            rules: MatchRules::from_config(config),
            max_retries: config.max_retries,
            policy,
            persistence,
            events,
            counters: Counters::default(),
        }
    }

    pub fn register_exit_order(&self, req: ExitOrderRequest) -> Result<ExitOrder, TrackerError> {
        self.register_exit_order_at(req, Utc::now())
    }

    /// Record a submitted exit order. Fails if the position already has a
    /// live order or the order id is taken.
    pub fn register_exit_order_at(
        &self,
        req: ExitOrderRequest,
        now: DateTime<Utc>,
    ) -> Result<ExitOrder, TrackerError> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.by_position.get(&req.position_id) {
            let err = TrackerError::DuplicateExit {
                position_id: req.position_id.clone(),
                order_id: existing.clone(),
            };
            drop(inner);
            self.counters.duplicate_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "exit order registration rejected");
            return Err(err);
        }
        if inner.live.contains_key(&req.order_id) {
            drop(inner);
            self.counters.duplicate_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(TrackerError::DuplicateOrderId(req.order_id));
        }

        let mut order = ExitOrder {
            order_id: req.order_id,
            position_id: req.position_id,
            group_id: req.group_id,
            lot_number: req.lot_number,
            direction: req.direction,
            quantity: req.quantity,
            price: req.price,
            product: req.product,
            exit_type: req.exit_type,
            entry_price: req.entry_price,
            status: ExitOrderStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            submitted_at: now,
            updated_at: now,
            last_reason: None,
        };
        order.status = ExitOrderStatus::Submitted;

        inner
            .by_position
            .insert(order.position_id.clone(), order.order_id.clone());
        inner.live.insert(order.order_id.clone(), order.clone());
        drop(inner);

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        info!(
            order_id = %order.order_id,
            id = %order.position_id,
            direction = %order.direction,
            qty = order.quantity,
            price = order.price,
            exit_type = %order.exit_type,
            "exit order submitted"
        );
        Ok(order)
    }

    pub fn process_fill_report(&self, fill: &FillReport) -> Option<FillEvent> {
        self.process_fill_report_at(fill, Utc::now())
    }

    /// Match a fill to its order, mark it FILLED, queue the position exit
    /// write and notify fill subscribers. `None` when nothing matched.
    pub fn process_fill_report_at(&self, fill: &FillReport, now: DateTime<Utc>) -> Option<FillEvent> {
        let mut inner = self.inner.lock();

        let explicit = fill
            .order_id
            .as_ref()
            .and_then(|id| inner.live.get(id))
            .filter(|o| o.status.is_open())
            .map(|o| o.order_id.clone());
        let matched_id = explicit.or_else(|| {
            fifo_match(inner.live.values(), fill, &self.rules, now).map(|o| o.order_id.clone())
        });

        let Some(order_id) = matched_id else {
            drop(inner);
            self.counters.unmatched_fills.fetch_add(1, Ordering::Relaxed);
            warn!(
                order_id = ?fill.order_id,
                product = %fill.product,
                price = fill.fill_price,
                qty = fill.fill_qty,
                "fill report matched no exit order — dropped"
            );
            return None;
        };

        let mut order = inner.live.remove(&order_id)?;
        order.status = ExitOrderStatus::Filled;
        order.updated_at = now;
        inner.retire(order.clone());
        drop(inner);

        let pnl = order.pnl_at(fill.fill_price, fill.fill_qty);
        self.counters.fills.fetch_add(1, Ordering::Relaxed);
        info!(
            order_id = %order.order_id,
            id = %order.position_id,
            fill_price = fill.fill_price,
            pnl,
            "exit order filled"
        );

        self.persistence.enqueue(PersistCommand::Exit(PositionExit {
            position_id: order.position_id.clone(),
            exit_price: fill.fill_price,
            exit_time: fill.fill_time,
            reason: order.exit_type.to_string(),
            pnl,
        }));

        let event = FillEvent {
            order,
            fill_price: fill.fill_price,
            fill_qty: fill.fill_qty,
            fill_time: fill.fill_time,
            pnl,
        };
        self.events.emit_fill(&event);
        Some(event)
    }

    pub fn process_cancel_report(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<CancelOutcome, TrackerError> {
        self.process_cancel_report_at(order_id, reason, Utc::now())
    }

    /// CANCELLED, then RETRY if the reason is retryable and retries remain,
    /// otherwise FAILED.
    pub fn process_cancel_report_at(
        &self,
        order_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, TrackerError> {
        let decision = self.policy.classify(reason);
        let mut inner = self.inner.lock();

        let order = inner
            .live
            .get_mut(order_id)
            .ok_or_else(|| TrackerError::UnknownOrder(order_id.to_string()))?;
        if !order.status.is_open() {
            return Err(TrackerError::InvalidTransition {
                order_id: order_id.to_string(),
                status: order.status.to_string(),
                expected: "PENDING or SUBMITTED",
            });
        }

        order.status = ExitOrderStatus::Cancelled;
        order.last_reason = Some(reason.to_string());
        order.updated_at = now;
        let cancelled = order.clone();

        let outcome = if decision.retryable && order.retry_count < order.max_retries {
            order.retry_count += 1;
            order.status = ExitOrderStatus::Retry;
            CancelOutcome::Retry(order.clone())
        } else {
            order.status = ExitOrderStatus::Failed;
            let failed = order.clone();
            inner.live.remove(order_id);
            inner.retire(failed.clone());
            CancelOutcome::Failed(failed)
        };
        drop(inner);

        self.counters.cancels.fetch_add(1, Ordering::Relaxed);
        self.events.emit_cancel(&CancelEvent {
            order: cancelled,
            reason: reason.to_string(),
            retryable: decision.retryable,
        });

        match &outcome {
            CancelOutcome::Retry(order) => {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                info!(
                    order_id = %order.order_id,
                    id = %order.position_id,
                    reason,
                    category = ?decision.category,
                    retry = order.retry_count,
                    max = order.max_retries,
                    "exit order cancelled — retry scheduled"
                );
                self.events.emit_retry(&RetryEvent {
                    order: order.clone(),
                    reason: reason.to_string(),
                    category: decision.category,
                });
            }
            CancelOutcome::Failed(order) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    order_id = %order.order_id,
                    id = %order.position_id,
                    reason,
                    retryable = decision.retryable,
                    retries = order.retry_count,
                    "exit order failed — position stays active"
                );
                self.events.emit_failed(&FailedEvent {
                    order: order.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        Ok(outcome)
    }

    pub fn mark_resubmitted(
        &self,
        order_id: &str,
        new_order_id: &str,
        new_price: f64,
    ) -> Result<ExitOrder, TrackerError> {
        self.mark_resubmitted_at(order_id, new_order_id, new_price, Utc::now())
    }

    /// RETRY -> SUBMITTED under the broker's new order id.
    pub fn mark_resubmitted_at(
        &self,
        order_id: &str,
        new_order_id: &str,
        new_price: f64,
        now: DateTime<Utc>,
    ) -> Result<ExitOrder, TrackerError> {
        let mut inner = self.inner.lock();

        let status = inner
            .live
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| TrackerError::UnknownOrder(order_id.to_string()))?;
        if status != ExitOrderStatus::Retry {
            return Err(TrackerError::InvalidTransition {
                order_id: order_id.to_string(),
                status: status.to_string(),
                expected: "RETRY",
            });
        }
        if new_order_id != order_id && inner.live.contains_key(new_order_id) {
            return Err(TrackerError::DuplicateOrderId(new_order_id.to_string()));
        }

        let mut order = inner
            .live
            .remove(order_id)
            .ok_or_else(|| TrackerError::UnknownOrder(order_id.to_string()))?;
        order.order_id = new_order_id.to_string();
        order.price = new_price;
        order.status = ExitOrderStatus::Submitted;
        order.submitted_at = now;
        order.updated_at = now;

        inner
            .by_position
            .insert(order.position_id.clone(), order.order_id.clone());
        inner.live.insert(order.order_id.clone(), order.clone());
        drop(inner);

        info!(
            old_order_id = order_id,
            order_id = %order.order_id,
            id = %order.position_id,
            price = new_price,
            retry = order.retry_count,
            "exit order resubmitted"
        );
        Ok(order)
    }

    pub fn mark_failed(&self, order_id: &str, reason: &str) -> Result<ExitOrder, TrackerError> {
        self.mark_failed_at(order_id, reason, Utc::now())
    }

    /// Force a live order to FAILED (e.g. its resubmission was rejected).
    pub fn mark_failed_at(
        &self,
        order_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ExitOrder, TrackerError> {
        let mut inner = self.inner.lock();
        let mut order = inner
            .live
            .remove(order_id)
            .ok_or_else(|| TrackerError::UnknownOrder(order_id.to_string()))?;
        order.status = ExitOrderStatus::Failed;
        order.last_reason = Some(reason.to_string());
        order.updated_at = now;
        inner.retire(order.clone());
        drop(inner);

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(order_id, id = %order.position_id, reason, "exit order marked failed");
        self.events.emit_failed(&FailedEvent {
            order: order.clone(),
            reason: reason.to_string(),
        });
        Ok(order)
    }

    pub fn cleanup_expired(&self, max_age: Duration) -> CleanupReport {
        self.cleanup_expired_at(max_age, Utc::now())
    }

    /// Drop terminal orders older than `max_age`; fail live orders that have
    /// been waiting longer than that.
    pub fn cleanup_expired_at(&self, max_age: Duration, now: DateTime<Utc>) -> CleanupReport {
        let mut inner = self.inner.lock();

        let before = inner.history.len();
        inner
            .history
            .retain(|o| now.signed_duration_since(o.updated_at) <= max_age);
        let purged_terminal = before - inner.history.len();

        let stale: Vec<String> = inner
            .live
            .values()
            .filter(|o| now.signed_duration_since(o.updated_at) > max_age)
            .map(|o| o.order_id.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(mut order) = inner.live.remove(&id) {
                order.status = ExitOrderStatus::Failed;
                order.last_reason = Some("expired without fill or cancel".to_string());
                order.updated_at = now;
                inner.retire(order.clone());
                expired.push(order);
            }
        }
        drop(inner);

        if !expired.is_empty() {
            self.counters
                .expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            for order in &expired {
                warn!(order_id = %order.order_id, id = %order.position_id, "exit order expired");
                self.events.emit_failed(&FailedEvent {
                    order: order.clone(),
                    reason: "expired".to_string(),
                });
            }
        }
        if purged_terminal > 0 {
            debug!(purged_terminal, "terminal exit orders purged");
        }

        CleanupReport {
            purged_terminal,
            expired,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Live or retained order by id.
    pub fn order(&self, order_id: &str) -> Option<ExitOrder> {
        let inner = self.inner.lock();
        inner
            .live
            .get(order_id)
            .cloned()
            .or_else(|| inner.history.iter().rev().find(|o| o.order_id == order_id).cloned())
    }

    /// Live order of a position, if any.
    pub fn live_order_for(&self, position_id: &str) -> Option<ExitOrder> {
        let inner = self.inner.lock();
        inner
            .by_position
            .get(position_id)
            .and_then(|id| inner.live.get(id))
            .cloned()
    }

    pub fn live_orders(&self) -> Vec<ExitOrder> {
        let mut orders: Vec<ExitOrder> = self.inner.lock().live.values().cloned().collect();
        orders.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        orders
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn stats(&self) -> TrackerStats {
        let (live_orders, history) = {
            let inner = self.inner.lock();
            (inner.live.len(), inner.history.len())
        };
        TrackerStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            duplicate_rejections: self.counters.duplicate_rejections.load(Ordering::Relaxed),
            fills: self.counters.fills.load(Ordering::Relaxed),
            unmatched_fills: self.counters.unmatched_fills.load(Ordering::Relaxed),
            cancels: self.counters.cancels.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            live_orders,
            history,
        }
    }
}

impl std::fmt::Debug for ExitOrderTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitOrderTracker")
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PersistenceReceiver, PersistenceWorker};
    use crate::store::{InMemoryStore, Position};
    use crate::types::PositionStatus;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracker() -> (ExitOrderTracker, PersistenceReceiver) {
        let (queue, rx) = PersistenceQueue::new();
        let tracker = ExitOrderTracker::new(
            &EngineConfig::default(),
            RetryPolicy::default(),
            queue,
            Arc::new(EventBus::new()),
        );
        (tracker, rx)
    }

    fn request(order_id: &str, position_id: &str, price: f64) -> ExitOrderRequest {
        ExitOrderRequest {
            order_id: order_id.into(),
            position_id: position_id.into(),
            group_id: "g-1".into(),
            lot_number: 1,
            direction: Direction::Long,
            quantity: 1,
            price,
            product: "TM0000".into(),
            exit_type: ExitType::TrailingStop,
            entry_price: 22520.0,
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

    #[test]
    fn one_live_order_per_position() {
        let (tracker, _rx) = tracker();
        let order = tracker.register_exit_order_at(request("o-1", "p-1", 22540.0), t(0)).unwrap();
        assert_eq!(order.status, ExitOrderStatus::Submitted);

        let err = tracker
            .register_exit_order_at(request("o-2", "p-1", 22540.0), t(1))
            .unwrap_err();
        assert_eq!(
            err,
            TrackerError::DuplicateExit {
                position_id: "p-1".into(),
                order_id: "o-1".into()
            }
        );
        assert_eq!(tracker.stats().duplicate_rejections, 1);
    }

    #[test]
    fn fifo_prefers_earliest_submission() {
        let (tracker, _rx) = tracker();
        tracker.register_exit_order_at(request("o-a", "p-1", 22540.0), t(0)).unwrap();
        tracker.register_exit_order_at(request("o-b", "p-2", 22542.0), t(5)).unwrap();

        let event = tracker.process_fill_report_at(&fill(22541.0, 6), t(6)).unwrap();
        assert_eq!(event.order.order_id, "o-a");
        assert_eq!(event.order.status, ExitOrderStatus::Filled);
        assert!(tracker.live_order_for("p-1").is_none());
        assert!(tracker.live_order_for("p-2").is_some());
    }

    #[test]
    fn fifo_respects_tolerance_quantity_and_window() {
        let rules = MatchRules {
            price_tolerance: 10.0,
            window: Duration::seconds(30),
        };
        let now = t(40);
        let mk = |id: &str, price: f64, qty: u32, at: i64| ExitOrder {
            order_id: id.into(),
            position_id: format!("p-{id}"),
            group_id: "g".into(),
            lot_number: 1,
            direction: Direction::Long,
            quantity: qty,
            price,
            product: "TM".into(),
            exit_type: ExitType::InitialStop,
            entry_price: 22500.0,
            status: ExitOrderStatus::Submitted,
            retry_count: 0,
            max_retries: 5,
            submitted_at: t(at),
            updated_at: t(at),
            last_reason: None,
        };
        let orders = vec![
            mk("too-old", 22541.0, 1, 0),
            mk("too-far", 22560.0, 1, 20),
            mk("wrong-qty", 22541.0, 2, 20),
            mk("ok", 22550.0, 1, 30),
        ];
        let matched = fifo_match(orders.iter(), &fill(22541.0, 40), &rules, now).unwrap();
        assert_eq!(matched.order_id, "ok");
    }

    #[test]
    fn explicit_order_id_bypasses_fifo() {
        let (tracker, _rx) = tracker();
        tracker.register_exit_order_at(request("o-a", "p-1", 22540.0), t(0)).unwrap();
        tracker.register_exit_order_at(request("o-b", "p-2", 22542.0), t(5)).unwrap();

        let mut report = fill(22541.0, 6);
        report.order_id = Some("o-b".into());
        let event = tracker.process_fill_report_at(&report, t(6)).unwrap();
        assert_eq!(event.order.order_id, "o-b");
    }

    #[test]
    fn unmatched_fill_is_counted_not_applied() {
        let (tracker, _rx) = tracker();
        tracker.register_exit_order_at(request("o-a", "p-1", 22540.0), t(0)).unwrap();
        assert!(tracker.process_fill_report_at(&fill(22600.0, 1), t(1)).is_none());
        let stats = tracker.stats();
        assert_eq!(stats.unmatched_fills, 1);
        assert_eq!(stats.live_orders, 1);
    }

    #[test]
    fn fill_queues_exit_write_with_pnl() {
        let (tracker, rx) = tracker();
        let store = Arc::new(InMemoryStore::new());
        store.insert_position(Position {
            id: "p-1".into(),
            group_id: "g-1".into(),
            lot_number: 1,
            direction: Direction::Long,
            entry_price: 22520.0,
            quantity: 1,
            range_high: 22560.0,
            range_low: 22500.0,
            stop_price: None,
            peak_price: Some(22560.0),
            trailing_activated: true,
            protected: false,
            pullback_ratio: None,
            status: PositionStatus::Active,
            realized_pnl: None,
        });
        let mut worker = PersistenceWorker::new(rx, store.clone());

        tracker.register_exit_order_at(request("o-a", "p-1", 22540.0), t(0)).unwrap();
        let event = tracker.process_fill_report_at(&fill(22541.0, 1), t(1)).unwrap();
        assert_eq!(event.pnl, 21.0);

        assert_eq!(worker.drain_pending(), 1);
        let exit = store.exit_record("p-1").unwrap();
        assert_eq!(exit.exit_price, 22541.0);
        assert_eq!(exit.pnl, 21.0);
        assert_eq!(exit.reason, "trailing_stop");
    }

    #[test]
    fn fok_cancels_retry_until_the_bound_then_fail() {
        let (tracker, _rx) = tracker();
        let retries = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let (r, f) = (Arc::clone(&retries), Arc::clone(&failed));
        tracker.events().on_retry(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tracker.events().on_failed(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tracker.register_exit_order_at(request("o-0", "p-1", 22540.0), t(0)).unwrap();

        // Two cancel/resubmit cycles bring retry_count to 2.
        let mut current = "o-0".to_string();
        for n in 1..=2 {
            let outcome = tracker.process_cancel_report_at(&current, "FOK", t(n)).unwrap();
            assert!(matches!(outcome, CancelOutcome::Retry(_)));
            let next = format!("o-{n}");
            tracker.mark_resubmitted_at(&current, &next, 22540.0 - 5.0 * n as f64, t(n)).unwrap();
            current = next;
        }
        assert_eq!(tracker.live_order_for("p-1").unwrap().retry_count, 2);

        // Third FOK: retry_count 2 -> 3, RETRY, retry callback fires.
        let outcome = tracker.process_cancel_report_at(&current, "FOK", t(3)).unwrap();
        match &outcome {
            CancelOutcome::Retry(order) => {
                assert_eq!(order.retry_count, 3);
                assert_eq!(order.status, ExitOrderStatus::Retry);
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(retries.load(Ordering::SeqCst), 3);

        // Burn the remaining retries.
        for n in 3..=4 {
            let next = format!("o-{n}");
            tracker.mark_resubmitted_at(&current, &next, 22520.0, t(n)).unwrap();
            current = next;
            tracker.process_cancel_report_at(&current, "FOK", t(n)).unwrap();
        }
        let next = "o-5".to_string();
        tracker.mark_resubmitted_at(&current, &next, 22520.0, t(5)).unwrap();
        assert_eq!(tracker.live_order_for("p-1").unwrap().retry_count, 5);

        // retry_count == max_retries: FAILED, purged from the live table.
        let outcome = tracker.process_cancel_report_at(&next, "FOK", t(6)).unwrap();
        match &outcome {
            CancelOutcome::Failed(order) => {
                assert_eq!(order.retry_count, 5);
                assert_eq!(order.status, ExitOrderStatus::Failed);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(tracker.live_order_for("p-1").is_none());
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(retries.load(Ordering::SeqCst), 5);

        // A FAILED order is never cancelled/resubmitted again.
        assert!(matches!(
            tracker.process_cancel_report_at(&next, "FOK", t(7)),
            Err(TrackerError::UnknownOrder(_))
        ));
    }

    #[test]
    fn non_retryable_cancel_fails_immediately() {
        let (tracker, _rx) = tracker();
        tracker.register_exit_order_at(request("o-1", "p-1", 22540.0), t(0)).unwrap();
        let outcome = tracker
            .process_cancel_report_at("o-1", "insufficient margin", t(1))
            .unwrap();
        assert!(matches!(outcome, CancelOutcome::Failed(_)));
        // Position may register a fresh exit.
        assert!(tracker.register_exit_order_at(request("o-2", "p-1", 22540.0), t(2)).is_ok());
    }

    #[test]
    fn resubmit_requires_retry_state() {
        let (tracker, _rx) = tracker();
        tracker.register_exit_order_at(request("o-1", "p-1", 22540.0), t(0)).unwrap();
        assert!(matches!(
            tracker.mark_resubmitted_at("o-1", "o-2", 22535.0, t(1)),
            Err(TrackerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cleanup_purges_old_terminal_and_expires_stale_live() {
        let (tracker, _rx) = tracker();
        tracker.register_exit_order_at(request("o-1", "p-1", 22540.0), t(0)).unwrap();
        tracker.process_fill_report_at(&fill(22540.0, 1), t(1)).unwrap();
        tracker.register_exit_order_at(request("o-2", "p-2", 22540.0), t(10)).unwrap();

        let report = tracker.cleanup_expired_at(Duration::seconds(300), t(305));
        assert_eq!(report.purged_terminal, 1);
        assert!(report.expired.is_empty());

        let report = tracker.cleanup_expired_at(Duration::seconds(300), t(400));
        assert_eq!(report.expired.len(), 1);
        assert_eq!(report.expired[0].order_id, "o-2");
        assert!(tracker.live_order_for("p-2").is_none());
        assert_eq!(tracker.stats().expired, 1);
    }
}
