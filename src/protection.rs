// =============================================================================
// Cumulative Profit Protection
// =============================================================================
//
// When a lot of a group exits with profit, the lots of that group still on
// their initial stop get a protective stop locked in beyond entry:
//
//   cumulative = sum of realised P&L of every EXITED lot in the group
//   LONG:  stop = entry + cumulative * multiplier(lot)
//   SHORT: stop = entry - cumulative * multiplier(lot)
//
// A candidate is applied only if it strictly improves on the lot's current
// stop; otherwise it is rejected and counted. Applied updates are persisted
// through the queue, appended to the in-memory history and published.
//
// Realised P&L comes from an in-memory ledger: every fill records its lot,
// reconciliation merges the store's EXITED rows by position id. Exit writes
// still sitting in the queue therefore count, and no store read happens
// while a fill is handled.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::persistence::{PersistCommand, PersistenceQueue};
use crate::position_cache::{PositionCache, StopChange};
use crate::runtime_config::EngineConfig;
use crate::store::{PositionStore, ProtectiveStopWrite};

/// One applied protective-stop recalculation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionUpdate {
    pub position_id: String,
    pub group_id: String,
    pub lot_number: u32,
    pub old_stop: f64,
    pub new_stop: f64,
    pub cumulative_profit: f64,
    pub multiplier: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtectionStats {
    pub runs: u64,
    pub applied: u64,
    pub rejected: u64,
}

pub struct ProfitProtection {
    store: Arc<dyn PositionStore>,
    cache: Arc<PositionCache>,
    persistence: PersistenceQueue,
    events: Arc<EventBus>,
    config: EngineConfig,
    /// group id -> position id -> realised P&L. Fed by every fill and seeded
    /// from the store during reconciliation, so the fill path never reads
    /// the store.
    realised: Mutex<HashMap<String, HashMap<String, f64>>>,
    history: Mutex<Vec<ProtectionUpdate>>,
    runs: AtomicU64,
    applied: AtomicU64,
    rejected: AtomicU64,
}

impl ProfitProtection {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PositionStore>,
        cache: Arc<PositionCache>,
        persistence: PersistenceQueue,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            cache,
            persistence,
            events,
            config,
            realised: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            runs: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Realised P&L ledger
    // -------------------------------------------------------------------------

    /// Record the realised P&L of an exited lot, winning or losing.
    pub fn record_realised(&self, group_id: &str, position_id: &str, pnl: f64) {
        if !pnl.is_finite() {
            warn!(group_id, id = position_id, pnl, "non-finite realised P&L ignored");
            return;
        }
        self.realised
            .lock()
            .entry(group_id.to_string())
            .or_default()
            .insert(position_id.to_string(), pnl);
    }

    /// Sum of realised P&L of every exited lot of `group_id` seen so far.
    pub fn cumulative_profit(&self, group_id: &str) -> f64 {
        self.realised
            .lock()
            .get(group_id)
            .map(|lots| lots.values().sum())
            .unwrap_or(0.0)
    }

    /// Merge EXITED P&L from the store for every group with cached lots, and
    /// drop ledgers of groups with none left. Blocking; call from
    /// reconciliation, never from the tick or fill path. Returns the number
    /// of groups read.
    pub fn sync_exited_from_store(&self) -> usize {
        let groups: HashSet<String> = self
            .cache
            .snapshot()
            .into_iter()
            .map(|e| e.position.group_id)
            .collect();

        let mut fetched = Vec::with_capacity(groups.len());
        for group_id in &groups {
            match self.store.exited_pnl_by_group(group_id) {
                Ok(rows) => fetched.push((group_id.clone(), rows)),
                Err(e) => warn!(group_id = %group_id, error = %e, "exited P&L lookup failed — keeping local ledger"),
            }
        }
        let synced = fetched.len();

        let live: HashSet<String> = self
            .cache
            .snapshot()
            .into_iter()
            .map(|e| e.position.group_id)
            .collect();

        let mut ledger = self.realised.lock();
        for (group_id, rows) in fetched {
            let lots = ledger.entry(group_id).or_default();
            for (position_id, pnl) in rows.into_iter().filter(|(_, p)| p.is_finite()) {
                lots.insert(position_id, pnl);
            }
        }
        ledger.retain(|group_id, _| live.contains(group_id) || groups.contains(group_id));
        drop(ledger);

        debug!(groups = synced, "realised P&L ledger synced");
        synced
    }

    // -------------------------------------------------------------------------
    // Protective stops
    // -------------------------------------------------------------------------

    pub fn update_protective_stops(
        &self,
        group_id: &str,
        exited_position_id: &str,
    ) -> Vec<ProtectionUpdate> {
        self.update_protective_stops_at(group_id, exited_position_id, Utc::now())
    }

    /// Recompute protective stops for `group_id` after `exited_position_id`
    /// closed. The exiting lot's P&L must already be in the ledger
    /// ([`ProfitProtection::record_realised`]).
    pub fn update_protective_stops_at(
        &self,
        group_id: &str,
        exited_position_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<ProtectionUpdate> {
        self.runs.fetch_add(1, Ordering::Relaxed);

        let cumulative = self.cumulative_profit(group_id);
        if cumulative <= 0.0 {
            debug!(group_id, cumulative, "no cumulative profit — stops unchanged");
            return Vec::new();
        }

        let candidates: Vec<_> = self
            .cache
            .group_entries(group_id)
            .into_iter()
            .filter(|e| e.id() != exited_position_id)
            .filter(|e| !e.trailing.activated && !e.position.protected)
            .collect();

        let mut updates = Vec::with_capacity(candidates.len());
        for entry in candidates {
            let multiplier = self.config.multiplier_for_lot(entry.position.lot_number);
            let candidate = entry.position.entry_price
                + entry.direction().sign() * cumulative * multiplier;

            match self.cache.apply_protective_stop(entry.id(), candidate) {
                StopChange::Applied { old_stop } => {
                    let update = ProtectionUpdate {
                        position_id: entry.position.id.clone(),
                        group_id: group_id.to_string(),
                        lot_number: entry.position.lot_number,
                        old_stop,
                        new_stop: candidate,
                        cumulative_profit: cumulative,
                        multiplier,
                        timestamp: now,
                    };
                    self.applied.fetch_add(1, Ordering::Relaxed);
                    info!(
                        id = %update.position_id,
                        group_id,
                        lot = update.lot_number,
                        old_stop,
                        new_stop = candidate,
                        cumulative,
                        multiplier,
                        "protective stop applied"
                    );
                    self.persistence
                        .enqueue(PersistCommand::ProtectiveStop(ProtectiveStopWrite {
                            position_id: update.position_id.clone(),
                            group_id: group_id.to_string(),
                            stop_price: candidate,
                            cumulative_profit: cumulative,
                            reason: format!("cumulative profit after {exited_position_id} exit"),
                            at: now,
                        }));
                    self.history.lock().push(update.clone());
                    updates.push(update);
                }
                StopChange::NotImproving { current_stop } => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    info!(
                        id = %entry.position.id,
                        candidate,
                        current_stop,
                        direction = %entry.direction(),
                        "protective stop rejected — does not improve current stop"
                    );
                }
                StopChange::Missing => {
                    debug!(id = %entry.position.id, "lot left the cache before protection");
                }
            }
        }

        for update in &updates {
            self.events.emit_protection_update(update);
        }
        updates
    }

    /// Applied updates, oldest first.
    pub fn history(&self) -> Vec<ProtectionUpdate> {
        self.history.lock().clone()
    }

    pub fn stats(&self) -> ProtectionStats {
        ProtectionStats {
            runs: self.runs.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ProfitProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfitProtection")
            .field("stats", &self.stats())
            .finish()
    }
}
