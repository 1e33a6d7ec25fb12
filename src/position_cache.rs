// =============================================================================
// Position Cache — in-memory view of ACTIVE lots and their derived levels
// =============================================================================
//
// Holds, per position id, the persisted snapshot plus everything derived
// from it: the stop price, the trailing activation price and the trailing
// state. One mutex guards the whole map, so a price tick sees a consistent
// snapshot and a close removes a position and its derived levels together.
//
// Life-cycle of an entry:
//   load / on_new_position  ->  evaluator mutates trailing state
//                           ->  protection raises the stop
//                           ->  on_position_closed (tombstoned until the
//                               store stops reporting it as ACTIVE)
//
// Derived levels:
//   LONG   stop = range low    activation = entry + K
//   SHORT  stop = range high   activation = entry - K
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ValidationError};
use crate::store::{Position, PositionStore, StoreRow};
use crate::types::{Direction, PositionStatus, RangeData};

// ---------------------------------------------------------------------------
// Cache model
// ---------------------------------------------------------------------------

/// Per-position trailing state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailingState {
    pub activated: bool,
    /// Most favourable price since activation.
    pub peak_price: Option<f64>,
    /// Exit level derived from the peak; only moves in the favourable direction.
    pub trailing_stop: Option<f64>,
    pub pullback_ratio: f64,
    pub direction: Direction,
}

impl TrailingState {
    fn new(direction: Direction, pullback_ratio: f64) -> Self {
        Self {
            activated: false,
            peak_price: None,
            trailing_stop: None,
            pullback_ratio,
            direction,
        }
    }

    /// Trailing exit level for a given peak: the peak minus `pullback_ratio`
    /// of the entry-to-peak move.
    pub fn stop_for_peak(&self, entry_price: f64, peak: f64) -> f64 {
        let gained = (peak - entry_price).abs();
        match self.direction {
            Direction::Long => peak - gained * self.pullback_ratio,
            Direction::Short => peak + gained * self.pullback_ratio,
        }
    }

    /// Record a new peak and ratchet the trailing stop.
    pub fn set_peak(&mut self, entry_price: f64, peak: f64) {
        self.activated = true;
        self.peak_price = Some(peak);
        let candidate = self.stop_for_peak(entry_price, peak);
        self.trailing_stop = Some(match self.trailing_stop {
            Some(current) => self.direction.favourable(current, candidate),
            None => candidate,
        });
    }
}

/// One cached lot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub position: Position,
    pub stop_price: f64,
    pub activation_price: f64,
    pub trailing: TrailingState,
    /// Set when the evaluator hands this lot to exit initiation; cleared when
    /// the exit fails so the next tick re-evaluates it.
    pub exit_pending_since: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn id(&self) -> &str {
        &self.position.id
    }

    pub fn direction(&self) -> Direction {
        self.position.direction
    }
}

/// Initial stop and trailing activation derived from the entry range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedLevels {
    pub stop_price: f64,
    pub activation_price: f64,
}

/// Compute the initial stop and activation price of a lot.
///
/// Rejects non-finite or non-positive inputs instead of producing levels
/// that would silently never (or always) trigger.
pub fn compute_levels(
    id: &str,
    direction: Direction,
    entry_price: f64,
    range: RangeData,
    activation_points: f64,
) -> Result<DerivedLevels, ValidationError> {
    for (field, value) in [
        ("entry_price", entry_price),
        ("range_high", range.high),
        ("range_low", range.low),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(ValidationError::NonPositive {
                id: id.to_string(),
                field,
                value,
            });
        }
    }
    if range.low > range.high {
        return Err(ValidationError::InvertedRange {
            id: id.to_string(),
            high: range.high,
            low: range.low,
        });
    }

    Ok(match direction {
        Direction::Long => DerivedLevels {
            stop_price: range.low,
            activation_price: entry_price + activation_points,
        },
        Direction::Short => DerivedLevels {
            stop_price: range.high,
            activation_price: entry_price - activation_points,
        },
    })
}

/// Outcome of a protective stop write against the cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopChange {
    Applied { old_stop: f64 },
    NotImproving { current_stop: f64 },
    Missing,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub rows: usize,
    pub inserted: usize,
    pub refreshed: usize,
    pub removed: usize,
    pub rejected: usize,
    pub skipped_closed: usize,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CacheInner {
    entries: BTreeMap<String, CacheEntry>,
    group_ranges: HashMap<String, RangeData>,
    /// Ids closed locally whose exit write may not have reached the store yet.
    closed: HashSet<String>,
}

/// Thread-safe position cache. One instance per running engine.
pub struct PositionCache {
    inner: Mutex<CacheInner>,
    activation_points: f64,
    default_pullback_ratio: f64,
    loads: AtomicU64,
    rejected_rows: AtomicU64,
}

impl PositionCache {
    pub fn new(activation_points: f64, default_pullback_ratio: f64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            activation_points,
            default_pullback_ratio,
            loads: AtomicU64::new(0),
            rejected_rows: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation with the durable store
    // -------------------------------------------------------------------------

    /// Reload ACTIVE positions from the store. Idempotent.
    pub fn load(&self, store: &dyn PositionStore) -> Result<LoadSummary, EngineError> {
        let rows = store.fetch_active_positions().map_err(EngineError::Store)?;
        Ok(self.reconcile_rows(&rows))
    }

    /// Merge a full set of ACTIVE rows into the cache.
    ///
    /// Positions absent from `rows` are dropped. Positions already cached
    /// keep their in-cache mutations (trailing state, raised stops, pending
    /// exit); the store can only move a stop in the favourable direction.
    /// Malformed rows are rejected one by one.
    pub fn reconcile_rows(&self, rows: &[StoreRow]) -> LoadSummary {
        let mut summary = LoadSummary {
            rows: rows.len(),
            ..LoadSummary::default()
        };
        let mut seen: HashSet<String> = HashSet::with_capacity(rows.len());
        let mut fresh: Vec<CacheEntry> = Vec::with_capacity(rows.len());
        let ranges = self.inner.lock().group_ranges.clone();

        for row in rows {
            if let Some(id) = row_id(row) {
                seen.insert(id);
            }
            let built = Position::from_row(row).and_then(|p| {
                let range = ranges.get(&p.group_id).copied();
                self.build_entry(p, range)
            });
            match built {
                Ok(entry) => fresh.push(entry),
                Err(e) => {
                    summary.rejected += 1;
                    self.rejected_rows.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "position row rejected during reconciliation");
                }
            }
        }

        let mut inner = self.inner.lock();

        // Store has caught up with these local closes.
        inner.closed.retain(|id| seen.contains(id));

        let before = inner.entries.len();
        inner.entries.retain(|id, _| seen.contains(id));
        summary.removed = before - inner.entries.len();

        for entry in fresh {
            let id = entry.position.id.clone();
            if inner.closed.contains(&id) {
                summary.skipped_closed += 1;
                continue;
            }
            match inner.entries.get_mut(&id) {
                Some(cached) => {
                    merge_into(cached, entry);
                    summary.refreshed += 1;
                }
                None => {
                    inner.entries.insert(id, entry);
                    summary.inserted += 1;
                }
            }
        }
        let cached = inner.entries.len();
        drop(inner);

        self.loads.fetch_add(1, Ordering::Relaxed);
        info!(
            rows = summary.rows,
            cached,
            inserted = summary.inserted,
            refreshed = summary.refreshed,
            removed = summary.removed,
            rejected = summary.rejected,
            "position cache reconciled"
        );
        summary
    }

    // -------------------------------------------------------------------------
    // Incremental updates
    // -------------------------------------------------------------------------

    /// Insert a freshly filled position without waiting for reconciliation.
    /// Invalid input is rejected and nothing is inserted.
    pub fn on_new_position(&self, position: Position) -> Result<(), ValidationError> {
        if position.status != PositionStatus::Active {
            return Err(ValidationError::Malformed(format!(
                "position {} is not ACTIVE",
                position.id
            )));
        }
        let range = self.group_range(&position.group_id);
        let entry = self.build_entry(position, range)?;
        let id = entry.position.id.clone();

        let mut inner = self.inner.lock();
        inner.closed.remove(&id);
        let stop = entry.stop_price;
        let activation = entry.activation_price;
        match inner.entries.get_mut(&id) {
            Some(cached) => merge_into(cached, entry),
            None => {
                inner.entries.insert(id.clone(), entry);
            }
        }
        drop(inner);

        info!(id = %id, stop, activation, "position added to cache");
        Ok(())
    }

    /// Raw-row variant of [`PositionCache::on_new_position`].
    pub fn on_new_position_row(&self, row: &StoreRow) -> Result<(), ValidationError> {
        self.on_new_position(Position::from_row(row)?)
    }

    /// Remove a position and all of its derived levels.
    pub fn on_position_closed(&self, position_id: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(position_id);
        inner.closed.insert(position_id.to_string());
        drop(inner);

        match &removed {
            Some(_) => info!(id = position_id, "position removed from cache"),
            None => debug!(id = position_id, "close for uncached position"),
        }
        removed
    }

    /// Record a group's range and derive initial stops for its lots that are
    /// still on their initial stop. Returns the number of lots updated; a
    /// repeat call with the same range is a no-op.
    pub fn set_group_range(&self, group_id: &str, range: RangeData) -> Result<usize, ValidationError> {
        compute_levels(group_id, Direction::Long, range.high, range, 0.0)?;

        let mut inner = self.inner.lock();
        if inner.group_ranges.get(group_id) == Some(&range) {
            debug!(group_id, "group range already set up");
            return Ok(0);
        }
        inner.group_ranges.insert(group_id.to_string(), range);

        let mut updated = 0;
        for entry in inner.entries.values_mut() {
            if entry.position.group_id != group_id
                || entry.position.protected
                || entry.trailing.activated
            {
                continue;
            }
            let levels = compute_levels(
                &entry.position.id,
                entry.position.direction,
                entry.position.entry_price,
                range,
                self.activation_points,
            )?;
            entry.position.range_high = range.high;
            entry.position.range_low = range.low;
            entry.stop_price = levels.stop_price;
            entry.activation_price = levels.activation_price;
            updated += 1;
        }
        drop(inner);

        info!(group_id, high = range.high, low = range.low, updated, "group initial stops set");
        Ok(updated)
    }

    /// Raise a lot's stop if `new_stop` strictly improves on the current one.
    /// The check and the write happen under one lock.
    pub fn apply_protective_stop(&self, position_id: &str, new_stop: f64) -> StopChange {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(position_id) else {
            return StopChange::Missing;
        };
        if !new_stop.is_finite() || !entry.direction().improves(new_stop, entry.stop_price) {
            return StopChange::NotImproving {
                current_stop: entry.stop_price,
            };
        }
        let old_stop = entry.stop_price;
        entry.stop_price = new_stop;
        entry.position.stop_price = Some(new_stop);
        entry.position.protected = true;
        StopChange::Applied { old_stop }
    }

    /// Mark a lot as handed to exit initiation. An existing pending
    /// timestamp is kept.
    pub fn mark_exit_pending(&self, position_id: &str, at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(position_id) {
            Some(entry) => {
                entry.exit_pending_since.get_or_insert(at);
                true
            }
            None => false,
        }
    }

    /// Allow the evaluator to trigger this position again.
    pub fn clear_exit_pending(&self, position_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(position_id) {
            Some(entry) => entry.exit_pending_since.take().is_some(),
            None => false,
        }
    }

    /// Run `f` against the entries inside a single critical section.
    pub fn with_entries_mut<R>(&self, f: impl FnOnce(&mut BTreeMap<String, CacheEntry>) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.entries)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn entry(&self, position_id: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(position_id).cloned()
    }

    /// Range recorded by [`PositionCache::set_group_range`], if any.
    pub fn group_range(&self, group_id: &str) -> Option<RangeData> {
        self.inner.lock().group_ranges.get(group_id).copied()
    }

    pub fn group_entries(&self, group_id: &str) -> Vec<CacheEntry> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.position.group_id == group_id)
            .cloned()
            .collect()
    }

    /// Copy of every cached entry, ordered by position id.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn rejected_rows(&self) -> u64 {
        self.rejected_rows.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// `group_range` is the locally recorded group range; it wins over the
    /// row's range until the store has caught up with it.
    fn build_entry(
        &self,
        mut position: Position,
        group_range: Option<RangeData>,
    ) -> Result<CacheEntry, ValidationError> {
        if let Some(range) = group_range {
            position.range_high = range.high;
            position.range_low = range.low;
        }
        let range = RangeData {
            high: position.range_high,
            low: position.range_low,
        };
        let levels = compute_levels(
            &position.id,
            position.direction,
            position.entry_price,
            range,
            self.activation_points,
        )?;

        let direction = position.direction;
        let stop_price = match position.stop_price {
            Some(stored) if position.protected => direction.favourable(levels.stop_price, stored),
            _ => levels.stop_price,
        };

        let pullback = position
            .pullback_ratio
            .filter(|r| r.is_finite() && *r > 0.0 && *r < 1.0)
            .unwrap_or(self.default_pullback_ratio);
        let mut trailing = TrailingState::new(direction, pullback);
        if position.trailing_activated {
            let peak = position.peak_price.unwrap_or(levels.activation_price);
            trailing.set_peak(position.entry_price, peak);
        }

        position.stop_price = Some(stop_price);
        position.peak_price = trailing.peak_price;

        Ok(CacheEntry {
            position,
            stop_price,
            activation_price: levels.activation_price,
            trailing,
            exit_pending_since: None,
        })
    }
}

/// Merge a freshly built entry into a cached one without losing in-cache
/// progress.
fn merge_into(cached: &mut CacheEntry, fresh: CacheEntry) {
    let direction = cached.direction();

    let stop_price = direction.favourable(cached.stop_price, fresh.stop_price);
    let protected = cached.position.protected || fresh.position.protected;

    let trailing = match (cached.trailing.activated, fresh.trailing.activated) {
        (true, true) => {
            let mut merged = cached.trailing.clone();
            if let (Some(a), Some(b)) = (cached.trailing.peak_price, fresh.trailing.peak_price) {
                merged.set_peak(cached.position.entry_price, direction.favourable(a, b));
            }
            merged
        }
        (false, true) => fresh.trailing.clone(),
        _ => cached.trailing.clone(),
    };

    let activation_price = if trailing.activated {
        cached.activation_price
    } else {
        fresh.activation_price
    };
    let exit_pending_since = cached.exit_pending_since;

    cached.position = fresh.position;
    cached.position.protected = protected;
    cached.position.stop_price = Some(stop_price);
    cached.position.trailing_activated = trailing.activated;
    cached.position.peak_price = trailing.peak_price;
    cached.stop_price = stop_price;
    cached.activation_price = activation_price;
    cached.trailing = trailing;
    cached.exit_pending_since = exit_pending_since;
}

fn row_id(row: &StoreRow) -> Option<String> {
    match row.get("id") {
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

impl std::fmt::Debug for PositionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PositionCache")
            .field("entries", &inner.entries.len())
            .field("groups", &inner.group_ranges.len())
            .field("activation_points", &self.activation_points)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn lot(id: &str, direction: Direction, entry: f64) -> Position {
        Position {
            id: id.into(),
            group_id: "g-1".into(),
            lot_number: 1,
            direction,
            entry_price: entry,
            quantity: 1,
            range_high: 22560.0,
            range_low: 22500.0,
            stop_price: None,
            peak_price: None,
            trailing_activated: false,
            protected: false,
            pullback_ratio: None,
            status: PositionStatus::Active,
            realized_pnl: None,
        }
    }

    #[test]
    fn long_levels_come_from_range_low() {
        let cache = PositionCache::new(15.0, 0.2);
        cache.on_new_position(lot("a", Direction::Long, 22540.0)).unwrap();
        let e = cache.entry("a").unwrap();
        assert_eq!(e.stop_price, 22500.0);
        assert_eq!(e.activation_price, 22555.0);
        assert!(!e.trailing.activated);
    }

    #[test]
    fn short_levels_come_from_range_high() {
        let cache = PositionCache::new(15.0, 0.2);
        cache.on_new_position(lot("s", Direction::Short, 22540.0)).unwrap();
        let e = cache.entry("s").unwrap();
        assert_eq!(e.stop_price, 22560.0);
        assert_eq!(e.activation_price, 22525.0);
    }

    #[test]
    fn invalid_position_is_rejected_without_touching_others() {
        let cache = PositionCache::new(15.0, 0.2);
        cache.on_new_position(lot("good", Direction::Long, 22540.0)).unwrap();

        let mut bad = lot("bad", Direction::Long, f64::NAN);
        assert!(cache.on_new_position(bad.clone()).is_err());
        bad.entry_price = 22540.0;
        bad.range_low = 0.0;
        assert!(cache.on_new_position(bad).is_err());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entry("good").unwrap().stop_price, 22500.0);
    }

    #[test]
    fn close_removes_entry_and_blocks_stale_reload() {
        let store = InMemoryStore::new();
        store.insert_position(lot("a", Direction::Long, 22540.0));
        let cache = PositionCache::new(15.0, 0.2);
        cache.load(&store).unwrap();

        assert!(cache.on_position_closed("a").is_some());
        assert!(cache.entry("a").is_none());

        // Exit write not yet applied: the store still reports the lot ACTIVE.
        let summary = cache.load(&store).unwrap();
        assert_eq!(summary.skipped_closed, 1);
        assert!(cache.entry("a").is_none());

        // Store caught up; tombstone dropped.
        store.mark_exited("a", 10.0);
        cache.load(&store).unwrap();
        store.insert_position(lot("a", Direction::Long, 22540.0));
        cache.load(&store).unwrap();
        assert!(cache.entry("a").is_some());
    }

    #[test]
    fn load_is_idempotent() {
        let store = InMemoryStore::new();
        store.insert_position(lot("a", Direction::Long, 22540.0));
        store.insert_position(lot("b", Direction::Short, 22540.0));
        let cache = PositionCache::new(15.0, 0.2);

        cache.load(&store).unwrap();
        let first = cache.snapshot();
        cache.load(&store).unwrap();
        assert_eq!(cache.snapshot(), first);
    }

    #[test]
    fn load_preserves_in_cache_mutations_and_drops_removed() {
        let store = InMemoryStore::new();
        store.insert_position(lot("a", Direction::Long, 22540.0));
        store.insert_position(lot("b", Direction::Long, 22540.0));
        let cache = PositionCache::new(15.0, 0.2);
        cache.load(&store).unwrap();

        cache.with_entries_mut(|entries| {
            let e = entries.get_mut("a").unwrap();
            e.trailing.set_peak(22540.0, 22580.0);
        });
        assert!(matches!(
            cache.apply_protective_stop("a", 22520.0),
            StopChange::Applied { .. }
        ));
        store.mark_exited("b", 5.0);

        let summary = cache.load(&store).unwrap();
        assert_eq!(summary.removed, 1);
        let a = cache.entry("a").unwrap();
        assert!(a.trailing.activated);
        assert_eq!(a.trailing.peak_price, Some(22580.0));
        assert_eq!(a.stop_price, 22520.0);
    }

    #[test]
    fn malformed_rows_are_rejected_individually() {
        let cache = PositionCache::new(15.0, 0.2);
        let good = lot("a", Direction::Long, 22540.0).to_row();
        let mut bad = lot("b", Direction::Long, 22540.0).to_row();
        bad.remove("range_high");

        let summary = cache.reconcile_rows(&[good, bad]);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(cache.rejected_rows(), 1);
    }

    #[test]
    fn protective_stop_must_improve() {
        let cache = PositionCache::new(15.0, 0.2);
        cache.on_new_position(lot("a", Direction::Long, 22540.0)).unwrap();
        assert_eq!(
            cache.apply_protective_stop("a", 22490.0),
            StopChange::NotImproving { current_stop: 22500.0 }
        );
        assert_eq!(cache.apply_protective_stop("zzz", 1.0), StopChange::Missing);
        assert_eq!(
            cache.apply_protective_stop("a", 22530.0),
            StopChange::Applied { old_stop: 22500.0 }
        );
        assert!(cache.entry("a").unwrap().position.protected);
    }

    #[test]
    fn group_range_setup_is_idempotent() {
        let cache = PositionCache::new(15.0, 0.2);
        cache.on_new_position(lot("a", Direction::Long, 22540.0)).unwrap();
        let range = RangeData { high: 22570.0, low: 22490.0 };

        assert_eq!(cache.set_group_range("g-1", range).unwrap(), 1);
        assert_eq!(cache.set_group_range("g-1", range).unwrap(), 0);
        assert_eq!(cache.entry("a").unwrap().stop_price, 22490.0);
        assert!(cache
            .set_group_range("g-2", RangeData { high: 1.0, low: 2.0 })
            .is_err());
    }

    #[test]
    fn group_range_survives_reload_before_store_catches_up() {
        let store = InMemoryStore::new();
        store.insert_position(lot("a", Direction::Long, 22540.0));
        let cache = PositionCache::new(15.0, 0.2);
        cache.load(&store).unwrap();

        // Widened range: the LONG stop moves down, away from the row's range.
        let range = RangeData { high: 22560.0, low: 22470.0 };
        assert_eq!(cache.set_group_range("g-1", range).unwrap(), 1);
        cache.load(&store).unwrap();
        let a = cache.entry("a").unwrap();
        assert_eq!(a.stop_price, 22470.0);
        assert_eq!(a.position.range_low, 22470.0);

        // Lots added later pick up the recorded range too.
        cache.on_new_position(lot("b", Direction::Long, 22540.0)).unwrap();
        assert_eq!(cache.entry("b").unwrap().stop_price, 22470.0);
        assert_eq!(cache.group_range("g-1"), Some(range));
    }

    #[test]
    fn trailing_stop_only_ratchets_forward() {
        let mut t = TrailingState::new(Direction::Short, 0.5);
        t.set_peak(22540.0, 22500.0);
        assert_eq!(t.trailing_stop, Some(22520.0));
        t.set_peak(22540.0, 22480.0);
        assert_eq!(t.trailing_stop, Some(22510.0));
    }
}
