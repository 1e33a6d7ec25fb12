// =============================================================================
// Trigger Evaluator — per-tick stop / trailing evaluation
// =============================================================================
//
// Runs once per price tick over every cached lot, in priority order:
//
//   1. Stop breach        LONG: price <= stop      SHORT: price >= stop
//                         -> exit trigger, nothing else evaluated this tick
//   2. Trailing activation (not yet activated)
//                         LONG: price >= activation SHORT: price <= activation
//                         -> peak = price, no exit this tick
//   3. Trailing tracking  (already activated)
//                         new favourable extreme -> peak update, no exit
//                         otherwise, price through the trailing stop
//                         -> trailing exit trigger
//
// The evaluator only mutates cache entries and returns what happened; exit
// initiation, deduplication and persistence happen in the caller, outside
// the cache lock.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::position_cache::CacheEntry;
use crate::store::TrailingWrite;
use crate::types::{Direction, ExitType};

/// Counters for one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    pub positions_evaluated: u32,
    pub stop_loss_triggers: u32,
    pub trailing_activations: u32,
    pub peak_updates: u32,
    pub trailing_exits: u32,
    pub skipped_pending: u32,
    pub skipped_invalid: u32,
}

impl TickStats {
    pub fn exit_triggers(&self) -> u32 {
        self.stop_loss_triggers + self.trailing_exits
    }
}

/// Everything exit initiation needs about one breached lot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitTrigger {
    pub position_id: String,
    pub group_id: String,
    pub lot_number: u32,
    pub direction: Direction,
    pub quantity: u32,
    pub entry_price: f64,
    pub exit_type: ExitType,
    pub trigger_price: f64,
    pub stop_price: f64,
    /// How far the tick went through the stop, in points (>= 0).
    pub breach: f64,
    pub at: DateTime<Utc>,
}

/// Result of evaluating one tick.
#[derive(Debug, Clone, Default)]
pub struct TickEvaluation {
    pub stats: TickStats,
    pub triggers: Vec<ExitTrigger>,
    pub trailing_writes: Vec<TrailingWrite>,
}

/// Evaluate `price` against every entry.
///
/// Lots with an exit already in flight (marked less than `pending_ttl` ago)
/// are skipped; after the TTL they become eligible again.
pub fn evaluate_tick(
    entries: &mut BTreeMap<String, CacheEntry>,
    price: f64,
    at: DateTime<Utc>,
    pending_ttl: Duration,
) -> Result<TickEvaluation, EngineError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(EngineError::InvalidPrice(price));
    }

    if let Some((key, entry)) = entries.iter().find(|(key, e)| **key != e.position.id) {
        return Err(EngineError::CacheInconsistent(format!(
            "entry keyed {key} holds position {}",
            entry.position.id
        )));
    }

    let mut eval = TickEvaluation::default();

    for entry in entries.values_mut() {
        if let Some(since) = entry.exit_pending_since {
            if at.signed_duration_since(since) < pending_ttl {
                eval.stats.skipped_pending += 1;
                continue;
            }
            debug!(id = %entry.position.id, "pending exit expired — re-evaluating");
            entry.exit_pending_since = None;
        }

        if !entry.stop_price.is_finite() || !entry.activation_price.is_finite() {
            eval.stats.skipped_invalid += 1;
            warn!(
                id = %entry.position.id,
                stop = entry.stop_price,
                activation = entry.activation_price,
                "cache entry has non-finite levels — skipped"
            );
            continue;
        }

        eval.stats.positions_evaluated += 1;
        evaluate_entry(entry, price, at, &mut eval);
    }

    Ok(eval)
}

fn evaluate_entry(entry: &mut CacheEntry, price: f64, at: DateTime<Utc>, eval: &mut TickEvaluation) {
    let direction = entry.direction();
    let is_long = direction == Direction::Long;
    let entry_price = entry.position.entry_price;

    // ── 1. Stop breach ──────────────────────────────────────────────
    let stop_hit = if is_long {
        price <= entry.stop_price
    } else {
        price >= entry.stop_price
    };
    if stop_hit {
        let exit_type = if entry.position.protected {
            ExitType::ProtectiveStop
        } else {
            ExitType::InitialStop
        };
        info!(
            id = %entry.position.id,
            direction = %direction,
            price,
            stop = entry.stop_price,
            exit_type = %exit_type,
            "stop breached"
        );
        eval.stats.stop_loss_triggers += 1;
        let stop = entry.stop_price;
        eval.triggers.push(trigger(entry, exit_type, price, stop, at));
        entry.exit_pending_since = Some(at);
        return;
    }

    // ── 2. Trailing activation ──────────────────────────────────────
    if !entry.trailing.activated {
        let activate = if is_long {
            price >= entry.activation_price
        } else {
            price <= entry.activation_price
        };
        if activate {
            entry.trailing.set_peak(entry_price, price);
            entry.position.trailing_activated = true;
            entry.position.peak_price = Some(price);
            eval.stats.trailing_activations += 1;
            eval.trailing_writes.push(TrailingWrite {
                position_id: entry.position.id.clone(),
                peak_price: price,
                at,
            });
            info!(
                id = %entry.position.id,
                direction = %direction,
                price,
                activation = entry.activation_price,
                "trailing activated"
            );
        }
        return;
    }

    // ── 3. Trailing tracking ────────────────────────────────────────
    let peak = entry.trailing.peak_price.unwrap_or(price);
    let new_extreme = if is_long { price > peak } else { price < peak };
    if new_extreme {
        entry.trailing.set_peak(entry_price, price);
        entry.position.peak_price = Some(price);
        eval.stats.peak_updates += 1;
        eval.trailing_writes.push(TrailingWrite {
            position_id: entry.position.id.clone(),
            peak_price: price,
            at,
        });
        debug!(
            id = %entry.position.id,
            peak = price,
            trailing_stop = entry.trailing.trailing_stop.unwrap_or_default(),
            "peak updated"
        );
        return;
    }

    if let Some(trail) = entry.trailing.trailing_stop {
        let trail_hit = if is_long { price <= trail } else { price >= trail };
        if trail_hit {
            info!(
                id = %entry.position.id,
                direction = %direction,
                price,
                peak,
                trailing_stop = trail,
                "trailing stop hit"
            );
            eval.stats.trailing_exits += 1;
            eval.triggers
                .push(trigger(entry, ExitType::TrailingStop, price, trail, at));
            entry.exit_pending_since = Some(at);
        }
    }
}

fn trigger(
    entry: &CacheEntry,
    exit_type: ExitType,
    price: f64,
    stop_price: f64,
    at: DateTime<Utc>,
) -> ExitTrigger {
    ExitTrigger {
        position_id: entry.position.id.clone(),
        group_id: entry.position.group_id.clone(),
        lot_number: entry.position.lot_number,
        direction: entry.direction(),
        quantity: entry.position.quantity,
        entry_price: entry.position.entry_price,
        exit_type,
        trigger_price: price,
        stop_price,
        breach: (stop_price - price).abs(),
        at,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_cache::PositionCache;
    use crate::store::Position;
    use crate::types::PositionStatus;
    use chrono::TimeZone;

    const TTL: i64 = 30;

    fn cache_with(direction: Direction, entry: f64) -> PositionCache {
        let cache = PositionCache::new(15.0, 0.2);
        cache
            .on_new_position(Position {
                id: "p-1".into(),
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
            })
            .unwrap();
        cache
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tick(cache: &PositionCache, price: f64, secs: i64) -> TickEvaluation {
        cache
            .with_entries_mut(|e| evaluate_tick(e, price, t(secs), Duration::seconds(TTL)))
            .unwrap()
    }

    #[test]
    fn long_stop_breach_triggers_once_without_trailing() {
        let cache = cache_with(Direction::Long, 22540.0);
        let eval = tick(&cache, 22499.0, 0);

        assert_eq!(eval.stats.stop_loss_triggers, 1);
        assert_eq!(eval.stats.trailing_activations, 0);
        assert_eq!(eval.stats.peak_updates, 0);
        assert_eq!(eval.triggers.len(), 1);
        let trig = &eval.triggers[0];
        assert_eq!(trig.exit_type, ExitType::InitialStop);
        assert_eq!(trig.stop_price, 22500.0);
        assert_eq!(trig.breach, 1.0);

        // Exit in flight: the next tick does not trigger again.
        let eval = tick(&cache, 22495.0, 1);
        assert_eq!(eval.stats.stop_loss_triggers, 0);
        assert_eq!(eval.stats.skipped_pending, 1);
    }

    #[test]
    fn pending_exit_expires_after_ttl() {
        let cache = cache_with(Direction::Long, 22540.0);
        tick(&cache, 22499.0, 0);
        let eval = tick(&cache, 22498.0, TTL + 1);
        assert_eq!(eval.stats.stop_loss_triggers, 1);
    }

    #[test]
    fn short_trailing_activates_on_third_tick() {
        let cache = cache_with(Direction::Short, 22540.0);

        let first = tick(&cache, 22540.0, 0);
        let second = tick(&cache, 22530.0, 1);
        let third = tick(&cache, 22524.0, 2);

        assert_eq!(first.stats.trailing_activations, 0);
        assert_eq!(second.stats.trailing_activations, 0);
        assert_eq!(third.stats.trailing_activations, 1);
        assert!(third.triggers.is_empty());

        let e = cache.entry("p-1").unwrap();
        assert!(e.trailing.activated);
        assert_eq!(e.trailing.peak_price, Some(22524.0));
        assert_eq!(third.trailing_writes.len(), 1);
    }

    #[test]
    fn peak_tracks_favourable_extreme_only() {
        let cache = cache_with(Direction::Long, 22540.0);
        tick(&cache, 22560.0, 0); // activation at 22555
        let up = tick(&cache, 22590.0, 1);
        assert_eq!(up.stats.peak_updates, 1);
        let flat = tick(&cache, 22585.0, 2);
        assert_eq!(flat.stats.peak_updates, 0);
        assert!(flat.triggers.is_empty());
        assert_eq!(cache.entry("p-1").unwrap().trailing.peak_price, Some(22590.0));
    }

    #[test]
    fn long_trailing_exit_after_pullback() {
        let cache = cache_with(Direction::Long, 22540.0);
        tick(&cache, 22560.0, 0);
        tick(&cache, 22640.0, 1);
        // peak 22640, gained 100, pullback 0.2 -> trailing stop 22620
        assert_eq!(cache.entry("p-1").unwrap().trailing.trailing_stop, Some(22620.0));

        let eval = tick(&cache, 22618.0, 2);
        assert_eq!(eval.stats.trailing_exits, 1);
        assert_eq!(eval.triggers[0].exit_type, ExitType::TrailingStop);
        assert_eq!(eval.triggers[0].stop_price, 22620.0);
        assert_eq!(eval.triggers[0].breach, 2.0);
    }

    #[test]
    fn stop_check_takes_priority_over_trailing() {
        let cache = cache_with(Direction::Short, 22540.0);
        tick(&cache, 22520.0, 0);
        let eval = tick(&cache, 22561.0, 1);
        assert_eq!(eval.stats.stop_loss_triggers, 1);
        assert_eq!(eval.stats.trailing_exits, 0);
        assert_eq!(eval.triggers[0].exit_type, ExitType::InitialStop);
    }

    #[test]
    fn protected_lot_exits_as_protective_stop() {
        let cache = cache_with(Direction::Long, 22540.0);
        cache.apply_protective_stop("p-1", 22545.0);
        let eval = tick(&cache, 22544.0, 0);
        assert_eq!(eval.triggers[0].exit_type, ExitType::ProtectiveStop);
    }

    #[test]
    fn invalid_price_is_an_error() {
        let cache = cache_with(Direction::Long, 22540.0);
        let res = cache.with_entries_mut(|e| {
            evaluate_tick(e, f64::NAN, t(0), Duration::seconds(TTL))
        });
        assert!(matches!(res, Err(EngineError::InvalidPrice(_))));
    }

    #[test]
    fn mis_keyed_entry_fails_the_tick_before_any_mutation() {
        let cache = cache_with(Direction::Long, 22540.0);
        let mut stray = cache.entry("p-1").unwrap();
        stray.position.id = "p-9".into();
        cache.with_entries_mut(|e| e.insert("p-0".into(), stray));

        let res = cache.with_entries_mut(|e| {
            evaluate_tick(e, 22499.0, t(0), Duration::seconds(TTL))
        });
        assert!(matches!(res, Err(EngineError::CacheInconsistent(_))));
        assert!(cache.entry("p-1").unwrap().exit_pending_since.is_none());
    }
}
