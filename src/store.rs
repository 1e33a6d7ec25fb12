// =============================================================================
// Durable Store Contract — typed boundary between the engine and storage
// =============================================================================
//
// The storage engine itself lives outside this crate. The engine only needs:
//   (a) all ACTIVE positions joined with their group's range,
//   (b) stop / protection / trailing field updates by position id,
//   (c) status / exit field updates by position id on fill,
//   (d) realised P&L of EXITED positions by group id.
//
// Rows come back as loose key/value maps and are mapped into `Position` here;
// anything missing or mistyped is a `ValidationError` for that one row.
//
// `InMemoryStore` implements the contract for paper trading and tests.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::types::{Direction, PositionStatus, RangeData};

/// A raw row as returned by the store.
pub type StoreRow = Map<String, Value>;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// One lot of a group, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub group_id: String,
    pub lot_number: u32,
    pub direction: Direction,
    pub entry_price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub range_high: f64,
    pub range_low: f64,
    /// Last persisted stop. `None` until the engine has written one.
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub peak_price: Option<f64>,
    #[serde(default)]
    pub trailing_activated: bool,
    /// Stop has been raised by cumulative profit protection.
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub pullback_ratio: Option<f64>,
    #[serde(default)]
    pub status: PositionStatus,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

fn default_quantity() -> u32 {
    1
}

impl Position {
    /// Map a store row into a typed position, validating every field the
    /// engine relies on.
    pub fn from_row(row: &StoreRow) -> Result<Self, ValidationError> {
        let id = match row.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(ValidationError::Malformed(format!("id has unexpected value {other}")))
            }
            None => return Err(ValidationError::Malformed("row has no `id`".to_string())),
        };

        let group_id = match row.get("group_id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(missing(&id, "group_id")),
        };

        let lot_number = row
            .get("lot_number")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| missing(&id, "lot_number"))?;

        let raw_direction = row
            .get("direction")
            .and_then(Value::as_str)
            .ok_or_else(|| missing(&id, "direction"))?;
        let direction = Direction::parse(raw_direction).ok_or_else(|| {
            ValidationError::UnknownDirection {
                id: id.clone(),
                raw: raw_direction.to_string(),
            }
        })?;

        let entry_price = positive_field(row, &id, "entry_price")?;
        let range_high = positive_field(row, &id, "range_high")?;
        let range_low = positive_field(row, &id, "range_low")?;
        if range_low > range_high {
            return Err(ValidationError::InvertedRange {
                id,
                high: range_high,
                low: range_low,
            });
        }

        let quantity = match row.get("quantity") {
            None | Some(Value::Null) => default_quantity(),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| missing(&id, "quantity"))?,
        };

        let status = match row.get("status").and_then(Value::as_str) {
            None => PositionStatus::Active,
            Some(s) if s.eq_ignore_ascii_case("ACTIVE") => PositionStatus::Active,
            Some(s) if s.eq_ignore_ascii_case("EXITED") => PositionStatus::Exited,
            Some(s) => {
                return Err(ValidationError::Malformed(format!(
                    "position {id}: unknown status `{s}`"
                )))
            }
        };

        Ok(Self {
            group_id,
            lot_number,
            direction,
            entry_price,
            quantity,
            range_high,
            range_low,
            stop_price: optional_positive(row, &id, "stop_price")?,
            peak_price: optional_positive(row, &id, "peak_price")?,
            trailing_activated: optional_bool(row, "trailing_activated"),
            protected: optional_bool(row, "protected"),
            pullback_ratio: optional_positive(row, &id, "pullback_ratio")?,
            status,
            realized_pnl: row.get("realized_pnl").and_then(Value::as_f64),
            id,
        })
    }

    /// Inverse of [`Position::from_row`].
    pub fn to_row(&self) -> StoreRow {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => StoreRow::new(),
        }
    }
}

fn missing(id: &str, field: &'static str) -> ValidationError {
    ValidationError::MissingField {
        id: id.to_string(),
        field,
    }
}

fn positive_field(row: &StoreRow, id: &str, field: &'static str) -> Result<f64, ValidationError> {
    let value = row
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| missing(id, field))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ValidationError::NonPositive {
            id: id.to_string(),
            field,
            value,
        });
    }
    Ok(value)
}

fn optional_positive(
    row: &StoreRow,
    id: &str,
    field: &'static str,
) -> Result<Option<f64>, ValidationError> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => positive_field(row, id, field).map(Some),
    }
}

fn optional_bool(row: &StoreRow, field: &str) -> bool {
    match row.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Write records
// ---------------------------------------------------------------------------

/// A protective-stop change, persisted to the position and the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveStopWrite {
    pub position_id: String,
    pub group_id: String,
    pub stop_price: f64,
    pub cumulative_profit: f64,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Trailing state of a position after activation or a new peak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingWrite {
    pub position_id: String,
    pub peak_price: f64,
    pub at: DateTime<Utc>,
}

/// A group's entry range, replacing the one recorded at group creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRangeWrite {
    pub group_id: String,
    pub range: RangeData,
    pub at: DateTime<Utc>,
}

/// Exit of a position after its exit order filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionExit {
    pub position_id: String,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub reason: String,
    pub pnl: f64,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Read/write contract the engine needs from the durable store.
///
/// Implementations may block; the engine only calls them from the
/// persistence worker or from reconciliation, never from the tick or fill
/// path.
pub trait PositionStore: Send + Sync {
    /// All ACTIVE positions joined with their group's `range_high`/`range_low`.
    fn fetch_active_positions(&self) -> Result<Vec<StoreRow>>;

    /// Realised P&L of EXITED positions in `group_id`, keyed by position id.
    fn exited_pnl_by_group(&self, group_id: &str) -> Result<Vec<(String, f64)>>;

    fn write_protective_stop(&self, write: &ProtectiveStopWrite) -> Result<()>;

    fn write_trailing_state(&self, write: &TrailingWrite) -> Result<()>;

    fn write_group_range(&self, write: &GroupRangeWrite) -> Result<()>;

    fn record_exit(&self, exit: &PositionExit) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    groups: HashMap<String, RangeData>,
    positions: HashMap<String, Position>,
    exits: HashMap<String, PositionExit>,
    stop_events: Vec<ProtectiveStopWrite>,
}

/// Thread-safe in-memory store. Positions carry their range inline; a group
/// range registered with [`InMemoryStore::insert_group`] takes precedence when
/// rows are joined.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_group(&self, group_id: &str, range: RangeData) {
        self.inner.write().groups.insert(group_id.to_string(), range);
    }

    pub fn insert_position(&self, position: Position) {
        self.inner
            .write()
            .positions
            .insert(position.id.clone(), position);
    }

    /// Mark a position EXITED with a realised P&L without going through an
    /// exit order (seeding and tests).
    pub fn mark_exited(&self, position_id: &str, pnl: f64) {
        if let Some(pos) = self.inner.write().positions.get_mut(position_id) {
            pos.status = PositionStatus::Exited;
            pos.realized_pnl = Some(pnl);
        }
    }

    pub fn group(&self, group_id: &str) -> Option<RangeData> {
        self.inner.read().groups.get(group_id).copied()
    }

    pub fn position(&self, position_id: &str) -> Option<Position> {
        self.inner.read().positions.get(position_id).cloned()
    }

    pub fn exit_record(&self, position_id: &str) -> Option<PositionExit> {
        self.inner.read().exits.get(position_id).cloned()
    }

    /// Protective-stop event log, oldest first.
    pub fn stop_events(&self) -> Vec<ProtectiveStopWrite> {
        self.inner.read().stop_events.clone()
    }

    /// Make every subsequent write fail (fault injection).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("store is rejecting writes");
        }
        Ok(())
    }
}

impl PositionStore for InMemoryStore {
    fn fetch_active_positions(&self) -> Result<Vec<StoreRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<StoreRow> = inner
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Active)
            .map(|p| {
                let mut row = p.to_row();
                if let Some(range) = inner.groups.get(&p.group_id) {
                    row.insert("range_high".into(), Value::from(range.high));
                    row.insert("range_low".into(), Value::from(range.low));
                }
                row
            })
            .collect();
        rows.sort_by(|a, b| {
            let ka = a.get("id").and_then(Value::as_str).unwrap_or_default();
            let kb = b.get("id").and_then(Value::as_str).unwrap_or_default();
            ka.cmp(kb)
        });
        Ok(rows)
    }

    fn exited_pnl_by_group(&self, group_id: &str) -> Result<Vec<(String, f64)>> {
        let inner = self.inner.read();
        Ok(inner
            .positions
            .values()
            .filter(|p| p.group_id == group_id && p.status == PositionStatus::Exited)
            .map(|p| (p.id.clone(), p.realized_pnl.unwrap_or(0.0)))
            .collect())
    }

    fn write_protective_stop(&self, write: &ProtectiveStopWrite) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let Some(pos) = inner.positions.get_mut(&write.position_id) else {
            bail!("unknown position {}", write.position_id);
        };
        pos.stop_price = Some(write.stop_price);
        pos.protected = true;
        inner.stop_events.push(write.clone());
        Ok(())
    }

    fn write_trailing_state(&self, write: &TrailingWrite) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let Some(pos) = inner.positions.get_mut(&write.position_id) else {
            bail!("unknown position {}", write.position_id);
        };
        pos.trailing_activated = true;
        pos.peak_price = Some(write.peak_price);
        Ok(())
    }

    fn write_group_range(&self, write: &GroupRangeWrite) -> Result<()> {
        self.check_writable()?;
        self.inner
            .write()
            .groups
            .insert(write.group_id.clone(), write.range);
        Ok(())
    }

    fn record_exit(&self, exit: &PositionExit) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let Some(pos) = inner.positions.get_mut(&exit.position_id) else {
            bail!("unknown position {}", exit.position_id);
        };
        pos.status = PositionStatus::Exited;
        pos.realized_pnl = Some(exit.pnl);
        inner.exits.insert(exit.position_id.clone(), exit.clone());
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("InMemoryStore")
            .field("groups", &inner.groups.len())
            .field("positions", &inner.positions.len())
            .field("stop_events", &inner.stop_events.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
