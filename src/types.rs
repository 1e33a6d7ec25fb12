// =============================================================================
// Shared types used across the exit-guard engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Parse the store's textual direction ("LONG" / "SHORT", case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }

    /// +1 for longs, -1 for shorts. Multiplies a price move into P&L.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Whether `candidate` is strictly more favourable than `current` for a
    /// stop on this side (higher for longs, lower for shorts).
    pub fn improves(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// The more favourable of two stop levels.
    pub fn favourable(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Long => a.max(b),
            Self::Short => a.min(b),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle status of a position lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Active,
    Exited,
}

impl Default for PositionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Exited => write!(f, "EXITED"),
        }
    }
}

/// Why an exit was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitType {
    InitialStop,
    ProtectiveStop,
    TrailingStop,
    Manual,
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitialStop => write!(f, "initial_stop"),
            Self::ProtectiveStop => write!(f, "protective_stop"),
            Self::TrailingStop => write!(f, "trailing_stop"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Which component asked for an exit. Recorded on the exit lock for
/// diagnostics when a second source collides with the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    PriceTick,
    Reconciliation,
    External,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceTick => write!(f, "price_tick"),
            Self::Reconciliation => write!(f, "reconciliation"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Exit order state machine.
///
/// PENDING -> SUBMITTED -> { FILLED | CANCELLED } -> { RETRY -> SUBMITTED | FAILED }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitOrderStatus {
    Pending,
    Submitted,
    Filled,
    Cancelled,
    Failed,
    Retry,
}

impl ExitOrderStatus {
    /// Orders in these states can still be matched against a fill.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Submitted)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for ExitOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Retry => write!(f, "RETRY"),
        }
    }
}

/// Range boundaries of a group's breakout window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeData {
    pub high: f64,
    pub low: f64,
}

/// Normalise a product code for fill matching: trim, upper-case, and drop
/// the trailing contract-month digits ("tm0000 " -> "TM", "TM202511" -> "TM").
pub fn normalize_product(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .to_string()
}
