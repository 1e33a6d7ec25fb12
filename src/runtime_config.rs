// =============================================================================
// Engine Configuration — per-deployment exit and risk parameters
// =============================================================================
//
// Every tunable of the exit engine lives here. All fields carry a serde
// default so that older config files missing new fields still load.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_product() -> String {
    "TM0000".to_string()
}

fn default_activation_points() -> f64 {
    15.0
}

fn default_trailing_pullback_ratio() -> f64 {
    0.20
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_cleanup_interval_secs() -> u64 {
    10
}

fn default_exit_lock_ttl_secs() -> u64 {
    30
}

fn default_fill_price_tolerance() -> f64 {
    10.0
}

fn default_fill_match_window_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_price_offset() -> f64 {
    5.0
}

fn default_order_retention_secs() -> u64 {
    300
}

fn default_protection_multiplier() -> f64 {
    2.0
}

fn default_fallback_failure_threshold() -> u32 {
    3
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the exit engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Instrument ----------------------------------------------------------

    /// Product exit orders are placed on.
    #[serde(default = "default_product")]
    pub product: String,

    // --- Trigger levels ------------------------------------------------------

    /// Distance in points from entry at which trailing tracking begins.
    #[serde(default = "default_activation_points")]
    pub activation_points: f64,

    /// Fraction of the entry-to-peak move given back before a trailing exit.
    /// Overridden per position when the store row carries one.
    #[serde(default = "default_trailing_pullback_ratio")]
    pub trailing_pullback_ratio: f64,

    // --- Background loops ----------------------------------------------------

    /// Backup reconciliation interval of the position cache.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Interval of the expired lock / expired order sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    // --- Exit orders ---------------------------------------------------------

    /// Lifetime of an exit claim in the deduplication gate.
    #[serde(default = "default_exit_lock_ttl_secs")]
    pub exit_lock_ttl_secs: u64,

    /// FIFO fill matching: accepted |order price - fill price|.
    #[serde(default = "default_fill_price_tolerance")]
    pub fill_price_tolerance: f64,

    /// FIFO fill matching: only orders submitted this recently are eligible.
    #[serde(default = "default_fill_match_window_secs")]
    pub fill_match_window_secs: u64,

    /// Retries allowed per exit order after a retry-eligible cancel.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Points the limit price moves toward the market on each retry.
    #[serde(default = "default_retry_price_offset")]
    pub retry_price_offset: f64,

    /// Terminal orders older than this are dropped from memory.
    #[serde(default = "default_order_retention_secs")]
    pub order_retention_secs: u64,

    // --- Cumulative profit protection ----------------------------------------

    /// Profit multiplier for lots without an explicit override.
    #[serde(default = "default_protection_multiplier")]
    pub default_protection_multiplier: f64,

    /// Lot number -> profit multiplier.
    #[serde(default)]
    pub lot_multipliers: BTreeMap<u32, f64>,

    // --- Fallback ------------------------------------------------------------

    /// Consecutive failed ticks before price updates are routed to the
    /// fallback path.
    #[serde(default = "default_fallback_failure_threshold")]
    pub fallback_failure_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            product: default_product(),
            activation_points: default_activation_points(),
            trailing_pullback_ratio: default_trailing_pullback_ratio(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            exit_lock_ttl_secs: default_exit_lock_ttl_secs(),
            fill_price_tolerance: default_fill_price_tolerance(),
            fill_match_window_secs: default_fill_match_window_secs(),
            max_retries: default_max_retries(),
            retry_price_offset: default_retry_price_offset(),
            order_retention_secs: default_order_retention_secs(),
            default_protection_multiplier: default_protection_multiplier(),
            lot_multipliers: BTreeMap::new(),
            fallback_failure_threshold: default_fallback_failure_threshold(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            product = %config.product,
            activation_points = config.activation_points,
            max_retries = config.max_retries,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Profit multiplier applied to `lot_number`.
    pub fn multiplier_for_lot(&self, lot_number: u32) -> f64 {
        self.lot_multipliers
            .get(&lot_number)
            .copied()
            .unwrap_or(self.default_protection_multiplier)
    }

    pub fn exit_lock_ttl(&self) -> Duration {
        Duration::seconds(self.exit_lock_ttl_secs as i64)
    }

    pub fn fill_match_window(&self) -> Duration {
        Duration::seconds(self.fill_match_window_secs as i64)
    }

    pub fn order_retention(&self) -> Duration {
        Duration::seconds(self.order_retention_secs as i64)
    }
}
