// =============================================================================
// Error taxonomy
// =============================================================================
//
// Component boundaries return these typed errors. I/O-shaped code (config
// files, store adapters, executors) uses `anyhow` and wraps into
// `EngineError` where it crosses into the core.
// =============================================================================

use thiserror::Error;

/// A position row could not be turned into a cacheable `Position`.
///
/// Always scoped to a single position: the offending row is skipped and the
/// rest of the cache is untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("position row is malformed: {0}")]
    Malformed(String),

    #[error("position {id}: missing field `{field}`")]
    MissingField { id: String, field: &'static str },

    #[error("position {id}: field `{field}` must be a finite number > 0 (got {value})")]
    NonPositive {
        id: String,
        field: &'static str,
        value: f64,
    },

    #[error("position {id}: unknown direction `{raw}`")]
    UnknownDirection { id: String, raw: String },

    #[error("position {id}: range low {low} is above range high {high}")]
    InvertedRange { id: String, high: f64, low: f64 },
}

/// Exit order tracker failures. Returned, never panicked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("position {position_id} already has exit order {order_id} in flight")]
    DuplicateExit {
        position_id: String,
        order_id: String,
    },

    #[error("order id {0} is already registered")]
    DuplicateOrderId(String),

    #[error("unknown exit order {0}")]
    UnknownOrder(String),

    #[error("exit order {order_id} is {status}, expected {expected}")]
    InvalidTransition {
        order_id: String,
        status: String,
        expected: &'static str,
    },
}

/// Failures surfaced by the engine as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid price tick {0}")]
    InvalidPrice(f64),

    #[error("cache inconsistency: {0}")]
    CacheInconsistent(String),

    #[error("trigger evaluation panicked: {0}")]
    EvaluationPanicked(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("durable store: {0:#}")]
    Store(anyhow::Error),

    #[error("order execution: {0:#}")]
    Execution(anyhow::Error),
}
