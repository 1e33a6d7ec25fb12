// =============================================================================
// Execution — exit order submission contract and the paper executor
// =============================================================================

use std::collections::VecDeque;

use anyhow::bail;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::Direction;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// An exit order to send to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRequest {
    pub position_id: String,
    /// Direction of the position being closed.
    pub direction: Direction,
    pub quantity: u32,
    pub price: f64,
    pub product: String,
}

impl ExitRequest {
    /// Order side that flattens the position.
    pub fn order_side(&self) -> &'static str {
        match self.direction {
            Direction::Long => "SELL",
            Direction::Short => "BUY",
        }
    }
}

/// Order-execution collaborator. Returns the broker order id; fills and
/// cancels come back asynchronously through the engine.
pub trait OrderExecutor: Send + Sync {
    fn submit_exit(&self, request: &ExitRequest) -> anyhow::Result<String>;
}

// ---------------------------------------------------------------------------
// Paper executor
// ---------------------------------------------------------------------------

/// A submission accepted by the paper executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperOrder {
    pub order_id: String,
    pub request: ExitRequest,
    pub submitted_at: DateTime<Utc>,
}

/// Accepts every exit locally and assigns a synthetic order id. No request
/// leaves the process. Rejections can be queued for fault injection.
#[derive(Default)]
pub struct PaperExecutor {
    submitted: Mutex<Vec<PaperOrder>>,
    rejections: Mutex<VecDeque<String>>,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next submission with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.rejections.lock().push_back(reason.into());
    }

    /// Submissions not yet taken, oldest first.
    pub fn take_submitted(&self) -> Vec<PaperOrder> {
        std::mem::take(&mut *self.submitted.lock())
    }

    pub fn pending(&self) -> usize {
        self.submitted.lock().len()
    }
}

impl OrderExecutor for PaperExecutor {
    fn submit_exit(&self, request: &ExitRequest) -> anyhow::Result<String> {
        if let Some(reason) = self.rejections.lock().pop_front() {
            warn!(
                id = %request.position_id,
                side = request.order_side(),
                price = request.price,
                reason = %reason,
                "paper exit rejected"
            );
            bail!("paper executor rejected exit: {reason}");
        }

        let order_id = format!("paper-{}", Uuid::new_v4());
        info!(
            id = %request.position_id,
            order_id = %order_id,
            side = request.order_side(),
            qty = request.quantity,
            price = request.price,
            product = %request.product,
            "paper exit accepted"
        );
        self.submitted.lock().push(PaperOrder {
            order_id: order_id.clone(),
            request: request.clone(),
            submitted_at: Utc::now(),
        });
        Ok(order_id)
    }
}

impl std::fmt::Debug for PaperExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperExecutor")
            .field("pending", &self.pending())
            .field("queued_rejections", &self.rejections.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(direction: Direction) -> ExitRequest {
        ExitRequest {
            position_id: "p-1".into(),
            direction,
            quantity: 1,
            price: 22500.0,
            product: "TM0000".into(),
        }
    }

    #[test]
    fn exit_side_flattens_position() {
        assert_eq!(request(Direction::Long).order_side(), "SELL");
        assert_eq!(request(Direction::Short).order_side(), "BUY");
    }

    #[test]
    fn paper_orders_get_unique_ids() {
        let exec = PaperExecutor::new();
        let a = exec.submit_exit(&request(Direction::Long)).unwrap();
        let b = exec.submit_exit(&request(Direction::Long)).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("paper-"));

        let taken = exec.take_submitted();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].order_id, a);
        assert_eq!(exec.pending(), 0);
    }

    #[test]
    fn queued_rejection_applies_once() {
        let exec = PaperExecutor::new();
        exec.reject_next("market closed");
        let err = exec.submit_exit(&request(Direction::Short)).unwrap_err();
        assert!(err.to_string().contains("market closed"));
        assert!(exec.submit_exit(&request(Direction::Short)).is_ok());
    }
}
