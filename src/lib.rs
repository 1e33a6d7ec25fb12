// =============================================================================
// Exit Guard — stop-loss, trailing-stop and profit-protection exit engine
// =============================================================================

pub mod error;
pub mod evaluator;
pub mod events;
pub mod execution;
pub mod exit_gate;
pub mod orchestrator;
pub mod order_tracker;
pub mod persistence;
pub mod position_cache;
pub mod protection;
pub mod retry_policy;
pub mod runtime_config;
pub mod store;
pub mod types;

pub use error::{EngineError, TrackerError, ValidationError};
pub use orchestrator::{EngineStats, ExitCoordinator, FallbackHandler, TickReport};
pub use runtime_config::EngineConfig;
