/// Order Execution
///
/// Bracket submission, the order state machine, and background
/// reconciliation against the venue.
pub mod engine;
pub mod monitor;
pub mod order;

pub use engine::{ExecutionEngine, ExecutionStats};
pub use monitor::OrderMonitor;
pub use order::{Order, OrderStateError, OrderStatus};
