/// Position Lifecycle
pub mod manager;

pub use manager::{ClosedPosition, ManagedPosition, PositionManager};
