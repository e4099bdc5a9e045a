/// Risk Controls
///
/// Pre-trade validation plus the two account-level supervisors: the
/// one-way kill switch and the reversible drawdown monitor.
pub mod drawdown;
pub mod engine;
pub mod kill_switch;

pub use drawdown::{DrawdownMonitor, DrawdownState, DrawdownUpdate};
pub use engine::{RiskEngine, RiskVerdict};
pub use kill_switch::KillSwitch;
