/// Signal Arbitration
///
/// The producer seam and the per-tick conflict resolution that yields at
/// most one actionable signal.
pub mod arbiter;
pub mod producer;

pub use arbiter::{ArbitrationPolicy, ProducerStats, SignalArbiter};
pub use producer::SignalProducer;
