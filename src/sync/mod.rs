/// State Synchronization
///
/// Push-preferred, pull-fallback view of the remote account.
pub mod candles;
pub mod synchronizer;

pub use candles::CandleBuffer;
pub use synchronizer::StateSynchronizer;
