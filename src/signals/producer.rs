use async_trait::async_trait;

use crate::core::{AccountSnapshot, MarketView, Signal};

/// Strategy seam. Producers decide *when* to trade; everything after the
/// returned [`Signal`] belongs to the engine. Implementations must be cheap
/// to poll: the arbiter bounds each call with a timeout and treats an
/// overrun as "no signal this tick".
#[async_trait]
pub trait SignalProducer: Send + Sync {
    fn name(&self) -> &str;

    /// Return a proposed trade for this tick, or `None`. Must not block on
    /// the network; all required data is in the provided views.
    async fn generate_signal(
        &self,
        market: &MarketView,
        account: &AccountSnapshot,
    ) -> Option<Signal>;

    /// Called when a new bar lands. Producers that memoize indicator values
    /// per bar drop them here.
    fn invalidate_cache(&self) {}
}
