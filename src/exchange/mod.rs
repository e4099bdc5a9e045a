/// Exchange Connectivity
///
/// The `ExchangeClient` trait is the only seam between the engine and a
/// venue. `PaperExchange` is the in-process implementation used by tests
/// and dry runs.
pub mod client;
pub mod paper;

pub use client::{
    AccountState, ExchangeClient, ExchangeError, ExchangeResult, OpenOrder, OrderAck,
    OrderRequest, StreamEvent,
};
pub use paper::PaperExchange;
