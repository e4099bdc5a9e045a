use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::{Candle, OrderKind, OrderSide, PositionInfo, Trade};

/// Failures talking to the exchange. Everything here is transient from the
/// engine's point of view: the cycle logs it, backs off, and retries on the
/// next tick.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange request failed: {0}")]
    Request(String),
    #[error("exchange returned malformed data: {0}")]
    Malformed(String),
    #[error("exchange stream disconnected")]
    Disconnected,
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Order submission payload. The `client_order_id` is the engine's own order
/// id; resubmitting the same id must not create a duplicate on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub kind: OrderKind,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub client_order_id: Uuid,
    pub accepted: bool,
    pub error: Option<String>,
}

/// Open order row as the exchange reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub filled_size: f64,
}

/// Push-stream messages. Consumed by the state synchronizer's update loop,
/// never directly by the control loop.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Account { equity: f64, margin_used: f64 },
    PositionUpdate(PositionInfo),
    /// Authoritative fill notice; preferred over the trade-history heuristic.
    OrderFill {
        client_order_id: Uuid,
        trade: Trade,
    },
    Candle {
        symbol: String,
        candle: Candle,
    },
    Disconnected,
    /// Stream re-established; a full pull refresh is required before
    /// trusting subsequent deltas.
    Reconnected,
}

/// The exchange seam. Wire-protocol details live behind this trait; the
/// engine only ever sees these operations.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn account_state(&self) -> ExchangeResult<AccountState>;

    async fn candles(&self, symbol: &str, interval: &str, limit: usize)
        -> ExchangeResult<Vec<Candle>>;

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<OrderAck>;

    /// Submit a group of orders as one atomic request. Implementations that
    /// return `false` from [`supports_atomic_brackets`] may reject this.
    async fn place_orders(&self, requests: Vec<OrderRequest>) -> ExchangeResult<Vec<OrderAck>>;

    fn supports_atomic_brackets(&self) -> bool;

    async fn cancel_order(&self, symbol: &str, client_order_id: Uuid) -> ExchangeResult<bool>;

    async fn open_orders(&self) -> ExchangeResult<Vec<OpenOrder>>;

    async fn trade_history(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<Trade>>;

    /// Subscribe to the push stream. The receiver is bounded; a consumer that
    /// falls behind is treated as a connection-health failure upstream.
    fn subscribe(&self) -> mpsc::Receiver<StreamEvent>;
}

/// Combined account + positions pull, one consistent read.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub equity: f64,
    pub margin_used: f64,
    pub positions: Vec<PositionInfo>,
    pub fetched_at: DateTime<Utc>,
}

impl AccountState {
    pub fn available_margin(&self) -> f64 {
        (self.equity - self.margin_used).max(0.0)
    }
}
