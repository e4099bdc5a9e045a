use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::core::{Candle, OrderKind, OrderSide, PositionInfo, Trade};

use super::client::{
    AccountState, ExchangeClient, ExchangeError, ExchangeResult, OpenOrder, OrderAck, OrderRequest,
    StreamEvent,
};

/// Deterministic in-memory exchange used by tests and the default demo run.
/// Market orders fill immediately at the current mark price; limit and stop
/// legs rest on the book until a test drives them. No slippage, a flat fee
/// rate, one consistent view of state behind a single lock.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    fee_rate: f64,
    atomic_brackets: bool,
    subscribers: Mutex<Vec<Subscriber>>,
}

struct Subscriber {
    tx: mpsc::Sender<StreamEvent>,
    /// Set when the channel saturated and events were dropped; the
    /// consumer owes itself a resync before trusting pushed state again.
    lagged: bool,
}

struct PaperState {
    balance: f64,
    prices: HashMap<String, f64>,
    positions: HashMap<String, PaperPosition>,
    open_orders: HashMap<Uuid, OrderRequest>,
    trades: Vec<Trade>,
    candles: HashMap<String, Vec<Candle>>,
    seen_order_ids: Vec<Uuid>,
    trade_seq: u64,
    /// When set, the next single order submission is rejected with this
    /// message. Lets tests exercise the rollback path.
    reject_next: Option<String>,
    /// Rejects the next order of the given kind, leaving earlier group
    /// members accepted.
    reject_kind: Option<(OrderKind, String)>,
    /// The next cancel loses the race: the resting order fills at the
    /// current mark just before the cancel arrives.
    fill_on_cancel: bool,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    size: f64, // signed: positive long, negative short
    entry_price: f64,
}

impl PaperExchange {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance: starting_balance,
                prices: HashMap::new(),
                positions: HashMap::new(),
                open_orders: HashMap::new(),
                trades: Vec::new(),
                candles: HashMap::new(),
                seen_order_ids: Vec::new(),
                trade_seq: 0,
                reject_next: None,
                reject_kind: None,
                fill_on_cancel: false,
            }),
            fee_rate: 0.0005,
            atomic_brackets: true,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn without_atomic_brackets(mut self) -> Self {
        self.atomic_brackets = false;
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock().unwrap();
        state.prices.insert(symbol.to_string(), price);
    }

    pub fn push_candle(&self, symbol: &str, candle: Candle) {
        let mut state = self.state.lock().unwrap();
        state
            .candles
            .entry(symbol.to_string())
            .or_default()
            .push(candle);
        drop(state);
        self.emit(StreamEvent::Candle {
            symbol: symbol.to_string(),
            candle,
        });
    }

    pub fn reject_next_order(&self, reason: &str) {
        self.state.lock().unwrap().reject_next = Some(reason.to_string());
    }

    pub fn reject_next_of_kind(&self, kind: OrderKind, reason: &str) {
        self.state.lock().unwrap().reject_kind = Some((kind, reason.to_string()));
    }

    /// The next cancel_order call arrives too late: the resting order fills
    /// at the current mark first and the venue reports nothing to cancel.
    pub fn fill_next_cancel(&self) {
        self.state.lock().unwrap().fill_on_cancel = true;
    }

    /// Force-fill a resting order at the given price, as though the trigger
    /// price traded through. The order leaves the book and a trade is
    /// recorded, but no push event is emitted: tests use this to exercise
    /// the monitor's trade-history reconciliation.
    pub fn force_fill(&self, client_order_id: Uuid, price: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(request) = state.open_orders.remove(&client_order_id) else {
            return false;
        };
        state.apply_fill(&request, price, self.fee_rate);
        true
    }

    /// Close a position out-of-band (manual close, liquidation). The engine
    /// only learns about it from the next account pull or position event.
    pub fn external_close(&self, symbol: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(position) = state.positions.remove(symbol) else {
            return;
        };
        let price = state.prices.get(symbol).copied().unwrap_or(0.0);
        let request = OrderRequest {
            client_order_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: if position.size > 0.0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            size: position.size.abs(),
            kind: OrderKind::Market,
            limit_price: None,
            stop_price: None,
            reduce_only: true,
        };
        state.positions.insert(
            symbol.to_string(),
            PaperPosition {
                size: position.size,
                entry_price: position.entry_price,
            },
        );
        state.apply_fill(&request, price, self.fee_rate);
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().unwrap().open_orders.len()
    }

    pub fn position_size(&self, symbol: &str) -> f64 {
        self.state
            .lock()
            .unwrap()
            .positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(0.0)
    }

    // try_send throughout: the exchange never blocks on a slow consumer.
    // A consumer that fell behind has a gap in its stream, so the next
    // delivery is prefixed with a disconnect/reconnect pair to force a
    // resynchronization.
    fn emit(&self, event: StreamEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter_mut() {
            if sub.tx.is_closed() {
                continue;
            }
            if sub.lagged {
                if sub.tx.try_send(StreamEvent::Disconnected).is_err() {
                    continue;
                }
                let _ = sub.tx.try_send(StreamEvent::Reconnected);
                sub.lagged = false;
            }
            if sub.tx.try_send(event.clone()).is_err() {
                sub.lagged = true;
            }
        }
    }

    fn unrealized(&self, state: &PaperState) -> f64 {
        state
            .positions
            .iter()
            .map(|(symbol, pos)| {
                let mark = state.prices.get(symbol).copied().unwrap_or(pos.entry_price);
                (mark - pos.entry_price) * pos.size
            })
            .sum()
    }
}

impl PaperState {
    fn apply_fill(&mut self, request: &OrderRequest, price: f64, fee_rate: f64) -> Trade {
        let fee = request.size * price * fee_rate;
        self.balance -= fee;

        let signed = match request.side {
            OrderSide::Buy => request.size,
            OrderSide::Sell => -request.size,
        };

        let position = self
            .positions
            .entry(request.symbol.clone())
            .or_insert(PaperPosition {
                size: 0.0,
                entry_price: price,
            });

        if position.size == 0.0 || position.size.signum() == signed.signum() {
            // Opening or adding: blend the entry price.
            let total = position.size + signed;
            if total.abs() > f64::EPSILON {
                position.entry_price = (position.entry_price * position.size.abs()
                    + price * signed.abs())
                    / total.abs();
            }
            position.size = total;
        } else {
            // Reducing or flipping: realize P&L on the closed portion.
            let closed = signed.abs().min(position.size.abs());
            let direction = position.size.signum();
            self.balance += (price - position.entry_price) * closed * direction;
            position.size += signed;
            if position.size.abs() < 1e-9 {
                position.size = 0.0;
            }
            if position.size == 0.0 {
                position.entry_price = 0.0;
            }
        }
        if position.size == 0.0 {
            self.positions.remove(&request.symbol);
        }

        self.trade_seq += 1;
        let trade = Trade {
            trade_id: format!("paper-{}", self.trade_seq),
            symbol: request.symbol.clone(),
            side: request.side,
            size: request.size,
            price,
            commission: fee,
            timestamp: Utc::now(),
        };
        self.trades.push(trade.clone());
        trade
    }

    fn accept(&mut self, request: &OrderRequest, fee_rate: f64) -> (OrderAck, Option<Trade>) {
        // Idempotency: a client order id we have already seen is acknowledged
        // without doing anything again.
        if self.seen_order_ids.contains(&request.client_order_id) {
            return (
                OrderAck {
                    client_order_id: request.client_order_id,
                    accepted: true,
                    error: None,
                },
                None,
            );
        }
        if let Some(reason) = self.reject_next.take() {
            return (
                OrderAck {
                    client_order_id: request.client_order_id,
                    accepted: false,
                    error: Some(reason),
                },
                None,
            );
        }
        if self
            .reject_kind
            .as_ref()
            .is_some_and(|(kind, _)| *kind == request.kind)
        {
            let (_, reason) = self.reject_kind.take().unwrap();
            return (
                OrderAck {
                    client_order_id: request.client_order_id,
                    accepted: false,
                    error: Some(reason),
                },
                None,
            );
        }

        self.seen_order_ids.push(request.client_order_id);

        match request.kind {
            OrderKind::Market => {
                let price = self
                    .prices
                    .get(&request.symbol)
                    .copied()
                    .unwrap_or(request.limit_price.unwrap_or(0.0));
                let trade = self.apply_fill(request, price, fee_rate);
                (
                    OrderAck {
                        client_order_id: request.client_order_id,
                        accepted: true,
                        error: None,
                    },
                    Some(trade),
                )
            }
            OrderKind::Limit | OrderKind::StopMarket | OrderKind::TakeProfitLimit => {
                self.open_orders
                    .insert(request.client_order_id, request.clone());
                (
                    OrderAck {
                        client_order_id: request.client_order_id,
                        accepted: true,
                        error: None,
                    },
                    None,
                )
            }
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn account_state(&self) -> ExchangeResult<AccountState> {
        let state = self.state.lock().unwrap();
        let unrealized = self.unrealized(&state);
        let positions = state
            .positions
            .iter()
            .map(|(symbol, pos)| {
                let mark = state.prices.get(symbol).copied().unwrap_or(pos.entry_price);
                PositionInfo {
                    symbol: symbol.clone(),
                    size: pos.size,
                    entry_price: pos.entry_price,
                    mark_price: mark,
                    unrealized_pnl: (mark - pos.entry_price) * pos.size,
                }
            })
            .collect();
        Ok(AccountState {
            equity: state.balance + unrealized,
            margin_used: 0.0,
            positions,
            fetched_at: Utc::now(),
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let state = self.state.lock().unwrap();
        let series = state.candles.get(symbol).cloned().unwrap_or_default();
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn place_order(&self, request: OrderRequest) -> ExchangeResult<OrderAck> {
        let (ack, trade) = {
            let mut state = self.state.lock().unwrap();
            state.accept(&request, self.fee_rate)
        };
        debug!(
            order_id = %request.client_order_id,
            symbol = %request.symbol,
            accepted = ack.accepted,
            "Paper order"
        );
        if let Some(trade) = trade {
            self.emit(StreamEvent::OrderFill {
                client_order_id: request.client_order_id,
                trade,
            });
        }
        Ok(ack)
    }

    async fn place_orders(&self, requests: Vec<OrderRequest>) -> ExchangeResult<Vec<OrderAck>> {
        if !self.atomic_brackets {
            return Err(ExchangeError::Request(
                "atomic order grouping not supported".into(),
            ));
        }
        // All-or-nothing: a pending rejection fails the whole group before
        // any order is applied.
        {
            let mut state = self.state.lock().unwrap();
            if let Some(reason) = state.reject_next.take() {
                return Ok(requests
                    .iter()
                    .map(|r| OrderAck {
                        client_order_id: r.client_order_id,
                        accepted: false,
                        error: Some(reason.clone()),
                    })
                    .collect());
            }
        }
        let mut acks = Vec::with_capacity(requests.len());
        for request in requests {
            acks.push(self.place_order(request).await?);
        }
        Ok(acks)
    }

    fn supports_atomic_brackets(&self) -> bool {
        self.atomic_brackets
    }

    async fn cancel_order(&self, _symbol: &str, client_order_id: Uuid) -> ExchangeResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.fill_on_cancel {
            if let Some(request) = state.open_orders.remove(&client_order_id) {
                state.fill_on_cancel = false;
                let price = state
                    .prices
                    .get(&request.symbol)
                    .copied()
                    .unwrap_or(request.limit_price.unwrap_or(0.0));
                state.apply_fill(&request, price, self.fee_rate);
                return Ok(false);
            }
        }
        Ok(state.open_orders.remove(&client_order_id).is_some())
    }

    async fn open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .open_orders
            .values()
            .map(|request| OpenOrder {
                client_order_id: request.client_order_id,
                symbol: request.symbol.clone(),
                side: request.side,
                size: request.size,
                filled_size: 0.0,
            })
            .collect())
    }

    async fn trade_history(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<Trade>> {
        let state = self.state.lock().unwrap();
        let mut trades: Vec<Trade> = state
            .trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect();
        trades.reverse(); // newest first
        trades.truncate(limit);
        Ok(trades)
    }

    fn subscribe(&self) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { tx, lagged: false });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(symbol: &str, side: OrderSide, size: f64) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            size,
            kind: OrderKind::Market,
            limit_price: None,
            stop_price: None,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn market_order_fills_and_moves_position() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("SOL", 150.0);

        let ack = exchange
            .place_order(market("SOL", OrderSide::Buy, 2.0))
            .await
            .unwrap();
        assert!(ack.accepted);
        assert!((exchange.position_size("SOL") - 2.0).abs() < 1e-9);

        let trades = exchange.trade_history("SOL", 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!((trades[0].price - 150.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reduce_realizes_pnl() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("SOL", 100.0);
        exchange
            .place_order(market("SOL", OrderSide::Buy, 1.0))
            .await
            .unwrap();

        exchange.set_price("SOL", 110.0);
        exchange
            .place_order(market("SOL", OrderSide::Sell, 1.0))
            .await
            .unwrap();

        assert_eq!(exchange.position_size("SOL"), 0.0);
        let account = exchange.account_state().await.unwrap();
        // +10 profit minus two fees.
        assert!(account.equity > 1009.0 && account.equity < 1010.0);
    }

    #[tokio::test]
    async fn duplicate_client_order_id_is_idempotent() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("SOL", 100.0);

        let request = market("SOL", OrderSide::Buy, 1.0);
        exchange.place_order(request.clone()).await.unwrap();
        let ack = exchange.place_order(request).await.unwrap();

        assert!(ack.accepted);
        assert!((exchange.position_size("SOL") - 1.0).abs() < 1e-9);
        assert_eq!(exchange.trade_history("SOL", 10).await.unwrap().len(), 1);
    }

    fn bar(seq: i64) -> Candle {
        Candle {
            open_time: Utc::now() + chrono::Duration::minutes(seq),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
        }
    }

    #[tokio::test]
    async fn saturated_subscriber_is_told_to_resync() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("SOL", 100.0);
        let mut rx = exchange.subscribe();

        // Overrun the channel without draining it, then catch up.
        for seq in 0..300 {
            exchange.push_candle("SOL", bar(seq));
        }
        while rx.try_recv().is_ok() {}

        // The next delivery carries the gap marker first.
        exchange.push_candle("SOL", bar(1000));
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Disconnected)));
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Reconnected)));
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Candle { .. })));
    }

    #[tokio::test]
    async fn resting_orders_sit_on_the_book() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("SOL", 100.0);

        let mut request = market("SOL", OrderSide::Sell, 1.0);
        request.kind = OrderKind::StopMarket;
        request.stop_price = Some(95.0);
        request.reduce_only = true;
        let id = request.client_order_id;
        exchange.place_order(request).await.unwrap();

        assert_eq!(exchange.open_order_count(), 1);
        assert!(exchange.cancel_order("SOL", id).await.unwrap());
        assert_eq!(exchange.open_order_count(), 0);
    }
}
