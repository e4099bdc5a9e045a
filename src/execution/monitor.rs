use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::exchange::{ExchangeClient, StreamEvent};
use crate::position::PositionManager;

use super::engine::ExecutionEngine;
use super::order::{Order, OrderStatus};

const FILL_LOOKBACK_MINUTES: i64 = 5;
const TRADE_HISTORY_DEPTH: usize = 50;
const SIZE_TOLERANCE: f64 = 1e-3;

/// Order Monitor
///
/// Background reconciliation for every non-terminal order. Push fill
/// events are authoritative; the open-order diff plus a bounded trade
/// history search is the fallback for venues (or moments) without them.
pub struct OrderMonitor {
    engine: Arc<ExecutionEngine>,
    positions: Arc<PositionManager>,
    exchange: Arc<dyn ExchangeClient>,
    poll_interval: Duration,
}

impl OrderMonitor {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        positions: Arc<PositionManager>,
        exchange: Arc<dyn ExchangeClient>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            positions,
            exchange,
            poll_interval,
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut stream = self.exchange.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.reconcile().await {
                            warn!(%err, "Order reconciliation pass failed");
                        }
                    }
                    event = stream.recv() => match event {
                        Some(StreamEvent::OrderFill { client_order_id, trade }) => {
                            self.apply_fill(client_order_id, &trade).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = shutdown.recv() => {
                        debug!("Order monitor stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn apply_fill(&self, order_id: Uuid, trade: &crate::core::Trade) {
        if let Some(order) = self.engine.on_fill(order_id, trade).await {
            if order.status == OrderStatus::Filled {
                self.positions.on_fill(&order, trade).await;
            }
        }
    }

    /// One reconciliation pass: expire overdue entries, then resolve
    /// orders that vanished from the venue's open list.
    pub async fn reconcile(&self) -> Result<()> {
        let active = self.engine.active_orders();
        if active.is_empty() {
            return Ok(());
        }

        let open: HashSet<Uuid> = self
            .exchange
            .open_orders()
            .await?
            .into_iter()
            .map(|o| o.client_order_id)
            .collect();
        let timeout = chrono::Duration::from_std(self.engine.order_timeout())?;
        let now = Utc::now();

        for order in active {
            if order.is_terminal() || order.status == OrderStatus::Pending {
                continue;
            }

            // Time-in-force applies to entries only; protective legs stay
            // working until their position is gone.
            if !order.reduce_only {
                let submitted = order.submitted_at.unwrap_or(order.created_at);
                if open.contains(&order.id) && now - submitted > timeout {
                    warn!(order_id = %order.id, "Order exceeded time-in-force, cancelling");
                    if self.exchange.cancel_order(&order.symbol, order.id).await? {
                        self.engine
                            .finalize(order.id, OrderStatus::Expired, "time-in-force exceeded")
                            .await;
                        self.cancel_legs(&order).await;
                    }
                    continue;
                }
            }

            if !open.contains(&order.id) {
                self.resolve_vanished(&order, now).await?;
            }
        }
        Ok(())
    }

    /// An order we believe is open is no longer on the venue. Treat it as
    /// filled only when a matching recent trade exists; otherwise leave it
    /// submitted for the next pass rather than guessing.
    async fn resolve_vanished(&self, order: &Order, now: chrono::DateTime<Utc>) -> Result<()> {
        let trades = self
            .exchange
            .trade_history(&order.symbol, TRADE_HISTORY_DEPTH)
            .await?;
        let remaining = order.size - order.filled_size;
        let lookback = chrono::Duration::minutes(FILL_LOOKBACK_MINUTES);

        let matched = trades.into_iter().find(|trade| {
            trade.side == order.side
                && (trade.size - remaining).abs() <= SIZE_TOLERANCE
                && now - trade.timestamp <= lookback
        });

        match matched {
            Some(trade) => {
                debug!(order_id = %order.id, trade_id = %trade.trade_id, "Vanished order matched to trade");
                self.apply_fill(order.id, &trade).await;
            }
            None => {
                debug!(
                    order_id = %order.id,
                    "Order missing from venue with no matching trade, leaving submitted"
                );
            }
        }
        Ok(())
    }

    async fn cancel_legs(&self, entry: &Order) {
        for leg in self.engine.legs_of(entry.id) {
            if let Err(err) = self.engine.cancel(leg.id).await {
                warn!(order_id = %leg.id, %err, "Failed to cancel bracket leg");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Execution as ExecutionConfig;
    use crate::core::{OrderSide, Side, Signal, Trade};
    use crate::exchange::PaperExchange;
    use crate::transport::EventBus;

    fn signal() -> Signal {
        Signal {
            symbol: "SOL".into(),
            side: Side::Long,
            entry_price: 100.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            size: None,
            strategy: "test".into(),
            confidence: 0.9,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    fn stack(
        exchange: Arc<PaperExchange>,
        order_timeout_secs: u64,
    ) -> (Arc<ExecutionEngine>, Arc<PositionManager>, OrderMonitor) {
        let bus = EventBus::new();
        let engine = Arc::new(ExecutionEngine::new(
            exchange.clone(),
            ExecutionConfig {
                slippage_tolerance_pct: 1.0,
                hard_revalidation_pct: 3.0,
                order_timeout_secs,
                monitor_interval_secs: 5,
                cancel_timeout_secs: 2,
            },
            true,
            bus.clone(),
        ));
        let positions = Arc::new(PositionManager::new(
            exchange.clone(),
            engine.clone(),
            bus,
            5.0,
        ));
        let monitor = OrderMonitor::new(
            engine.clone(),
            positions.clone(),
            exchange,
            Duration::from_secs(5),
        );
        (engine, positions, monitor)
    }

    #[tokio::test]
    async fn vanished_order_with_matching_trade_is_filled() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        let (engine, positions, monitor) = stack(exchange.clone(), 300);

        let entry_id = engine.execute(&signal(), 2.0, 100.0).await.unwrap().unwrap();
        // Entry trades through off-stream.
        assert!(exchange.force_fill(entry_id, 100.0));

        monitor.reconcile().await.unwrap();

        assert!(engine.order(entry_id).is_none());
        let history = engine.history().await;
        assert!(history.iter().any(|o| o.id == entry_id && o.status == OrderStatus::Filled));
        assert!(positions.has_position("SOL"));
    }

    #[tokio::test]
    async fn vanished_order_without_trade_stays_submitted() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        let (engine, _positions, monitor) = stack(exchange.clone(), 300);

        let entry_id = engine.execute(&signal(), 2.0, 100.0).await.unwrap().unwrap();
        // Vanishes with no trade record.
        exchange.cancel_order("SOL", entry_id).await.unwrap();

        monitor.reconcile().await.unwrap();

        let order = engine.order(entry_id).unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
    }

    #[tokio::test]
    async fn overdue_entry_expires_and_legs_are_cancelled() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        let (engine, _positions, monitor) = stack(exchange.clone(), 0);

        let entry_id = engine.execute(&signal(), 2.0, 100.0).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        monitor.reconcile().await.unwrap();

        let history = engine.history().await;
        assert!(history.iter().any(|o| o.id == entry_id && o.status == OrderStatus::Expired));
        assert_eq!(exchange.open_order_count(), 0);
        assert!(engine.active_orders().is_empty());
    }

    #[tokio::test]
    async fn overdue_partially_filled_entry_still_expires() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        let (engine, _positions, monitor) = stack(exchange.clone(), 0);

        let entry_id = engine.execute(&signal(), 2.0, 100.0).await.unwrap().unwrap();
        let partial = Trade {
            trade_id: "t-partial".into(),
            symbol: "SOL".into(),
            side: OrderSide::Buy,
            size: 1.0,
            price: 100.0,
            commission: 0.05,
            timestamp: Utc::now(),
        };
        engine.on_fill(entry_id, &partial).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        monitor.reconcile().await.unwrap();

        // A half-filled entry past its time-in-force must still leave the
        // active set, not linger partially filled forever.
        assert!(engine.order(entry_id).is_none());
        let history = engine.history().await;
        assert!(history.iter().any(|o| o.id == entry_id && o.status == OrderStatus::Expired));
        assert_eq!(exchange.open_order_count(), 0);
    }
}
