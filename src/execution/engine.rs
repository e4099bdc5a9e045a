use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Execution as ExecutionConfig;
use crate::core::{OrderKind, Side, Signal, Trade};
use crate::exchange::{ExchangeClient, OrderRequest};
use crate::transport::{EngineEvent, EventBus};

use super::order::{Order, OrderStatus};

#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub submitted: AtomicU64,
    pub filled: AtomicU64,
    pub cancelled: AtomicU64,
    pub rejected: AtomicU64,
    pub expired: AtomicU64,
    pub slippage_downgrades: AtomicU64,
    pub slippage_drops: AtomicU64,
}

impl ExecutionStats {
    pub fn log_summary(&self) {
        info!(
            submitted = self.submitted.load(Ordering::Relaxed),
            filled = self.filled.load(Ordering::Relaxed),
            cancelled = self.cancelled.load(Ordering::Relaxed),
            rejected = self.rejected.load(Ordering::Relaxed),
            expired = self.expired.load(Ordering::Relaxed),
            slippage_downgrades = self.slippage_downgrades.load(Ordering::Relaxed),
            slippage_drops = self.slippage_drops.load(Ordering::Relaxed),
            "Execution statistics"
        );
    }
}

/// Execution Engine
///
/// Turns an accepted signal into a bracket order set and owns every order
/// from creation to its terminal state, at which point it moves to
/// immutable history.
pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    bracket_orders: bool,
    active: DashMap<Uuid, Order>,
    history: RwLock<Vec<Order>>,
    stats: ExecutionStats,
    bus: EventBus,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        config: ExecutionConfig,
        bracket_orders: bool,
        bus: EventBus,
    ) -> Self {
        Self {
            exchange,
            config,
            bracket_orders,
            active: DashMap::new(),
            history: RwLock::new(Vec::new()),
            stats: ExecutionStats::default(),
            bus,
        }
    }

    /// Submit a validated signal. Returns the entry order id, or `None`
    /// when the signal was dropped (hard price move) or the venue rejected
    /// the group.
    pub async fn execute(
        &self,
        signal: &Signal,
        size: f64,
        current_price: f64,
    ) -> Result<Option<Uuid>> {
        let move_pct =
            ((current_price - signal.entry_price) / signal.entry_price).abs() * 100.0;

        if move_pct >= self.config.hard_revalidation_pct {
            self.stats.slippage_drops.fetch_add(1, Ordering::Relaxed);
            warn!(
                symbol = %signal.symbol,
                move_pct,
                "Price moved past hard revalidation threshold, dropping signal"
            );
            self.bus.publish(EngineEvent::SignalRejected {
                symbol: signal.symbol.clone(),
                side: signal.side,
                strategy: signal.strategy.clone(),
                reason: format!("price moved {move_pct:.2}% since signal generation"),
                timestamp: Utc::now(),
            });
            return Ok(None);
        }

        let entry_kind = if move_pct >= self.config.slippage_tolerance_pct {
            // Inside the hard threshold a limit entry chases the market
            // instead of being dropped.
            self.stats
                .slippage_downgrades
                .fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %signal.symbol, move_pct, "Downgrading limit entry to market");
            OrderKind::Market
        } else {
            OrderKind::Limit
        };

        let entry = Order::entry_for(signal, size, entry_kind);
        let entry_id = entry.id;
        let mut group = vec![entry];

        if self.bracket_orders {
            if let Some(stop) = signal.stop_loss {
                let mut leg = Order::new(
                    &signal.symbol,
                    signal.side.exit_order_side(),
                    size,
                    OrderKind::StopMarket,
                );
                leg.stop_price = Some(stop);
                leg.reduce_only = true;
                leg.parent_id = Some(entry_id);
                leg.strategy = Some(signal.strategy.clone());
                group.push(leg);
            }
            if let Some(target) = signal.take_profit {
                let mut leg = Order::new(
                    &signal.symbol,
                    signal.side.exit_order_side(),
                    size,
                    OrderKind::TakeProfitLimit,
                );
                leg.limit_price = Some(target);
                leg.reduce_only = true;
                leg.parent_id = Some(entry_id);
                leg.strategy = Some(signal.strategy.clone());
                group.push(leg);
            }
        }

        let submitted = if group.len() > 1 && self.exchange.supports_atomic_brackets() {
            self.submit_atomic(group).await?
        } else {
            self.submit_sequential(group).await?
        };
        Ok(submitted.then_some(entry_id))
    }

    async fn submit_atomic(&self, mut group: Vec<Order>) -> Result<bool> {
        let requests: Vec<OrderRequest> = group.iter().map(Order::to_request).collect();
        let acks = self.exchange.place_orders(requests).await?;

        let rejection = acks
            .iter()
            .find(|ack| !ack.accepted)
            .and_then(|ack| ack.error.clone());
        if let Some(reason) = rejection {
            warn!(reason = %reason, "Atomic bracket submission rejected");
            for mut order in group.drain(..) {
                order.status_note = Some(reason.clone());
                order.transition(OrderStatus::Rejected)?;
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                self.history.write().await.push(order);
            }
            return Ok(false);
        }

        for mut order in group.drain(..) {
            order.transition(OrderStatus::Submitted)?;
            self.stats.submitted.fetch_add(1, Ordering::Relaxed);
            debug!(order_id = %order.id, kind = ?order.kind, "Order submitted");
            self.active.insert(order.id, order);
        }
        Ok(true)
    }

    /// Fallback for venues without atomic grouping: submit in order and
    /// roll back accepted orders if a later leg is refused.
    async fn submit_sequential(&self, mut group: Vec<Order>) -> Result<bool> {
        let mut accepted: Vec<Uuid> = Vec::new();
        let mut failure: Option<String> = None;

        for order in group.iter_mut() {
            let ack = self.exchange.place_order(order.to_request()).await?;
            if ack.accepted {
                order.transition(OrderStatus::Submitted)?;
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                accepted.push(order.id);
            } else {
                failure = Some(
                    ack.error
                        .unwrap_or_else(|| "order rejected by exchange".to_string()),
                );
                order.status_note = failure.clone();
                order.transition(OrderStatus::Rejected)?;
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }

        if let Some(reason) = failure {
            warn!(reason = %reason, "Bracket leg rejected, rolling back accepted orders");
            for order in group.iter_mut() {
                if accepted.contains(&order.id) {
                    let cancelled = self
                        .exchange
                        .cancel_order(&order.symbol, order.id)
                        .await
                        .unwrap_or(false);
                    if cancelled {
                        order.status_note = Some(format!("rolled back: {reason}"));
                        order.transition(OrderStatus::Cancelled)?;
                        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    } else {
                        // An unconfirmed cancel usually means the order
                        // filled first; keep tracking it and let the
                        // monitor reconcile the fill.
                        self.active.insert(order.id, order.clone());
                        self.bus.alert(&format!(
                            "bracket rollback left {} order live on {}",
                            order.id, order.symbol
                        ));
                    }
                } else if order.status == OrderStatus::Pending {
                    // Never reached the venue; record it so the ledger
                    // stays complete.
                    order.status_note = Some(format!("not submitted: {reason}"));
                    order.transition(OrderStatus::Cancelled)?;
                    self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                }
            }
            let mut history = self.history.write().await;
            for order in group.into_iter().filter(|o| o.is_terminal()) {
                history.push(order);
            }
            return Ok(false);
        }

        for order in group {
            self.active.insert(order.id, order);
        }
        Ok(true)
    }

    /// Submit one standalone order (a replacement protective leg). Returns
    /// `None` when the venue refuses it.
    pub async fn submit_single(&self, mut order: Order) -> Result<Option<Uuid>> {
        let ack = self.exchange.place_order(order.to_request()).await?;
        if !ack.accepted {
            order.status_note = ack.error.clone();
            order.transition(OrderStatus::Rejected)?;
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                symbol = %order.symbol,
                reason = ack.error.as_deref().unwrap_or("unspecified"),
                "Standalone order rejected"
            );
            self.history.write().await.push(order);
            return Ok(None);
        }
        order.transition(OrderStatus::Submitted)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let order_id = order.id;
        self.active.insert(order_id, order);
        Ok(Some(order_id))
    }

    /// Apply a confirmed trade to a tracked order. Returns the updated
    /// order when it is one of ours.
    pub async fn on_fill(&self, order_id: Uuid, trade: &Trade) -> Option<Order> {
        let mut entry = self.active.get_mut(&order_id)?;
        if let Err(err) = entry.record_fill(trade) {
            warn!(order_id = %order_id, %err, "Dropping fill for order in terminal state");
            return None;
        }
        let snapshot = entry.clone();
        drop(entry);

        if snapshot.is_terminal() {
            self.active.remove(&order_id);
            self.stats.filled.fetch_add(1, Ordering::Relaxed);
            self.history.write().await.push(snapshot.clone());
            info!(
                order_id = %order_id,
                symbol = %snapshot.symbol,
                price = snapshot.avg_fill_price,
                size = snapshot.filled_size,
                "Order filled"
            );
            self.bus.publish(EngineEvent::OrderFilled {
                order_id,
                symbol: snapshot.symbol.clone(),
                side: snapshot.side,
                size: snapshot.filled_size,
                price: snapshot.avg_fill_price,
                commission: snapshot.commission,
                reduce_only: snapshot.reduce_only,
                timestamp: Utc::now(),
            });
        }
        Some(snapshot)
    }

    /// Move an active order to a terminal state without a fill.
    pub async fn finalize(&self, order_id: Uuid, status: OrderStatus, note: &str) -> Option<Order> {
        let (_, mut order) = self.active.remove(&order_id)?;
        order.status_note = Some(note.to_string());
        if let Err(err) = order.transition(status) {
            warn!(order_id = %order_id, %err, "Refusing illegal terminal transition");
            self.active.insert(order_id, order);
            return None;
        }
        match status {
            OrderStatus::Cancelled => self.stats.cancelled.fetch_add(1, Ordering::Relaxed),
            OrderStatus::Expired => self.stats.expired.fetch_add(1, Ordering::Relaxed),
            OrderStatus::Rejected => self.stats.rejected.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        let snapshot = order.clone();
        self.history.write().await.push(order);
        Some(snapshot)
    }

    /// Cancel one order on the venue and locally.
    pub async fn cancel(&self, order_id: Uuid) -> Result<bool> {
        let Some(order) = self.active.get(&order_id).map(|o| o.clone()) else {
            return Ok(false);
        };
        let cancelled = self.exchange.cancel_order(&order.symbol, order_id).await?;
        if cancelled {
            self.finalize(order_id, OrderStatus::Cancelled, "cancelled by engine")
                .await;
        }
        Ok(cancelled)
    }

    /// Shutdown path: cancel every non-terminal order with a bounded
    /// per-cancel budget. Orders whose cancels time out stay active and
    /// are reported.
    pub async fn cancel_all(&self) -> usize {
        let budget = Duration::from_secs(self.config.cancel_timeout_secs);
        let ids: Vec<Uuid> = self.active.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for order_id in ids {
            match timeout(budget, self.cancel(order_id)).await {
                Ok(Ok(true)) => cancelled += 1,
                Ok(Ok(false)) => {}
                Ok(Err(err)) => warn!(order_id = %order_id, %err, "Cancel failed"),
                Err(_) => {
                    warn!(order_id = %order_id, "Cancel timed out");
                    self.bus
                        .alert(&format!("cancel of order {order_id} timed out at shutdown"));
                }
            }
        }
        cancelled
    }

    /// Immediate reduce-only market order closing the given exposure.
    pub async fn close_position(&self, symbol: &str, side: Side, size: f64) -> Result<Uuid> {
        let mut order = Order::new(symbol, side.exit_order_side(), size, OrderKind::Market);
        order.reduce_only = true;
        let order_id = order.id;
        let ack = self.exchange.place_order(order.to_request()).await?;
        if !ack.accepted {
            anyhow::bail!(
                "close order for {symbol} rejected: {}",
                ack.error.unwrap_or_default()
            );
        }
        order.transition(OrderStatus::Submitted)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.active.insert(order_id, order);
        Ok(order_id)
    }

    pub fn active_orders(&self) -> Vec<Order> {
        self.active.iter().map(|entry| entry.clone()).collect()
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        self.active.get(&order_id).map(|entry| entry.clone())
    }

    /// Bracket legs attached to the given entry order.
    pub fn legs_of(&self, entry_id: Uuid) -> Vec<Order> {
        self.active
            .iter()
            .filter(|entry| entry.parent_id == Some(entry_id))
            .map(|entry| entry.clone())
            .collect()
    }

    pub async fn history(&self) -> Vec<Order> {
        self.history.read().await.clone()
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.config.order_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;

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

    fn engine(exchange: Arc<PaperExchange>) -> ExecutionEngine {
        ExecutionEngine::new(
            exchange,
            ExecutionConfig {
                slippage_tolerance_pct: 1.0,
                hard_revalidation_pct: 3.0,
                order_timeout_secs: 30,
                monitor_interval_secs: 5,
                cancel_timeout_secs: 2,
            },
            true,
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn bracket_submission_tracks_three_orders() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        let engine = engine(exchange);

        let entry_id = engine.execute(&signal(), 2.0, 100.0).await.unwrap().unwrap();
        let active = engine.active_orders();
        assert_eq!(active.len(), 3);
        assert_eq!(engine.legs_of(entry_id).len(), 2);
        assert!(active.iter().all(|o| o.status == OrderStatus::Submitted));
    }

    #[tokio::test]
    async fn hard_price_move_drops_the_signal() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 104.0);
        let engine = engine(exchange);

        let result = engine.execute(&signal(), 2.0, 104.0).await.unwrap();
        assert!(result.is_none());
        assert!(engine.active_orders().is_empty());
        assert_eq!(engine.stats().slippage_drops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn moderate_move_downgrades_entry_to_market() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 101.5);
        let engine = engine(exchange);

        let entry_id = engine
            .execute(&signal(), 2.0, 101.5)
            .await
            .unwrap()
            .unwrap();
        // A market entry fills instantly on paper, so only the two legs
        // remain active.
        assert!(engine.order(entry_id).is_none() || engine.order(entry_id).unwrap().kind == OrderKind::Market);
        assert_eq!(engine.stats().slippage_downgrades.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn atomic_rejection_leaves_nothing_active() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        exchange.reject_next_order("margin check failed");
        let engine = engine(exchange);

        let result = engine.execute(&signal(), 2.0, 100.0).await.unwrap();
        assert!(result.is_none());
        assert!(engine.active_orders().is_empty());
        let history = engine.history().await;
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|o| o.status == OrderStatus::Rejected));
    }

    #[tokio::test]
    async fn resubmitting_same_signal_does_not_duplicate() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        let engine = engine(exchange.clone());

        let entry_id = engine.execute(&signal(), 2.0, 100.0).await.unwrap().unwrap();
        let order = engine.order(entry_id).unwrap();
        // Same client-order-id on the wire is acknowledged without a new
        // order appearing.
        let ack = exchange.place_order(order.to_request()).await.unwrap();
        assert!(ack.accepted);
        assert_eq!(exchange.open_order_count(), 3);
    }

    #[tokio::test]
    async fn sequential_leg_rejection_rolls_back_accepted_orders() {
        let exchange = Arc::new(PaperExchange::new(1000.0).without_atomic_brackets());
        exchange.set_price("SOL", 100.0);
        exchange.reject_next_of_kind(OrderKind::TakeProfitLimit, "price band violation");
        let engine = engine(exchange.clone());

        let result = engine.execute(&signal(), 2.0, 100.0).await.unwrap();
        assert!(result.is_none());
        // Entry and stop were accepted, then cancelled when the target
        // leg was refused.
        assert_eq!(exchange.open_order_count(), 0);
        assert!(engine.active_orders().is_empty());
        let history = engine.history().await;
        assert_eq!(
            history.iter().filter(|o| o.status == OrderStatus::Cancelled).count(),
            2
        );
        assert_eq!(
            history.iter().filter(|o| o.status == OrderStatus::Rejected).count(),
            1
        );
    }

    #[tokio::test]
    async fn unconfirmed_rollback_cancel_keeps_order_tracked() {
        let exchange = Arc::new(PaperExchange::new(1000.0).without_atomic_brackets());
        exchange.set_price("SOL", 100.0);
        exchange.reject_next_of_kind(OrderKind::TakeProfitLimit, "price band violation");
        exchange.fill_next_cancel();
        let engine = engine(exchange.clone());

        let result = engine.execute(&signal(), 2.0, 100.0).await.unwrap();
        assert!(result.is_none());

        // The entry filled just before the rollback cancel reached the
        // venue; it stays tracked for the monitor instead of being written
        // off as cancelled.
        let live = engine.active_orders();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].kind, OrderKind::Limit);
        assert_eq!(live[0].status, OrderStatus::Submitted);
        assert!((exchange.position_size("SOL") - 2.0).abs() < 1e-9);
        let history = engine.history().await;
        assert!(history.iter().all(|o| o.id != live[0].id));
    }

    #[tokio::test]
    async fn unsubmitted_legs_reach_the_ledger_on_rollback() {
        let exchange = Arc::new(PaperExchange::new(1000.0).without_atomic_brackets());
        exchange.set_price("SOL", 100.0);
        // The stop is refused before the target leg is ever sent.
        exchange.reject_next_of_kind(OrderKind::StopMarket, "trigger too close");
        let engine = engine(exchange.clone());

        let result = engine.execute(&signal(), 2.0, 100.0).await.unwrap();
        assert!(result.is_none());
        assert!(engine.active_orders().is_empty());

        let history = engine.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().filter(|o| o.status == OrderStatus::Rejected).count(),
            1
        );
        let unsent = history
            .iter()
            .find(|o| o.kind == OrderKind::TakeProfitLimit)
            .unwrap();
        assert_eq!(unsent.status, OrderStatus::Cancelled);
        assert!(unsent.status_note.as_deref().unwrap().starts_with("not submitted"));
    }

    #[tokio::test]
    async fn cancel_all_clears_resting_orders() {
        let exchange = Arc::new(PaperExchange::new(1000.0));
        exchange.set_price("SOL", 100.0);
        let engine = engine(exchange.clone());

        engine.execute(&signal(), 2.0, 100.0).await.unwrap();
        let cancelled = engine.cancel_all().await;
        assert_eq!(cancelled, 3);
        assert!(engine.active_orders().is_empty());
        assert_eq!(exchange.open_order_count(), 0);
    }
}
